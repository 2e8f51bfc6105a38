//! Initial load: a newly tracked tag is searched once, and its matches go to
//! the subscriber that asked for it.

mod common;

use common::*;
use lib_tagwall::{ConnectionState, HubConfig, Registration};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn new_tag_is_searched_once_and_matches_are_delivered() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    search.add(item("1", &["Launch"]));
    search.add(item("2", &["other"]));
    search.add(item("3", &["launch", "space"]));
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, mut rx) = subscriber(1);
    assert_eq!(
        hub.broadcaster().register(sink, "launch"),
        Ok(Registration::Registered { newly_tracked: true })
    );
    settle().await;

    assert_eq!(search.queries(), ["#launch"]);
    let payloads = drain(&mut rx);
    assert_eq!(payloads.len(), 1);
    assert_eq!(status_ids(&payloads[0]), ["1", "3"]);

    // Once the live connection is up the tag is not searched again.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(hub.connection_state(), ConnectionState::Connected);
    assert_eq!(search.queries(), ["#launch"]);
    assert!(drain(&mut rx).is_empty());

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn already_tracked_tag_triggers_no_search() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (first, _rx1) = subscriber(1);
    let (second, mut rx2) = subscriber(2);
    hub.broadcaster().register(first, "launch").unwrap();
    settle().await;
    search.add(item("9", &["launch"]));

    assert_eq!(
        hub.broadcaster().register(second, "LAUNCH"),
        Ok(Registration::Registered { newly_tracked: false })
    );
    settle().await;

    assert_eq!(search.queries(), ["#launch"]);
    assert!(drain(&mut rx2).is_empty());
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_initial_load_is_dropped() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    search.set_failing(true);
    search.add(item("1", &["launch"]));
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, mut rx) = subscriber(1);
    hub.broadcaster().register(sink, "launch").unwrap();
    settle().await;
    search.set_failing(false);
    sleep(Duration::from_secs(10)).await;

    assert_eq!(search.queries(), ["#launch"]);
    assert!(drain(&mut rx).is_empty());
    hub.shutdown().await;
}
