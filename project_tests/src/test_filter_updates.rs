//! Debounced, rate-limited updates of the live filter.

mod common;

use common::*;
use lib_tagwall::{ChannelId, HubConfig};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

#[tokio::test(start_paused = true)]
async fn a_burst_of_registrations_yields_one_reconnect() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, _rx) = subscriber(1);
    let names: Vec<String> = (0..10).map(|i| format!("burst{}", i)).collect();
    for name in &names {
        hub.broadcaster().register(sink.clone(), name).unwrap();
        sleep(Duration::from_millis(20)).await;
    }
    sleep(Duration::from_secs(2)).await;

    let connects = feed.connects();
    assert_eq!(connects.len(), 1);
    let expected: Vec<&str> = names.iter().map(String::as_str).collect();
    assert_eq!(connects[0], tags(&expected));

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnects_respect_the_filter_rate() {
    let start = Instant::now();
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, _rx) = subscriber(1);
    hub.broadcaster().register(sink.clone(), "a").unwrap();
    sleep_until(start + Duration::from_secs(1)).await;
    assert_eq!(feed.connects().len(), 1);

    // At 0.3 updates/s the next permit is ~3.8s in.
    hub.broadcaster().register(sink, "b").unwrap();
    sleep_until(start + Duration::from_millis(3500)).await;
    assert_eq!(feed.connects().len(), 1);

    sleep_until(start + Duration::from_millis(4000)).await;
    assert_eq!(feed.connects(), [tags(&["a"]), tags(&["a", "b"])]);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropping_a_covered_tag_keeps_the_connection() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, _rx) = subscriber(1);
    hub.broadcaster().register(sink.clone(), "a").unwrap();
    hub.broadcaster().register(sink, "b").unwrap();
    sleep(Duration::from_secs(1)).await;

    assert!(hub.broadcaster().unregister(ChannelId(1), "b"));
    sleep(Duration::from_secs(10)).await;
    assert_eq!(feed.connects(), [tags(&["a", "b"])]);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_tag_set_is_never_applied() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, _rx) = subscriber(1);
    hub.broadcaster().register(sink, "a").unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(hub.broadcaster().on_subscriber_disconnect(ChannelId(1)), 1);
    assert!(hub.registry().is_empty());
    sleep(Duration::from_secs(60)).await;

    let connects = feed.connects();
    assert_eq!(connects.len(), 1);
    assert!(connects.iter().all(|set| !set.is_empty()));

    hub.shutdown().await;
}
