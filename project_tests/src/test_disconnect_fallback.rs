//! Fallback coverage while the live connection is down.

mod common;

use common::*;
use lib_tagwall::{ConnectionState, HubConfig};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

/// Initial loads finish within a few milliseconds, out of the way of the
/// coverage cycles under test.
fn fast_initial_loads() -> HubConfig {
    HubConfig {
        initial_load_rate: 1000.0,
        ..HubConfig::default()
    }
}

fn or_queries(queries: &[String]) -> Vec<String> {
    queries.iter().filter(|q| q.contains(" OR ")).cloned().collect()
}

#[tokio::test(start_paused = true)]
async fn one_query_covers_all_tags_and_results_are_split_per_tag() {
    let start = Instant::now();
    let feed = FakeLiveFeed::failing();
    let search = FakeSearch::new();
    let hub = start_hub(fast_initial_loads(), &feed, &search).await;

    let mut receivers = Vec::new();
    for (id, tag) in [(1, "a"), (2, "b"), (3, "c")] {
        let (sink, rx) = subscriber(id);
        hub.broadcaster().register(sink, tag).unwrap();
        receivers.push(rx);
    }
    settle().await;

    let corpus: [(&str, &[&str]); 5] = [
        ("1", &["a"]),
        ("2", &["b"]),
        ("3", &["c"]),
        ("4", &["a", "b"]),
        ("5", &["z"]),
    ];
    for (id, item_tags) in corpus {
        search.add(item(id, item_tags));
    }
    sleep_until(start + Duration::from_millis(2500)).await;

    assert_eq!(feed.connects(), [tags(&["a", "b", "c"])]);
    assert_eq!(hub.connection_state(), ConnectionState::Disconnected);
    assert_eq!(or_queries(&search.queries()), ["#a OR #b OR #c"]);

    let expected: [&[&str]; 3] = [&["1", "4"], &["2", "4"], &["3"]];
    for (rx, ids) in receivers.iter_mut().zip(expected) {
        let payloads = drain(rx);
        assert_eq!(payloads.len(), 1);
        assert_eq!(status_ids(&payloads[0]), ids);
    }

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fifteen_tags_are_covered_within_two_cycles() {
    let start = Instant::now();
    let feed = FakeLiveFeed::failing();
    let search = FakeSearch::new();
    let hub = start_hub(fast_initial_loads(), &feed, &search).await;

    let (sink, _rx) = subscriber(1);
    for i in 0..15 {
        hub.broadcaster()
            .register(sink.clone(), &format!("tag{:02}", i))
            .unwrap();
    }
    sleep_until(start + Duration::from_millis(4500)).await;

    let cycles = or_queries(&search.queries());
    assert_eq!(cycles.len(), 2);
    let covered: BTreeSet<&str> = cycles
        .iter()
        .flat_map(|q| q.split(" OR "))
        .map(|t| t.trim_start_matches('#'))
        .collect();
    assert_eq!(covered.len(), 15);
    for query in &cycles {
        assert_eq!(query.split(" OR ").count(), 10);
    }

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn search_failures_do_not_stop_coverage_and_reconnect_ends_it() {
    let start = Instant::now();
    let feed = FakeLiveFeed::failing();
    let search = FakeSearch::new();
    search.set_failing(true);
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, mut rx) = subscriber(1);
    hub.broadcaster().register(sink, "a").unwrap();
    sleep_until(start + Duration::from_millis(4500)).await;

    // Initial load plus the cycles at 2s and 4s, all failed and dropped.
    assert_eq!(search.queries().len(), 3);
    assert!(drain(&mut rx).is_empty());

    // The periodic re-check at 30s reconnects once the upstream accepts.
    feed.set_failing(false);
    search.set_failing(false);
    sleep_until(start + Duration::from_secs(33)).await;
    assert_eq!(hub.connection_state(), ConnectionState::Connected);
    assert_eq!(feed.connects().len(), 2);

    let searched = search.queries().len();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(search.queries().len(), searched);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn live_hang_up_falls_back_until_the_recheck() {
    let start = Instant::now();
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, mut rx) = subscriber(1);
    hub.broadcaster().register(sink, "foo").unwrap();
    sleep_until(start + Duration::from_secs(1)).await;
    assert_eq!(hub.connection_state(), ConnectionState::Connected);

    search.add(item("1", &["foo"]));
    feed.hang_up();
    settle().await;
    assert_eq!(hub.connection_state(), ConnectionState::Disconnected);

    sleep_until(start + Duration::from_millis(2500)).await;
    let payloads = drain(&mut rx);
    assert_eq!(payloads.len(), 1);
    assert_eq!(status_ids(&payloads[0]), ["1"]);

    // Same tag set as before; the re-check reconnects anyway.
    sleep_until(start + Duration::from_secs(31)).await;
    assert_eq!(feed.connects(), [tags(&["foo"]), tags(&["foo"])]);
    assert_eq!(hub.connection_state(), ConnectionState::Connected);

    hub.shutdown().await;
}
