//! Registration bookkeeping seen from the subscriber transport.

mod common;

use common::*;
use lib_tagwall::{ChannelId, CommandError, ConnectionState, HubConfig, Registration, Tag};

#[tokio::test(start_paused = true)]
async fn mixed_case_register_and_unregister_address_the_same_tag() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;
    let launch = Tag::parse("launch").unwrap();

    let (sink, _rx) = subscriber(1);
    hub.broadcaster().register(sink.clone(), "LAUNCH").unwrap();
    assert_eq!(
        hub.broadcaster().register(sink.clone(), "Launch"),
        Ok(Registration::AlreadyRegistered)
    );
    assert_eq!(hub.registry().count(&launch), 1);

    assert!(hub.broadcaster().unregister(sink.id(), "launch"));
    assert!(!hub.registry().contains(&launch));

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_tags_are_rejected_without_side_effects() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, _rx) = subscriber(1);
    let too_long = "x".repeat(31);
    for raw in ["", "two words", "dash-ed", too_long.as_str()] {
        assert!(hub.broadcaster().register(sink.clone(), raw).is_err(), "{raw:?}");
    }
    settle().await;

    assert!(hub.registry().is_empty());
    assert!(search.queries().is_empty());
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_releases_only_that_subscribers_references() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (leaving, mut leaving_rx) = subscriber(1);
    let (staying, mut staying_rx) = subscriber(2);
    for tag in ["x", "y", "z"] {
        hub.broadcaster().register(leaving.clone(), tag).unwrap();
    }
    hub.broadcaster().register(staying, "x").unwrap();

    assert_eq!(hub.broadcaster().on_subscriber_disconnect(ChannelId(1)), 3);
    let remaining: Vec<String> = hub
        .registry()
        .snapshot()
        .iter()
        .map(|t| t.to_string())
        .collect();
    assert_eq!(remaining, ["x"]);

    assert_eq!(hub.broadcaster().publish(&item("1", &["x", "y"])), 1);
    assert!(drain(&mut leaving_rx).is_empty());
    assert_eq!(drain(&mut staying_rx).len(), 1);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn command_lines_follow_the_text_protocol() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;
    let broadcaster = hub.broadcaster();

    let (sink, _rx) = subscriber(1);
    assert_eq!(broadcaster.on_subscriber_message(&sink, "REG Space"), Ok(true));
    assert_eq!(broadcaster.on_subscriber_message(&sink, "register mars"), Ok(true));
    assert_eq!(broadcaster.on_subscriber_message(&sink, "REG not valid!"), Ok(true));
    assert_eq!(broadcaster.on_subscriber_message(&sink, "REG bad!"), Ok(false));
    assert_eq!(broadcaster.on_subscriber_message(&sink, "unregister SPACE"), Ok(true));
    assert_eq!(broadcaster.on_subscriber_message(&sink, "UNREG space"), Ok(false));
    assert_eq!(
        broadcaster.on_subscriber_message(&sink, "SUBSCRIBE x"),
        Err(CommandError::UnknownVerb("SUBSCRIBE".to_string()))
    );
    assert_eq!(
        broadcaster.on_subscriber_message(&sink, "UNREG"),
        Err(CommandError::MissingTag("UNREG".to_string()))
    );

    let tracked: Vec<String> = hub.registry().snapshot().iter().map(|t| t.to_string()).collect();
    assert_eq!(tracked, ["mars", "not"]);
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_live_connection() {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (sink, _rx) = subscriber(1);
    hub.broadcaster().register(sink, "a").unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert_eq!(hub.connection_state(), ConnectionState::Connected);

    let state = hub.watch_connection();
    hub.shutdown().await;
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    settle().await;
    assert!(!feed.push(item("1", &["a"])));
}
