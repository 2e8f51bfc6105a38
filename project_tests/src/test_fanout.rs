//! Live items reach exactly the subscribers of the tags they carry.

mod common;

use common::*;
use lib_tagwall::{ConnectionState, FeedItem, HubConfig, Reshare, TagHub};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

struct Rig {
    hub: TagHub,
    feed: Arc<FakeLiveFeed>,
    foo: tokio::sync::mpsc::Receiver<bytes::Bytes>,
    bar: tokio::sync::mpsc::Receiver<bytes::Bytes>,
}

/// Subscriber 1 follows "foo", subscriber 2 follows "bar", live connection up.
async fn rig() -> Rig {
    let feed = FakeLiveFeed::new();
    let search = FakeSearch::new();
    let hub = start_hub(HubConfig::default(), &feed, &search).await;

    let (a, foo) = subscriber(1);
    let (b, bar) = subscriber(2);
    hub.broadcaster().register(a, "foo").unwrap();
    hub.broadcaster().register(b, "bar").unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(hub.connection_state(), ConnectionState::Connected);
    assert_eq!(feed.connects(), [tags(&["bar", "foo"])]);

    Rig { hub, feed, foo, bar }
}

async fn push(feed: &FakeLiveFeed, item: FeedItem) {
    assert!(feed.push(item));
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn items_are_routed_by_tag() {
    let mut rig = rig().await;

    push(&rig.feed, item("1", &["foo"])).await;
    assert_eq!(drain(&mut rig.foo).len(), 1);
    assert!(drain(&mut rig.bar).is_empty());

    push(&rig.feed, item("2", &["foo", "bar"])).await;
    assert_eq!(drain(&mut rig.foo).len(), 1);
    assert_eq!(drain(&mut rig.bar).len(), 1);

    push(&rig.feed, item("3", &[])).await;
    assert!(drain(&mut rig.foo).is_empty());
    assert!(drain(&mut rig.bar).is_empty());

    rig.hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn tag_casing_does_not_matter_and_duplicates_collapse() {
    let mut rig = rig().await;

    push(&rig.feed, item("1", &["FOO", "foo", "Foo"])).await;
    let payloads = drain(&mut rig.foo);
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["statusId"], "1");
    assert!(payloads[0].is_object());

    rig.hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reshares_render_with_the_original_author() {
    let mut rig = rig().await;

    let mut reshare = item("20", &["bar"]);
    reshare.text = "we have liftoff".to_string();
    reshare.reshare_of = Some(Reshare {
        id: "10".to_string(),
        author: "nasa".to_string(),
    });
    push(&rig.feed, reshare).await;

    let payloads = drain(&mut rig.bar);
    assert_eq!(payloads.len(), 1);
    let view = &payloads[0];
    assert_eq!(view["text"], "RT @nasa: we have liftoff");
    assert_eq!(view["isReshare"], true);
    assert_eq!(view["originalUsername"], "nasa");
    assert_eq!(view["username"], "tester");
    assert_eq!(view["id"], "10");
    assert_eq!(view["statusId"], "20");

    rig.hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unregistered_subscribers_stop_receiving() {
    let mut rig = rig().await;

    assert!(rig.hub.broadcaster().unregister(lib_tagwall::ChannelId(1), "FOO"));
    push(&rig.feed, item("1", &["foo", "bar"])).await;
    assert!(drain(&mut rig.foo).is_empty());
    assert_eq!(drain(&mut rig.bar).len(), 1);

    rig.hub.shutdown().await;
}
