//! # Shared Test Fixtures
//!
//! In-memory stand-ins for the upstream collaborators and subscriber
//! transport, so scenario tests can drive a real `TagHub` on tokio's paused
//! clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use lib_tagwall::core::TagSet;
use lib_tagwall::{
    ChannelId, ChannelSink, FeedError, FeedItem, FeedStream, HubConfig, LiveFeed, SearchClient,
    SubscriberSink, TagHub,
};
use tokio::sync::mpsc;

type ItemSender = mpsc::UnboundedSender<Result<FeedItem, FeedError>>;

/// Live feed that records every filter it was asked for and lets the test
/// push items into the newest connection.
#[derive(Default)]
pub struct FakeLiveFeed {
    connects: Mutex<Vec<TagSet>>,
    senders: Mutex<Vec<ItemSender>>,
    fail: AtomicBool,
}

impl FakeLiveFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A feed whose connects fail until `set_failing(false)`.
    pub fn failing() -> Arc<Self> {
        let feed = Self::default();
        feed.fail.store(true, Ordering::SeqCst);
        Arc::new(feed)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every filter set a connect was attempted with, oldest first.
    pub fn connects(&self) -> Vec<TagSet> {
        self.connects.lock().unwrap().clone()
    }

    /// Pushes `item` into the newest open connection.
    pub fn push(&self, item: FeedItem) -> bool {
        self.senders
            .lock()
            .unwrap()
            .last()
            .is_some_and(|tx| tx.send(Ok(item)).is_ok())
    }

    /// Ends every open connection as if the upstream hung up.
    pub fn hang_up(&self) {
        self.senders.lock().unwrap().clear();
    }
}

#[async_trait]
impl LiveFeed for FakeLiveFeed {
    async fn connect(&self, tags: &TagSet) -> Result<FeedStream, FeedError> {
        self.connects.lock().unwrap().push(tags.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(FeedError::Connect("upstream refused".to_string()));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }
}

/// Search over an in-memory corpus. Understands `#a OR #b` queries.
#[derive(Default)]
pub struct FakeSearch {
    queries: Mutex<Vec<String>>,
    corpus: Mutex<Vec<FeedItem>>,
    fail: AtomicBool,
}

impl FakeSearch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, item: FeedItem) {
        self.corpus.lock().unwrap().push(item);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every query received, oldest first.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchClient for FakeSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<FeedItem>, FeedError> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(FeedError::Search {
                transient: true,
                message: "503 Service Unavailable".to_string(),
            });
        }
        let wanted: Vec<&str> = query.split(" OR ").map(|t| t.trim_start_matches('#')).collect();
        Ok(self
            .corpus
            .lock()
            .unwrap()
            .iter()
            .filter(|item| {
                item.tags
                    .iter()
                    .any(|t| wanted.iter().any(|w| t.eq_ignore_ascii_case(w)))
            })
            .take(max_results)
            .cloned()
            .collect())
    }
}

pub fn item(id: &str, tags: &[&str]) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        text: format!("post {}", id),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        time: 1_700_000_000_000,
        author: "tester".to_string(),
        author_avatar: None,
        reshare_of: None,
    }
}

pub fn subscriber(id: u64) -> (Arc<dyn SubscriberSink>, mpsc::Receiver<Bytes>) {
    let (sink, rx) = ChannelSink::new(ChannelId(id));
    (Arc::new(sink), rx)
}

/// Everything queued for a subscriber, decoded.
pub fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<serde_json::Value> {
    let mut payloads = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        payloads.push(serde_json::from_slice(&bytes).unwrap());
    }
    payloads
}

/// Status ids in a batch payload.
pub fn status_ids(batch: &serde_json::Value) -> Vec<String> {
    batch
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["statusId"].as_str().unwrap().to_string())
        .collect()
}

/// Lets spawned workers run without moving the paused clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Starts a hub and lets its workers take their first tick.
pub async fn start_hub(
    config: HubConfig,
    feed: &Arc<FakeLiveFeed>,
    search: &Arc<FakeSearch>,
) -> TagHub {
    let feed: Arc<dyn LiveFeed> = Arc::clone(feed) as Arc<dyn LiveFeed>;
    let search: Arc<dyn SearchClient> = Arc::clone(search) as Arc<dyn SearchClient>;
    let hub = TagHub::start(config, feed, search).unwrap();
    settle().await;
    hub
}

pub fn tags(names: &[&str]) -> TagSet {
    names
        .iter()
        .map(|n| lib_tagwall::Tag::parse(n).unwrap())
        .collect()
}
