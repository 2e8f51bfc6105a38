//! # Fallback Poller
//!
//! Search-based coverage for when the live connection is not delivering, and
//! one-shot initial loads for tags that just started being tracked.
//!
//! ## Disconnected-state coverage
//!
//! Every `period` the poller checks the connection state. If it is anything
//! but `Connected`, it takes up to `max_tags` tags from its rotation cursor,
//! issues one OR query for them under the fallback rate limiter, and hands
//! each tag the subset of results that carry it.
//!
//! When more tags are tracked than fit in one query, the chosen ones move to
//! the back of the cursor so every tag is covered within
//! `ceil(tracked / max_tags)` cycles. Newly tracked tags are inserted at the
//! front, so a stream of additions faster than the poll period can keep
//! pushing older tags back. That starvation risk is accepted; the cursor is
//! plain round-robin and nothing more.
//!
//! ## Initial load
//!
//! `InitialLoader::request` spawns a one-off task per newly tracked tag. It
//! runs under its own limiter, independent of the coverage cycle, and its
//! results go out once.
//!
//! The cursor is owned by the poller task alone and needs no lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::Dispatcher;
use crate::core::filter_controller::ConnectionState;
use crate::core::rate_limiter::TokenBucket;
use crate::core::registry::{TagRegistry, TagSet};
use crate::core::tag::Tag;
use crate::feed::item::FeedItem;
use crate::feed::source::SearchClient;

/// Builds `#a OR #b OR #c` for the given tags.
pub fn build_query(tags: &[Tag]) -> String {
    tags.iter()
        .map(Tag::query_form)
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Splits one result set back out per tag and delivers each subset.
/// Returns the number of successful sends.
pub fn redistribute(dispatcher: &Dispatcher, tags: &[Tag], results: &[FeedItem]) -> usize {
    tags.iter()
        .map(|tag| {
            let matching: Vec<&FeedItem> = results.iter().filter(|item| item.has_tag(tag)).collect();
            dispatcher.publish_batch(tag, &matching)
        })
        .sum()
}

/// Round-robin order over the tracked tags.
#[derive(Debug, Default, Clone)]
pub struct RotationCursor {
    queue: VecDeque<Tag>,
}

impl RotationCursor {
    /// Creates an empty cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents with `tracked`, in order.
    pub fn reset(&mut self, tracked: &TagSet) {
        self.queue = tracked.iter().cloned().collect();
    }

    /// Drops tags that are no longer tracked and puts newly tracked ones at
    /// the front.
    pub fn reconcile(&mut self, tracked: &TagSet) {
        self.queue.retain(|tag| tracked.contains(tag));
        let fresh: Vec<Tag> = tracked
            .iter()
            .filter(|tag| !self.queue.contains(tag))
            .cloned()
            .collect();
        for tag in fresh.into_iter().rev() {
            self.queue.push_front(tag);
        }
    }

    /// The tags to cover this cycle. With more than `max` tags queued, the
    /// first `max` are taken and rotated to the back.
    pub fn take(&mut self, max: usize) -> Vec<Tag> {
        if self.queue.len() <= max {
            return self.queue.iter().cloned().collect();
        }
        let chosen: Vec<Tag> = self.queue.drain(..max).collect();
        self.queue.extend(chosen.iter().cloned());
        chosen
    }

    /// Queued tags in cursor order.
    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.queue.iter()
    }

    /// Number of queued tags.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the cursor is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// What one coverage cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollCycle {
    /// The live connection is up; nothing to cover.
    Connected,
    /// Disconnected, but no tags are tracked.
    NothingTracked,
    /// A query ran; `delivered` sends were made.
    Searched {
        /// Tags covered by the query.
        tags: Vec<Tag>,
        /// Successful sends.
        delivered: usize,
    },
    /// The query failed; results for these tags were dropped this cycle.
    Failed {
        /// Tags the failed query covered.
        tags: Vec<Tag>,
    },
}

/// Periodic coverage worker.
pub struct FallbackPoller {
    registry: Arc<TagRegistry>,
    dispatcher: Arc<Dispatcher>,
    search: Arc<dyn SearchClient>,
    limiter: TokenBucket,
    connection: watch::Receiver<ConnectionState>,
    period: Duration,
    max_tags: usize,
    max_results: usize,
    cursor: RotationCursor,
    was_connected: bool,
}

impl FallbackPoller {
    /// Builds a poller. `max_tags` is clamped to at least one and `period` to
    /// at least a millisecond.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TagRegistry>,
        dispatcher: Arc<Dispatcher>,
        search: Arc<dyn SearchClient>,
        limiter: TokenBucket,
        connection: watch::Receiver<ConnectionState>,
        period: Duration,
        max_tags: usize,
        max_results: usize,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            search,
            limiter,
            connection,
            period: period.max(Duration::from_millis(1)),
            max_tags: max_tags.max(1),
            max_results,
            cursor: RotationCursor::new(),
            was_connected: false,
        }
    }

    /// Runs a coverage cycle every period until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        log::info!("Fallback poller started (every {:?})", self.period);
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.poll_once() => {}
                    }
                }
            }
        }
        log::info!("Fallback poller stopped.");
    }

    /// One coverage cycle.
    pub async fn poll_once(&mut self) -> PollCycle {
        let state = *self.connection.borrow();
        let tracked = self.registry.snapshot();

        if state == ConnectionState::Connected {
            if !self.was_connected {
                self.cursor.reset(&tracked);
                self.was_connected = true;
            }
            return PollCycle::Connected;
        }
        self.was_connected = false;

        self.cursor.reconcile(&tracked);
        let tags = self.cursor.take(self.max_tags);
        if tags.is_empty() {
            return PollCycle::NothingTracked;
        }

        let query = build_query(&tags);
        log::info!("Searching tag queue: {}", query);
        self.limiter.acquire().await;
        match self.search.search(&query, self.max_results).await {
            Ok(results) => {
                let delivered = redistribute(&self.dispatcher, &tags, &results);
                log::debug!(
                    "Fallback query returned {} items, {} sends",
                    results.len(),
                    delivered
                );
                PollCycle::Searched { tags, delivered }
            }
            Err(e) => {
                log::warn!("Fallback query {:?} dropped: {}", query, e);
                PollCycle::Failed { tags }
            }
        }
    }

    /// The rotation cursor, for inspection.
    pub fn cursor(&self) -> &RotationCursor {
        &self.cursor
    }
}

/// Issues one-shot searches for newly tracked tags.
#[derive(Clone)]
pub struct InitialLoader {
    dispatcher: Arc<Dispatcher>,
    search: Arc<dyn SearchClient>,
    limiter: Arc<TokenBucket>,
    max_results: usize,
    shutdown: CancellationToken,
}

impl InitialLoader {
    /// Builds a loader. `shutdown` cancels loads still waiting or in flight.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        search: Arc<dyn SearchClient>,
        limiter: TokenBucket,
        max_results: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            search,
            limiter: Arc::new(limiter),
            max_results,
            shutdown,
        }
    }

    /// Spawns the initial load for `tag` on its own task. Must be called from
    /// within a tokio runtime.
    pub fn request(&self, tag: Tag) -> JoinHandle<usize> {
        let loader = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = loader.shutdown.cancelled() => 0,
                delivered = loader.load(&tag) => delivered,
            }
        })
    }

    /// Runs the initial load for `tag` in the current task.
    pub async fn load(&self, tag: &Tag) -> usize {
        log::info!("Loading initial items for {}", tag);
        self.limiter.acquire().await;
        let tags = [tag.clone()];
        match self.search.search(&build_query(&tags), self.max_results).await {
            Ok(results) => redistribute(&self.dispatcher, &tags, &results),
            Err(e) => {
                log::warn!("Initial load for {} dropped: {}", tag, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::subscriptions::{ChannelId, ChannelSink, SubscriberSink};
    use crate::error::FeedError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn tag(s: &str) -> Tag {
        Tag::parse(s).unwrap()
    }

    fn item(id: &str, tags: &[&str]) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            text: String::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            time: 0,
            author: "x".to_string(),
            author_avatar: None,
            reshare_of: None,
        }
    }

    #[derive(Default)]
    struct FakeSearch {
        queries: Mutex<Vec<String>>,
        results: Mutex<Vec<FeedItem>>,
        fail: bool,
    }

    #[async_trait]
    impl SearchClient for FakeSearch {
        async fn search(&self, query: &str, _max: usize) -> Result<Vec<FeedItem>, FeedError> {
            self.queries.lock().unwrap().push(query.to_string());
            if self.fail {
                return Err(FeedError::Search {
                    transient: true,
                    message: "503".to_string(),
                });
            }
            Ok(self.results.lock().unwrap().clone())
        }
    }

    fn poller(
        registry: Arc<TagRegistry>,
        dispatcher: Arc<Dispatcher>,
        search: Arc<FakeSearch>,
        state: ConnectionState,
    ) -> (FallbackPoller, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(state);
        let poller = FallbackPoller::new(
            registry,
            dispatcher,
            search,
            TokenBucket::new("fallback", 100.0),
            rx,
            Duration::from_secs(2),
            10,
            100,
        );
        (poller, tx)
    }

    #[test]
    fn query_is_an_or_of_hashtags() {
        assert_eq!(build_query(&[tag("a"), tag("b"), tag("c")]), "#a OR #b OR #c");
        assert_eq!(build_query(&[tag("solo")]), "#solo");
    }

    #[test]
    fn cursor_rotates_so_fifteen_tags_are_covered_in_two_cycles() {
        let tracked: TagSet = (0..15).map(|i| tag(&format!("t{i:02}"))).collect();
        let mut cursor = RotationCursor::new();
        cursor.reset(&tracked);

        let first = cursor.take(10);
        let second = cursor.take(10);
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);

        let covered: HashSet<_> = first.iter().chain(second.iter()).collect();
        assert_eq!(covered.len(), 15);
        assert_eq!(cursor.len(), 15);
    }

    #[test]
    fn small_sets_are_taken_whole_without_rotation() {
        let tracked: TagSet = ["a", "b", "c"].iter().map(|s| tag(s)).collect();
        let mut cursor = RotationCursor::new();
        cursor.reset(&tracked);
        assert_eq!(cursor.take(10), vec![tag("a"), tag("b"), tag("c")]);
        assert_eq!(cursor.take(10), vec![tag("a"), tag("b"), tag("c")]);
    }

    #[test]
    fn reconcile_puts_new_tags_first_and_drops_stale_ones() {
        let mut cursor = RotationCursor::new();
        cursor.reset(&["a", "b", "c"].iter().map(|s| tag(s)).collect());
        cursor.reconcile(&["b", "c", "x", "y"].iter().map(|s| tag(s)).collect());
        let order: Vec<_> = cursor.iter().map(Tag::as_str).collect();
        assert_eq!(order, ["x", "y", "b", "c"]);
    }

    #[test]
    fn redistribute_splits_results_per_tag() {
        let dispatcher = Dispatcher::new();
        let mut receivers = Vec::new();
        for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
            let (sink, rx) = ChannelSink::new(ChannelId(id));
            let sink: Arc<dyn SubscriberSink> = Arc::new(sink);
            dispatcher.subscriptions().insert(tag(name), sink);
            receivers.push(rx);
        }
        let results = vec![item("1", &["A"]), item("2", &["b", "a"]), item("3", &["zzz"])];
        let sent = redistribute(&dispatcher, &[tag("a"), tag("b"), tag("c")], &results);
        assert_eq!(sent, 2);

        let a: serde_json::Value = serde_json::from_slice(&receivers[0].try_recv().unwrap()).unwrap();
        assert_eq!(a.as_array().unwrap().len(), 2);
        let b: serde_json::Value = serde_json::from_slice(&receivers[1].try_recv().unwrap()).unwrap();
        assert_eq!(b.as_array().unwrap().len(), 1);
        assert!(receivers[2].try_recv().is_err());
    }

    #[tokio::test]
    async fn connected_cycles_do_nothing() {
        let registry = Arc::new(TagRegistry::new());
        registry.track("a").unwrap();
        let search = Arc::new(FakeSearch::default());
        let (mut poller, _tx) = poller(
            registry,
            Arc::new(Dispatcher::new()),
            Arc::clone(&search),
            ConnectionState::Connected,
        );
        assert_eq!(poller.poll_once().await, PollCycle::Connected);
        assert!(search.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnected_cycle_issues_one_query_for_all_tags() {
        let registry = Arc::new(TagRegistry::new());
        for t in ["a", "b", "c"] {
            registry.track(t).unwrap();
        }
        let search = Arc::new(FakeSearch::default());
        let (mut poller, _tx) = poller(
            registry,
            Arc::new(Dispatcher::new()),
            Arc::clone(&search),
            ConnectionState::Disconnected,
        );
        let cycle = poller.poll_once().await;
        assert!(matches!(cycle, PollCycle::Searched { ref tags, .. } if tags.len() == 3));
        assert_eq!(*search.queries.lock().unwrap(), ["#a OR #b OR #c"]);
    }

    #[tokio::test]
    async fn search_failures_are_absorbed() {
        let registry = Arc::new(TagRegistry::new());
        registry.track("a").unwrap();
        let search = Arc::new(FakeSearch {
            fail: true,
            ..FakeSearch::default()
        });
        let (mut poller, _tx) = poller(
            registry,
            Arc::new(Dispatcher::new()),
            search,
            ConnectionState::Disconnected,
        );
        assert_eq!(poller.poll_once().await, PollCycle::Failed { tags: vec![tag("a")] });
        assert!(matches!(poller.poll_once().await, PollCycle::Failed { .. }));
    }

    #[tokio::test]
    async fn reconnect_resets_the_cursor() {
        let registry = Arc::new(TagRegistry::new());
        let tracked: Vec<String> = (0..12).map(|i| format!("t{i:02}")).collect();
        for t in &tracked {
            registry.track(t).unwrap();
        }
        let search = Arc::new(FakeSearch::default());
        let (mut poller, tx) = poller(
            registry,
            Arc::new(Dispatcher::new()),
            search,
            ConnectionState::Disconnected,
        );
        poller.poll_once().await;
        assert_eq!(poller.cursor().iter().next().unwrap().as_str(), "t10");

        tx.send_replace(ConnectionState::Connected);
        poller.poll_once().await;
        assert_eq!(poller.cursor().iter().next().unwrap().as_str(), "t00");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_still_ticks() {
        let registry = Arc::new(TagRegistry::new());
        registry.track("a").unwrap();
        let search = Arc::new(FakeSearch::default());
        let (_tx, rx) = watch::channel(ConnectionState::Disconnected);
        let poller = FallbackPoller::new(
            registry,
            Arc::new(Dispatcher::new()),
            Arc::clone(&search) as Arc<dyn SearchClient>,
            TokenBucket::new("fallback", 1000.0),
            rx,
            Duration::ZERO,
            10,
            100,
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(poller.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        task.await.unwrap();
        assert!(search.queries.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn initial_load_delivers_matching_results_once() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (sink, mut rx) = ChannelSink::new(ChannelId(1));
        let sink: Arc<dyn SubscriberSink> = Arc::new(sink);
        dispatcher.subscriptions().insert(tag("launch"), sink);

        let search = Arc::new(FakeSearch::default());
        *search.results.lock().unwrap() = vec![item("1", &["Launch"]), item("2", &["other"])];
        let loader = InitialLoader::new(
            Arc::clone(&dispatcher),
            Arc::clone(&search) as Arc<dyn SearchClient>,
            TokenBucket::new("initial", 10.0),
            100,
            CancellationToken::new(),
        );
        assert_eq!(loader.request(tag("launch")).await.unwrap(), 1);
        assert_eq!(*search.queries.lock().unwrap(), ["#launch"]);

        let batch: serde_json::Value = serde_json::from_slice(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(batch.as_array().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }
}
