//! # Upstream Filter Controller
//!
//! Keeps the one live upstream connection filtered to the registry's tag set
//! without reconnecting faster than the upstream tolerates.
//!
//! ## Update Lifecycle
//!
//! `Idle -> PendingScheduled -> Applying -> Idle`
//!
//! - Any change to the *set* of tracked tags calls `FilterUpdateHandle::schedule`.
//!   Only the first call in a window moves the state to `PendingScheduled` and
//!   wakes the worker; later calls are no-ops until the pending flag clears.
//! - The worker waits out the debounce delay, then a permit from the filter
//!   rate limiter. Changes that land during either wait fold into this update.
//! - It then clears the pending flag (`Applying`), snapshots the registry and
//!   decides with `plan_update` whether to reconnect. A schedule request that
//!   arrives while applying starts a fresh cycle after this one.
//!
//! ## Connection State
//!
//! `Connecting` while `LiveFeed::connect` is in flight, `Connected` once it
//! returns a stream, `Disconnected` when the connect fails or the stream ends
//! on its own. Failed connections are not retried here: the fallback poller
//! covers the gap, and either the next registry change or the periodic
//! re-check starts a new attempt.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::Dispatcher;
use crate::core::rate_limiter::TokenBucket;
use crate::core::registry::{TagRegistry, TagSet};
use crate::feed::source::{FeedStream, LiveFeed};

/// State of the single upstream live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live connection; the fallback poller is covering tracked tags.
    Disconnected,
    /// A connect call is in flight.
    Connecting,
    /// Items are flowing from the live connection.
    Connected,
}

/// Where the filter update pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterUpdateState {
    /// Nothing to do.
    Idle,
    /// A change is waiting out the debounce delay or the rate limiter.
    PendingScheduled,
    /// The worker is computing or applying a new filter.
    Applying,
}

/// The debounce bookkeeping, free of timers so it can be driven directly.
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    pending: bool,
    applying: bool,
}

impl UpdateScheduler {
    /// Test-and-set on the pending flag. `true` means the caller must wake the
    /// worker; `false` means an update is already pending.
    pub fn request(&mut self) -> bool {
        if self.pending {
            return false;
        }
        self.pending = true;
        true
    }

    /// Clears the pending flag and enters `Applying`. Returns `false` if there
    /// was nothing pending.
    pub fn begin_apply(&mut self) -> bool {
        if !self.pending {
            return false;
        }
        self.pending = false;
        self.applying = true;
        true
    }

    /// Leaves `Applying`.
    pub fn finish_apply(&mut self) {
        self.applying = false;
    }

    /// Current lifecycle state. A request made during `Applying` reports
    /// `PendingScheduled`, since that is the work still owed.
    pub fn state(&self) -> FilterUpdateState {
        if self.pending {
            FilterUpdateState::PendingScheduled
        } else if self.applying {
            FilterUpdateState::Applying
        } else {
            FilterUpdateState::Idle
        }
    }
}

/// What to do with a freshly computed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Nothing is tracked. Never filter to nothing; keep what is applied.
    SkipEmpty,
    /// The live connection already covers every tag in the snapshot.
    SkipCovered,
    /// Tear down and reconnect with the snapshot.
    Apply,
}

/// Decides whether `snapshot` warrants a reconnect.
///
/// While the connection is up (or coming up) a snapshot that is a subset of
/// the last applied filter is skipped: extra upstream tags cost nothing since
/// items for them find no subscribers, while a reconnect spends rate budget.
/// While disconnected any non-empty snapshot is applied.
pub fn plan_update(last_applied: &TagSet, snapshot: &TagSet, state: ConnectionState) -> FilterDecision {
    if snapshot.is_empty() {
        FilterDecision::SkipEmpty
    } else if state != ConnectionState::Disconnected && snapshot.is_subset(last_applied) {
        FilterDecision::SkipCovered
    } else {
        FilterDecision::Apply
    }
}

/// Cheap, cloneable front end used by the register/unregister path. Never
/// blocks.
#[derive(Debug, Clone)]
pub struct FilterUpdateHandle {
    scheduler: Arc<Mutex<UpdateScheduler>>,
    wake: mpsc::UnboundedSender<()>,
    connection: watch::Receiver<ConnectionState>,
}

impl FilterUpdateHandle {
    /// Requests a filter update. Returns `true` if this call armed a new
    /// debounce window.
    pub fn schedule(&self) -> bool {
        let armed = self
            .scheduler
            .lock()
            .expect("Filter scheduler lock poisoned")
            .request();
        if armed && self.wake.send(()).is_err() {
            log::debug!("Filter controller is gone; update request dropped");
        }
        armed
    }

    /// Where the update pipeline is.
    pub fn update_state(&self) -> FilterUpdateState {
        self.scheduler
            .lock()
            .expect("Filter scheduler lock poisoned")
            .state()
    }

    /// Current live connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// A receiver that observes connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }
}

struct LiveConnection {
    cancel: CancellationToken,
    _reader: JoinHandle<()>,
}

/// The worker that owns the live connection.
pub struct FilterController {
    registry: Arc<TagRegistry>,
    dispatcher: Arc<Dispatcher>,
    feed: Arc<dyn LiveFeed>,
    limiter: TokenBucket,
    debounce: Duration,
    recheck: Duration,
    handle: FilterUpdateHandle,
    wake_rx: mpsc::UnboundedReceiver<()>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    last_applied: TagSet,
    live: Option<LiveConnection>,
}

impl FilterController {
    /// Builds the worker and the handle that feeds it.
    pub fn new(
        registry: Arc<TagRegistry>,
        dispatcher: Arc<Dispatcher>,
        feed: Arc<dyn LiveFeed>,
        limiter: TokenBucket,
        debounce: Duration,
        recheck: Duration,
    ) -> (Self, FilterUpdateHandle) {
        let (wake, wake_rx) = mpsc::unbounded_channel();
        let (state_tx, connection) = watch::channel(ConnectionState::Disconnected);
        let handle = FilterUpdateHandle {
            scheduler: Arc::new(Mutex::new(UpdateScheduler::default())),
            wake,
            connection,
        };
        let controller = Self {
            registry,
            dispatcher,
            feed,
            limiter,
            debounce,
            recheck: recheck.max(Duration::from_millis(1)),
            handle: handle.clone(),
            wake_rx,
            state_tx: Arc::new(state_tx),
            generation: Arc::new(AtomicU64::new(0)),
            last_applied: BTreeSet::new(),
            live: None,
        };
        (controller, handle)
    }

    /// Main loop. Returns after `shutdown` fires, with the live connection
    /// closed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        log::info!(
            "Filter controller started (debounce {:?}, {} updates/s)",
            self.debounce,
            self.limiter.rate()
        );
        let mut recheck = interval(self.recheck);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
        recheck.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                woke = self.wake_rx.recv() => {
                    if woke.is_none() {
                        break;
                    }
                    self.debounce_and_apply(&shutdown).await;
                }
                _ = recheck.tick() => self.recheck_connection(),
            }
        }

        self.close_live();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        log::info!("Filter controller stopped.");
    }

    async fn debounce_and_apply(&mut self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = async {
                sleep(self.debounce).await;
                self.limiter.acquire().await;
            } => {}
        }

        if !self
            .handle
            .scheduler
            .lock()
            .expect("Filter scheduler lock poisoned")
            .begin_apply()
        {
            return;
        }

        let snapshot = self.registry.snapshot();
        let state = self.handle.connection_state();
        match plan_update(&self.last_applied, &snapshot, state) {
            FilterDecision::SkipEmpty => {
                log::debug!("No tracked tags; keeping the current filter");
            }
            FilterDecision::SkipCovered => {
                log::debug!("Live filter already covers {} tags", snapshot.len());
            }
            FilterDecision::Apply => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = self.apply(snapshot) => {}
                }
            }
        }

        self.handle
            .scheduler
            .lock()
            .expect("Filter scheduler lock poisoned")
            .finish_apply();
    }

    async fn apply(&mut self, snapshot: TagSet) {
        let names: Vec<&str> = snapshot.iter().map(|t| t.as_str()).collect();
        log::info!("Filtering to {:?}", names);

        self.close_live();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(ConnectionState::Connecting);

        let result = self.feed.connect(&snapshot).await;
        self.last_applied = snapshot;
        match result {
            Ok(stream) => {
                self.state_tx.send_replace(ConnectionState::Connected);
                log::info!("Registered stream connection");
                let cancel = CancellationToken::new();
                let reader = tokio::spawn(read_live(
                    stream,
                    Arc::clone(&self.dispatcher),
                    Arc::clone(&self.state_tx),
                    Arc::clone(&self.generation),
                    generation,
                    cancel.clone(),
                ));
                self.live = Some(LiveConnection {
                    cancel,
                    _reader: reader,
                });
            }
            Err(e) => {
                log::warn!("{}; falling back to search until the next update", e);
                self.state_tx.send_replace(ConnectionState::Disconnected);
            }
        }
    }

    fn recheck_connection(&self) {
        if self.handle.connection_state() == ConnectionState::Disconnected
            && !self.registry.is_empty()
            && self.handle.schedule()
        {
            log::info!("Live connection is down; scheduling a reconnect");
        }
    }

    fn close_live(&mut self) {
        if let Some(live) = self.live.take() {
            live.cancel.cancel();
        }
    }
}

/// The live read loop. Publishes every item until the stream ends, fails or
/// the controller tears it down. Only an unexpected end flips the state to
/// `Disconnected`, and only if no newer connection has been opened since.
async fn read_live(
    mut stream: FeedStream,
    dispatcher: Arc<Dispatcher>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => match next {
                Some(Ok(item)) => {
                    dispatcher.publish(&item);
                }
                Some(Err(e)) => {
                    log::warn!("{}", e);
                    break;
                }
                None => {
                    log::warn!("Live stream closed by upstream.");
                    break;
                }
            }
        }
    }

    state_tx.send_if_modified(|state| {
        if current_generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        *state = ConnectionState::Disconnected;
        true
    });
    log::info!("Stream disconnected");
}
