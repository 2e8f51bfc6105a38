//! # Broadcaster
//!
//! The entry point for the subscriber transport. Keeps the tag -> channel
//! associations and the registry reference counts in step, and triggers
//! filter updates and initial loads when the tracked set changes.
//!
//! ## Core Design Principles:
//!
//! 1.  **One Reference per Association**: Every `(tag, channel)` pair holds
//!     exactly one registry reference. Registering the same pair twice is a
//!     no-op, so a channel can never leak a count it does not release.
//!
//! 2.  **Atomic Registration**: The subscriptions lock is held across the
//!     registry mutation. Lock order is always subscriptions, then registry.
//!
//! 3.  **Nothing Blocks the Caller**: Filter updates and initial loads are
//!     handed to their workers. A register call returns without waiting on
//!     a rate limiter or the network.

use std::sync::Arc;

use crate::core::dispatcher::Dispatcher;
use crate::core::fallback_poller::InitialLoader;
use crate::core::filter_controller::FilterUpdateHandle;
use crate::core::registry::TagRegistry;
use crate::core::subscriptions::{ChannelId, SubscriberSink};
use crate::core::tag::Tag;
use crate::error::{CommandError, TagError};
use crate::feed::item::FeedItem;

/// A parsed subscriber command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `REG <tag>` / `REGISTER <tag>`
    Register(String),
    /// `UNREG <tag>` / `UNREGISTER <tag>`
    Unregister(String),
}

/// Parses `"<VERB> <tag>"`. The verb is case-insensitive; the tag is returned
/// as given and validated later.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or(CommandError::Empty)?;
    let upper = verb.to_ascii_uppercase();
    let make: fn(String) -> Command = match upper.as_str() {
        "REG" | "REGISTER" => Command::Register,
        "UNREG" | "UNREGISTER" => Command::Unregister,
        _ => return Err(CommandError::UnknownVerb(verb.to_string())),
    };
    let tag = parts
        .next()
        .ok_or_else(|| CommandError::MissingTag(verb.to_string()))?;
    Ok(make(tag.to_string()))
}

/// Outcome of a successful `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new association was recorded.
    Registered {
        /// The tag went from untracked to tracked.
        newly_tracked: bool,
    },
    /// The channel was already associated with the tag.
    AlreadyRegistered,
}

/// Subscriber-facing side of the hub.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<TagRegistry>,
    dispatcher: Arc<Dispatcher>,
    filter: FilterUpdateHandle,
    loader: InitialLoader,
}

impl Broadcaster {
    /// Assembles a broadcaster over shared hub state.
    pub fn new(
        registry: Arc<TagRegistry>,
        dispatcher: Arc<Dispatcher>,
        filter: FilterUpdateHandle,
        loader: InitialLoader,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            filter,
            loader,
        }
    }

    /// # Register
    ///
    /// Associates `sink`'s channel with the normalized form of `raw` and takes
    /// a registry reference for it. On the transition that newly tracks the
    /// tag, a filter update is scheduled and an initial load is spawned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        sink: Arc<dyn SubscriberSink>,
        raw: &str,
    ) -> Result<Registration, TagError> {
        let tag = Tag::parse(raw)?;
        let channel = sink.id();
        let newly_tracked = {
            let mut subscriptions = self.dispatcher.subscriptions();
            if !subscriptions.insert(tag.clone(), sink) {
                return Ok(Registration::AlreadyRegistered);
            }
            self.registry.acquire(&tag)
        };

        log::debug!("Channel {} registered for {}", channel, tag);
        if newly_tracked {
            self.filter.schedule();
            self.loader.request(tag);
        }
        Ok(Registration::Registered { newly_tracked })
    }

    /// # Unregister
    ///
    /// Drops the association and its registry reference. Returns `false` if
    /// the channel was not registered for the tag.
    pub fn unregister(&self, channel: ChannelId, raw: &str) -> bool {
        let Ok(tag) = Tag::parse(raw) else {
            return false;
        };
        let untracked = {
            let mut subscriptions = self.dispatcher.subscriptions();
            if !subscriptions.remove(&tag, channel) {
                return false;
            }
            self.registry.untrack(&tag)
        };

        log::debug!("Channel {} unregistered from {}", channel, tag);
        if untracked {
            self.filter.schedule();
        }
        true
    }

    /// Releases every association `channel` holds. Returns how many there
    /// were.
    pub fn on_subscriber_disconnect(&self, channel: ChannelId) -> usize {
        let (released, untracked) = {
            let mut subscriptions = self.dispatcher.subscriptions();
            let tags = subscriptions.remove_channel(channel);
            let untracked = tags.iter().filter(|tag| self.registry.untrack(tag)).count();
            (tags.len(), untracked)
        };

        if released > 0 {
            log::debug!("Channel {} closed; released {} tags", channel, released);
        }
        if untracked > 0 {
            self.filter.schedule();
        }
        released
    }

    /// Handles one command line from `sink`'s transport.
    ///
    /// `REGISTER` yields whether the registration took effect (an invalid tag
    /// yields `false`), `UNREGISTER` whether an association was removed.
    pub fn on_subscriber_message(
        &self,
        sink: &Arc<dyn SubscriberSink>,
        line: &str,
    ) -> Result<bool, CommandError> {
        match parse_command(line)? {
            Command::Register(raw) => match self.register(Arc::clone(sink), &raw) {
                Ok(_) => Ok(true),
                Err(e) => {
                    log::info!("Channel {} sent an invalid tag: {}", sink.id(), e);
                    Ok(false)
                }
            },
            Command::Unregister(raw) => Ok(self.unregister(sink.id(), &raw)),
        }
    }

    /// Delivers a live item to every subscriber of its tags.
    pub fn publish(&self, item: &FeedItem) -> usize {
        self.dispatcher.publish(item)
    }

    /// The tag registry this broadcaster drives.
    pub fn registry(&self) -> &Arc<TagRegistry> {
        &self.registry
    }

    /// Number of channels registered for `tag`.
    pub fn subscriber_count(&self, tag: &Tag) -> usize {
        self.dispatcher.subscriber_count(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter_controller::{FilterController, FilterUpdateState};
    use crate::core::rate_limiter::TokenBucket;
    use crate::core::subscriptions::ChannelSink;
    use crate::error::FeedError;
    use crate::feed::source::{FeedStream, LiveFeed, SearchClient};
    use crate::core::registry::TagSet;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use tokio_util::sync::CancellationToken;

    struct NoFeed;

    #[async_trait]
    impl LiveFeed for NoFeed {
        async fn connect(&self, _tags: &TagSet) -> Result<FeedStream, FeedError> {
            Err(FeedError::Connect("offline".to_string()))
        }
    }

    #[async_trait]
    impl SearchClient for NoFeed {
        async fn search(&self, _query: &str, _max: usize) -> Result<Vec<FeedItem>, FeedError> {
            Ok(Vec::new())
        }
    }

    /// Broadcaster wired to a controller that is never run, so scheduling can
    /// be observed without anything consuming it.
    fn broadcaster() -> (Broadcaster, FilterController) {
        let registry = Arc::new(TagRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new());
        let (controller, handle) = FilterController::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::new(NoFeed),
            TokenBucket::new("filter", 1.0),
            Duration::from_millis(500),
            Duration::from_secs(30),
        );
        let loader = InitialLoader::new(
            Arc::clone(&dispatcher),
            Arc::new(NoFeed),
            TokenBucket::new("initial", 1.0),
            100,
            CancellationToken::new(),
        );
        (Broadcaster::new(registry, dispatcher, handle, loader), controller)
    }

    fn sink(id: u64) -> (Arc<dyn SubscriberSink>, Receiver<Bytes>) {
        let (sink, rx) = ChannelSink::new(ChannelId(id));
        (Arc::new(sink), rx)
    }

    #[test]
    fn parses_both_verb_spellings_case_insensitively() {
        assert_eq!(parse_command("REG foo"), Ok(Command::Register("foo".into())));
        assert_eq!(parse_command("register Foo"), Ok(Command::Register("Foo".into())));
        assert_eq!(parse_command("UnReg foo"), Ok(Command::Unregister("foo".into())));
        assert_eq!(parse_command("  UNREGISTER   foo  "), Ok(Command::Unregister("foo".into())));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(parse_command(""), Err(CommandError::Empty));
        assert_eq!(parse_command("SUB foo"), Err(CommandError::UnknownVerb("SUB".into())));
        assert_eq!(parse_command("REG"), Err(CommandError::MissingTag("REG".into())));
    }

    #[tokio::test]
    async fn first_registration_tracks_and_schedules() {
        let (broadcaster, _controller) = broadcaster();
        let (a, _rx) = sink(1);
        let (b, _rx2) = sink(2);

        assert_eq!(
            broadcaster.register(Arc::clone(&a), "Foo"),
            Ok(Registration::Registered { newly_tracked: true })
        );
        assert_eq!(broadcaster.filter.update_state(), FilterUpdateState::PendingScheduled);
        assert_eq!(
            broadcaster.register(b, "FOO"),
            Ok(Registration::Registered { newly_tracked: false })
        );
        assert_eq!(broadcaster.register(a, "foo"), Ok(Registration::AlreadyRegistered));

        let foo = Tag::parse("foo").unwrap();
        assert_eq!(broadcaster.registry().count(&foo), 2);
        assert_eq!(broadcaster.subscriber_count(&foo), 2);
    }

    #[tokio::test]
    async fn invalid_tags_change_nothing() {
        let (broadcaster, _controller) = broadcaster();
        let (a, _rx) = sink(1);
        assert!(broadcaster.register(a, "no spaces!").is_err());
        assert!(broadcaster.registry().is_empty());
        assert_eq!(broadcaster.filter.update_state(), FilterUpdateState::Idle);
    }

    #[tokio::test]
    async fn mixed_case_unregister_releases_the_same_tag() {
        let (broadcaster, _controller) = broadcaster();
        let (a, _rx) = sink(1);
        broadcaster.register(Arc::clone(&a), "foo").unwrap();

        assert!(broadcaster.unregister(a.id(), "FOO"));
        assert!(!broadcaster.unregister(a.id(), "foo"));
        assert!(broadcaster.registry().is_empty());
    }

    #[tokio::test]
    async fn disconnect_releases_every_association() {
        let (broadcaster, _controller) = broadcaster();
        let (a, _rx) = sink(1);
        let (b, _rx2) = sink(2);
        for tag in ["x", "y", "z"] {
            broadcaster.register(Arc::clone(&a), tag).unwrap();
        }
        broadcaster.register(b, "x").unwrap();

        assert_eq!(broadcaster.on_subscriber_disconnect(a.id()), 3);
        let tracked: Vec<_> = broadcaster.registry().snapshot().into_iter().collect();
        assert_eq!(tracked, vec![Tag::parse("x").unwrap()]);
        assert_eq!(broadcaster.on_subscriber_disconnect(a.id()), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_churn_on_one_tag_keeps_counts_in_step() {
        let (broadcaster, _controller) = broadcaster();
        let broadcaster = Arc::new(broadcaster);
        let runtime = tokio::runtime::Handle::current();
        let race = Tag::parse("race").unwrap();

        let threads: Vec<_> = (0..8u64)
            .map(|i| {
                let broadcaster = Arc::clone(&broadcaster);
                let runtime = runtime.clone();
                std::thread::spawn(move || {
                    let _entered = runtime.enter();
                    let (sink, _rx) = sink(i + 1);
                    for round in 0..300 {
                        broadcaster.register(Arc::clone(&sink), "Race").unwrap();
                        match round % 3 {
                            0 => assert!(broadcaster.unregister(sink.id(), "race")),
                            1 => assert_eq!(broadcaster.on_subscriber_disconnect(sink.id()), 1),
                            _ => {
                                assert_eq!(
                                    broadcaster.register(Arc::clone(&sink), "RACE"),
                                    Ok(Registration::AlreadyRegistered)
                                );
                                assert!(broadcaster.unregister(sink.id(), "RACE"));
                            }
                        }
                    }
                    if i % 2 == 1 {
                        broadcaster.register(sink, "race").unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(broadcaster.registry().count(&race), 4);
        assert_eq!(broadcaster.subscriber_count(&race), 4);
        assert_eq!(broadcaster.registry().len(), 1);

        for i in (1..8u64).step_by(2) {
            assert_eq!(broadcaster.on_subscriber_disconnect(ChannelId(i + 1)), 1);
        }
        assert!(broadcaster.registry().is_empty());
        assert_eq!(broadcaster.subscriber_count(&race), 0);
    }

    #[tokio::test]
    async fn command_lines_drive_registration() {
        let (broadcaster, _controller) = broadcaster();
        let (a, mut rx) = sink(1);

        assert_eq!(broadcaster.on_subscriber_message(&a, "REG Foo"), Ok(true));
        assert_eq!(broadcaster.on_subscriber_message(&a, "REG bad-tag"), Ok(false));
        assert!(broadcaster.on_subscriber_message(&a, "PING").is_err());

        let item = FeedItem {
            id: "1".into(),
            text: "hello".into(),
            tags: vec!["FOO".into()],
            time: 0,
            author: "someone".into(),
            author_avatar: None,
            reshare_of: None,
        };
        assert_eq!(broadcaster.publish(&item), 1);
        assert!(rx.try_recv().is_ok());

        assert_eq!(broadcaster.on_subscriber_message(&a, "UNREG foo"), Ok(true));
        assert_eq!(broadcaster.publish(&item), 0);
    }
}
