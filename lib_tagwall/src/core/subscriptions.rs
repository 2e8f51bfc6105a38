//! # Subscriptions
//!
//! The tag <-> subscriber channel multi-map. It is indexed both ways so that a
//! publish can find every channel for a tag, and a transport disconnect can
//! find every tag for a channel, without scanning.
//!
//! `Subscriptions` itself does no locking. The dispatcher wraps it in a single
//! mutex and that mutex is the only thing guarding it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::tag::Tag;
use crate::error::SinkError;

/// Identity of a subscriber channel, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where payloads for one subscriber go. Owned by the transport; the core only
/// keeps a handle and calls `send`.
///
/// `send` must not block. A failed send is not retried.
pub trait SubscriberSink: Send + Sync {
    /// The channel's identity.
    fn id(&self) -> ChannelId;
    /// Hands a payload to the transport.
    fn send(&self, payload: Bytes) -> Result<(), SinkError>;
}

/// Payloads a [`ChannelSink`] holds before it starts refusing new ones.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1000;

/// A sink backed by a bounded MPSC channel; the transport task drains the
/// receiver and writes to its socket.
///
/// A subscriber that falls `capacity` payloads behind gets
/// [`SinkError::Lagging`] for everything sent until it catches up.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    id: ChannelId,
    sender: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Creates a sink holding up to [`SUBSCRIBER_QUEUE_CAPACITY`] payloads and
    /// the receiver the transport should drain.
    pub fn new(id: ChannelId) -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_capacity(id, SUBSCRIBER_QUEUE_CAPACITY)
    }

    /// Like [`ChannelSink::new`] with an explicit queue size (at least 1).
    pub fn with_capacity(id: ChannelId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { id, sender }, receiver)
    }
}

impl SubscriberSink for ChannelSink {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, payload: Bytes) -> Result<(), SinkError> {
        self.sender.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Lagging,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Bidirectional tag <-> channel association.
#[derive(Default)]
pub struct Subscriptions {
    by_tag: HashMap<Tag, BTreeMap<ChannelId, Arc<dyn SubscriberSink>>>,
    by_channel: HashMap<ChannelId, BTreeSet<Tag>>,
}

impl Subscriptions {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `channel` is associated with `tag`.
    pub fn contains(&self, tag: &Tag, channel: ChannelId) -> bool {
        self.by_tag
            .get(tag)
            .is_some_and(|channels| channels.contains_key(&channel))
    }

    /// Associates `sink` with `tag`. Returns `false` if it already was.
    pub fn insert(&mut self, tag: Tag, sink: Arc<dyn SubscriberSink>) -> bool {
        let channel = sink.id();
        let channels = self.by_tag.entry(tag.clone()).or_default();
        if channels.contains_key(&channel) {
            return false;
        }
        channels.insert(channel, sink);
        self.by_channel.entry(channel).or_default().insert(tag);
        true
    }

    /// Drops the association. Returns `false` if there was none.
    pub fn remove(&mut self, tag: &Tag, channel: ChannelId) -> bool {
        let Some(channels) = self.by_tag.get_mut(tag) else {
            return false;
        };
        if channels.remove(&channel).is_none() {
            return false;
        }
        if channels.is_empty() {
            self.by_tag.remove(tag);
        }
        if let Some(tags) = self.by_channel.get_mut(&channel) {
            tags.remove(tag);
            if tags.is_empty() {
                self.by_channel.remove(&channel);
            }
        }
        true
    }

    /// Drops every association of `channel` and returns the tags it had.
    pub fn remove_channel(&mut self, channel: ChannelId) -> BTreeSet<Tag> {
        let tags = self.by_channel.remove(&channel).unwrap_or_default();
        for tag in &tags {
            if let Some(channels) = self.by_tag.get_mut(tag) {
                channels.remove(&channel);
                if channels.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        tags
    }

    /// Sinks associated with the (already normalized) tag text.
    pub fn sinks_for(&self, tag: &str) -> Vec<Arc<dyn SubscriberSink>> {
        self.by_tag
            .get(tag)
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Tags `channel` is associated with.
    pub fn tags_of(&self, channel: ChannelId) -> BTreeSet<Tag> {
        self.by_channel.get(&channel).cloned().unwrap_or_default()
    }

    /// Number of channels associated with `tag`.
    pub fn channel_count(&self, tag: &Tag) -> usize {
        self.by_tag.get(tag).map_or(0, BTreeMap::len)
    }

    /// Number of channels with at least one association.
    pub fn active_channels(&self) -> usize {
        self.by_channel.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> Tag {
        Tag::parse(s).unwrap()
    }

    fn sink(id: u64) -> Arc<dyn SubscriberSink> {
        Arc::new(ChannelSink::new(ChannelId(id)).0)
    }

    #[test]
    fn insert_is_idempotent_per_pair() {
        let mut subs = Subscriptions::new();
        assert!(subs.insert(tag("foo"), sink(1)));
        assert!(!subs.insert(tag("foo"), sink(1)));
        assert!(subs.insert(tag("foo"), sink(2)));
        assert_eq!(subs.channel_count(&tag("foo")), 2);
    }

    #[test]
    fn remove_cleans_both_indexes() {
        let mut subs = Subscriptions::new();
        subs.insert(tag("foo"), sink(1));
        assert!(subs.remove(&tag("foo"), ChannelId(1)));
        assert!(!subs.remove(&tag("foo"), ChannelId(1)));
        assert_eq!(subs.channel_count(&tag("foo")), 0);
        assert!(subs.tags_of(ChannelId(1)).is_empty());
        assert_eq!(subs.active_channels(), 0);
    }

    #[test]
    fn remove_channel_returns_all_its_tags() {
        let mut subs = Subscriptions::new();
        subs.insert(tag("foo"), sink(1));
        subs.insert(tag("bar"), sink(1));
        subs.insert(tag("bar"), sink(2));
        let removed: Vec<_> = subs.remove_channel(ChannelId(1)).into_iter().collect();
        assert_eq!(removed, [tag("bar"), tag("foo")]);
        assert!(subs.sinks_for("foo").is_empty());
        assert_eq!(subs.sinks_for("bar").len(), 1);
    }

    #[test]
    fn channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelSink::new(ChannelId(9));
        assert!(sink.send(Bytes::from_static(b"x")).is_ok());
        drop(rx);
        assert_eq!(sink.send(Bytes::from_static(b"y")), Err(SinkError::Closed));
    }

    #[test]
    fn channel_sink_refuses_a_stalled_reader() {
        let (sink, mut rx) = ChannelSink::with_capacity(ChannelId(4), 3);
        let payload = Bytes::from(vec![0u8; 1024]);
        for _ in 0..3 {
            assert!(sink.send(payload.clone()).is_ok());
        }
        for _ in 0..1000 {
            assert_eq!(sink.send(payload.clone()), Err(SinkError::Lagging));
        }
        assert_eq!(rx.len(), 3);

        rx.try_recv().unwrap();
        assert!(sink.send(payload).is_ok());
        assert_eq!(rx.len(), 3);
    }

    #[test]
    fn default_queue_is_bounded() {
        let (sink, rx) = ChannelSink::new(ChannelId(5));
        let payload = Bytes::from_static(b"{}");
        let accepted = (0..SUBSCRIBER_QUEUE_CAPACITY + 50)
            .filter(|_| sink.send(payload.clone()).is_ok())
            .count();
        assert_eq!(accepted, SUBSCRIBER_QUEUE_CAPACITY);
        assert_eq!(rx.len(), SUBSCRIBER_QUEUE_CAPACITY);
    }
}
