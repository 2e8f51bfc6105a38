//! # Fan-out Dispatcher
//!
//! Routes items to the subscriber channels of every tag they carry.
//!
//! ## Core Design Principles:
//!
//! 1.  **Encode Once**: An item is serialised a single time and the resulting
//!     `Bytes` is cloned (a reference-count bump) into every sink.
//!
//! 2.  **Lock Only to Look Up**: The subscriptions mutex is held just long
//!     enough to copy out the sink handles for a tag. Sends happen after it is
//!     released, so a slow transport never stalls registration.
//!
//! 3.  **Best Effort**: A sink that fails (closed, or lagging behind its
//!     bounded queue) is skipped, not retried and not removed. Detecting dead
//!     subscribers is the transport's job; it reports them through
//!     `Broadcaster::on_subscriber_disconnect`.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use crate::core::subscriptions::Subscriptions;
use crate::core::tag::{normalize, Tag};
use crate::feed::item::{encode_batch, encode_item, FeedItem};

/// Owner of the subscription map and the publish path.
#[derive(Default)]
pub struct Dispatcher {
    subscriptions: Mutex<Subscriptions>,
}

impl Dispatcher {
    /// Creates a dispatcher with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to the subscription map.
    pub(crate) fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock().expect("Dispatcher lock poisoned")
    }

    /// # Publish
    ///
    /// Sends one live item to the subscribers of each tag it carries. Tags are
    /// compared lower-cased; an item carrying the same tag twice is delivered
    /// once for it. An item with no tags reaches nobody.
    ///
    /// Returns the number of successful sends.
    pub fn publish(&self, item: &FeedItem) -> usize {
        let tags: BTreeSet<String> = item.tags.iter().map(|t| normalize(t)).collect();
        if tags.is_empty() {
            return 0;
        }
        let payload = match encode_item(item) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Dropping item {}: {}", item.id, e);
                return 0;
            }
        };
        tags.iter().map(|tag| self.deliver(tag, &payload)).sum()
    }

    /// # Publish Batch
    ///
    /// Sends a search result subset to the subscribers of `tag` as a single
    /// array payload. Empty batches are not sent.
    pub fn publish_batch(&self, tag: &Tag, items: &[&FeedItem]) -> usize {
        if items.is_empty() {
            return 0;
        }
        let payload = match encode_batch(items.iter().copied()) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Dropping batch of {} items for {}: {}", items.len(), tag, e);
                return 0;
            }
        };
        self.deliver(tag.as_str(), &payload)
    }

    fn deliver(&self, tag: &str, payload: &Bytes) -> usize {
        let sinks = self.subscriptions().sinks_for(tag);
        let mut delivered = 0;
        for sink in sinks {
            match sink.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("Send to channel {} for {} failed: {}", sink.id(), tag, e),
            }
        }
        delivered
    }

    /// Number of channels currently associated with `tag`.
    pub fn subscriber_count(&self, tag: &Tag) -> usize {
        self.subscriptions().channel_count(tag)
    }
}
