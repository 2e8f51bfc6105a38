//! # Upstream Collaborators
//!
//! The two ways items enter the relay: a single filtered live connection, and
//! a keyword search used while that connection is down and for initial loads.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::core::registry::TagSet;
use crate::error::FeedError;
use crate::feed::item::FeedItem;

/// Items from one live connection. The stream is lazy and not restartable; it
/// ends (or yields an error) when the connection drops. Dropping it closes the
/// connection.
pub type FeedStream = BoxStream<'static, Result<FeedItem, FeedError>>;

/// Opens filter-scoped live connections to the upstream service.
///
/// Only the filter controller calls this, and it never holds more than one
/// stream at a time.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    /// Opens a connection that delivers items carrying any of `tags`.
    async fn connect(&self, tags: &TagSet) -> Result<FeedStream, FeedError>;
}

/// Runs keyword searches against the upstream service.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Returns up to `max_results` recent items matching `query`.
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<FeedItem>, FeedError>;
}
