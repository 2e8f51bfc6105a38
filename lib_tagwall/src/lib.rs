//! Tag-based live feed fan-out.
//!
//! Subscribers register interest in tags; the hub keeps one upstream live
//! connection filtered to the union of those tags, falls back to rate-limited
//! search while that connection is down, and fans every item out to the
//! subscribers of the tags it carries.

pub mod config;
pub mod core;
pub mod error;
pub mod feed;

pub use config::HubConfig;
pub use crate::core::{
    Broadcaster, ChannelId, ChannelSink, ConnectionState, Registration, SubscriberSink, Tag, TagHub,
    TagRegistry,
};
pub use error::{CommandError, ConfigError, FeedError, PayloadError, SinkError, TagError};
pub use feed::{FeedItem, FeedStream, LiveFeed, Reshare, SearchClient};
