//! # Feed Module
//!
//! The data that flows through the relay and the collaborators it comes from.
//!
//! ## Contained Modules:
//! - **`item`**: The normalized `FeedItem` record and its stable JSON payload
//!   form as delivered to subscribers.
//! - **`source`**: The `LiveFeed` and `SearchClient` traits. The core never
//!   talks to the upstream service directly; the server binary (or a test)
//!   supplies implementations of these.

/// The feed item record and payload encoding.
pub mod item;
/// Live feed and search collaborator traits.
pub mod source;

pub use item::{encode_batch, encode_item, FeedItem, ItemView, Reshare};
pub use source::{FeedStream, LiveFeed, SearchClient};
