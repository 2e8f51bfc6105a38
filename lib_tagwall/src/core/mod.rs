//! # Core Engine Module
//!
//! Everything between the subscriber transport and the upstream feed.
//!
//! ## Core Components:
//!
//! - **`tag`**: Validation and normalization of the keywords subscribers
//!   follow.
//!
//! - **`registry`**: Reference counts per tracked tag. Its key set is what the
//!   live filter should be.
//!
//! - **`rate_limiter`**: Token buckets that pace reconnects and searches.
//!
//! - **`subscriptions`** / **`dispatcher`**: The tag -> channel map and the
//!   encode-once fan-out over it.
//!
//! - **`filter_controller`**: Debounced, rate-limited reconnects of the single
//!   live connection, and its state.
//!
//! - **`fallback_poller`**: Search coverage while the live connection is down,
//!   and initial loads for newly tracked tags.
//!
//! - **`broadcaster`**: Register/unregister entry points for the transport.
//!
//! - **`hub`**: Starts and stops all of the above.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Registration entry points and command parsing.
pub mod broadcaster;
/// Encode-once fan-out to subscriber sinks.
pub mod dispatcher;
/// Disconnected-state search coverage and initial loads.
pub mod fallback_poller;
/// The live connection and its debounced filter updates.
pub mod filter_controller;
/// The assembled, running hub.
pub mod hub;
/// Token bucket rate limiting.
pub mod rate_limiter;
/// Reference-counted tracked tags.
pub mod registry;
/// Subscriber channels and the tag -> channel map.
pub mod subscriptions;
/// Tag validation and normalization.
pub mod tag;

// --- Public API Re-exports ---
pub use broadcaster::{parse_command, Broadcaster, Command, Registration};
pub use dispatcher::Dispatcher;
pub use fallback_poller::{build_query, FallbackPoller, InitialLoader, PollCycle, RotationCursor};
pub use filter_controller::{
    plan_update, ConnectionState, FilterController, FilterDecision, FilterUpdateHandle,
    FilterUpdateState,
};
pub use hub::TagHub;
pub use rate_limiter::TokenBucket;
pub use registry::{TagRegistry, TagSet, Tracked};
pub use subscriptions::{ChannelId, ChannelSink, SubscriberSink, Subscriptions};
pub use tag::{normalize, Tag, MAX_TAG_LEN};
