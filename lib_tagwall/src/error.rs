//! # Error Types
//!
//! Every failure the core can observe. None of these reach a subscriber: the
//! workers log them and carry on, and only `TagError`/`CommandError` are ever
//! returned to the transport.

use thiserror::Error;

/// Why a tag was refused at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    /// The tag was empty.
    #[error("tag is empty")]
    Empty,

    /// The tag is longer than the upstream allows.
    #[error("tag is {len} characters long, the limit is {max}")]
    TooLong {
        /// Length of the offending tag, in characters.
        len: usize,
        /// The configured limit.
        max: usize,
    },

    /// The tag contains something other than ASCII letters, digits or `_`.
    #[error("tag {0:?} may only contain letters, digits and underscores")]
    InvalidCharacters(String),
}

/// A malformed command line from the subscriber transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The line was blank.
    #[error("empty command")]
    Empty,

    /// The verb is not one of REG/REGISTER/UNREG/UNREGISTER.
    #[error("unknown command {0:?}")]
    UnknownVerb(String),

    /// The verb needs a tag argument and none was given.
    #[error("command {0:?} is missing its tag argument")]
    MissingTag(String),
}

/// Failures reported by the live feed and search collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Opening the filtered live connection failed.
    #[error("failed to open live connection: {0}")]
    Connect(String),

    /// The live connection broke after it was established.
    #[error("live stream failed: {0}")]
    Stream(String),

    /// A search query failed.
    #[error("search failed (transient: {transient}): {message}")]
    Search {
        /// Whether retrying later is expected to succeed.
        transient: bool,
        /// Collaborator supplied detail.
        message: String,
    },
}

/// A subscriber sink refused a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The receiving side is gone.
    #[error("subscriber channel closed")]
    Closed,

    /// The subscriber's queue is full; it is not reading fast enough.
    #[error("subscriber is lagging, payload dropped")]
    Lagging,
}

/// A feed item (or batch) could not be serialised.
#[derive(Debug, Error)]
#[error("failed to serialise payload: {0}")]
pub struct PayloadError(#[from] pub serde_json::Error);

/// A hub setting is out of range.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A rate, period or count must be strictly positive and finite.
    #[error("{field} must be positive, got {value}")]
    NotPositive {
        /// Name of the offending setting.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// A period (or the interval implied by a rate) is too short to tick or
    /// too long to schedule.
    #[error("{field} of {value} gives a period outside 1ns..={max_secs}s")]
    OutOfRange {
        /// Name of the offending setting.
        field: &'static str,
        /// The rejected value.
        value: f64,
        /// Longest accepted period, in seconds.
        max_secs: u64,
    },
}
