//! # Tags
//!
//! A `Tag` is the keyword a subscriber follows. Tags are validated and
//! lower-cased at the boundary; once a `Tag` value exists it is known to be
//! 1 to 30 ASCII letters, digits or underscores, all lower case.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::TagError;

/// Longest tag the upstream accepts.
pub const MAX_TAG_LEN: usize = 30;

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("tag pattern is a valid regex"));

/// Lower-cases a raw tag. Idempotent.
pub fn normalize(raw: &str) -> String {
    raw.to_lowercase()
}

/// A validated, normalized tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    /// Validates `raw` and returns its normalized form.
    pub fn parse(raw: &str) -> Result<Self, TagError> {
        if raw.is_empty() {
            return Err(TagError::Empty);
        }
        let len = raw.chars().count();
        if len > MAX_TAG_LEN {
            return Err(TagError::TooLong { len, max: MAX_TAG_LEN });
        }
        if !TAG_PATTERN.is_match(raw) {
            return Err(TagError::InvalidCharacters(raw.to_string()));
        }
        Ok(Self(normalize(raw)))
    }

    /// The normalized text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The form used inside a search query, e.g. `#launch`.
    pub fn query_form(&self) -> String {
        format!("#{}", self.0)
    }

    /// Case-insensitive comparison against a tag as carried by a feed item.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Tag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
