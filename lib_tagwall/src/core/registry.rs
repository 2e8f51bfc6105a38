//! # Tag Registry
//!
//! Reference-counted set of tags that at least one subscriber follows. The
//! registry is the source of truth for the upstream filter: the filter
//! controller snapshots it, the fallback poller rotates over it.
//!
//! A tag is present iff its count is at least one. The `0 -> 1` and `1 -> 0`
//! transitions are reported to the caller because they are what triggers
//! filter updates and initial loads.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::core::tag::Tag;
use crate::error::TagError;

/// Immutable ordered copy of the tracked tags.
pub type TagSet = BTreeSet<Tag>;

/// Result of a successful `track` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked {
    /// The normalized tag.
    pub tag: Tag,
    /// `true` only when this call moved the tag from untracked to tracked.
    pub newly_tracked: bool,
}

/// Thread-safe tag -> reference count map.
#[derive(Debug, Default)]
pub struct TagRegistry {
    counts: Mutex<BTreeMap<Tag, u32>>,
}

impl TagRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and normalizes `raw`, then takes one reference on it.
    ///
    /// Invalid input leaves the registry untouched.
    pub fn track(&self, raw: &str) -> Result<Tracked, TagError> {
        let tag = Tag::parse(raw)?;
        let newly_tracked = self.acquire(&tag);
        Ok(Tracked { tag, newly_tracked })
    }

    /// Takes one reference on an already validated tag. Returns `true` on the
    /// `0 -> 1` transition.
    pub fn acquire(&self, tag: &Tag) -> bool {
        let mut counts = self.counts.lock().expect("Registry lock poisoned");
        let count = counts.entry(tag.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            log::info!("Tracking {}", tag);
            true
        } else {
            false
        }
    }

    /// Drops one reference. Returns `true` when the tag became untracked.
    ///
    /// Releasing a tag that is not tracked is a no-op.
    pub fn untrack(&self, tag: &Tag) -> bool {
        let mut counts = self.counts.lock().expect("Registry lock poisoned");
        let Some(count) = counts.get_mut(tag) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(tag);
            log::info!("Untracking {}", tag);
            true
        } else {
            false
        }
    }

    /// Ordered copy of the currently tracked tags.
    pub fn snapshot(&self) -> TagSet {
        let counts = self.counts.lock().expect("Registry lock poisoned");
        counts.keys().cloned().collect()
    }

    /// Current reference count for `tag`, zero if untracked.
    pub fn count(&self, tag: &Tag) -> u32 {
        let counts = self.counts.lock().expect("Registry lock poisoned");
        counts.get(tag).copied().unwrap_or(0)
    }

    /// Whether `tag` is tracked.
    pub fn contains(&self, tag: &Tag) -> bool {
        self.count(tag) > 0
    }

    /// Number of distinct tracked tags.
    pub fn len(&self) -> usize {
        self.counts.lock().expect("Registry lock poisoned").len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn tag(s: &str) -> Tag {
        Tag::parse(s).unwrap()
    }

    #[test]
    fn track_reports_only_the_first_reference() {
        let registry = TagRegistry::new();
        assert!(registry.track("rust").unwrap().newly_tracked);
        assert!(!registry.track("RUST").unwrap().newly_tracked);
        assert_eq!(registry.count(&tag("rust")), 2);
    }

    #[test]
    fn invalid_tags_have_no_side_effects() {
        let registry = TagRegistry::new();
        assert!(registry.track("#nope").is_err());
        assert!(registry.track("").is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn n_tracks_then_n_untracks_leaves_nothing() {
        let registry = TagRegistry::new();
        let rust = tag("rust");
        for _ in 0..5 {
            registry.track("rust").unwrap();
        }
        for i in 0..5 {
            assert!(registry.contains(&rust));
            let became_untracked = registry.untrack(&rust);
            assert_eq!(became_untracked, i == 4);
        }
        assert!(!registry.contains(&rust));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn entry_exists_iff_net_count_positive() {
        let registry = TagRegistry::new();
        let t = tag("mixed");
        // +1 +1 -1 +1 -1 -1 -1(extra)
        let ops = [true, true, false, true, false, false, false];
        let mut net: i32 = 0;
        for op in ops {
            if op {
                registry.acquire(&t);
                net += 1;
            } else {
                registry.untrack(&t);
                net = (net - 1).max(0);
            }
            assert_eq!(registry.contains(&t), net > 0);
        }
    }

    #[test]
    fn snapshot_is_ordered_and_detached() {
        let registry = TagRegistry::new();
        for raw in ["zeta", "alpha", "Mid"] {
            registry.track(raw).unwrap();
        }
        let snapshot = registry.snapshot();
        registry.untrack(&tag("alpha"));
        let names: Vec<_> = snapshot.iter().map(Tag::as_str).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_track_untrack_balances_out() {
        let registry = Arc::new(TagRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let t = tag(if i % 2 == 0 { "even" } else { "odd" });
                    for _ in 0..500 {
                        registry.acquire(&t);
                        registry.untrack(&t);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
