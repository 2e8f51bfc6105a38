//! # Hub Configuration
//!
//! Tunables for the hub's workers. Every field has a default that matches
//! the limits of a typical hosted stream and search API, so an empty JSON
//! object deserialises to a usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound on the number of tags one fallback query may OR together.
pub const MAX_TAGS_PER_QUERY: usize = 10;

/// Longest period any worker may be configured with, directly or through a
/// rate.
pub const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Settings for a [`TagHub`](crate::core::hub::TagHub).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubConfig {
    /// Live filter reconnects per second.
    pub filter_update_rate: f64,
    /// Quiet time after the first registry change before a reconnect.
    pub filter_debounce_ms: u64,
    /// How often a dropped live connection is re-attempted.
    pub filter_recheck_secs: u64,
    /// Fallback searches per second.
    pub fallback_poll_rate: f64,
    /// Time between fallback coverage cycles.
    pub fallback_poll_period_secs: f64,
    /// Initial-load searches per second.
    pub initial_load_rate: f64,
    /// Tags per fallback query. Clamped to `1..=MAX_TAGS_PER_QUERY`.
    pub max_tags_per_query: usize,
    /// Result count requested from every search.
    pub search_max_results: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            filter_update_rate: 0.3,
            filter_debounce_ms: 500,
            filter_recheck_secs: 30,
            fallback_poll_rate: 0.5,
            fallback_poll_period_secs: 2.0,
            initial_load_rate: 1.0,
            max_tags_per_query: MAX_TAGS_PER_QUERY,
            search_max_results: 100,
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

/// `secs` as a non-zero duration no longer than [`MAX_PERIOD`].
fn period(field: &'static str, value: f64, secs: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(period) if !period.is_zero() && period <= MAX_PERIOD => Ok(period),
        _ => Err(ConfigError::OutOfRange {
            field,
            value,
            max_secs: MAX_PERIOD.as_secs(),
        }),
    }
}

fn rate(field: &'static str, value: f64) -> Result<(), ConfigError> {
    positive(field, value)?;
    period(field, value, 1.0 / value).map(drop)
}

impl HubConfig {
    /// Rejects zero, negative and non-finite rates and periods, and any
    /// period (or rate interval) that rounds to zero or exceeds [`MAX_PERIOD`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        rate("filterUpdateRate", self.filter_update_rate)?;
        rate("fallbackPollRate", self.fallback_poll_rate)?;
        rate("initialLoadRate", self.initial_load_rate)?;

        let recheck = self.filter_recheck_secs as f64;
        positive("filterRecheckSecs", recheck)?;
        period("filterRecheckSecs", recheck, recheck)?;

        let poll = self.fallback_poll_period_secs;
        positive("fallbackPollPeriodSecs", poll)?;
        period("fallbackPollPeriodSecs", poll, poll)?;

        positive("searchMaxResults", self.search_max_results as f64)?;
        Ok(())
    }

    /// Quiet time before a filter reconnect.
    pub fn filter_debounce(&self) -> Duration {
        Duration::from_millis(self.filter_debounce_ms)
    }

    /// Re-check period while the live connection is down, capped at
    /// [`MAX_PERIOD`].
    pub fn filter_recheck(&self) -> Duration {
        Duration::from_secs(self.filter_recheck_secs).min(MAX_PERIOD)
    }

    /// Fallback cycle period. Values [`validate`](Self::validate) would
    /// reject are clamped into `1ms..=MAX_PERIOD` instead of panicking.
    pub fn fallback_poll_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.fallback_poll_period_secs)
            .unwrap_or(MAX_PERIOD)
            .clamp(Duration::from_millis(1), MAX_PERIOD)
    }

    /// `max_tags_per_query` clamped to what a query may hold.
    pub fn tags_per_query(&self) -> usize {
        self.max_tags_per_query.clamp(1, MAX_TAGS_PER_QUERY)
    }
}
