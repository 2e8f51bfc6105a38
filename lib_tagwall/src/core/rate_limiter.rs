//! # Token-Bucket Rate Limiter
//!
//! A smooth limiter that hands out one permit every `1 / rate` seconds with a
//! burst of one. `acquire` never fails, it only waits; callers are expected to
//! await it from a worker task, never from the register/unregister path or the
//! live read loop.
//!
//! Waiters are served in arrival order because the reservation lock is a fair
//! `tokio::sync::Mutex` held across the sleep.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// One independently paced permit source.
#[derive(Debug)]
pub struct TokenBucket {
    name: &'static str,
    rate: f64,
    interval: Duration,
    next_free: Mutex<Instant>,
}

impl TokenBucket {
    /// Creates a limiter granting `permits_per_second` permits. The first
    /// permit is available immediately.
    ///
    /// A non-positive or non-finite rate yields a limiter that never grants a
    /// second permit; `HubConfig::validate` keeps such values out.
    pub fn new(name: &'static str, permits_per_second: f64) -> Self {
        let interval = Duration::try_from_secs_f64(1.0 / permits_per_second).unwrap_or(Duration::MAX);
        Self {
            name,
            rate: permits_per_second,
            interval,
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Waits until a permit is available and takes it. Returns how long the
    /// caller was held back.
    pub async fn acquire(&self) -> Duration {
        let mut next_free = self.next_free.lock().await;
        let now = Instant::now();
        let waited = if *next_free > now {
            let target = *next_free;
            log::debug!(
                "Rate limiter '{}' holding caller for {:?}",
                self.name,
                target - now
            );
            sleep_until(target).await;
            target - now
        } else {
            Duration::ZERO
        };
        let start = (*next_free).max(now);
        *next_free = start.checked_add(self.interval).unwrap_or(start);
        waited
    }

    /// Takes a permit only if one is available right now and nobody is queued.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut next_free) = self.next_free.try_lock() else {
            return false;
        };
        let now = Instant::now();
        if *next_free > now {
            return false;
        }
        *next_free = now.checked_add(self.interval).unwrap_or(now);
        true
    }

    /// Configured permits per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Name used in log lines.
    pub fn name(&self) -> &'static str {
        self.name
    }
}
