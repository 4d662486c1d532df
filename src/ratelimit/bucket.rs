//! Leaky bucket state and its fill/leak recurrence.

use std::time::{Duration, Instant};

use crate::error::{Result, SluiceError};

/// Default burst size.
pub const DEFAULT_CAPACITY: f64 = 10.0;
/// Default drain rate in tokens per second.
pub const DEFAULT_LEAK_RATE: f64 = 2.0;

/// Validated bucket parameters shared by every bucket of a limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    capacity: f64,
    leak_rate: f64,
}

impl BucketPolicy {
    /// Create a policy, refusing parameters that cannot admit traffic.
    ///
    /// Capacity must hold at least one request, since a request needs a
    /// whole token of headroom. The leak rate must be positive and fast
    /// enough that draining a full bucket fits in a `Duration`.
    pub fn new(capacity: f64, leak_rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity < 1.0 {
            return Err(SluiceError::Config(format!(
                "bucket capacity must be a number of at least 1, got {}",
                capacity
            )));
        }
        if !leak_rate.is_finite() || leak_rate <= 0.0 {
            return Err(SluiceError::Config(format!(
                "leak rate must be a positive number of tokens per second, got {}",
                leak_rate
            )));
        }
        // capacity >= 1, so the drain time bounds the token interval too
        if Duration::try_from_secs_f64(capacity / leak_rate).is_err() {
            return Err(SluiceError::Config(format!(
                "leak rate {} is too slow to drain a bucket of capacity {}",
                leak_rate, capacity
            )));
        }
        Ok(Self {
            capacity,
            leak_rate,
        })
    }

    /// Maximum number of tokens a bucket may hold.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens drained per second.
    pub fn leak_rate(&self) -> f64 {
        self.leak_rate
    }

    /// Time for a full bucket to drain completely.
    pub fn drain_time(&self) -> Duration {
        Duration::from_secs_f64(self.capacity / self.leak_rate)
    }

    /// Time for one token to leak out.
    pub fn token_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.leak_rate)
    }
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            leak_rate: DEFAULT_LEAK_RATE,
        }
    }
}

/// Accumulated, not-yet-drained load for one key.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    level: f64,
    last_checked: Instant,
}

impl LeakyBucket {
    /// An empty bucket observed at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            level: 0.0,
            last_checked: now,
        }
    }

    /// Level as of the last update.
    pub fn level(&self) -> f64 {
        self.level
    }

    /// When the leak was last applied.
    pub fn last_checked(&self) -> Instant {
        self.last_checked
    }

    /// Level the bucket would have at `now`, without mutating it.
    ///
    /// An instant earlier than `last_checked` counts as zero elapsed time.
    pub fn level_at(&self, policy: &BucketPolicy, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_checked);
        (self.level - elapsed.as_secs_f64() * policy.leak_rate).max(0.0)
    }

    /// Apply the leak up to `now`.
    ///
    /// `last_checked` never moves backward, so a regressing clock neither
    /// drains the bucket nor re-counts time that already leaked.
    pub fn leak(&mut self, policy: &BucketPolicy, now: Instant) {
        self.level = self.level_at(policy, now);
        if now > self.last_checked {
            self.last_checked = now;
        }
    }

    /// Leak up to `now`, then admit one request if it fits.
    ///
    /// Returns `true` if the request was admitted. A rejection leaves the
    /// level untouched.
    pub fn try_admit(&mut self, policy: &BucketPolicy, now: Instant) -> bool {
        self.leak(policy, now);

        if self.level + 1.0 <= policy.capacity {
            self.level += 1.0;
            true
        } else {
            false
        }
    }
}
