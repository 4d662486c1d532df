//! Core leaky-bucket limiter implementation.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{AdmissionControl, Decision};
use super::bucket::{BucketPolicy, LeakyBucket};
use super::clock::{Clock, MonotonicClock};

/// The limiter that owns one leaky bucket per key.
///
/// Buckets live in a `DashMap` and each carries its own mutex, so the
/// leak-decide-update sequence for one key is atomic while calls for other
/// keys proceed in parallel. Share it between handlers with an `Arc`.
pub struct LeakyBucketLimiter<C: Clock = MonotonicClock> {
    /// Bucket state indexed by key
    buckets: DashMap<String, Mutex<LeakyBucket>>,
    /// Capacity and leak rate shared by every bucket
    policy: BucketPolicy,
    /// Time source for the leak computation
    clock: C,
}

impl LeakyBucketLimiter<MonotonicClock> {
    /// Create a limiter on the system monotonic clock.
    pub fn new(policy: BucketPolicy) -> Self {
        Self::with_clock(policy, MonotonicClock)
    }
}

impl<C: Clock> LeakyBucketLimiter<C> {
    /// Create a limiter that reads time from `clock`.
    pub fn with_clock(policy: BucketPolicy, clock: C) -> Self {
        Self {
            buckets: DashMap::new(),
            policy,
            clock,
        }
    }

    /// Decide whether one request for `key` may proceed.
    ///
    /// Creates the bucket on first use. Never blocks on anything but the
    /// key's own bucket.
    pub fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();

        let admitted = match self.buckets.get(key) {
            Some(bucket) => {
                let mut state = bucket.lock();
                state.try_admit(&self.policy, now)
            }
            None => {
                let bucket = self.buckets.entry(key.to_owned()).or_insert_with(|| {
                    debug!(key = %key, "Creating new leaky bucket");
                    Mutex::new(LeakyBucket::new(now))
                });
                let mut state = bucket.lock();
                state.try_admit(&self.policy, now)
            }
        };

        if admitted {
            trace!(key = %key, "Request admitted");
        } else {
            debug!(key = %key, "Rate limit exceeded");
        }
        admitted
    }

    /// Current level for `key`, leaked up to now, without mutating state.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn level(&self, key: &str) -> Option<f64> {
        let now = self.clock.now();
        let bucket = self.buckets.get(key)?;
        let state = bucket.lock();
        Some(state.level_at(&self.policy, now))
    }

    /// Remove buckets that have fully drained and sat idle for `max_idle`.
    ///
    /// A bucket still holding load is kept, so eviction never lets through a
    /// request that would otherwise be rejected. Returns the number removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;

        self.buckets.retain(|_, bucket| {
            let bucket = bucket.get_mut();
            let drained = bucket.level_at(&self.policy, now) <= 0.0;
            let idle = now.saturating_duration_since(bucket.last_checked()) >= max_idle;
            if drained && idle {
                evicted += 1;
                false
            } else {
                true
            }
        });

        evicted
    }

    /// The policy every bucket follows.
    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    /// Number of keys with a bucket.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[async_trait]
impl<C: Clock> AdmissionControl for LeakyBucketLimiter<C> {
    async fn admit(&self, key: &str) -> Decision {
        if self.allow(key) {
            Decision::Admitted
        } else {
            Decision::Rejected
        }
    }

    fn retry_after_secs(&self) -> u64 {
        (1.0 / self.policy.leak_rate()).ceil().max(1.0) as u64
    }
}
