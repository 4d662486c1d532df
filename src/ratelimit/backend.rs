//! Admission trait for abstracting immediate and queued limiters.

use async_trait::async_trait;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Admitted,
    /// The bucket was full.
    Rejected,
    /// The bucket was full and so was the wait queue.
    QueueFull,
    /// The request waited in the queue and the bucket never drained in time.
    TimedOut,
}

impl Decision {
    /// Whether the guarded operation may run.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

/// Trait for admission control implementations.
///
/// The HTTP layer only depends on this trait so it can work with either the
/// immediate `LeakyBucketLimiter` or the waiting `QueuedLimiter`.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Decide whether one request for `key` may proceed.
    async fn admit(&self, key: &str) -> Decision;

    /// Seconds a rejected client should wait before retrying.
    fn retry_after_secs(&self) -> u64;
}
