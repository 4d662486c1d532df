//! Leaky-bucket rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod eviction;
mod key;
mod limiter;
mod queue;

pub use backend::{AdmissionControl, Decision};
pub use bucket::{BucketPolicy, LeakyBucket, DEFAULT_CAPACITY, DEFAULT_LEAK_RATE};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use eviction::run_idle_sweeper;
pub use key::{BucketKey, KeyStrategy, ANONYMOUS_CLIENT};
pub use limiter::LeakyBucketLimiter;
pub use queue::{QueuedLimiter, DEFAULT_QUEUE_TIMEOUT};
