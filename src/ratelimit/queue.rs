//! Bounded wait queue in front of a leaky-bucket limiter.
//!
//! A request that finds its bucket full can wait, up to a timeout, for the
//! bucket to leak instead of being rejected outright. Waiters are granted in
//! FIFO order by a drainer that wakes once per leaked token.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::backend::{AdmissionControl, Decision};
use super::clock::{Clock, MonotonicClock};
use super::limiter::LeakyBucketLimiter;

/// Default time a waiter may spend in the queue.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

type Waiter = oneshot::Sender<()>;

/// A limiter that queues rejected requests instead of failing them at once.
///
/// Each key has its own FIFO behind its own lock, laid out like the
/// limiter's buckets, so queueing or granting on one key never waits on
/// another.
pub struct QueuedLimiter<C: Clock = MonotonicClock> {
    limiter: Arc<LeakyBucketLimiter<C>>,
    /// Pending waiters indexed by key
    waiters: DashMap<String, Mutex<VecDeque<Waiter>>>,
    max_queue_size: usize,
    timeout: Duration,
}

impl<C: Clock> QueuedLimiter<C> {
    /// Wrap `limiter` with a queue of at most `max_queue_size` waiters per key.
    ///
    /// A `max_queue_size` of zero disables queueing.
    pub fn new(
        limiter: Arc<LeakyBucketLimiter<C>>,
        max_queue_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            limiter,
            waiters: DashMap::new(),
            max_queue_size,
            timeout,
        }
    }

    /// The wrapped limiter.
    pub fn limiter(&self) -> &Arc<LeakyBucketLimiter<C>> {
        &self.limiter
    }

    /// Number of live waiters for `key`.
    pub fn queued_len(&self, key: &str) -> usize {
        self.waiters
            .get(key)
            .map(|queue| queue.lock().iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Admit immediately if the bucket has room, otherwise wait in the queue.
    pub async fn admit_or_wait(&self, key: &str) -> Decision {
        if self.limiter.allow(key) {
            return Decision::Admitted;
        }
        if self.max_queue_size == 0 {
            return Decision::Rejected;
        }

        let rx = {
            let entry = self.waiters.entry(key.to_owned()).or_default();
            let mut queue = entry.lock();
            queue.retain(|tx| !tx.is_closed());

            if queue.len() >= self.max_queue_size {
                warn!(
                    key = %key,
                    max_queue_size = self.max_queue_size,
                    "Queue full, rejecting request"
                );
                return Decision::QueueFull;
            }

            let (tx, rx) = oneshot::channel();
            queue.push_back(tx);
            trace!(key = %key, queued = queue.len(), "Request queued");
            rx
        };

        match time::timeout(self.timeout, rx).await {
            Ok(Ok(())) => Decision::Admitted,
            // The sender was dropped without a grant, e.g. the queue was cleared.
            Ok(Err(_)) => Decision::Rejected,
            Err(_) => {
                warn!(
                    key = %key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Request timed out in queue"
                );
                Decision::TimedOut
            }
        }
    }

    /// Grant as many queued waiters as the buckets currently allow.
    ///
    /// Waiters whose callers already gave up are dropped without consuming
    /// capacity. Keys are visited one at a time, so only the key being
    /// drained is locked. Returns the number of waiters granted.
    pub fn drain_once(&self) -> usize {
        let mut granted = 0;

        for entry in self.waiters.iter() {
            let key = entry.key();
            let mut queue = entry.value().lock();
            queue.retain(|tx| !tx.is_closed());

            while !queue.is_empty() {
                if !self.limiter.allow(key) {
                    break;
                }
                if let Some(tx) = queue.pop_front() {
                    if tx.send(()).is_ok() {
                        granted += 1;
                    } else {
                        debug!(key = %key, "Waiter gave up before its grant");
                    }
                }
            }
        }

        self.waiters.retain(|_, queue| !queue.get_mut().is_empty());
        granted
    }

    /// Run the drainer until `shutdown` resolves.
    ///
    /// Wakes once per token interval of the wrapped limiter's policy.
    pub async fn run_drainer<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let period = self.limiter.policy().token_interval();
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(period_ms = period.as_millis() as u64, "Queue drainer started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let granted = self.drain_once();
                    if granted > 0 {
                        trace!(granted = granted, "Granted queued requests");
                    }
                }
            }
        }

        info!("Queue drainer stopped");
    }
}

#[async_trait]
impl<C: Clock + 'static> AdmissionControl for QueuedLimiter<C> {
    async fn admit(&self, key: &str) -> Decision {
        self.admit_or_wait(key).await
    }

    fn retry_after_secs(&self) -> u64 {
        self.limiter.retry_after_secs()
    }
}
