//! Background sweep of idle buckets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use super::clock::Clock;
use super::limiter::LeakyBucketLimiter;

/// Periodically evict buckets that have drained and sat idle for `max_idle`.
///
/// Runs one sweep every `max_idle` until `shutdown` resolves.
pub async fn run_idle_sweeper<C, F>(
    limiter: Arc<LeakyBucketLimiter<C>>,
    max_idle: Duration,
    shutdown: F,
) where
    C: Clock,
    F: Future<Output = ()> + Send,
{
    let mut ticker = time::interval(max_idle);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and there is nothing to sweep yet.
    ticker.tick().await;
    tokio::pin!(shutdown);

    info!(max_idle_secs = max_idle.as_secs(), "Idle bucket sweeper started");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let evicted = limiter.evict_idle(max_idle);
                debug!(
                    evicted = evicted,
                    remaining = limiter.bucket_count(),
                    "Swept idle buckets"
                );
            }
        }
    }

    info!("Idle bucket sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BucketPolicy, ManualClock};
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_drained_buckets() {
        let clock = ManualClock::new();
        let policy = BucketPolicy::new(10.0, 2.0).unwrap();
        let limiter = Arc::new(LeakyBucketLimiter::with_clock(policy, clock.clone()));
        limiter.allow("documents");
        limiter.allow("tags");

        let (tx, rx) = oneshot::channel::<()>();
        let sweeper = tokio::spawn(run_idle_sweeper(
            Arc::clone(&limiter),
            Duration::from_secs(60),
            async move {
                let _ = rx.await;
            },
        ));

        clock.advance(Duration::from_secs(120));
        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(limiter.bucket_count(), 0);

        tx.send(()).unwrap();
        sweeper.await.unwrap();
    }
}
