use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{BucketConfig, BucketMetrics, Decision, Error, RateBucket};

/// A shareable, direction-scoped rate limiter.
///
/// The bucket sits behind a short mutex-protected critical section; metric
/// reads go through atomics and never contend with the data plane. The lock
/// is never held across an `.await` and no I/O happens under it.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    bucket: Mutex<RateBucket>,
    rate: AtomicU64,
    burst: AtomicU64,
    limit_hits: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: BucketConfig) -> Self {
        let bucket = RateBucket::new(config, Instant::now());
        let metrics = bucket.metrics();

        Self {
            inner: Arc::new(Inner {
                bucket: Mutex::new(bucket),
                rate: AtomicU64::new(metrics.rate),
                burst: AtomicU64::new(metrics.burst),
                limit_hits: AtomicU64::new(metrics.limit_hits),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(BucketConfig::unlimited())
    }

    /// Waits until `n` bytes may pass.
    ///
    /// Dynamic adjustment piggybacks on this call; it is cooldown-gated
    /// inside the bucket so the extra work is O(1) per acquire.
    pub async fn acquire(&self, n: u64) -> Result<(), Error> {
        loop {
            // The critical section is O(1) and free of I/O; logging happens
            // after the lock is gone.
            let (decision, adjusted) = {
                let mut bucket = self.inner.bucket.lock();
                let decision = bucket.take(n, Instant::now())?;
                let adjusted = bucket.maybe_adjust(Instant::now());

                self.publish(&bucket);

                (decision, adjusted)
            };

            if let Some(new_rate) = adjusted {
                tracing::debug!(target: "sssonector::ratelimit", %new_rate, "Adjusted rate");
            }

            match decision {
                Decision::Ready => return Ok(()),
                Decision::Wait(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Replaces the configured rate, e.g. from a config reload.
    pub fn set_rate(&self, new_rate: u64) -> Result<(), Error> {
        let mut bucket = self.inner.bucket.lock();

        bucket.set_rate(new_rate, Instant::now())?;
        self.publish(&bucket);

        Ok(())
    }

    /// Replaces the whole shaping configuration, preserving earned tokens.
    pub fn reconfigure(&self, config: BucketConfig) {
        let mut bucket = self.inner.bucket.lock();

        bucket.reconfigure(config, Instant::now());
        self.publish(&bucket);
    }

    /// Wait-free snapshot of the current shaping state.
    pub fn metrics(&self) -> BucketMetrics {
        BucketMetrics {
            rate: self.inner.rate.load(Ordering::Relaxed),
            burst: self.inner.burst.load(Ordering::Relaxed),
            limit_hits: self.inner.limit_hits.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, bucket: &RateBucket) {
        let metrics = bucket.metrics();

        self.inner.rate.store(metrics.rate, Ordering::Relaxed);
        self.inner.burst.store(metrics.burst, Ordering::Relaxed);
        self.inner
            .limit_hits
            .store(metrics.limit_hits, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limited(rate: u64) -> RateLimiter {
        RateLimiter::new(BucketConfig {
            base_rate: rate,
            overhead_factor: 1.0,
            ..BucketConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_acquire_is_immediate() {
        let limiter = RateLimiter::unlimited();

        limiter.acquire(10_000_000).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = limited(1000);

        limiter.acquire(100).await.unwrap(); // Drains the initial burst.

        let before = Instant::now();
        limiter.acquire(100).await.unwrap();

        assert!(before.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_acquire_fails_instead_of_stalling() {
        let limiter = limited(1000);

        assert!(matches!(
            limiter.acquire(1_000_000).await,
            Err(Error::TooLarge { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn set_rate_is_visible_in_metrics() {
        let limiter = limited(1000);

        limiter.set_rate(2000).unwrap();

        assert_eq!(limiter.metrics().rate, 2000);
        assert_eq!(limiter.metrics().burst, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_hits_are_published() {
        let limiter = limited(1000);

        limiter.acquire(100).await.unwrap();
        limiter.acquire(100).await.unwrap();

        assert_eq!(limiter.metrics().limit_hits, 1);
    }
}
