use std::time::Duration;

use tokio::time::Instant;

use crate::Error;

/// Multiplier applied by one dynamic adjustment step.
const INCREASE_FACTOR: f64 = 1.2;
const DECREASE_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Configured application throughput in bytes per second; 0 = unlimited.
    pub base_rate: u64,
    /// Floor for dynamic adjustment; 0 = no floor.
    pub min_rate: u64,
    /// Ceiling for dynamic adjustment; 0 = no ceiling.
    pub max_rate: u64,
    /// Fraction of one second of traffic the bucket may hold.
    pub burst_factor: f64,
    /// Compensation for TCP/TLS framing overhead on the wire.
    pub overhead_factor: f64,
    pub dynamic_enabled: bool,
    /// Minimum time between two dynamic adjustments.
    pub cooldown: Duration,
    pub increase_threshold: f64,
    pub decrease_threshold: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            base_rate: 0,
            min_rate: 0,
            max_rate: 0,
            burst_factor: 0.1,
            overhead_factor: 1.05,
            dynamic_enabled: false,
            cooldown: Duration::from_secs(1),
            increase_threshold: 0.8,
            decrease_threshold: 0.2,
        }
    }
}

impl BucketConfig {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Burst capacity in bytes for a given configured rate.
    ///
    /// The largest single take that can ever succeed at that rate; anything
    /// bigger is rejected with [`Error::TooLarge`](crate::Error::TooLarge).
    pub fn burst_capacity(&self, rate: u64) -> u64 {
        (rate as f64 * self.overhead_factor * self.burst_factor) as u64
    }
}

/// The verdict of [`RateBucket::take`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The tokens were consumed; send now.
    Ready,
    /// Too few tokens; offering the same amount after this wait will succeed.
    Wait(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketMetrics {
    /// Current configured rate in bytes per second (0 = unlimited).
    pub rate: u64,
    /// Current burst capacity in bytes.
    pub burst: u64,
    /// How often a take had to wait for refill.
    pub limit_hits: u64,
}

/// A token bucket over bytes with injected time.
///
/// Refill happens lazily on every [`take`](Self::take): `tokens = min(burst,
/// tokens + elapsed × rate)`. The rate used for refill is the configured rate
/// times [`BucketConfig::overhead_factor`], so the configured value describes
/// application throughput rather than on-wire throughput.
#[derive(Debug)]
pub struct RateBucket {
    config: BucketConfig,
    current_rate: u64,
    tokens: f64,
    last_refill: Instant,
    last_adjust: Instant,
    consumed_since_adjust: u64,
    limit_hits: u64,
}

impl RateBucket {
    pub fn new(config: BucketConfig, now: Instant) -> Self {
        let current_rate = clamp_rate(config.base_rate, config.min_rate, config.max_rate);

        let mut bucket = Self {
            config,
            current_rate,
            tokens: 0.0,
            last_refill: now,
            last_adjust: now,
            consumed_since_adjust: 0,
            limit_hits: 0,
        };
        bucket.tokens = bucket.burst();

        bucket
    }

    pub fn is_unlimited(&self) -> bool {
        self.current_rate == 0
    }

    pub fn current_rate(&self) -> u64 {
        self.current_rate
    }

    /// Effective refill rate in bytes per second.
    pub fn effective_rate(&self) -> f64 {
        self.current_rate as f64 * self.config.overhead_factor
    }

    pub fn burst(&self) -> f64 {
        self.effective_rate() * self.config.burst_factor
    }

    /// Attempts to consume `n` tokens.
    ///
    /// Requests larger than the burst capacity can never succeed and are
    /// rejected so the caller fragments instead of stalling forever.
    pub fn take(&mut self, n: u64, now: Instant) -> Result<Decision, Error> {
        if self.is_unlimited() {
            return Ok(Decision::Ready);
        }

        self.refill(now);

        let burst = self.burst();
        if n as f64 > burst {
            return Err(Error::TooLarge {
                requested: n,
                burst: burst as u64,
            });
        }

        if self.tokens >= n as f64 {
            self.tokens -= n as f64;
            self.consumed_since_adjust += n;

            return Ok(Decision::Ready);
        }

        self.limit_hits += 1;

        let deficit = n as f64 - self.tokens;
        let wait = Duration::from_secs_f64(deficit / self.effective_rate());

        Ok(Decision::Wait(wait))
    }

    /// Atomically replaces the current rate.
    ///
    /// Earned tokens survive the change but are clamped to the new burst, so
    /// a reload neither forfeits credit nor permits an instantaneous
    /// over-burst.
    pub fn set_rate(&mut self, new_rate: u64, now: Instant) -> Result<(), Error> {
        let floor = self.config.min_rate;
        let ceiling = self.config.max_rate;

        let below = floor != 0 && new_rate < floor;
        let above = ceiling != 0 && new_rate > ceiling;
        if new_rate != 0 && (below || above) {
            return Err(Error::RateOutOfRange {
                requested: new_rate,
                min: floor,
                max: ceiling,
            });
        }

        self.refill(now);
        self.current_rate = new_rate;
        self.tokens = self.tokens.min(self.burst());

        Ok(())
    }

    /// Applies one bounded dynamic adjustment step if the cooldown has
    /// elapsed and utilization warrants it.
    ///
    /// Returns the new rate when it changed.
    pub fn maybe_adjust(&mut self, now: Instant) -> Option<u64> {
        if !self.config.dynamic_enabled || self.is_unlimited() {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.last_adjust);
        if elapsed < self.config.cooldown {
            return None;
        }

        let capacity = self.effective_rate() * elapsed.as_secs_f64();
        let utilization = self.consumed_since_adjust as f64 / capacity;

        self.last_adjust = now;
        self.consumed_since_adjust = 0;

        let new_rate = if utilization >= self.config.increase_threshold {
            let ceiling = if self.config.max_rate != 0 {
                self.config.max_rate
            } else {
                u64::MAX
            };

            ((self.current_rate as f64 * INCREASE_FACTOR) as u64).min(ceiling)
        } else if utilization <= self.config.decrease_threshold {
            ((self.current_rate as f64 * DECREASE_FACTOR) as u64).max(self.config.min_rate.max(1))
        } else {
            self.current_rate
        };

        if new_rate == self.current_rate {
            return None;
        }

        self.refill(now);
        self.current_rate = new_rate;
        self.tokens = self.tokens.min(self.burst());

        Some(new_rate)
    }

    /// Replaces the whole configuration, e.g. from a reload.
    ///
    /// Earned tokens and the limit-hit counter survive; tokens clamp to the
    /// new burst.
    pub fn reconfigure(&mut self, config: BucketConfig, now: Instant) {
        self.refill(now);

        self.current_rate = clamp_rate(config.base_rate, config.min_rate, config.max_rate);
        self.config = config;
        self.tokens = self.tokens.min(self.burst());
    }

    pub fn metrics(&self) -> BucketMetrics {
        BucketMetrics {
            rate: self.current_rate,
            burst: self.burst() as u64,
            limit_hits: self.limit_hits,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);

        self.tokens = self
            .burst()
            .min(self.tokens + elapsed.as_secs_f64() * self.effective_rate());
        self.last_refill = now;
    }
}

fn clamp_rate(rate: u64, min: u64, max: u64) -> u64 {
    if rate == 0 {
        return 0;
    }

    let rate = rate.max(min);

    if max != 0 { rate.min(max) } else { rate }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: u64) -> BucketConfig {
        BucketConfig {
            base_rate: rate,
            overhead_factor: 1.0, // Keep the numbers round.
            ..BucketConfig::default()
        }
    }

    #[test]
    fn starts_with_a_full_burst() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(config(1000), now);

        assert_eq!(bucket.take(100, now).unwrap(), Decision::Ready);
        assert!(matches!(bucket.take(1, now).unwrap(), Decision::Wait(_)));
    }

    #[test]
    fn wait_is_proportional_to_the_deficit() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(config(1000), now);

        assert_eq!(bucket.take(60, now).unwrap(), Decision::Ready);

        // 40 tokens left, 20 missing, at 1000 B/s that is 20ms.
        let Decision::Wait(wait) = bucket.take(60, now).unwrap() else {
            panic!("expected a wait");
        };
        assert_eq!(wait, Duration::from_millis(20));
    }

    #[test]
    fn waiting_the_promised_duration_makes_the_take_succeed() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(config(1000), now);

        let _ = bucket.take(100, now).unwrap();
        let Decision::Wait(wait) = bucket.take(50, now).unwrap() else {
            panic!("expected a wait");
        };

        assert_eq!(bucket.take(50, now + wait).unwrap(), Decision::Ready);
    }

    #[test]
    fn idle_time_never_accumulates_more_than_one_burst() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(config(1000), now);

        let later = now + Duration::from_secs(3600);

        assert_eq!(bucket.take(100, later).unwrap(), Decision::Ready);
        assert!(matches!(bucket.take(100, later).unwrap(), Decision::Wait(_)));
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(config(1000), now);

        assert_eq!(
            bucket.take(101, now).unwrap_err(),
            Error::TooLarge {
                requested: 101,
                burst: 100,
            }
        );
    }

    #[test]
    fn unlimited_bucket_grants_anything() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(BucketConfig::unlimited(), now);

        assert_eq!(bucket.take(10_000_000, now).unwrap(), Decision::Ready);
        assert_eq!(bucket.metrics().limit_hits, 0);
    }

    #[test]
    fn overhead_factor_raises_the_refill_rate() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(
            BucketConfig {
                base_rate: 1000,
                overhead_factor: 1.05,
                ..BucketConfig::default()
            },
            now,
        );

        // Burst = 1000 * 1.05 * 0.1 = 105.
        assert_eq!(bucket.take(105, now).unwrap(), Decision::Ready);
        assert!(matches!(bucket.take(1, now).unwrap(), Decision::Wait(_)));
    }

    #[test]
    fn set_rate_clamps_earned_tokens_to_the_new_burst() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(config(1000), now);

        bucket.set_rate(500, now).unwrap();

        assert_eq!(bucket.take(50, now).unwrap(), Decision::Ready);
        assert!(matches!(bucket.take(1, now).unwrap(), Decision::Wait(_)));
    }

    #[test]
    fn set_rate_validates_the_configured_range() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(
            BucketConfig {
                base_rate: 1000,
                min_rate: 500,
                max_rate: 4000,
                ..BucketConfig::default()
            },
            now,
        );

        assert!(bucket.set_rate(499, now).is_err());
        assert!(bucket.set_rate(4001, now).is_err());
        assert!(bucket.set_rate(2000, now).is_ok());
        assert_eq!(bucket.current_rate(), 2000);
    }

    fn dynamic_config() -> BucketConfig {
        BucketConfig {
            base_rate: 1000,
            min_rate: 500,
            max_rate: 4000,
            overhead_factor: 1.0,
            dynamic_enabled: true,
            ..BucketConfig::default()
        }
    }

    #[test]
    fn sustained_high_utilization_steps_the_rate_up() {
        let start = Instant::now();
        let mut bucket = RateBucket::new(dynamic_config(), start);

        // Consume at full rate for a whole cooldown window.
        let mut now = start;
        for _ in 0..10 {
            now += Duration::from_millis(100);
            let _ = bucket.take(100, now).unwrap();
        }

        assert_eq!(bucket.maybe_adjust(now), Some(1200));
        assert_eq!(bucket.current_rate(), 1200);
    }

    #[test]
    fn idle_utilization_steps_the_rate_down_to_the_floor() {
        let start = Instant::now();
        let mut bucket = RateBucket::new(dynamic_config(), start);

        let mut now = start;
        for _ in 0..10 {
            now += Duration::from_secs(2);
            bucket.maybe_adjust(now);
        }

        assert_eq!(bucket.current_rate(), 500);
    }

    #[test]
    fn adjustments_respect_the_cooldown() {
        let start = Instant::now();
        let mut bucket = RateBucket::new(dynamic_config(), start);

        assert_eq!(bucket.maybe_adjust(start + Duration::from_millis(500)), None);

        // The first eligible adjustment sees zero utilization.
        assert_eq!(
            bucket.maybe_adjust(start + Duration::from_secs(1)),
            Some(800)
        );

        // Immediately after, the cooldown blocks another step.
        assert_eq!(bucket.maybe_adjust(start + Duration::from_secs(1)), None);
    }

    #[test]
    fn adjustment_is_capped_at_the_ceiling() {
        let start = Instant::now();
        let mut bucket = RateBucket::new(
            BucketConfig {
                base_rate: 3900,
                ..dynamic_config()
            },
            start,
        );

        let mut now = start;
        for _ in 0..10 {
            now += Duration::from_millis(100);
            let _ = bucket.take(390, now).unwrap();
        }

        assert_eq!(bucket.maybe_adjust(now), Some(4000));
        assert_eq!(bucket.maybe_adjust(now + Duration::from_secs(5)), Some(3200));
    }

    #[test]
    fn limit_hits_count_waits() {
        let now = Instant::now();
        let mut bucket = RateBucket::new(config(1000), now);

        let _ = bucket.take(100, now).unwrap();
        let _ = bucket.take(100, now).unwrap();
        let _ = bucket.take(100, now).unwrap();

        assert_eq!(bucket.metrics().limit_hits, 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Over any synthetic schedule, granted bytes never exceed
            /// `rate × elapsed + burst`.
            #[test]
            fn rate_bound_holds(
                steps in proptest::collection::vec((1u64..=200, 0u64..=500), 1..200),
            ) {
                let start = Instant::now();
                let mut bucket = RateBucket::new(config(1000), start);

                let mut now = start;
                let mut granted = 0u64;

                for (n, advance_ms) in steps {
                    now += Duration::from_millis(advance_ms);

                    if let Ok(Decision::Ready) = bucket.take(n, now) {
                        granted += n;
                    }
                }

                let elapsed = (now - start).as_secs_f64();
                let bound = 1000.0 * elapsed + bucket.burst() + 1.0;

                prop_assert!(
                    (granted as f64) <= bound,
                    "granted {granted} bytes, bound {bound}"
                );
            }

            /// A single take is never granted more than one burst without refill.
            #[test]
            fn burst_bound_holds(n in 1u64..=10_000) {
                let now = Instant::now();
                let mut bucket = RateBucket::new(config(1000), now);

                match bucket.take(n, now) {
                    Ok(Decision::Ready) => prop_assert!(n as f64 <= bucket.burst()),
                    Ok(Decision::Wait(_)) | Err(_) => {}
                }
            }
        }
    }
}
