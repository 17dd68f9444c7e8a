//! Admission limiter: per-key token buckets
//!
//! The first gate applied to any outbound call. Each resource key (an
//! API host, a scraped site, a payment rail) gets its own bucket with a
//! configured rate and burst capacity; unconfigured keys fall back to a
//! global default. Refill is computed lazily from elapsed wall-clock
//! time at each access - there are no background timers.

use crate::config::{BucketConfig, LimiterConfig};
use crate::error::{IntakeError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A single token bucket
///
/// Token count is a float clamped to `[0, capacity]`.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    capacity: f64,
}

impl Bucket {
    fn new(config: &BucketConfig) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: Instant::now(),
            rate: config.rate,
            capacity: config.capacity,
        }
    }

    /// Refill based on elapsed time since last access
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Wait statistics for the limiter
#[derive(Debug, Clone, Default)]
pub struct LimiterStats {
    /// Total acquire/try_acquire requests
    pub requests: u64,
    /// Requests that had to wait
    pub waited: u64,
    /// Sum of all wait durations in seconds
    pub total_wait_secs: f64,
    /// Number of keys with an allocated bucket
    pub keys_tracked: usize,
}

struct LimiterInner {
    buckets: HashMap<String, Bucket>,
    requests: u64,
    waited: u64,
    total_wait_secs: f64,
}

/// Per-key token bucket admission limiter
pub struct AdmissionLimiter {
    config: LimiterConfig,
    inner: Mutex<LimiterInner>,
}

impl AdmissionLimiter {
    /// Create a limiter from configuration
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LimiterInner {
                buckets: HashMap::new(),
                requests: 0,
                waited: 0,
                total_wait_secs: 0.0,
            }),
        }
    }

    fn bucket_config(&self, key: &str) -> BucketConfig {
        self.config
            .per_key
            .get(key)
            .cloned()
            .unwrap_or(BucketConfig {
                rate: self.config.default_rate,
                capacity: self.config.default_capacity,
            })
    }

    fn check_cost(cost: f64) -> Result<()> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(IntakeError::InvalidCost(cost));
        }
        Ok(())
    }

    /// Reject rates and capacities the refill arithmetic cannot handle
    fn check_bucket(config: &BucketConfig) -> Result<()> {
        if !config.rate.is_finite() || config.rate <= 0.0 {
            return Err(IntakeError::Config(format!(
                "bucket rate must be positive and finite, got {}",
                config.rate
            )));
        }
        if !config.capacity.is_finite() || config.capacity <= 0.0 {
            return Err(IntakeError::Config(format!(
                "bucket capacity must be positive and finite, got {}",
                config.capacity
            )));
        }
        Ok(())
    }

    /// Acquire tokens, suspending the caller if necessary
    ///
    /// Refills lazily, then either deducts immediately (returns zero
    /// wait) or computes the exact wait for sufficiency, suspends for
    /// that duration, and deducts. Returns the time waited.
    pub async fn acquire(&self, key: &str, cost: f64) -> Result<Duration> {
        Self::check_cost(cost)?;

        let wait = {
            let mut inner = self.inner.lock();
            inner.requests += 1;
            let config = self.bucket_config(key);
            Self::check_bucket(&config)?;
            let bucket = inner
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| Bucket::new(&config));
            bucket.refill();

            if bucket.tokens >= cost {
                bucket.tokens = (bucket.tokens - cost).max(0.0);
                return Ok(Duration::ZERO);
            }

            let wait_secs = (cost - bucket.tokens) / bucket.rate;
            inner.waited += 1;
            inner.total_wait_secs += wait_secs;
            Duration::from_secs_f64(wait_secs)
        };

        tracing::debug!(key, wait_ms = wait.as_millis() as u64, "admission wait");
        tokio::time::sleep(wait).await;

        // Deduct after the wait; refill covers the elapsed sleep
        let mut inner = self.inner.lock();
        let config = self.bucket_config(key);
        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(&config));
        bucket.refill();
        bucket.tokens = (bucket.tokens - cost).max(0.0);

        Ok(wait)
    }

    /// Try to acquire tokens without suspending
    ///
    /// Fails closed: returns `Ok(false)` when tokens are insufficient.
    pub fn try_acquire(&self, key: &str, cost: f64) -> Result<bool> {
        Self::check_cost(cost)?;

        let mut inner = self.inner.lock();
        inner.requests += 1;
        let config = self.bucket_config(key);
        Self::check_bucket(&config)?;
        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(&config));
        bucket.refill();

        if bucket.tokens >= cost {
            bucket.tokens = (bucket.tokens - cost).max(0.0);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Estimated wait for the given cost, without acquiring
    pub fn wait_hint(&self, key: &str, cost: f64) -> Result<Duration> {
        Self::check_cost(cost)?;

        let mut inner = self.inner.lock();
        let config = self.bucket_config(key);
        Self::check_bucket(&config)?;
        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(&config));
        bucket.refill();

        if bucket.tokens >= cost {
            Ok(Duration::ZERO)
        } else {
            Ok(Duration::from_secs_f64((cost - bucket.tokens) / bucket.rate))
        }
    }

    /// Override the rate for a key, resetting its bucket
    pub fn set_rate(&self, key: &str, config: BucketConfig) -> Result<()> {
        Self::check_bucket(&config)?;
        let mut inner = self.inner.lock();
        inner.buckets.insert(key.to_string(), Bucket::new(&config));
        Ok(())
    }

    /// Read-only snapshot of wait statistics
    pub fn stats(&self) -> LimiterStats {
        let inner = self.inner.lock();
        LimiterStats {
            requests: inner.requests,
            waited: inner.waited,
            total_wait_secs: inner.total_wait_secs,
            keys_tracked: inner.buckets.len(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn limiter(rate: f64, capacity: f64) -> AdmissionLimiter {
        AdmissionLimiter::new(LimiterConfig {
            default_rate: rate,
            default_capacity: capacity,
            per_key: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_acquire_within_capacity_is_immediate() {
        let limiter = limiter(10.0, 5.0);
        let wait = limiter.acquire("api", 1.0).await.unwrap();
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn test_try_acquire_exhausts_capacity() {
        let limiter = limiter(10.0, 5.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire("api", 1.0).unwrap());
        }
        // Bucket drained with no elapsed time: must fail closed
        assert!(!limiter.try_acquire("api", 1.0).unwrap());
    }

    #[test]
    fn test_refill_after_elapsed_time() {
        let limiter = limiter(10.0, 2.0);
        assert!(limiter.try_acquire("api", 2.0).unwrap());
        assert!(!limiter.try_acquire("api", 1.0).unwrap());

        // 1/R = 100ms for one token at rate 10/s
        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.try_acquire("api", 1.0).unwrap());
    }

    #[tokio::test]
    async fn test_acquire_waits_when_drained() {
        let limiter = limiter(100.0, 1.0);
        limiter.acquire("api", 1.0).await.unwrap();

        let start = Instant::now();
        let wait = limiter.acquire("api", 1.0).await.unwrap();
        assert!(wait > Duration::ZERO);
        // Rate 100/s means ~10ms to accrue one token
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_negative_cost_rejected() {
        let limiter = limiter(1.0, 1.0);
        assert!(matches!(
            limiter.try_acquire("api", -1.0),
            Err(IntakeError::InvalidCost(_))
        ));
    }

    #[test]
    fn test_per_key_config_overrides_default() {
        let mut per_key = HashMap::new();
        per_key.insert(
            "slow-site".to_string(),
            BucketConfig {
                rate: 0.1,
                capacity: 1.0,
            },
        );
        let limiter = AdmissionLimiter::new(LimiterConfig {
            default_rate: 10.0,
            default_capacity: 5.0,
            per_key,
        });

        assert!(limiter.try_acquire("slow-site", 1.0).unwrap());
        assert!(!limiter.try_acquire("slow-site", 1.0).unwrap());

        // Default key still has its own, larger bucket
        assert!(limiter.try_acquire("fast-api", 1.0).unwrap());
        assert!(limiter.try_acquire("fast-api", 1.0).unwrap());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1.0, 1.0);
        assert!(limiter.try_acquire("a", 1.0).unwrap());
        assert!(!limiter.try_acquire("a", 1.0).unwrap());
        assert!(limiter.try_acquire("b", 1.0).unwrap());
    }

    #[test]
    fn test_wait_hint() {
        let limiter = limiter(10.0, 1.0);
        assert_eq!(limiter.wait_hint("api", 1.0).unwrap(), Duration::ZERO);
        assert!(limiter.try_acquire("api", 1.0).unwrap());
        let hint = limiter.wait_hint("api", 1.0).unwrap();
        assert!(hint > Duration::ZERO && hint <= Duration::from_millis(120));
    }

    #[test]
    fn test_set_rate_resets_bucket() {
        let limiter = limiter(1.0, 1.0);
        assert!(limiter.try_acquire("api", 1.0).unwrap());
        limiter
            .set_rate(
                "api",
                BucketConfig {
                    rate: 1.0,
                    capacity: 3.0,
                },
            )
            .unwrap();
        assert!(limiter.try_acquire("api", 3.0).unwrap());
    }

    #[test]
    fn test_zero_rate_bucket_rejected() {
        let mut per_key = HashMap::new();
        per_key.insert(
            "stalled".to_string(),
            BucketConfig {
                rate: 0.0,
                capacity: 1.0,
            },
        );
        let limiter = AdmissionLimiter::new(LimiterConfig {
            default_rate: 10.0,
            default_capacity: 5.0,
            per_key,
        });

        // A bucket that can never refill is a config error, not a wait
        assert!(matches!(
            limiter.try_acquire("stalled", 1.0),
            Err(IntakeError::Config(_))
        ));
        assert!(matches!(
            limiter.wait_hint("stalled", 1.0),
            Err(IntakeError::Config(_))
        ));

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(limiter
                .set_rate(
                    "api",
                    BucketConfig {
                        rate: bad,
                        capacity: 1.0,
                    },
                )
                .is_err());
        }
        assert!(limiter
            .set_rate(
                "api",
                BucketConfig {
                    rate: 1.0,
                    capacity: 0.0,
                },
            )
            .is_err());
    }

    #[test]
    fn test_stats() {
        let limiter = limiter(1.0, 2.0);
        limiter.try_acquire("api", 1.0).unwrap();
        limiter.try_acquire("api", 1.0).unwrap();
        let stats = limiter.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.keys_tracked, 1);
    }
}
