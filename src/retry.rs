//! Retry engine with jittered exponential backoff
//!
//! Delays follow `base × exp_base^attempt`, capped at a maximum, with a
//! symmetric uniform jitter so synchronized callers do not retry in
//! lockstep. Errors classified fatal are surfaced immediately.

use crate::error::ErrorClass;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first (not "retries after")
    pub max_attempts: u32,
    /// Delay before the first retry, pre-jitter
    pub base_delay: Duration,
    /// Cap applied to the pre-jitter delay
    pub max_delay: Duration,
    /// Exponential growth factor per attempt
    pub exponential_base: f64,
    /// Jitter fraction: delay varies by ±(jitter × delay)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: 0.1,
        }
    }
}

/// Compute the backoff delay for a zero-based attempt index
///
/// The cap applies before jitter, so the final delay can exceed
/// `max_delay` by at most the jitter fraction. Never negative.
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = config.exponential_base.powi(attempt.min(63) as i32);
    let capped = (config.base_delay.as_secs_f64() * exp).min(config.max_delay.as_secs_f64());

    // fastrand::f64() is uniform in [0, 1)
    let jitter = capped * config.jitter * (fastrand::f64() * 2.0 - 1.0);
    Duration::from_secs_f64((capped + jitter).max(0.0))
}

/// Counters for one retry engine instance
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Individual attempts made
    pub attempts: u64,
    /// Operations that ultimately succeeded
    pub successes: u64,
    /// Operations that ultimately failed (exhausted or fatal)
    pub failures: u64,
    /// Backoff sleeps taken
    pub retries: u64,
    /// Total time slept in backoff, in seconds
    pub total_backoff_secs: f64,
}

#[derive(Default)]
struct StatsCells {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    backoff_micros: AtomicU64,
}

/// Executes operations under a retry policy, keeping per-instance stats
///
/// An explicit instance: construct one per subsystem and inject it,
/// rather than sharing ambient global state.
pub struct RetryEngine {
    config: RetryConfig,
    stats: StatsCells,
}

impl RetryEngine {
    /// Create an engine with the given policy
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: StatsCells::default(),
        }
    }

    /// The policy this engine applies
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run an operation under the retry policy
    ///
    /// `classify` decides per error whether another attempt is worth
    /// making. A `Fatal` classification re-raises immediately; exhausting
    /// `max_attempts` returns the last error.
    pub async fn run<T, E, C, F, Fut>(&self, classify: C, op: F) -> Result<T, E>
    where
        C: Fn(&E) -> ErrorClass,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => {
                    self.stats.successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => {
                    if classify(&err) == ErrorClass::Fatal {
                        tracing::debug!(attempt, "fatal error, not retrying");
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                    if attempt + 1 >= max_attempts {
                        tracing::warn!(attempts = max_attempts, "retries exhausted");
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }

                    let delay = compute_delay(attempt, &self.config);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .backoff_micros
                        .fetch_add(delay.as_micros() as u64, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Read-only snapshot of the engine's counters
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            successes: self.stats.successes.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            total_backoff_secs: self.stats.backoff_micros.load(Ordering::Relaxed) as f64 / 1e6,
        }
    }
}
