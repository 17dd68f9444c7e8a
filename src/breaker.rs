//! Circuit breaker with exponential cooloff
//!
//! One parameterized state machine per dependency key. Callers check
//! `can_execute()` before attempting a call and report the outcome with
//! `record_success()` / `record_failure()` once per operation.
//!
//! State transitions:
//!
//! ```text
//! closed ──(failures reach threshold)──► open
//! open ──(cooloff elapsed, lazy)──► half-open
//! half-open ──(N successes)──► closed
//! half-open ──(any failure)──► open (cooloff re-applied)
//! ```
//!
//! Cooloff grows as `base × multiplier` with the multiplier doubling on
//! each trip up to a ceiling, capped at an absolute maximum. All timing
//! is evaluated lazily at `can_execute()` - no background timers.
//!
//! A tri-color health label (healthy/degraded/tripped) is derived from
//! the same counters purely for dashboards; it adds no transitions.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit trips
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close
    pub success_threshold: u32,
    /// Probe calls allowed while half-open
    pub half_open_max_probes: u32,
    /// Base cooloff applied on the first trip
    pub base_cooloff: Duration,
    /// Absolute cap on any single cooloff
    pub max_cooloff: Duration,
    /// Multiplier growth per trip
    pub backoff_factor: f64,
    /// Ceiling on the backoff multiplier
    pub max_backoff_multiplier: f64,
    /// Consecutive failures before the health label turns degraded
    pub degraded_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            half_open_max_probes: 1,
            base_cooloff: Duration::from_secs(600),
            max_cooloff: Duration::from_secs(7200),
            backoff_factor: 2.0,
            max_backoff_multiplier: 8.0,
            degraded_threshold: 1,
        }
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// All calls pass
    Closed,
    /// Calls rejected immediately
    Open,
    /// Bounded probe calls allowed
    HalfOpen,
}

/// Human-facing health label derived from breaker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthColor {
    /// Full operation
    Healthy,
    /// Failures accruing, proceed with caution
    Degraded,
    /// Circuit open
    Tripped,
}

/// Read-only breaker snapshot for dashboards
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub health: HealthColor,
    pub consecutive_failures: u32,
    pub cooloff_remaining: Duration,
    pub backoff_multiplier: f64,
    pub total_trips: u64,
    pub total_recoveries: u64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_probes: u32,
    last_failure: Option<Instant>,
    cooloff_until: Option<Instant>,
    backoff_multiplier: f64,
    total_trips: u64,
    total_recoveries: u64,
}

/// Failure-aware gate for one named dependency
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for the given dependency key
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_probes: 0,
                last_failure: None,
                cooloff_until: None,
                backoff_multiplier: 1.0,
                total_trips: 0,
                total_recoveries: 0,
            }),
        }
    }

    /// Dependency key this breaker guards
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Check whether a call may proceed
    ///
    /// Evaluates the cooloff lazily: an open circuit whose cooloff has
    /// elapsed moves to half-open here, on the calling task.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .cooloff_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_probes = 1;
                    tracing::debug!(key = %self.key, "breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes < self.config.half_open_max_probes {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        // Multiplier only shrinks on success
        inner.backoff_multiplier = (inner.backoff_multiplier / self.config.backoff_factor).max(1.0);

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
            if inner.half_open_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.cooloff_until = None;
                inner.total_recoveries += 1;
                crate::metrics::try_record_breaker_recovery(&self.key);
                tracing::info!(key = %self.key, "breaker recovered, circuit closed");
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.half_open_successes = 0;

        let should_trip = match inner.state {
            // One probe failure reopens immediately
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_trip {
            self.trip(&mut inner);
        }
    }

    /// Transition to open and apply the exponential cooloff
    fn trip(&self, inner: &mut BreakerInner) {
        let cooloff = self
            .config
            .base_cooloff
            .mul_f64(inner.backoff_multiplier)
            .min(self.config.max_cooloff);
        inner.state = CircuitState::Open;
        inner.cooloff_until = Some(Instant::now() + cooloff);
        inner.half_open_probes = 0;
        inner.backoff_multiplier = (inner.backoff_multiplier * self.config.backoff_factor)
            .min(self.config.max_backoff_multiplier);
        inner.total_trips += 1;

        crate::metrics::try_record_breaker_trip(&self.key);
        tracing::warn!(
            key = %self.key,
            failures = inner.consecutive_failures,
            cooloff_secs = cooloff.as_secs_f64(),
            "breaker tripped, circuit open"
        );
    }

    /// Current circuit state (without lazily advancing open → half-open)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Tri-color health label for dashboards
    pub fn health(&self) -> HealthColor {
        let inner = self.inner.lock();
        health_of(&inner, &self.config)
    }

    /// Read-only snapshot of the breaker
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let now = Instant::now();
        BreakerSnapshot {
            state: inner.state,
            health: health_of(&inner, &self.config),
            consecutive_failures: inner.consecutive_failures,
            cooloff_remaining: inner
                .cooloff_until
                .and_then(|until| until.checked_duration_since(now))
                .unwrap_or(Duration::ZERO),
            backoff_multiplier: inner.backoff_multiplier,
            total_trips: inner.total_trips,
            total_recoveries: inner.total_recoveries,
        }
    }
}

fn health_of(inner: &BreakerInner, config: &BreakerConfig) -> HealthColor {
    match inner.state {
        CircuitState::Open => HealthColor::Tripped,
        CircuitState::HalfOpen => HealthColor::Degraded,
        CircuitState::Closed => {
            if inner.consecutive_failures >= config.degraded_threshold {
                HealthColor::Degraded
            } else {
                HealthColor::Healthy
            }
        }
    }
}

/// Map-wide health summary (counts per color)
#[derive(Debug, Clone, Default)]
pub struct BreakerSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub tripped: usize,
}

/// Registry of breakers keyed per dependency
///
/// An explicit instance owned by the composition root; breakers are
/// allocated on first use with the map's default configuration.
pub struct BreakerMap {
    default_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerMap {
    /// Create a map with the given default configuration
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a dependency key
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(key.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(key, self.default_config.clone()))
        }))
    }

    /// Install a breaker with a key-specific configuration
    pub fn set_config(&self, key: &str, config: BreakerConfig) {
        let mut breakers = self.breakers.lock();
        breakers.insert(key.to_string(), Arc::new(CircuitBreaker::new(key, config)));
    }

    /// Manually reset a breaker to pristine closed state
    ///
    /// Returns false if the key has no breaker.
    pub fn reset(&self, key: &str) -> bool {
        let mut breakers = self.breakers.lock();
        if let Some(existing) = breakers.get(key) {
            let config = existing.config.clone();
            breakers.insert(key.to_string(), Arc::new(CircuitBreaker::new(key, config)));
            tracing::info!(key, "breaker manually reset");
            true
        } else {
            false
        }
    }

    /// Snapshot of every breaker, keyed by dependency
    pub fn snapshot_all(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = self.breakers.lock();
        breakers
            .iter()
            .map(|(k, b)| (k.clone(), b.snapshot()))
            .collect()
    }

    /// Health summary across all breakers
    pub fn summary(&self) -> BreakerSummary {
        let breakers = self.breakers.lock();
        let mut summary = BreakerSummary {
            total: breakers.len(),
            ..Default::default()
        };
        for breaker in breakers.values() {
            match breaker.health() {
                HealthColor::Healthy => summary.healthy += 1,
                HealthColor::Degraded => summary.degraded += 1,
                HealthColor::Tripped => summary.tripped += 1,
            }
        }
        summary
    }
}
