//! SLO guard: backpressure derived from live performance
//!
//! Tracks two signals, per-minute throughput and p95 dispatch latency,
//! and answers one question: is there headroom to accept more work?
//! Headroom is denied early, at 80% of either target, so the system
//! sheds load before it is saturated rather than after.
//!
//! The minute window is relative to guard creation, not aligned to
//! wall-clock minute boundaries. Restarting the process restarts the
//! window, which deliberately re-admits a burst after a crash.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Fraction of either target at which headroom is denied
const HEADROOM_FRACTION: f64 = 0.8;

/// SLO targets and sampling bounds
#[derive(Debug, Clone)]
pub struct SloConfig {
    /// p95 dispatch latency target
    pub max_p95_latency: Duration,
    /// Items-per-minute throughput ceiling
    pub max_throughput_per_min: u64,
    /// Bound on retained latency samples (ring buffer)
    pub max_latency_samples: usize,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_p95_latency: Duration::from_secs(5),
            max_throughput_per_min: 1000,
            max_latency_samples: 1000,
        }
    }
}

/// Read-only view of the guard's current state
#[derive(Debug, Clone)]
pub struct SloSnapshot {
    /// p95 over retained samples, in seconds; None with no samples
    pub p95_latency_secs: Option<f64>,
    /// Items counted in the current minute window
    pub processed_this_minute: u64,
    /// Configured throughput ceiling
    pub max_throughput_per_min: u64,
    /// Retained latency sample count
    pub latency_samples: usize,
    /// Whether the guard would currently admit more work
    pub headroom: bool,
}

struct SloInner {
    processed_this_minute: u64,
    minute_started: Instant,
    latencies: VecDeque<f64>,
}

impl SloInner {
    /// Reset the throughput counter when the minute window rolls over
    fn maybe_reset_minute(&mut self, now: Instant) {
        if now.duration_since(self.minute_started) >= Duration::from_secs(60) {
            self.processed_this_minute = 0;
            self.minute_started = now;
        }
    }

    /// p95 over retained samples via sort and index, None when empty
    fn p95(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    fn headroom(&mut self, config: &SloConfig) -> bool {
        self.maybe_reset_minute(Instant::now());

        let throughput_limit = (config.max_throughput_per_min as f64 * HEADROOM_FRACTION) as u64;
        if self.processed_this_minute >= throughput_limit {
            tracing::warn!(
                processed = self.processed_this_minute,
                limit = throughput_limit,
                "throughput headroom exhausted"
            );
            return false;
        }

        if let Some(p95) = self.p95() {
            let latency_limit = config.max_p95_latency.as_secs_f64() * HEADROOM_FRACTION;
            if p95 > latency_limit {
                tracing::warn!(
                    p95_secs = p95,
                    limit_secs = latency_limit,
                    "latency headroom exhausted"
                );
                return false;
            }
        }

        true
    }
}

/// Backpressure guard driven by throughput and latency targets
///
/// An explicit injected instance; all methods take `&self` and are safe
/// to call from any task.
pub struct SloGuard {
    config: SloConfig,
    inner: Mutex<SloInner>,
}

impl SloGuard {
    /// Create a guard; the minute window starts now
    pub fn new(config: SloConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SloInner {
                processed_this_minute: 0,
                minute_started: Instant::now(),
                latencies: VecDeque::new(),
            }),
        }
    }

    /// Whether there is headroom to admit more work
    ///
    /// Denies at 80% of the throughput ceiling or when p95 latency
    /// exceeds 80% of its target. With no latency samples yet, only
    /// throughput is considered.
    pub fn headroom(&self) -> bool {
        self.inner.lock().headroom(&self.config)
    }

    /// Record one dispatch latency observation, in seconds
    pub fn record_latency(&self, secs: f64) {
        let mut inner = self.inner.lock();
        inner.latencies.push_back(secs);
        while inner.latencies.len() > self.config.max_latency_samples {
            inner.latencies.pop_front();
        }
    }

    /// Count items against the current minute window
    pub fn record_processed(&self, count: u64) {
        let mut inner = self.inner.lock();
        inner.maybe_reset_minute(Instant::now());
        inner.processed_this_minute += count;
    }

    /// Read-only snapshot for stats endpoints
    pub fn snapshot(&self) -> SloSnapshot {
        let mut inner = self.inner.lock();
        let headroom = inner.headroom(&self.config);
        SloSnapshot {
            p95_latency_secs: inner.p95(),
            processed_this_minute: inner.processed_this_minute,
            max_throughput_per_min: self.config.max_throughput_per_min,
            latency_samples: inner.latencies.len(),
            headroom,
        }
    }
}
