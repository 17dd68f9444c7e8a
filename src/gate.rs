//! Dependency gate: composed outbound-call protection
//!
//! Wraps a dependency call in the canonical order: admission limiter
//! first (pace the call), then circuit breaker (skip a dead dependency
//! entirely), then the retry engine around the call itself. The breaker
//! records one outcome per gated operation, not per attempt, so a
//! successful retry sequence counts as a success.
//!
//! ```no_run
//! use std::sync::Arc;
//! use intake_core::breaker::{BreakerConfig, BreakerMap};
//! use intake_core::config::LimiterConfig;
//! use intake_core::error::ErrorClass;
//! use intake_core::gate::DependencyGate;
//! use intake_core::limiter::AdmissionLimiter;
//! use intake_core::retry::RetryConfig;
//!
//! # async fn example() {
//! let gate = DependencyGate::builder()
//!     .limiter(Arc::new(AdmissionLimiter::new(LimiterConfig::default())))
//!     .breakers(Arc::new(BreakerMap::new(BreakerConfig::default())))
//!     .retry(RetryConfig::default())
//!     .build();
//!
//! let result: Result<String, _> = gate
//!     .call("stripe", |_e: &std::io::Error| ErrorClass::Retryable, || async {
//!         Ok("charged".to_string())
//!     })
//!     .await;
//! # }
//! ```

use crate::breaker::{BreakerMap, BreakerSummary};
use crate::config::LimiterConfig;
use crate::error::{ErrorClass, GateError};
use crate::limiter::AdmissionLimiter;
use crate::retry::{RetryConfig, RetryEngine, RetryStats};
use std::future::Future;
use std::sync::Arc;

/// Builder for [`DependencyGate`]
#[derive(Default)]
pub struct DependencyGateBuilder {
    limiter: Option<Arc<AdmissionLimiter>>,
    breakers: Option<Arc<BreakerMap>>,
    retry: Option<RetryConfig>,
    cost: Option<f64>,
}

impl DependencyGateBuilder {
    /// Share an admission limiter with other gates
    pub fn limiter(mut self, limiter: Arc<AdmissionLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Share a breaker map with other gates
    pub fn breakers(mut self, breakers: Arc<BreakerMap>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Token cost charged per attempt (default 1.0)
    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn build(self) -> DependencyGate {
        DependencyGate {
            limiter: self
                .limiter
                .unwrap_or_else(|| Arc::new(AdmissionLimiter::new(LimiterConfig::default()))),
            breakers: self
                .breakers
                .unwrap_or_else(|| Arc::new(BreakerMap::new(Default::default()))),
            retry: RetryEngine::new(self.retry.unwrap_or_default()),
            cost: self.cost.unwrap_or(1.0),
        }
    }
}

/// Gated access to named external dependencies
///
/// Explicit injected components; clone the `Arc`s into several gates to
/// share buckets and breakers across subsystems.
pub struct DependencyGate {
    limiter: Arc<AdmissionLimiter>,
    breakers: Arc<BreakerMap>,
    retry: RetryEngine,
    cost: f64,
}

impl DependencyGate {
    pub fn builder() -> DependencyGateBuilder {
        DependencyGateBuilder::default()
    }

    /// Call a dependency under limiter, breaker, and retry protection
    ///
    /// `key` names the dependency for both the token bucket and the
    /// breaker. `classify` decides which dependency errors are worth
    /// retrying. An open breaker short-circuits before any tokens are
    /// spent; each retry attempt re-acquires admission so backoff and
    /// pacing compose.
    pub async fn call<T, D, C, F, Fut>(
        &self,
        key: &str,
        classify: C,
        op: F,
    ) -> Result<T, GateError<D>>
    where
        C: Fn(&D) -> ErrorClass,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, D>>,
    {
        let breaker = self.breakers.get(key);
        if !breaker.can_execute() {
            tracing::debug!(key, "breaker open, call skipped");
            return Err(GateError::BreakerOpen {
                key: key.to_string(),
            });
        }

        let limiter = self.limiter.as_ref();
        let cost = self.cost;
        let op = &op;
        let result = self
            .retry
            .run(
                |err: &GateError<D>| match err {
                    GateError::Call(dep_err) => classify(dep_err),
                    // Limiter misuse is a caller bug, never retried
                    _ => ErrorClass::Fatal,
                },
                move || async move {
                    limiter.acquire(key, cost).await.map_err(GateError::Intake)?;
                    op().await.map_err(GateError::Call)
                },
            )
            .await;

        // One breaker outcome per operation, not per attempt
        match &result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }

    /// Retry counters for this gate
    pub fn retry_stats(&self) -> RetryStats {
        self.retry.stats()
    }

    /// Health summary across this gate's breakers
    pub fn breaker_summary(&self) -> BreakerSummary {
        self.breakers.summary()
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<BreakerMap> {
        &self.breakers
    }
}
