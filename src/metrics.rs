//! Prometheus metrics for the intake core
//!
//! A process-global registry initialized once. Hot paths go through the
//! `try_record_*` helpers, which are no-ops until `init_metrics()` has
//! run, so library users who never initialize metrics pay only a
//! OnceLock load.

use crate::error::{IntakeError, Result};
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All intake metrics, registered against one registry
pub struct Metrics {
    registry: Registry,

    /// Items accepted into the pipeline, by source and kind
    pub items_accepted: CounterVec,
    /// Items and events dropped, by reason (duplicate, backpressure, queue_full)
    pub items_dropped: CounterVec,
    /// Handler failures, by handler name
    pub handler_errors: CounterVec,
    /// Breaker trips, by dependency key
    pub breaker_trips: CounterVec,
    /// Breaker recoveries, by dependency key
    pub breaker_recoveries: CounterVec,
    /// Current intake queue depth
    pub queue_depth: Gauge,
    /// Dispatch latency (enqueue to handlers complete), in seconds
    pub dispatch_latency: Histogram,
}

impl Metrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let items_accepted = CounterVec::new(
            Opts::new("intake_items_accepted_total", "Items accepted for dispatch"),
            &["source", "kind"],
        )
        .map_err(|e| IntakeError::Metrics(e.to_string()))?;

        let items_dropped = CounterVec::new(
            Opts::new("intake_items_dropped_total", "Items dropped at admission"),
            &["reason"],
        )
        .map_err(|e| IntakeError::Metrics(e.to_string()))?;

        let handler_errors = CounterVec::new(
            Opts::new("intake_handler_errors_total", "Handler failures"),
            &["handler"],
        )
        .map_err(|e| IntakeError::Metrics(e.to_string()))?;

        let breaker_trips = CounterVec::new(
            Opts::new("intake_breaker_trips_total", "Circuit breaker trips"),
            &["key"],
        )
        .map_err(|e| IntakeError::Metrics(e.to_string()))?;

        let breaker_recoveries = CounterVec::new(
            Opts::new(
                "intake_breaker_recoveries_total",
                "Circuit breaker recoveries",
            ),
            &["key"],
        )
        .map_err(|e| IntakeError::Metrics(e.to_string()))?;

        let queue_depth = Gauge::new("intake_queue_depth", "Current intake queue depth")
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;

        let dispatch_latency = Histogram::with_opts(
            HistogramOpts::new(
                "intake_dispatch_latency_seconds",
                "Enqueue-to-dispatched latency",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0,
            ]),
        )
        .map_err(|e| IntakeError::Metrics(e.to_string()))?;

        registry
            .register(Box::new(items_accepted.clone()))
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(items_dropped.clone()))
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(handler_errors.clone()))
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(breaker_trips.clone()))
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(breaker_recoveries.clone()))
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;
        registry
            .register(Box::new(dispatch_latency.clone()))
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;

        Ok(Self {
            registry,
            items_accepted,
            items_dropped,
            handler_errors,
            breaker_trips,
            breaker_recoveries,
            queue_depth,
            dispatch_latency,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .map_err(|e| IntakeError::Metrics(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| IntakeError::Metrics(e.to_string()))
    }
}

/// Initialize the global metrics registry (idempotent)
pub fn init_metrics() -> Result<&'static Metrics> {
    if let Some(existing) = METRICS.get() {
        return Ok(existing);
    }
    let metrics = Metrics::new()?;
    Ok(METRICS.get_or_init(|| metrics))
}

/// The global metrics, if initialized
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

pub fn try_record_accepted(source: &str, kind: &str) {
    if let Some(m) = METRICS.get() {
        m.items_accepted.with_label_values(&[source, kind]).inc();
    }
}

pub fn try_record_drop(reason: &str) {
    if let Some(m) = METRICS.get() {
        m.items_dropped.with_label_values(&[reason]).inc();
    }
}

pub fn try_record_handler_error(handler: &str) {
    if let Some(m) = METRICS.get() {
        m.handler_errors.with_label_values(&[handler]).inc();
    }
}

pub fn try_record_breaker_trip(key: &str) {
    if let Some(m) = METRICS.get() {
        m.breaker_trips.with_label_values(&[key]).inc();
    }
}

pub fn try_record_breaker_recovery(key: &str) {
    if let Some(m) = METRICS.get() {
        m.breaker_recoveries.with_label_values(&[key]).inc();
    }
}

pub fn try_set_queue_depth(depth: i64) {
    if let Some(m) = METRICS.get() {
        m.queue_depth.set(depth as f64);
    }
}

pub fn try_observe_dispatch_latency(secs: f64) {
    if let Some(m) = METRICS.get() {
        m.dispatch_latency.observe(secs);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let a = init_metrics().unwrap();
        let b = init_metrics().unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_recording_and_gather() {
        let m = init_metrics().unwrap();
        try_record_accepted("upwork", "opportunity.discovered");
        try_record_drop("duplicate");
        try_record_breaker_trip("stripe");
        try_set_queue_depth(4);
        try_observe_dispatch_latency(0.02);

        let text = m.gather().unwrap();
        assert!(text.contains("intake_items_accepted_total"));
        assert!(text.contains("intake_items_dropped_total"));
        assert!(text.contains("intake_queue_depth"));
    }

    #[test]
    fn test_helpers_are_safe_pre_init() {
        // Other tests may have initialized the global; this just must
        // not panic either way.
        try_record_handler_error("nobody");
        try_record_breaker_recovery("nothing");
    }
}
