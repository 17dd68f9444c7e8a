//! # intake-core
//!
//! Reliability and admission-control core for systems that ingest work
//! from unreliable external sources and call rate-limited dependencies.
//!
//! Two halves:
//!
//! - **Intake**: an idempotent, backpressure-aware [`pipeline`] plus a
//!   topic-routed [`bus`], both rejecting duplicates by content-derived
//!   key and shedding load when the [`slo`] guard reports no headroom.
//! - **Outbound**: per-key token buckets ([`limiter`]), per-dependency
//!   circuit breakers ([`breaker`]), and a jittered retry engine
//!   ([`retry`]), composed in canonical order by the [`gate`].
//!
//! Everything is an explicit injected instance; there are no global
//! singletons apart from the optional [`metrics`] registry.
//!
//! ```no_run
//! use bytes::Bytes;
//! use intake_core::item::WorkItem;
//! use intake_core::pipeline::Pipeline;
//!
//! # async fn example() {
//! let (handle, runner) = Pipeline::builder().build();
//! tokio::spawn(runner.run());
//!
//! let item = WorkItem::new("upwork", "opportunity.discovered", Bytes::from("{}"));
//! let accepted = handle.submit(item);
//! # let _ = accepted;
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod breaker;
pub mod bus;
pub mod config;
pub mod dedup;
pub mod error;
pub mod gate;
pub mod item;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod slo;

pub use breaker::{BreakerConfig, BreakerMap, CircuitBreaker, CircuitState, HealthColor};
pub use bus::{BusEvent, EventBus, EventBusConfig, TopicHandler};
pub use config::{BucketConfig, Config, LimiterConfig};
pub use dedup::IdempotencySet;
pub use error::{ErrorClass, GateError, HandlerError, IntakeError, Result};
pub use gate::DependencyGate;
pub use item::WorkItem;
pub use limiter::AdmissionLimiter;
pub use pipeline::{Handler, Pipeline, PipelineConfig, PipelineHandle, PipelineRunner};
pub use retry::{compute_delay, RetryConfig, RetryEngine};
pub use slo::{SloConfig, SloGuard};
