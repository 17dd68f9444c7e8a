//! Configuration, loadable from `INTAKE_*` environment variables
//!
//! Every knob has a default, so `Config::default()` is a working
//! configuration and `from_env()` only overrides what is set. A set but
//! unparseable variable is a hard error rather than a silent fallback.

use crate::breaker::BreakerConfig;
use crate::bus::EventBusConfig;
use crate::error::{IntakeError, Result};
use crate::pipeline::PipelineConfig;
use crate::retry::RetryConfig;
use crate::slo::SloConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Rate and burst capacity for one token bucket
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Tokens accrued per second
    pub rate: f64,
    /// Maximum tokens the bucket holds
    pub capacity: f64,
}

/// Admission limiter configuration
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Rate for keys with no explicit entry
    pub default_rate: f64,
    /// Capacity for keys with no explicit entry
    pub default_capacity: f64,
    /// Key-specific overrides
    pub per_key: HashMap<String, BucketConfig>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_rate: 10.0,
            default_capacity: 20.0,
            per_key: HashMap::new(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, for development
    #[default]
    Pretty,
    /// One JSON object per line, for ingestion
    Json,
}

/// Top-level configuration for an intake deployment
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub bus: EventBusConfig,
    pub slo: SloConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub limiter: LimiterConfig,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Parse an env var if set, erroring on malformed values
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| IntakeError::Config(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from the environment over defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("INTAKE_QUEUE_CAPACITY")? {
            config.pipeline.queue_capacity = v;
            config.bus.queue_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("INTAKE_SEEN_WINDOW_HOURS")? {
            config.pipeline.seen_window = Duration::from_secs(v * 3600);
        }

        if let Some(v) = env_parse::<u64>("INTAKE_MAX_THROUGHPUT_PER_MIN")? {
            config.slo.max_throughput_per_min = v;
        }
        if let Some(v) = env_parse::<f64>("INTAKE_MAX_P95_LATENCY_SECS")? {
            config.slo.max_p95_latency = Duration::from_secs_f64(v);
        }

        if let Some(v) = env_parse::<u32>("INTAKE_BREAKER_FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("INTAKE_BREAKER_BASE_COOLOFF_SECS")? {
            config.breaker.base_cooloff = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("INTAKE_BREAKER_MAX_COOLOFF_SECS")? {
            config.breaker.max_cooloff = Duration::from_secs(v);
        }

        if let Some(v) = env_parse::<u32>("INTAKE_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_parse::<f64>("INTAKE_RETRY_BASE_DELAY_SECS")? {
            config.retry.base_delay = Duration::from_secs_f64(v);
        }

        if let Some(v) = env_parse::<f64>("INTAKE_DEFAULT_RATE")? {
            config.limiter.default_rate = v;
        }
        if let Some(v) = env_parse::<f64>("INTAKE_DEFAULT_CAPACITY")? {
            config.limiter.default_capacity = v;
        }

        if let Ok(raw) = std::env::var("INTAKE_LOG_LEVEL") {
            config.log_level = match raw.to_lowercase().as_str() {
                "debug" => LogLevel::Debug,
                "info" => LogLevel::Info,
                "warn" => LogLevel::Warn,
                "error" => LogLevel::Error,
                other => {
                    return Err(IntakeError::Config(format!(
                        "invalid INTAKE_LOG_LEVEL={other}"
                    )))
                }
            };
        }
        if let Ok(raw) = std::env::var("INTAKE_LOG_FORMAT") {
            config.log_format = match raw.to_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                other => {
                    return Err(IntakeError::Config(format!(
                        "invalid INTAKE_LOG_FORMAT={other}"
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.queue_capacity == 0 {
            return Err(IntakeError::Config("queue capacity must be > 0".into()));
        }
        if self.limiter.default_rate <= 0.0 || !self.limiter.default_rate.is_finite() {
            return Err(IntakeError::Config(format!(
                "default rate must be positive, got {}",
                self.limiter.default_rate
            )));
        }
        if self.limiter.default_capacity <= 0.0 {
            return Err(IntakeError::Config(format!(
                "default capacity must be positive, got {}",
                self.limiter.default_capacity
            )));
        }
        for (key, bucket) in &self.limiter.per_key {
            if !bucket.rate.is_finite() || bucket.rate <= 0.0 {
                return Err(IntakeError::Config(format!(
                    "rate for '{key}' must be positive, got {}",
                    bucket.rate
                )));
            }
            if !bucket.capacity.is_finite() || bucket.capacity <= 0.0 {
                return Err(IntakeError::Config(format!(
                    "capacity for '{key}' must be positive, got {}",
                    bucket.capacity
                )));
            }
        }
        if self.breaker.failure_threshold == 0 {
            return Err(IntakeError::Config(
                "breaker failure threshold must be > 0".into(),
            ));
        }
        if self.slo.max_throughput_per_min == 0 {
            return Err(IntakeError::Config(
                "throughput ceiling must be > 0".into(),
            ));
        }
        Ok(())
    }
}
