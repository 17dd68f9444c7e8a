//! Error types for the intake core

use thiserror::Error;

/// Result type alias for intake operations
pub type Result<T> = std::result::Result<T, IntakeError>;

/// Main error type for the intake core
#[derive(Error, Debug)]
pub enum IntakeError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Negative or non-finite token cost passed to the admission limiter
    #[error("invalid token cost: {0}")]
    InvalidCost(f64),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Error type for gated dependency calls
///
/// Breaker-open rejection is an ordinary value here, not exception-driven
/// control flow, so callers can implement graceful skip/fallback.
/// `D` is the dependency's own error type.
#[derive(Error, Debug)]
pub enum GateError<D> {
    /// Circuit is open for this dependency, call skipped
    #[error("breaker open for '{key}'")]
    BreakerOpen { key: String },

    /// The dependency call itself failed (after retries, if retryable)
    #[error("dependency call failed: {0}")]
    Call(D),

    /// Limiter misuse (negative cost)
    #[error(transparent)]
    Intake(#[from] IntakeError),
}

/// Error returned by a pipeline or bus handler
///
/// Handler failures are counted and logged by the dispatch loop, never
/// propagated to producers, so a plain message is all that is needed.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

/// Classification of a dependency error for the retry engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient, worth retrying with backoff
    Retryable,
    /// Permanent, re-raise immediately with no retry accounting
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_error_display() {
        let err: GateError<std::io::Error> = GateError::BreakerOpen {
            key: "stripe".into(),
        };
        assert_eq!(err.to_string(), "breaker open for 'stripe'");
    }

    #[test]
    fn test_invalid_cost_display() {
        let err = IntakeError::InvalidCost(-1.0);
        assert!(err.to_string().contains("-1"));
    }
}
