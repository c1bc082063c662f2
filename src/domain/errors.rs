//! Domain errors for the mender retry governor.
//!
//! Only caller misuse and persistence failures are errors. Budget exhaustion,
//! stagnation and low confidence are ordinary breaker outcomes and travel in
//! [`BreakerDecision`](crate::domain::models::BreakerDecision) instead.

use thiserror::Error;

/// Domain-level errors that can occur in the governor.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Attempt number out of order: expected {expected}, got {got}")]
    AttemptOutOfOrder { expected: u32, got: u32 },

    #[error("Cascade depth cannot decrease: current {current}, requested {requested}")]
    CascadeRegression { current: u32, requested: u32 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Envelope integrity mismatch: stored hash {stored}, computed {computed}")]
    IntegrityMismatch { stored: String, computed: String },

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether this error is the caller's fault rather than an environmental failure.
    pub const fn is_invalid_usage(&self) -> bool {
        matches!(
            self,
            Self::InvalidUsage(_) | Self::AttemptOutOfOrder { .. } | Self::CascadeRegression { .. }
        )
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_usage_classification() {
        assert!(DomainError::InvalidUsage("bad".into()).is_invalid_usage());
        assert!(DomainError::AttemptOutOfOrder { expected: 2, got: 1 }.is_invalid_usage());
        assert!(DomainError::CascadeRegression { current: 2, requested: 1 }.is_invalid_usage());
        assert!(!DomainError::Persistence("disk full".into()).is_invalid_usage());
    }

    #[test]
    fn test_error_messages() {
        let err = DomainError::AttemptOutOfOrder { expected: 3, got: 2 };
        assert_eq!(err.to_string(), "Attempt number out of order: expected 3, got 2");
    }
}
