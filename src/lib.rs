//! Mender - Adaptive retry governor for automated patch attempts
//!
//! Mender does not generate patches. It sits between an external patch
//! generator and its evaluators and decides, attempt by attempt, whether
//! another try is worthwhile. Improvement is measured as a gradient (error
//! count deltas and confidence components) rather than pass/fail; runaway
//! loops are stopped by a trend-aware circuit breaker; risky outcomes are
//! escalated to a developer; and every lineage is recorded in a tamper-evident
//! envelope with a stable content hash.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): attempt records, trend analysis, the circuit
//!   breaker, the audit envelope, and the `MemoryAdapter` port
//! - **Service Layer** (`services`): the `RetryGovernor` and escalation policy
//! - **Adapters** (`adapters`): an in-process `MemoryAdapter`
//! - **Infrastructure Layer** (`infrastructure`): configuration, logging, and
//!   envelope schema validation
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mender::{InMemoryAdapter, RetryGovernor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = mender::ConfigLoader::load()?;
//!     let governor = RetryGovernor::new(Arc::new(InMemoryAdapter::new()?), config)?;
//!     // feed evaluator results through governor.run_attempt(...)
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use adapters::InMemoryAdapter;
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    analyze, merge, AttemptRecord, BreakerConfig, BreakerDecision, BreakerPhase, BreakerReason,
    BreakerSnapshot, CircuitBreaker, ConfidenceComponents, ConfidenceWeights, Config, Envelope,
    PartialConfidence, ResourceQuota, ResourceUsage, TransmissionRecord, TrendDirection,
    TrendMetadata, TrendSettings,
};
pub use domain::ports::{is_breaker_open, update_breaker_on_result, EnvelopeFilter, MemoryAdapter};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::logging::{LogConfig, LoggerImpl};
pub use infrastructure::validators::{envelope_schema, EnvelopeValidator};
pub use services::{
    AttemptEvaluation, AttemptResponse, DebugAttemptRequest, EscalationPolicy, GovernorAction,
    RetryGovernor,
};
