pub mod attempt;
pub mod breaker;
pub mod confidence;
pub mod config;
pub mod envelope;
pub mod resource;
pub mod telemetry;
pub mod trend;

pub use attempt::{error_delta, AttemptRecord};
pub use breaker::{
    BreakerConfig, BreakerDecision, BreakerPhase, BreakerReason, BreakerSnapshot, CircuitBreaker,
    Probation,
};
pub use confidence::{merge, ConfidenceComponents, ConfidenceWeights, PartialConfidence};
pub use config::{Config, EscalationConfig, LoggingConfig};
pub use envelope::{
    canonical_json, BreakerView, Envelope, EnvelopeMetadata, HASHED_FIELDS, HASH_SCHEMA_VERSION,
};
pub use resource::{ResourceQuota, ResourceUsage};
pub use telemetry::{error_signature, TransmissionRecord};
pub use trend::{analyze, TrendDirection, TrendMetadata, TrendSettings};
