//! Application services built on the domain models and ports.

pub mod escalation;
pub mod retry_governor;

pub use escalation::{EscalationPolicy, EscalationTrigger};
pub use retry_governor::{
    AttemptEvaluation, AttemptResponse, DebugAttemptRequest, GovernorAction, RetryGovernor,
};
