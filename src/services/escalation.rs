//! Escalation policy: when an attempt needs a human.
//!
//! Escalation is never a failure. A trigger flags the envelope for a developer
//! and leaves the breaker's own accounting untouched.

use serde::{Deserialize, Serialize};

use crate::domain::models::{
    AttemptRecord, BreakerDecision, BreakerReason, ConfidenceComponents, EscalationConfig,
};

/// Why an attempt was escalated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// The evaluators tagged the attempt with a sensitive category.
    SensitiveCategory { category: String },
    /// The risk component reached the configured threshold.
    HighRisk { risk: f64, threshold: f64 },
    /// The breaker opened with nothing left to try.
    RetryHalted { reason: BreakerReason },
}

impl EscalationTrigger {
    /// Human-readable developer message.
    pub fn message(&self) -> String {
        match self {
            Self::SensitiveCategory { category } => match category.as_str() {
                "schema_change" => "schema change detected".to_string(),
                "auth_change" => "authentication change detected".to_string(),
                other => format!("sensitive change detected: {other}"),
            },
            Self::HighRisk { risk, threshold } => {
                format!("risk {risk:.2} at or above threshold {threshold:.2}")
            }
            Self::RetryHalted { reason } => format!("automated retries halted: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EscalationPolicy {
    config: EscalationConfig,
}

impl EscalationPolicy {
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// First matching trigger, checked in order: sensitive category, high
    /// risk, terminal breaker.
    pub fn evaluate(
        &self,
        record: &AttemptRecord,
        components: &ConfidenceComponents,
        decision: Option<&BreakerDecision>,
        breaker_terminal: bool,
    ) -> Option<EscalationTrigger> {
        if let Some(category) = self
            .config
            .sensitive_categories
            .iter()
            .find(|c| record.has_category(c))
        {
            return Some(EscalationTrigger::SensitiveCategory {
                category: category.clone(),
            });
        }

        if components.risk >= self.config.risk_threshold {
            return Some(EscalationTrigger::HighRisk {
                risk: components.risk,
                threshold: self.config.risk_threshold,
            });
        }

        match decision {
            Some(decision)
                if self.config.flag_on_terminal && !decision.allowed && breaker_terminal =>
            {
                Some(EscalationTrigger::RetryHalted {
                    reason: decision.reason,
                })
            }
            _ => None,
        }
    }
}
