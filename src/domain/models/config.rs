use serde::{Deserialize, Serialize};

use super::breaker::BreakerConfig;
use super::confidence::ConfidenceWeights;
use super::resource::ResourceQuota;

/// Main configuration structure for mender
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Circuit breaker and trend analysis settings
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Weights for the derived overall confidence score
    #[serde(default)]
    pub confidence_weights: ConfidenceWeights,

    /// When to flag a lineage for a developer
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Per-lineage resource limits
    #[serde(default)]
    pub quota: ResourceQuota,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Escalation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EscalationConfig {
    /// Risk component at or above which an attempt is escalated
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: f64,

    /// Error categories that always need a human (schema or auth changes)
    #[serde(default = "default_sensitive_categories")]
    pub sensitive_categories: Vec<String>,

    /// Flag the lineage when the breaker opens for good
    #[serde(default = "default_flag_on_terminal")]
    pub flag_on_terminal: bool,
}

const fn default_risk_threshold() -> f64 {
    0.8
}

fn default_sensitive_categories() -> Vec<String> {
    vec![
        "schema_change".to_string(),
        "auth_change".to_string(),
        "security".to_string(),
    ]
}

const fn default_flag_on_terminal() -> bool {
    true
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            risk_threshold: default_risk_threshold(),
            sensitive_categories: default_sensitive_categories(),
            flag_on_terminal: default_flag_on_terminal(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Days to keep rolled log files before they are pruned; `0` keeps them
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            retention_days: default_retention_days(),
            log_dir: None,
        }
    }
}
