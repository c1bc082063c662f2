//! Telemetry records handed to an external monitoring collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::confidence::ConfidenceComponents;

/// One transmission per attempt, written through the memory adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionRecord {
    pub patch_id: String,
    pub language: String,
    pub error_classification: String,
    pub confidence_scoring: ConfidenceComponents,
    pub timestamp: DateTime<Utc>,
    /// Short stable fingerprint of the error, for grouping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_signature: Option<String>,
    /// The raw error text, already scrubbed of credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
}

impl TransmissionRecord {
    pub fn new(
        patch_id: impl Into<String>,
        language: impl Into<String>,
        error_classification: impl Into<String>,
        confidence_scoring: ConfidenceComponents,
    ) -> Self {
        Self {
            patch_id: patch_id.into(),
            language: language.into(),
            error_classification: error_classification.into(),
            confidence_scoring,
            timestamp: Utc::now(),
            error_signature: None,
            original_error: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.error_signature = Some(signature.into());
        self
    }

    pub fn with_original_error(mut self, error: impl Into<String>) -> Self {
        self.original_error = Some(error.into());
        self
    }
}

/// Short fingerprint grouping errors of the same type and message.
///
/// Digits are dropped from the message so line and column numbers do not
/// split otherwise identical errors.
pub fn error_signature(error_type: &str, message: &str) -> String {
    let normalized: String = message.chars().filter(|c| !c.is_ascii_digit()).collect();
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized.trim().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}
