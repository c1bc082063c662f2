//! Attempt records: one row per patch attempt in a session's history.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single attempt outcome, immutable once appended to a history.
///
/// `error_delta` is `previous error_count - current error_count`, so a
/// positive delta means the attempt reduced the number of errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub error_count: u32,
    pub error_delta: i64,
    pub confidence: f64,
    /// Category tags reported by the external evaluators, kept sorted so that
    /// serialization is deterministic.
    #[serde(default)]
    pub error_categories: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(
        attempt_number: u32,
        error_count: u32,
        error_delta: i64,
        confidence: f64,
        error_categories: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            attempt_number,
            error_count,
            error_delta,
            confidence,
            error_categories: error_categories.into_iter().map(Into::into).collect(),
            timestamp: Utc::now(),
        }
    }

    /// Whether this attempt's delta counts as "no meaningful change".
    pub fn is_stalled(&self, epsilon: f64) -> bool {
        (self.error_delta as f64).abs() <= epsilon
    }

    /// The error count before this attempt, reconstructed from the delta.
    pub fn previous_error_count(&self) -> i64 {
        i64::from(self.error_count) + self.error_delta
    }

    pub fn has_category(&self, tag: &str) -> bool {
        self.error_categories.contains(tag)
    }
}

/// Compute `previous - current` for two error counts.
pub fn error_delta(previous: u32, current: u32) -> i64 {
    i64::from(previous) - i64::from(current)
}
