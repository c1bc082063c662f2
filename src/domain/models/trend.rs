//! Trend analysis over a session's attempt history.
//!
//! A session is not judged by whether the last attempt passed, but by where
//! the sequence of attempts is heading. The analyzer looks at a sliding window
//! of the most recent [`AttemptRecord`]s and their error deltas and reports:
//!
//! - a **direction** (`improving`, `plateauing`, `worsening`);
//! - a **velocity score** in `[0, 1]`, the normalized rate of error reduction;
//! - a **stagnation risk** in `[0, 1]`, driven by the trailing run of attempts
//!   whose delta is within epsilon of zero.
//!
//! ## Classification
//!
//! 1. Fewer than 2 records in the window: `plateauing`, velocity `0`.
//! 2. **Improving**: mean delta is positive *and* at least
//!    `improving_fraction` of the deltas are meaningfully positive, so one big
//!    step cannot mask an otherwise flat window.
//! 3. **Worsening**: mean delta is negative.
//! 4. Otherwise **plateauing**.
//!
//! ## Stagnation run
//!
//! The trailing near-zero run is counted over the last
//! `max(improvement_window, stagnation_threshold)` records. The risk is
//! `run / stagnation_threshold`, saturating at `1.0`, which keeps it
//! monotonic: extending a stalled run never lowers the risk.

use serde::{Deserialize, Serialize};

use super::attempt::AttemptRecord;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Default fraction of window deltas that must be positive to call a trend improving.
pub const DEFAULT_IMPROVING_FRACTION: f64 = 0.6;

/// Default tolerance within which an error delta counts as "no change".
///
/// Error deltas are integers, so `0.0` means only exact-zero deltas stall.
pub const DEFAULT_STAGNATION_EPSILON: f64 = 0.0;

/// Parameters for [`analyze`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendSettings {
    /// Number of most recent records used for direction and velocity.
    pub improvement_window: usize,
    /// Length of the near-zero run at which stagnation risk saturates.
    pub stagnation_threshold: usize,
    /// Absolute delta at or below which an attempt counts as stalled.
    pub stagnation_epsilon: f64,
    /// Fraction of positive deltas required for `improving`.
    pub improving_fraction: f64,
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            improvement_window: 3,
            stagnation_threshold: 5,
            stagnation_epsilon: DEFAULT_STAGNATION_EPSILON,
            improving_fraction: DEFAULT_IMPROVING_FRACTION,
        }
    }
}

// ---------------------------------------------------------------------------
// TrendDirection / TrendMetadata
// ---------------------------------------------------------------------------

/// Which way the error count is heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    /// Also the neutral default when there is too little history to tell.
    #[default]
    Plateauing,
    Worsening,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Plateauing => "plateauing",
            Self::Worsening => "worsening",
        }
    }
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived trend summary. Never persisted on its own; it always travels
/// inside a breaker snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrendMetadata {
    pub direction: TrendDirection,
    pub velocity_score: f64,
    pub stagnation_risk: f64,
}

impl TrendMetadata {
    /// Whether the stagnation run has reached the configured threshold.
    pub fn is_stagnant(&self) -> bool {
        self.stagnation_risk >= 1.0
    }
}

// ---------------------------------------------------------------------------
// analyze
// ---------------------------------------------------------------------------

/// Derive the trend for an ordered attempt history.
pub fn analyze(history: &[AttemptRecord], settings: &TrendSettings) -> TrendMetadata {
    let window = settings.improvement_window.max(1);
    let recent = &history[history.len().saturating_sub(window)..];
    let stagnation_risk = stagnation_risk(history, settings);

    if recent.len() < 2 {
        return TrendMetadata {
            direction: TrendDirection::Plateauing,
            velocity_score: 0.0,
            stagnation_risk,
        };
    }

    let deltas: Vec<f64> = recent.iter().map(|r| r.error_delta as f64).collect();
    let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
    let positive = deltas
        .iter()
        .filter(|d| **d > settings.stagnation_epsilon)
        .count();
    let positive_ratio = positive as f64 / deltas.len() as f64;

    let direction = if mean > 0.0 && positive_ratio >= settings.improving_fraction {
        TrendDirection::Improving
    } else if mean < 0.0 {
        TrendDirection::Worsening
    } else {
        TrendDirection::Plateauing
    };

    TrendMetadata {
        direction,
        velocity_score: velocity_score(recent),
        stagnation_risk,
    }
}

/// Net error reduction per attempt, scaled by the largest error count seen
/// around the window (including the count just before it).
fn velocity_score(recent: &[AttemptRecord]) -> f64 {
    let net: i64 = recent.iter().map(|r| r.error_delta).sum();
    if net <= 0 {
        return 0.0;
    }

    let baseline = recent
        .iter()
        .flat_map(|r| [i64::from(r.error_count), r.previous_error_count()])
        .max()
        .unwrap_or(1)
        .max(1);

    let per_attempt = net as f64 / recent.len() as f64;
    (per_attempt / baseline as f64).clamp(0.0, 1.0)
}

/// Trailing near-zero run divided by the stagnation threshold, capped at 1.
fn stagnation_risk(history: &[AttemptRecord], settings: &TrendSettings) -> f64 {
    let threshold = settings.stagnation_threshold.max(1);
    let span = settings.improvement_window.max(threshold);
    let tail = &history[history.len().saturating_sub(span)..];

    let run = tail
        .iter()
        .rev()
        .take_while(|r| r.is_stalled(settings.stagnation_epsilon))
        .count();

    (run as f64 / threshold as f64).min(1.0)
}
