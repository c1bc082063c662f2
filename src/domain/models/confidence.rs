//! Confidence scoring.
//!
//! Three independent signals describe how much an attempt can be trusted:
//! syntactic validity, logical soundness and risk. They are kept separate so
//! every component stays inspectable; a weighted overall score can be derived
//! on demand but is never the only thing stored.

use serde::{Deserialize, Serialize};

/// Clamp a confidence-typed value into `[0.0, 1.0]`.
///
/// Returns `None` for non-finite input so callers can decide whether that is
/// a no-op or an invalid-usage failure.
pub fn clamp_unit(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value.clamp(0.0, 1.0))
    }
}

/// The per-attempt confidence components, each in `[0.0, 1.0]`.
///
/// `risk` is a risk level: higher values mean a riskier patch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceComponents {
    pub syntax: f64,
    pub logic: f64,
    pub risk: f64,
}

impl Default for ConfidenceComponents {
    /// No evidence yet: zero syntax and logic confidence, zero observed risk.
    fn default() -> Self {
        Self {
            syntax: 0.0,
            logic: 0.0,
            risk: 0.0,
        }
    }
}

/// A partial update to [`ConfidenceComponents`]. Omitted fields keep their
/// previous value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialConfidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syntax: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
}

impl PartialConfidence {
    pub fn syntax(mut self, value: f64) -> Self {
        self.syntax = Some(value);
        self
    }

    pub fn logic(mut self, value: f64) -> Self {
        self.logic = Some(value);
        self
    }

    pub fn risk(mut self, value: f64) -> Self {
        self.risk = Some(value);
        self
    }

    pub const fn is_empty(&self) -> bool {
        self.syntax.is_none() && self.logic.is_none() && self.risk.is_none()
    }

    /// Name of the first provided component that is NaN.
    pub fn first_malformed(&self) -> Option<&'static str> {
        [("syntax", self.syntax), ("logic", self.logic), ("risk", self.risk)]
            .into_iter()
            .find_map(|(name, v)| v.filter(|x| x.is_nan()).map(|_| name))
    }
}

/// Relative weights used to derive an overall score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub syntax: f64,
    pub logic: f64,
    pub risk: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            syntax: 0.3,
            logic: 0.5,
            risk: 0.2,
        }
    }
}

impl ConfidenceComponents {
    /// Build components, clamping every value into range. NaN becomes `0.0`.
    pub fn new(syntax: f64, logic: f64, risk: f64) -> Self {
        Self {
            syntax: clamp_unit(syntax).unwrap_or(0.0),
            logic: clamp_unit(logic).unwrap_or(0.0),
            risk: clamp_unit(risk).unwrap_or(0.0),
        }
    }

    /// Weighted mean of syntax, logic and `1 - risk`.
    ///
    /// Returns `0.0` if every weight is zero.
    pub fn overall(&self, weights: &ConfidenceWeights) -> f64 {
        let total = weights.syntax + weights.logic + weights.risk;
        if total <= 0.0 {
            return 0.0;
        }
        let score = weights.logic.mul_add(
            self.logic,
            weights.syntax.mul_add(self.syntax, weights.risk * (1.0 - self.risk)),
        ) / total;
        score.clamp(0.0, 1.0)
    }
}

/// Merge a partial update into previous components.
///
/// Each provided component overwrites the previous value after clamping to
/// `[0.0, 1.0]`; omitted and NaN components are retained from `previous`.
/// Never fails: an empty update returns `previous` unchanged.
pub fn merge(update: &PartialConfidence, previous: &ConfidenceComponents) -> ConfidenceComponents {
    let pick = |new: Option<f64>, old: f64| new.and_then(clamp_unit).unwrap_or(old);
    ConfidenceComponents {
        syntax: pick(update.syntax, previous.syntax),
        logic: pick(update.logic, previous.logic),
        risk: pick(update.risk, previous.risk),
    }
}
