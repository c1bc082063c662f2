//! The audit envelope for one patch lineage.
//!
//! An [`Envelope`] carries everything an auditor needs to replay the governor's
//! reasoning: the full attempt history, confidence components, a breaker
//! snapshot, resource usage, the escalation flag and the success latch. Its
//! fields are private; state only changes through the envelope's own
//! operations, each of which recomputes the content hash.
//!
//! ## Stable hash
//!
//! The hash is SHA-256 over a canonical JSON rendering of a fixed subset of
//! fields, listed in [`HASHED_FIELDS`] and versioned by
//! [`HASH_SCHEMA_VERSION`]. The rendering follows RFC 8785 (JCS): object keys
//! sorted by UTF-16 code units, no whitespace, and numbers written the way
//! ECMAScript prints them, so `1.0` hashes as `1` and `1e21` as `1e+21`. Any
//! JCS implementation reproduces the digest.
//!
//! Volatile bookkeeping is left out: metadata timestamps and labels, attempt
//! timestamps, the trend (derived from attempts), resource usage and the
//! developer message. Changing the field list or the rendering changes every
//! hash and must bump the version.
//!
//! Deserializing an [`Envelope`] verifies the stored hash; use
//! `EnvelopeValidator::parse` to also check the published schema.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};
use sha2::{Digest, Sha256};

use super::attempt::AttemptRecord;
use super::breaker::{BreakerPhase, CircuitBreaker};
use super::confidence::{clamp_unit, merge, ConfidenceComponents, PartialConfidence};
use super::resource::ResourceUsage;
use super::trend::TrendMetadata;
use crate::domain::errors::{DomainError, DomainResult};

/// Version of the hashed-field list. Part of the hash preimage.
pub const HASH_SCHEMA_VERSION: u32 = 2;

/// Envelope fields covered by the stable hash.
pub const HASHED_FIELDS: &[&str] = &[
    "patch_id",
    "patch_data",
    "attempts[].attempt_number",
    "attempts[].error_count",
    "attempts[].error_delta",
    "attempts[].confidence",
    "attempts[].error_categories",
    "confidence_components",
    "breaker_state.phase",
    "breaker_state.cascade_depth",
    "success",
    "flagged_for_developer",
    "halt_reason",
];

/// Envelope bookkeeping. Never hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub created_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// The breaker state as recorded in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakerView {
    pub phase: BreakerPhase,
    pub trend: TrendMetadata,
    pub cascade_depth: u32,
    #[serde(default)]
    pub probation_remaining: u32,
}

impl From<&CircuitBreaker> for BreakerView {
    fn from(breaker: &CircuitBreaker) -> Self {
        Self {
            phase: breaker.phase(),
            trend: breaker.trend(),
            cascade_depth: breaker.cascade_depth(),
            // A terminal breaker cannot grant the probations it has left.
            probation_remaining: if breaker.is_terminal() {
                0
            } else {
                breaker.probations_remaining()
            },
        }
    }
}

/// Audit record for one patch lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredEnvelope")]
pub struct Envelope {
    patch_id: String,
    patch_data: Value,
    metadata: EnvelopeMetadata,
    attempts: Vec<AttemptRecord>,
    confidence_components: ConfidenceComponents,
    breaker_state: BreakerView,
    resource_usage: ResourceUsage,
    success: bool,
    flagged_for_developer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    developer_message: Option<String>,
    /// Set when the lineage is stopped outside the breaker, e.g. by a quota.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    halt_reason: Option<String>,
    hash: String,
}

/// Wire form of an [`Envelope`] before its hash is checked.
#[derive(Deserialize)]
pub(crate) struct StoredEnvelope {
    patch_id: String,
    patch_data: Value,
    metadata: EnvelopeMetadata,
    attempts: Vec<AttemptRecord>,
    confidence_components: ConfidenceComponents,
    breaker_state: BreakerView,
    resource_usage: ResourceUsage,
    success: bool,
    flagged_for_developer: bool,
    #[serde(default)]
    developer_message: Option<String>,
    #[serde(default)]
    halt_reason: Option<String>,
    hash: String,
}

impl TryFrom<StoredEnvelope> for Envelope {
    type Error = DomainError;

    fn try_from(stored: StoredEnvelope) -> DomainResult<Self> {
        let envelope = Self {
            patch_id: stored.patch_id,
            patch_data: stored.patch_data,
            metadata: stored.metadata,
            attempts: stored.attempts,
            confidence_components: stored.confidence_components,
            breaker_state: stored.breaker_state,
            resource_usage: stored.resource_usage,
            success: stored.success,
            flagged_for_developer: stored.flagged_for_developer,
            developer_message: stored.developer_message,
            halt_reason: stored.halt_reason,
            hash: stored.hash,
        };
        let computed = envelope.compute_hash();
        if envelope.hash != computed {
            return Err(DomainError::IntegrityMismatch {
                stored: envelope.hash,
                computed,
            });
        }
        Ok(envelope)
    }
}

impl Envelope {
    /// Start a new lineage. `patch_data` must be a JSON object.
    pub fn new(patch_id: impl Into<String>, patch_data: Value) -> DomainResult<Self> {
        ensure_object(&patch_data)?;
        let now = Utc::now();
        let mut envelope = Self {
            patch_id: patch_id.into(),
            patch_data,
            metadata: EnvelopeMetadata {
                created_at: now,
                timestamp: now,
                labels: BTreeMap::new(),
            },
            attempts: Vec::new(),
            confidence_components: ConfidenceComponents::default(),
            breaker_state: BreakerView::default(),
            resource_usage: ResourceUsage::default(),
            success: false,
            flagged_for_developer: false,
            developer_message: None,
            halt_reason: None,
            hash: String::new(),
        };
        envelope.rehash();
        Ok(envelope)
    }

    pub fn patch_id(&self) -> &str {
        &self.patch_id
    }

    pub fn patch_data(&self) -> &Value {
        &self.patch_data
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn latest_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    pub fn confidence_components(&self) -> ConfidenceComponents {
        self.confidence_components
    }

    pub fn breaker_state(&self) -> &BreakerView {
        &self.breaker_state
    }

    pub fn resource_usage(&self) -> &ResourceUsage {
        &self.resource_usage
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn flagged_for_developer(&self) -> bool {
        self.flagged_for_developer
    }

    pub fn developer_message(&self) -> Option<&str> {
        self.developer_message.as_deref()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    /// The hash as of the last mutation.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Append an attempt. Numbers must start at 1 or above and then increase by exactly 1.
    pub fn append_attempt(&mut self, mut record: AttemptRecord) -> DomainResult<()> {
        let expected = self.attempts.last().map(|a| a.attempt_number + 1);
        let in_order = match expected {
            Some(next) => record.attempt_number == next,
            None => record.attempt_number >= 1,
        };
        if !in_order {
            return Err(DomainError::AttemptOutOfOrder {
                expected: expected.unwrap_or(1),
                got: record.attempt_number,
            });
        }
        record.confidence = clamp_unit(record.confidence).ok_or_else(|| {
            DomainError::InvalidUsage(format!(
                "attempt {} has a NaN confidence",
                record.attempt_number
            ))
        })?;

        self.attempts.push(record);
        self.rehash();
        Ok(())
    }

    /// Merge confidence signals; provided values are clamped, omitted ones kept.
    pub fn merge_confidence(&mut self, update: &PartialConfidence) -> DomainResult<()> {
        if let Some(field) = update.first_malformed() {
            return Err(DomainError::InvalidUsage(format!(
                "confidence component {field} is NaN"
            )));
        }
        self.confidence_components = merge(update, &self.confidence_components);
        self.rehash();
        Ok(())
    }

    /// Record the breaker's phase, trend and cascade depth.
    pub fn set_breaker_snapshot(&mut self, view: BreakerView) -> DomainResult<()> {
        if view.cascade_depth < self.breaker_state.cascade_depth {
            return Err(DomainError::CascadeRegression {
                current: self.breaker_state.cascade_depth,
                requested: view.cascade_depth,
            });
        }
        let mut view = view;
        view.trend.velocity_score = clamp_unit(view.trend.velocity_score).unwrap_or(0.0);
        view.trend.stagnation_risk = clamp_unit(view.trend.stagnation_risk).unwrap_or(0.0);
        self.breaker_state = view;
        self.rehash();
        Ok(())
    }

    pub fn merge_resource_usage(&mut self, usage: &ResourceUsage) {
        self.resource_usage.merge(usage);
        self.rehash();
    }

    /// Flag the lineage for a human. Repeated calls replace the message and
    /// keep the flag set.
    pub fn apply_developer_flag(&mut self, reason: impl Into<String>) {
        self.flagged_for_developer = true;
        self.developer_message = Some(reason.into());
        self.rehash();
    }

    /// Latch success. Idempotent.
    pub fn mark_success(&mut self) {
        if !self.success {
            self.success = true;
            self.rehash();
        }
    }

    /// Stop the lineage outside the breaker. The first reason sticks.
    pub fn halt(&mut self, reason: impl Into<String>) {
        if self.halt_reason.is_none() {
            self.halt_reason = Some(reason.into());
            self.rehash();
        }
    }

    /// Replace the patch payload, e.g. with the latest candidate patch.
    pub fn set_patch_data(&mut self, patch_data: Value) -> DomainResult<()> {
        ensure_object(&patch_data)?;
        self.patch_data = patch_data;
        self.rehash();
        Ok(())
    }

    /// Attach a free-form metadata label. Labels are not hashed.
    pub fn label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.labels.insert(key.into(), value.into());
    }

    /// Regenerate the metadata timestamp. Does not affect the hash.
    pub fn refresh_timestamp(&mut self) {
        self.metadata.timestamp = Utc::now();
    }

    /// Success latched, halted, or OPEN with no probation left.
    pub fn is_terminal(&self) -> bool {
        self.success
            || self.halt_reason.is_some()
            || (self.breaker_state.phase == BreakerPhase::Open
                && self.breaker_state.probation_remaining == 0)
    }

    /// Whether the stored hash matches the current stable state.
    pub fn verify_integrity(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Hex-encoded SHA-256 over the canonical form of the hashed fields.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("mender-envelope-v{HASH_SCHEMA_VERSION}\n").as_bytes());
        hasher.update(canonical_json(&self.stable_view()).as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn to_json(&self) -> DomainResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn stable_view(&self) -> Value {
        let attempts: Vec<Value> = self
            .attempts
            .iter()
            .map(|a| {
                json!({
                    "attempt_number": a.attempt_number,
                    "error_count": a.error_count,
                    "error_delta": a.error_delta,
                    "confidence": a.confidence,
                    "error_categories": a.error_categories,
                })
            })
            .collect();

        json!({
            "patch_id": self.patch_id,
            "patch_data": self.patch_data,
            "attempts": attempts,
            "confidence_components": {
                "syntax": self.confidence_components.syntax,
                "logic": self.confidence_components.logic,
                "risk": self.confidence_components.risk,
            },
            "breaker_state": {
                "phase": self.breaker_state.phase.as_str(),
                "cascade_depth": self.breaker_state.cascade_depth,
            },
            "success": self.success,
            "flagged_for_developer": self.flagged_for_developer,
            "halt_reason": self.halt_reason,
        })
    }

    fn rehash(&mut self) {
        self.hash = self.compute_hash();
    }
}

fn ensure_object(patch_data: &Value) -> DomainResult<()> {
    if patch_data.is_object() {
        Ok(())
    } else {
        Err(DomainError::InvalidUsage(
            "patch_data must be a JSON object".to_string(),
        ))
    }
}

/// Render JSON in RFC 8785 canonical form.
///
/// Independent of whether `serde_json` was built with `preserve_order`.
/// Integers are written exactly; every other number uses the ECMAScript
/// shortest round-trip form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String(key.clone()));
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Number(number) => write_number(number, out),
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_number(number: &Number, out: &mut String) {
    if let Some(i) = number.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = number.as_u64() {
        let _ = write!(out, "{u}");
    } else if let Some(f) = number.as_f64() {
        out.push_str(&ecmascript_number(f));
    }
}

/// `Number.prototype.toString()` for a finite double.
fn ecmascript_number(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return "0".to_string();
    }

    // `{:e}` yields the shortest round-trip digits, e.g. `1.2345e-7`.
    let scientific = format!("{:e}", value.abs());
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();

    let body = if (0..21).contains(&exponent) {
        let point = usize::try_from(exponent).unwrap_or(0) + 1;
        if digits.len() <= point {
            format!("{digits}{}", "0".repeat(point - digits.len()))
        } else {
            format!("{}.{}", &digits[..point], &digits[point..])
        }
    } else if (-6..0).contains(&exponent) {
        let zeros = usize::try_from(-exponent - 1).unwrap_or(0);
        format!("0.{}{digits}", "0".repeat(zeros))
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        let lead = if digits.len() > 1 {
            format!("{}.{}", &digits[..1], &digits[1..])
        } else {
            digits
        };
        format!("{lead}e{sign}{}", exponent.unsigned_abs())
    };

    if value < 0.0 {
        format!("-{body}")
    } else {
        body
    }
}
