//! Schema validation and integrity checking for serialized envelopes.
//!
//! Envelopes cross the crate boundary as JSON with fixed snake_case field
//! names. [`envelope_schema`] publishes that shape as a Draft 7 JSON schema and
//! [`EnvelopeValidator::parse`] is the only sanctioned way back from JSON to an
//! [`Envelope`]: schema first, then deserialization, then the stored hash is
//! checked against a fresh computation.

use jsonschema::{Draft, JSONSchema};
use serde_json::{json, Value};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::envelope::StoredEnvelope;
use crate::domain::models::Envelope;

/// The published Draft 7 schema for serialized envelopes.
pub fn envelope_schema() -> Value {
    let unit = json!({"type": "number", "minimum": 0.0, "maximum": 1.0});
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Envelope",
        "type": "object",
        "required": [
            "patch_id",
            "patch_data",
            "metadata",
            "attempts",
            "confidence_components",
            "breaker_state",
            "resource_usage",
            "success",
            "flagged_for_developer",
            "hash"
        ],
        "properties": {
            "patch_id": {"type": "string", "minLength": 1},
            "patch_data": {"type": "object"},
            "metadata": {
                "type": "object",
                "required": ["created_at", "timestamp"],
                "properties": {
                    "created_at": {"type": "string"},
                    "timestamp": {"type": "string"},
                    "labels": {"type": "object", "additionalProperties": {"type": "string"}}
                }
            },
            "attempts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["attempt_number", "error_count", "error_delta", "confidence", "timestamp"],
                    "properties": {
                        "attempt_number": {"type": "integer", "minimum": 1},
                        "error_count": {"type": "integer", "minimum": 0},
                        "error_delta": {"type": "integer"},
                        "confidence": unit,
                        "error_categories": {"type": "array", "items": {"type": "string"}},
                        "timestamp": {"type": "string"}
                    }
                }
            },
            "confidence_components": {
                "type": "object",
                "required": ["syntax", "logic", "risk"],
                "properties": {"syntax": unit, "logic": unit, "risk": unit}
            },
            "breaker_state": {
                "type": "object",
                "required": ["phase", "trend", "cascade_depth"],
                "properties": {
                    "phase": {"enum": ["closed", "open", "half_open"]},
                    "trend": {
                        "type": "object",
                        "required": ["direction", "velocity_score", "stagnation_risk"],
                        "properties": {
                            "direction": {"enum": ["improving", "plateauing", "worsening"]},
                            "velocity_score": unit,
                            "stagnation_risk": unit
                        }
                    },
                    "cascade_depth": {"type": "integer", "minimum": 0},
                    "probation_remaining": {"type": "integer", "minimum": 0}
                }
            },
            "resource_usage": {"type": "object"},
            "success": {"type": "boolean"},
            "flagged_for_developer": {"type": "boolean"},
            "developer_message": {"type": "string"},
            "halt_reason": {"type": "string"},
            "hash": {"type": "string", "pattern": "^[0-9a-f]{64}$"}
        }
    })
}

/// Compiled envelope schema.
pub struct EnvelopeValidator {
    schema: JSONSchema,
}

impl std::fmt::Debug for EnvelopeValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeValidator").finish_non_exhaustive()
    }
}

impl EnvelopeValidator {
    pub fn new() -> DomainResult<Self> {
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&envelope_schema())
            .map_err(|e| DomainError::SchemaValidation(format!("failed to compile envelope schema: {e}")))?;
        Ok(Self { schema })
    }

    /// Check `value` against the schema, collecting every violation.
    pub fn validate(&self, value: &Value) -> DomainResult<()> {
        match self.schema.validate(value) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let messages: Vec<String> = errors
                    .map(|e| format!("{}: {}", e.instance_path, e))
                    .collect();
                Err(DomainError::SchemaValidation(messages.join(", ")))
            }
        }
    }

    /// Validate, deserialize and verify the stored hash.
    pub fn parse(&self, value: Value) -> DomainResult<Envelope> {
        self.validate(&value)?;
        let stored: StoredEnvelope = serde_json::from_value(value)?;
        Envelope::try_from(stored)
    }

    pub fn parse_str(&self, raw: &str) -> DomainResult<Envelope> {
        self.parse(serde_json::from_str(raw)?)
    }
}
