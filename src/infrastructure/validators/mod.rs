//! JSON schema validation at the envelope boundary.

pub mod envelope_validator;

pub use envelope_validator::{envelope_schema, EnvelopeValidator};
