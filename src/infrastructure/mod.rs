//! Infrastructure layer module
//!
//! - Configuration management (figment)
//! - Logging infrastructure (tracing)
//! - Envelope schema validation (jsonschema)

pub mod config;
pub mod logging;
pub mod validators;
