//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber:
//! - JSON or pretty stdout output
//! - Rolling log files with retention
//! - Secret scrubbing for strings that leave the governor

pub mod config;
pub mod logger;
pub mod retention;
pub mod secret_scrubbing;

pub use config::{LogConfig, LogFormat, RotationPolicy};
pub use logger::LoggerImpl;
pub use retention::prune_expired_logs;
pub use secret_scrubbing::SecretScrubber;
