//! Domain layer for the mender retry governor
//!
//! Pure models (attempts, trend, breaker, envelope) and the persistence port.
//! Nothing in here performs I/O.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
