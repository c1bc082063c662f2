//! Port trait definitions (Hexagonal Architecture)
//!
//! The governor depends on a single outbound port, [`MemoryAdapter`], which
//! durable backends (files, relational stores, workflow engines) implement
//! outside this crate. The shared breaker bookkeeping is provided as free
//! functions over the trait so adapters compose it rather than inherit it.

pub mod memory_adapter;

pub use memory_adapter::{is_breaker_open, update_breaker_on_result, EnvelopeFilter, MemoryAdapter};
