//! In-process memory adapter.

pub mod in_memory_adapter;

pub use in_memory_adapter::InMemoryAdapter;
