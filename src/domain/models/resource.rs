//! Resource accounting for a patch lineage.
//!
//! Counters are merged additively across attempts and are used only for
//! quota enforcement, never for correctness decisions.

use serde::{Deserialize, Serialize};

/// Aggregate resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub wall_time_ms: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub compute_units: u64,
}

impl ResourceUsage {
    /// Add another usage sample to this one, saturating on overflow.
    pub fn merge(&mut self, other: &Self) {
        self.wall_time_ms = self.wall_time_ms.saturating_add(other.wall_time_ms);
        self.memory_bytes = self.memory_bytes.saturating_add(other.memory_bytes);
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.compute_units = self.compute_units.saturating_add(other.compute_units);
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Optional per-counter limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    #[serde(default)]
    pub max_wall_time_ms: Option<u64>,
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_compute_units: Option<u64>,
}

impl ResourceQuota {
    /// Name of the first counter in `usage` that exceeds its limit, if any.
    pub fn exceeded_by(&self, usage: &ResourceUsage) -> Option<&'static str> {
        let checks = [
            ("wall_time_ms", self.max_wall_time_ms, usage.wall_time_ms),
            ("memory_bytes", self.max_memory_bytes, usage.memory_bytes),
            ("tokens", self.max_tokens, usage.tokens),
            ("compute_units", self.max_compute_units, usage.compute_units),
        ];
        checks
            .into_iter()
            .find(|(_, limit, used)| limit.is_some_and(|l| *used > l))
            .map(|(name, _, _)| name)
    }
}
