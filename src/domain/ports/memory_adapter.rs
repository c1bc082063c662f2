//! Persistence port for envelopes, breaker state and telemetry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    AttemptRecord, BreakerConfig, BreakerDecision, BreakerPhase, BreakerSnapshot, CircuitBreaker,
    Envelope, TransmissionRecord,
};

// ---------------------------------------------------------------------------
// EnvelopeFilter
// ---------------------------------------------------------------------------

/// Criteria for [`MemoryAdapter::query_envelopes`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeFilter {
    #[serde(default)]
    pub patch_id: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub flagged_for_developer: Option<bool>,
    /// Maximum number of envelopes returned.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl EnvelopeFilter {
    pub fn for_patch(patch_id: impl Into<String>) -> Self {
        Self {
            patch_id: Some(patch_id.into()),
            ..Default::default()
        }
    }

    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn flagged(mut self) -> Self {
        self.flagged_for_developer = Some(true);
        self
    }

    /// Whether `envelope` satisfies every set criterion. `limit` is not checked here.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.patch_id
            .as_deref()
            .is_none_or(|id| envelope.patch_id() == id)
            && self.success.is_none_or(|s| envelope.success() == s)
            && self
                .flagged_for_developer
                .is_none_or(|f| envelope.flagged_for_developer() == f)
    }
}

// ---------------------------------------------------------------------------
// MemoryAdapter
// ---------------------------------------------------------------------------

/// Persistence contract the governor writes through.
///
/// Each call is treated as an atomic single-session operation. Failures are
/// reported as [`DomainError::Persistence`](crate::domain::errors::DomainError::Persistence)
/// and are never retried by the governor; any retry policy belongs to the
/// adapter itself.
#[async_trait]
pub trait MemoryAdapter: Send + Sync {
    /// Persist the latest version of an envelope, replacing any earlier
    /// version with the same `patch_id`.
    async fn store_envelope(&self, envelope: &Envelope) -> DomainResult<()>;

    /// Envelopes matching `filter`, most recently stored first.
    async fn query_envelopes(&self, filter: &EnvelopeFilter) -> DomainResult<Vec<Envelope>>;

    /// The most recently stored breaker snapshot for a session, if any.
    async fn get_breaker_state(&self, session_key: &str) -> DomainResult<Option<BreakerSnapshot>>;

    async fn store_breaker_state(
        &self,
        session_key: &str,
        snapshot: &BreakerSnapshot,
    ) -> DomainResult<()>;

    async fn store_transmission(&self, record: &TransmissionRecord) -> DomainResult<()>;
}

#[async_trait]
impl<T: MemoryAdapter + ?Sized> MemoryAdapter for Arc<T> {
    async fn store_envelope(&self, envelope: &Envelope) -> DomainResult<()> {
        (**self).store_envelope(envelope).await
    }

    async fn query_envelopes(&self, filter: &EnvelopeFilter) -> DomainResult<Vec<Envelope>> {
        (**self).query_envelopes(filter).await
    }

    async fn get_breaker_state(&self, session_key: &str) -> DomainResult<Option<BreakerSnapshot>> {
        (**self).get_breaker_state(session_key).await
    }

    async fn store_breaker_state(
        &self,
        session_key: &str,
        snapshot: &BreakerSnapshot,
    ) -> DomainResult<()> {
        (**self).store_breaker_state(session_key, snapshot).await
    }

    async fn store_transmission(&self, record: &TransmissionRecord) -> DomainResult<()> {
        (**self).store_transmission(record).await
    }
}

// ---------------------------------------------------------------------------
// Shared breaker helpers
// ---------------------------------------------------------------------------

/// Run one attempt result through the session's stored breaker.
///
/// Loads the last snapshot (or starts fresh), records the attempt, takes the
/// decision and persists the updated snapshot before returning it.
pub async fn update_breaker_on_result<A>(
    adapter: &A,
    session_key: &str,
    config: &BreakerConfig,
    record: AttemptRecord,
) -> DomainResult<BreakerDecision>
where
    A: MemoryAdapter + ?Sized,
{
    let mut breaker = match adapter.get_breaker_state(session_key).await? {
        Some(snapshot) => CircuitBreaker::restore(config.clone(), snapshot),
        None => CircuitBreaker::new(config.clone()),
    };

    breaker.record(record)?;
    let decision = breaker.can_attempt();
    adapter
        .store_breaker_state(session_key, &breaker.snapshot())
        .await?;

    debug!(
        session_key,
        allowed = decision.allowed,
        reason = %decision.reason,
        "breaker updated from stored state"
    );
    Ok(decision)
}

/// Read-only check of the stored breaker phase. Unknown sessions are closed.
pub async fn is_breaker_open<A>(adapter: &A, session_key: &str) -> DomainResult<bool>
where
    A: MemoryAdapter + ?Sized,
{
    Ok(adapter
        .get_breaker_state(session_key)
        .await?
        .is_some_and(|snapshot| snapshot.phase == BreakerPhase::Open))
}
