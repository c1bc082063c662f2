//! Common test utilities for integration tests
//!
//! Provides shared fixtures, helpers, and test adapters used across
//! multiple integration test files.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mender::domain::models::{
    AttemptRecord, BreakerSnapshot, Envelope, PartialConfidence, TransmissionRecord,
};
use mender::domain::ports::{EnvelopeFilter, MemoryAdapter};
use mender::services::{AttemptEvaluation, DebugAttemptRequest};
use mender::{DomainError, DomainResult, InMemoryAdapter};

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
#[allow(dead_code)]
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Build an attempt history from error counts and confidences, computing deltas.
#[allow(dead_code)]
pub fn history(errors: &[u32], confidences: &[f64]) -> Vec<AttemptRecord> {
    let mut previous: Option<u32> = None;
    errors
        .iter()
        .zip(confidences)
        .enumerate()
        .map(|(i, (&count, &confidence))| {
            let delta = previous.map_or(0, |p| i64::from(p) - i64::from(count));
            previous = Some(count);
            AttemptRecord::new(
                u32::try_from(i + 1).unwrap(),
                count,
                delta,
                confidence,
                Vec::<String>::new(),
            )
        })
        .collect()
}

/// A request whose evaluators report `errors` remaining errors.
#[allow(dead_code)]
pub fn attempt_request(session: &str, errors: u32, logic: f64) -> DebugAttemptRequest {
    DebugAttemptRequest {
        session_id: Some(session.to_string()),
        error_type: "TypeError".to_string(),
        message: format!("{errors} type errors remaining"),
        patch_code: format!("def fix():\n    return {errors}\n"),
        original_code: "def fix():\n    return '1' + 1\n".to_string(),
        max_attempts: None,
        language: "python".to_string(),
        evaluation: AttemptEvaluation {
            error_count: errors,
            confidence: PartialConfidence::default().syntax(0.9).logic(logic).risk(0.1),
            ..Default::default()
        },
    }
}

/// Memory adapter whose writes can be made to fail on demand.
#[allow(dead_code)]
pub struct FlakyAdapter {
    inner: InMemoryAdapter,
    fail_envelopes: AtomicBool,
    fail_breakers: AtomicBool,
    fail_transmissions: AtomicBool,
}

#[allow(dead_code)]
impl FlakyAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryAdapter::new().unwrap(),
            fail_envelopes: AtomicBool::new(false),
            fail_breakers: AtomicBool::new(false),
            fail_transmissions: AtomicBool::new(false),
        })
    }

    /// Fail every write.
    pub fn set_failing(&self, failing: bool) {
        self.fail_envelopes.store(failing, Ordering::SeqCst);
        self.fail_breakers.store(failing, Ordering::SeqCst);
        self.fail_transmissions.store(failing, Ordering::SeqCst);
    }

    pub fn fail_envelope_writes(&self, failing: bool) {
        self.fail_envelopes.store(failing, Ordering::SeqCst);
    }

    pub fn fail_breaker_writes(&self, failing: bool) {
        self.fail_breakers.store(failing, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryAdapter {
        &self.inner
    }

    fn check(flag: &AtomicBool) -> DomainResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(DomainError::Persistence("disk full".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MemoryAdapter for FlakyAdapter {
    async fn store_envelope(&self, envelope: &Envelope) -> DomainResult<()> {
        Self::check(&self.fail_envelopes)?;
        self.inner.store_envelope(envelope).await
    }

    async fn query_envelopes(&self, filter: &EnvelopeFilter) -> DomainResult<Vec<Envelope>> {
        self.inner.query_envelopes(filter).await
    }

    async fn get_breaker_state(&self, session_key: &str) -> DomainResult<Option<BreakerSnapshot>> {
        self.inner.get_breaker_state(session_key).await
    }

    async fn store_breaker_state(
        &self,
        session_key: &str,
        snapshot: &BreakerSnapshot,
    ) -> DomainResult<()> {
        Self::check(&self.fail_breakers)?;
        self.inner.store_breaker_state(session_key, snapshot).await
    }

    async fn store_transmission(&self, record: &TransmissionRecord) -> DomainResult<()> {
        Self::check(&self.fail_transmissions)?;
        self.inner.store_transmission(record).await
    }
}
