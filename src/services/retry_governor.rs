//! Retry governor service.
//!
//! Owns the keyed collection of debugging sessions (session key → breaker +
//! envelope) and runs one attempt cycle per call: record the attempt, consult
//! the breaker, update and re-hash the envelope, decide on escalation, then
//! persist through the [`MemoryAdapter`]. Sessions that reach a terminal state
//! are dropped from memory once persisted; the adapter keeps them for audit.
//!
//! Attempts within a session are serialized by a per-session mutex; distinct
//! sessions proceed concurrently and only contend on the session map while a
//! session is looked up or inserted. Each cycle works on copies of the session
//! state and commits them only after every store succeeded, so a persistence
//! failure leaves the session exactly as it was.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::escalation::{EscalationPolicy, EscalationTrigger};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    error_delta, error_signature, BreakerConfig, BreakerDecision, BreakerView, CircuitBreaker,
    Config, Envelope, PartialConfidence, ResourceUsage, TransmissionRecord,
};
use crate::domain::ports::{EnvelopeFilter, MemoryAdapter};
use crate::infrastructure::logging::SecretScrubber;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Outcome of the external evaluators (linters, tests, scanners) for one patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptEvaluation {
    /// Remaining errors after applying the patch; `0` means fixed.
    pub error_count: u32,
    #[serde(default)]
    pub confidence: PartialConfidence,
    #[serde(default)]
    pub error_categories: Vec<String>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Nesting level of this attempt when patches spawn further patches.
    #[serde(default)]
    pub cascade_depth: Option<u32>,
}

/// One "run a debug attempt" call from the transport layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugAttemptRequest {
    /// Session key; a new session is started when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    pub error_type: String,
    pub message: String,
    pub patch_code: String,
    #[serde(default)]
    pub original_code: String,
    /// Overrides the configured attempt budget for a new session.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_language")]
    pub language: String,
    pub evaluation: AttemptEvaluation,
}

fn default_language() -> String {
    "unknown".to_string()
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernorAction {
    /// The error count reached zero.
    Success,
    /// Generate another patch.
    Retry,
    /// Stop and hand the lineage to a developer.
    Escalate,
    /// Stop; no further attempts are permitted.
    Halt,
}

impl GovernorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Escalate => "escalate",
            Self::Halt => "halt",
        }
    }
}

/// Response echoed back by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResponse {
    pub action: GovernorAction,
    pub envelope: Envelope,
    pub extras: Value,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Session {
    breaker: CircuitBreaker,
    envelope: Envelope,
}

impl Session {
    fn halted(&self) -> Option<&str> {
        self.envelope.halt_reason()
    }

    /// Nothing further can change this session.
    fn is_finished(&self) -> bool {
        self.envelope.is_terminal() || self.breaker.is_terminal()
    }
}

type SessionHandle = Arc<Mutex<Session>>;

// ---------------------------------------------------------------------------
// RetryGovernor
// ---------------------------------------------------------------------------

/// Governs retry sessions and writes their state through a memory adapter.
pub struct RetryGovernor<A: MemoryAdapter> {
    adapter: Arc<A>,
    config: Config,
    escalation: EscalationPolicy,
    scrubber: SecretScrubber,
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl<A: MemoryAdapter> RetryGovernor<A> {
    pub fn new(adapter: Arc<A>, config: Config) -> DomainResult<Self> {
        config.breaker.validate()?;
        let scrubber = SecretScrubber::new()
            .map_err(|e| DomainError::InvalidUsage(format!("secret scrubber: {e}")))?;
        Ok(Self {
            adapter,
            escalation: EscalationPolicy::new(config.escalation.clone()),
            config,
            scrubber,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn with_defaults(adapter: Arc<A>) -> DomainResult<Self> {
        Self::new(adapter, Config::default())
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of sessions held in memory.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run one attempt cycle for the request's session.
    ///
    /// Invalid usage and persistence failures are errors; every breaker
    /// outcome is an `Ok` response.
    pub async fn run_attempt(&self, request: DebugAttemptRequest) -> DomainResult<AttemptResponse> {
        let evaluation = &request.evaluation;
        if let Some(field) = evaluation.confidence.first_malformed() {
            return Err(DomainError::InvalidUsage(format!(
                "confidence component {field} is NaN"
            )));
        }

        let session_key = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let handle = self.session(&session_key, request.max_attempts).await?;
        let mut session = handle.lock().await;

        if session.envelope.success() {
            self.release_if_finished(&session_key, &session).await;
            return Err(DomainError::InvalidUsage(format!(
                "session {session_key} already succeeded"
            )));
        }
        if let Some(reason) = session.halted().map(str::to_string) {
            let response = self.respond(&session_key, &session, GovernorAction::Halt, &reason, None);
            self.release_if_finished(&session_key, &session).await;
            return Ok(response);
        }

        let mut breaker = session.breaker.clone();
        let mut envelope = session.envelope.clone();

        // The breaker is consulted before the attempt is accepted; a denied
        // attempt is not recorded.
        let gate = breaker.can_attempt();
        if !gate.allowed {
            session.breaker = breaker;
            let response = self.respond(
                &session_key,
                &session,
                GovernorAction::Halt,
                gate.reason.as_str(),
                Some(&gate),
            );
            self.release_if_finished(&session_key, &session).await;
            return Ok(response);
        }

        if let Some(depth) = evaluation.cascade_depth {
            breaker.set_cascade_depth(depth)?;
        }

        let previous = envelope.latest_attempt().map(|a| a.error_count);
        let delta = previous.map_or(0, |p| error_delta(p, evaluation.error_count));
        let attempt_number = breaker.last_attempt_number().map_or(1, |n| n + 1);

        envelope.merge_confidence(&evaluation.confidence)?;
        let components = envelope.confidence_components();
        let overall = components.overall(&self.config.confidence_weights);

        let record = breaker.record_attempt(
            evaluation.error_count,
            delta,
            overall,
            evaluation.error_categories.iter().cloned(),
            attempt_number,
        )?;
        envelope.append_attempt(record.clone())?;
        envelope.merge_resource_usage(&evaluation.resource_usage);
        envelope.set_patch_data(json!({
            "error_type": request.error_type,
            "language": request.language,
            "patch_code": request.patch_code,
            "original_code": request.original_code,
        }))?;

        let fixed = evaluation.error_count == 0;
        let quota_exceeded = self.config.quota.exceeded_by(envelope.resource_usage());

        let (decision, reason) = if fixed {
            envelope.mark_success();
            (None, "error count reached zero".to_string())
        } else if let Some(counter) = quota_exceeded {
            let reason = format!("resource quota exceeded: {counter}");
            envelope.halt(reason.clone());
            (None, reason)
        } else {
            let decision = breaker.can_attempt();
            (Some(decision), decision.reason.as_str().to_string())
        };
        envelope.set_breaker_snapshot(BreakerView::from(&breaker))?;

        let trigger = if fixed {
            None
        } else {
            self.escalation.evaluate(
                &record,
                &components,
                decision.as_ref(),
                breaker.is_terminal(),
            )
        };
        if let Some(ref trigger) = trigger {
            let message = self.scrubber.scrub(&trigger.message());
            info!(
                session_key = %session_key,
                attempt = attempt_number,
                message = %message,
                "lineage flagged for developer"
            );
            envelope.apply_developer_flag(message);
        }

        let action = choose_action(fixed, quota_exceeded.is_some(), decision.as_ref(), trigger.as_ref());
        envelope.refresh_timestamp();

        let transmission = TransmissionRecord::new(
            session_key.clone(),
            request.language.clone(),
            request.error_type.clone(),
            components,
        )
        .with_signature(error_signature(&request.error_type, &request.message))
        .with_original_error(self.scrubber.scrub(&request.message));

        self.persist(&session_key, &breaker, &envelope, &transmission)
            .await?;

        debug!(
            session_key = %session_key,
            attempt = attempt_number,
            error_count = evaluation.error_count,
            action = action.as_str(),
            reason = %reason,
            "attempt governed"
        );

        session.breaker = breaker;
        session.envelope = envelope;
        let response = self.respond(&session_key, &session, action, &reason, decision.as_ref());
        self.release_if_finished(&session_key, &session).await;
        Ok(response)
    }

    /// Consult a session's breaker without recording anything.
    pub async fn can_attempt(&self, session_key: &str) -> DomainResult<BreakerDecision> {
        let handle = self.existing_session(session_key).await?;
        let mut session = handle.lock().await;
        let decision = session.breaker.can_attempt();
        self.release_if_finished(session_key, &session).await;
        Ok(decision)
    }

    /// Ask for a HALF_OPEN probation on an OPEN session.
    ///
    /// Returns whether the probation was granted; a grant is persisted before
    /// it takes effect.
    pub async fn request_probation(&self, session_key: &str) -> DomainResult<bool> {
        let handle = self.existing_session(session_key).await?;
        let mut session = handle.lock().await;
        let mut breaker = session.breaker.clone();
        if session.halted().is_some() || !breaker.request_probation() {
            self.release_if_finished(session_key, &session).await;
            return Ok(false);
        }
        let mut envelope = session.envelope.clone();
        envelope.set_breaker_snapshot(BreakerView::from(&breaker))?;
        envelope.refresh_timestamp();

        self.adapter
            .store_envelope(&envelope)
            .await
            .map_err(|e| persistence_failure(session_key, "envelope", e))?;
        self.adapter
            .store_breaker_state(session_key, &breaker.snapshot())
            .await
            .map_err(|e| persistence_failure(session_key, "breaker state", e))?;

        info!(session_key, "probation granted");
        session.breaker = breaker;
        session.envelope = envelope;
        Ok(true)
    }

    /// The current envelope for a lineage, from memory or the adapter.
    pub async fn get_envelope(&self, patch_id: &str) -> DomainResult<Option<Envelope>> {
        let handle = self.sessions.read().await.get(patch_id).cloned();
        if let Some(handle) = handle {
            return Ok(Some(handle.lock().await.envelope.clone()));
        }
        Ok(self
            .adapter
            .query_envelopes(&EnvelopeFilter {
                limit: Some(1),
                ..EnvelopeFilter::for_patch(patch_id)
            })
            .await?
            .into_iter()
            .next())
    }

    /// Most recently stored envelopes, newest first.
    pub async fn list_recent(&self, limit: usize) -> DomainResult<Vec<Envelope>> {
        self.adapter
            .query_envelopes(&EnvelopeFilter::recent(limit))
            .await
    }

    async fn existing_session(&self, session_key: &str) -> DomainResult<SessionHandle> {
        if let Some(handle) = self.sessions.read().await.get(session_key) {
            return Ok(handle.clone());
        }
        if self.adapter.get_breaker_state(session_key).await?.is_none() {
            return Err(DomainError::SessionNotFound(session_key.to_string()));
        }
        self.session(session_key, None).await
    }

    /// Look up a session, restoring it from the adapter or starting a new one.
    async fn session(&self, session_key: &str, max_attempts: Option<u32>) -> DomainResult<SessionHandle> {
        if let Some(handle) = self.sessions.read().await.get(session_key) {
            return Ok(handle.clone());
        }

        let config = self.breaker_config(max_attempts)?;
        let mut breaker = match self.adapter.get_breaker_state(session_key).await? {
            Some(snapshot) => CircuitBreaker::restore(config, snapshot),
            None => CircuitBreaker::new(config),
        };
        let stored = self
            .adapter
            .query_envelopes(&EnvelopeFilter {
                limit: Some(1),
                ..EnvelopeFilter::for_patch(session_key)
            })
            .await?
            .into_iter()
            .next();
        let envelope = match stored {
            Some(envelope) => envelope,
            None => Envelope::new(session_key, json!({}))?,
        };
        let recorded = envelope.latest_attempt().map(|a| a.attempt_number);
        if breaker.last_attempt_number() != recorded {
            // The envelope is the audit record; the breaker follows it.
            warn!(
                session_key,
                breaker_attempt = breaker.last_attempt_number(),
                envelope_attempt = recorded,
                "stored breaker and envelope disagree, resyncing breaker"
            );
            breaker.resync(envelope.attempts());
        }

        let mut sessions = self.sessions.write().await;
        let handle = sessions
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session { breaker, envelope })));
        Ok(handle.clone())
    }

    /// Drop a finished session from memory. Callers hold the session lock.
    async fn release_if_finished(&self, session_key: &str, session: &Session) {
        if session.is_finished() && self.sessions.write().await.remove(session_key).is_some() {
            debug!(session_key, "finished session released");
        }
    }

    fn breaker_config(&self, max_attempts: Option<u32>) -> DomainResult<BreakerConfig> {
        let mut config = self.config.breaker.clone();
        if let Some(max) = max_attempts {
            config.max_attempts = max;
            config.validate()?;
        }
        Ok(config)
    }

    async fn persist(
        &self,
        session_key: &str,
        breaker: &CircuitBreaker,
        envelope: &Envelope,
        transmission: &TransmissionRecord,
    ) -> DomainResult<()> {
        self.adapter
            .store_envelope(envelope)
            .await
            .map_err(|e| persistence_failure(session_key, "envelope", e))?;
        self.adapter
            .store_breaker_state(session_key, &breaker.snapshot())
            .await
            .map_err(|e| persistence_failure(session_key, "breaker state", e))?;
        self.adapter
            .store_transmission(transmission)
            .await
            .map_err(|e| persistence_failure(session_key, "transmission", e))?;
        Ok(())
    }

    fn respond(
        &self,
        session_key: &str,
        session: &Session,
        action: GovernorAction,
        reason: &str,
        decision: Option<&BreakerDecision>,
    ) -> AttemptResponse {
        let envelope = &session.envelope;
        let breaker = &session.breaker;
        let extras = json!({
            "session_id": session_key,
            "attempt_number": envelope.latest_attempt().map(|a| a.attempt_number),
            "allowed": decision.map(|d| d.allowed),
            "reason": reason,
            "phase": breaker.phase().as_str(),
            "trend": breaker.trend(),
            "overall_confidence": envelope
                .confidence_components()
                .overall(&self.config.confidence_weights),
            "probation_remaining": breaker.probations_remaining(),
            "developer_message": envelope.developer_message(),
            "hash": envelope.hash(),
        });
        AttemptResponse {
            action,
            envelope: envelope.clone(),
            extras,
        }
    }
}

fn choose_action(
    fixed: bool,
    quota_exceeded: bool,
    decision: Option<&BreakerDecision>,
    trigger: Option<&EscalationTrigger>,
) -> GovernorAction {
    if fixed {
        return GovernorAction::Success;
    }
    if trigger.is_some() {
        return GovernorAction::Escalate;
    }
    if quota_exceeded || decision.is_some_and(|d| !d.allowed) {
        return GovernorAction::Halt;
    }
    GovernorAction::Retry
}

/// Log and convert an adapter failure. Non-persistence errors pass through.
fn persistence_failure(session_key: &str, what: &str, err: DomainError) -> DomainError {
    warn!(session_key, what, error = %err, "store failed");
    match err {
        DomainError::Persistence(_) => err,
        other => DomainError::Persistence(format!("storing {what}: {other}")),
    }
}
