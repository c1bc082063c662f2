//! Trend-aware circuit breaker for patch retry loops.
//!
//! Unlike a plain failure-count breaker, this one looks at the *shape* of the
//! attempt history. It opens when the attempt budget is spent, when attempts
//! stop moving the error count (stagnation), or when confidence is below the
//! floor while the trend is worsening.
//!
//! Phase changes happen only in [`CircuitBreaker::can_attempt`], so every
//! decision sees the freshest trend. [`CircuitBreaker::record_attempt`] only
//! appends history. Once OPEN the breaker never resumes on its own: the caller
//! must ask for a HALF_OPEN probation with [`CircuitBreaker::request_probation`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::attempt::AttemptRecord;
use super::confidence::clamp_unit;
use super::trend::{
    analyze, TrendDirection, TrendMetadata, TrendSettings, DEFAULT_IMPROVING_FRACTION,
    DEFAULT_STAGNATION_EPSILON,
};
use crate::domain::errors::{DomainError, DomainResult};

/// Configuration for the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Hard cap on attempts per lineage.
    pub max_attempts: u32,
    /// Window used for trend direction and velocity.
    pub improvement_window: usize,
    /// Stalled run length at which the breaker opens.
    pub stagnation_threshold: usize,
    /// Latest confidence below this, combined with a worsening trend, opens the breaker.
    pub confidence_floor: f64,
    /// Absolute delta at or below which an attempt counts as stalled.
    pub stagnation_epsilon: f64,
    /// Fraction of positive deltas required to call the trend improving.
    pub improving_fraction: f64,
    /// Number of HALF_OPEN probations a lineage may request.
    pub max_probations: u32,
    /// Deepest allowed nesting of recursively spawned patches.
    pub cascade_ceiling: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            improvement_window: 3,
            stagnation_threshold: 5,
            confidence_floor: 0.6,
            stagnation_epsilon: DEFAULT_STAGNATION_EPSILON,
            improving_fraction: DEFAULT_IMPROVING_FRACTION,
            max_probations: 1,
            cascade_ceiling: 3,
        }
    }
}

impl BreakerConfig {
    /// A breaker that gives up early.
    pub fn sensitive() -> Self {
        Self {
            max_attempts: 5,
            stagnation_threshold: 3,
            confidence_floor: 0.7,
            max_probations: 0,
            ..Default::default()
        }
    }

    /// A breaker that tolerates long plateaus.
    pub fn resilient() -> Self {
        Self {
            max_attempts: 20,
            improvement_window: 5,
            stagnation_threshold: 8,
            confidence_floor: 0.4,
            max_probations: 2,
            ..Default::default()
        }
    }

    pub fn trend_settings(&self) -> TrendSettings {
        TrendSettings {
            improvement_window: self.improvement_window,
            stagnation_threshold: self.stagnation_threshold,
            stagnation_epsilon: self.stagnation_epsilon,
            improving_fraction: self.improving_fraction,
        }
    }

    /// Number of records the breaker must retain to analyze its trend.
    pub fn retained_history(&self) -> usize {
        self.improvement_window.max(self.stagnation_threshold).max(1)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_attempts == 0 {
            return Err(DomainError::InvalidUsage("max_attempts must be positive".into()));
        }
        if self.improvement_window == 0 {
            return Err(DomainError::InvalidUsage("improvement_window must be positive".into()));
        }
        if self.stagnation_threshold == 0 {
            return Err(DomainError::InvalidUsage("stagnation_threshold must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(DomainError::InvalidUsage(format!(
                "confidence_floor {} is outside [0, 1]",
                self.confidence_floor
            )));
        }
        if !(self.improving_fraction > 0.0 && self.improving_fraction <= 1.0) {
            return Err(DomainError::InvalidUsage(format!(
                "improving_fraction {} is outside (0, 1]",
                self.improving_fraction
            )));
        }
        if self.stagnation_epsilon.is_nan() || self.stagnation_epsilon < 0.0 {
            return Err(DomainError::InvalidUsage("stagnation_epsilon must be non-negative".into()));
        }
        Ok(())
    }
}

/// Phase of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    /// Attempts flow normally.
    #[default]
    Closed,
    /// Attempts are blocked.
    Open,
    /// A single probationary attempt is allowed.
    HalfOpen,
}

impl BreakerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Why the breaker decided what it decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerReason {
    Continue,
    HalfOpenTrial,
    BudgetExhausted,
    CascadeDepthExceeded,
    StagnationDetected,
    LowConfidenceWorsening,
    ProbationFailed,
    CircuitOpen,
}

impl BreakerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::HalfOpenTrial => "half-open trial",
            Self::BudgetExhausted => "attempt budget exhausted",
            Self::CascadeDepthExceeded => "cascade depth exceeded",
            Self::StagnationDetected => "stagnation detected",
            Self::LowConfidenceWorsening => "confidence below floor with worsening trend",
            Self::ProbationFailed => "probation failed",
            Self::CircuitOpen => "circuit open",
        }
    }
}

impl std::fmt::Display for BreakerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`CircuitBreaker::can_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerDecision {
    pub allowed: bool,
    pub reason: BreakerReason,
    pub trend: TrendMetadata,
    pub phase: BreakerPhase,
}

/// An active HALF_OPEN probation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probation {
    /// `attempt_count` when the probation was granted; the trial is used once
    /// the count moves past it.
    pub started_at_attempt: u32,
    /// Granted while the stagnation run was saturated. Such a trial ends in
    /// OPEN whatever its outcome.
    pub under_stagnation: bool,
}

/// Serializable breaker state, stored per session by a memory adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub phase: BreakerPhase,
    pub attempt_count: u32,
    pub last_attempt_number: Option<u32>,
    /// The analysis window only; the envelope keeps the full history.
    pub history: Vec<AttemptRecord>,
    pub trend: TrendMetadata,
    pub cascade_depth: u32,
    pub probations_used: u32,
    pub probation: Option<Probation>,
    pub open_reason: Option<BreakerReason>,
    pub opened_at: Option<DateTime<Utc>>,
    pub open_count: u32,
    pub state_changed_at: DateTime<Utc>,
    /// Attempt budget of this lineage, which may differ from the configured one.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            attempt_count: 0,
            last_attempt_number: None,
            history: Vec::new(),
            trend: TrendMetadata::default(),
            cascade_depth: 0,
            probations_used: 0,
            probation: None,
            open_reason: None,
            opened_at: None,
            open_count: 0,
            state_changed_at: Utc::now(),
            max_attempts: None,
        }
    }
}

/// Per-session breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerSnapshot,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerSnapshot::default(),
        }
    }

    /// Rebuild a breaker from a stored snapshot.
    ///
    /// A budget recorded in the snapshot takes precedence over `config`.
    pub fn restore(mut config: BreakerConfig, snapshot: BreakerSnapshot) -> Self {
        if let Some(max) = snapshot.max_attempts.filter(|m| *m > 0) {
            config.max_attempts = max;
        }
        Self {
            config,
            state: snapshot,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            max_attempts: Some(self.config.max_attempts),
            ..self.state.clone()
        }
    }

    /// Replace the attempt ledger with `attempts`, the full ordered history.
    ///
    /// Used when a stored snapshot and the stored envelope disagree on the
    /// latest attempt. Phase, probations and cascade depth are kept.
    pub fn resync(&mut self, attempts: &[AttemptRecord]) {
        let retain = self.config.retained_history();
        self.state.attempt_count = u32::try_from(attempts.len()).unwrap_or(u32::MAX);
        self.state.last_attempt_number = attempts.last().map(|a| a.attempt_number);
        self.state.history = attempts[attempts.len().saturating_sub(retain)..].to_vec();
        self.state.trend = analyze(&self.state.history, &self.config.trend_settings());
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn phase(&self) -> BreakerPhase {
        self.state.phase
    }

    pub fn attempt_count(&self) -> u32 {
        self.state.attempt_count
    }

    pub fn last_attempt_number(&self) -> Option<u32> {
        self.state.last_attempt_number
    }

    pub fn trend(&self) -> TrendMetadata {
        self.state.trend
    }

    pub fn cascade_depth(&self) -> u32 {
        self.state.cascade_depth
    }

    pub fn history(&self) -> &[AttemptRecord] {
        &self.state.history
    }

    pub fn latest(&self) -> Option<&AttemptRecord> {
        self.state.history.last()
    }

    pub fn probations_remaining(&self) -> u32 {
        self.config.max_probations.saturating_sub(self.state.probations_used)
    }

    /// Record an attempt outcome.
    ///
    /// Confidence is clamped into `[0, 1]`. A non-increasing `attempt_number`
    /// or a NaN confidence is invalid usage. Never changes the phase.
    pub fn record_attempt(
        &mut self,
        error_count: u32,
        error_delta: i64,
        confidence: f64,
        error_categories: impl IntoIterator<Item = impl Into<String>>,
        attempt_number: u32,
    ) -> DomainResult<AttemptRecord> {
        let record = AttemptRecord::new(
            attempt_number,
            error_count,
            error_delta,
            confidence,
            error_categories,
        );
        self.record(record)
    }

    /// Record a prebuilt attempt record. See [`Self::record_attempt`].
    pub fn record(&mut self, mut record: AttemptRecord) -> DomainResult<AttemptRecord> {
        let next = self.state.last_attempt_number.map_or(1, |n| n + 1);
        if record.attempt_number == 0
            || self
                .state
                .last_attempt_number
                .is_some_and(|last| record.attempt_number <= last)
        {
            return Err(DomainError::AttemptOutOfOrder {
                expected: next,
                got: record.attempt_number,
            });
        }
        record.confidence = clamp_unit(record.confidence).ok_or_else(|| {
            DomainError::InvalidUsage(format!(
                "attempt {} has a NaN confidence",
                record.attempt_number
            ))
        })?;

        self.state.attempt_count += 1;
        self.state.last_attempt_number = Some(record.attempt_number);
        self.state.history.push(record.clone());

        let retain = self.config.retained_history();
        if self.state.history.len() > retain {
            let excess = self.state.history.len() - retain;
            self.state.history.drain(..excess);
        }

        self.state.trend = analyze(&self.state.history, &self.config.trend_settings());

        debug!(
            attempt = record.attempt_number,
            error_count = record.error_count,
            error_delta = record.error_delta,
            direction = %self.state.trend.direction,
            stagnation_risk = self.state.trend.stagnation_risk,
            "attempt recorded"
        );

        Ok(record)
    }

    /// Decide whether another attempt is permitted.
    ///
    /// Idempotent for repeated calls with no intervening `record_attempt`.
    pub fn can_attempt(&mut self) -> BreakerDecision {
        if self.state.attempt_count >= self.config.max_attempts {
            return self.deny(BreakerReason::BudgetExhausted);
        }
        if self.state.cascade_depth > self.config.cascade_ceiling {
            return self.deny(BreakerReason::CascadeDepthExceeded);
        }

        match self.state.phase {
            BreakerPhase::Open => {
                let reason = self.state.open_reason.unwrap_or(BreakerReason::CircuitOpen);
                return self.deny(reason);
            }
            BreakerPhase::HalfOpen => {
                let probation = self.state.probation.unwrap_or(Probation {
                    started_at_attempt: self.state.attempt_count,
                    under_stagnation: self.state.trend.is_stagnant(),
                });
                if self.state.attempt_count == probation.started_at_attempt {
                    return self.decision(true, BreakerReason::HalfOpenTrial);
                }
                if probation.under_stagnation {
                    return self.deny(BreakerReason::StagnationDetected);
                }
                let improved = self
                    .latest()
                    .is_some_and(|r| r.error_delta as f64 > self.config.stagnation_epsilon);
                if !improved {
                    return self.deny(BreakerReason::ProbationFailed);
                }
                self.close();
            }
            BreakerPhase::Closed => {}
        }

        let trend = self.state.trend;
        if trend.is_stagnant() {
            return self.deny(BreakerReason::StagnationDetected);
        }

        let below_floor = self
            .latest()
            .is_some_and(|r| r.confidence < self.config.confidence_floor);
        if below_floor && trend.direction == TrendDirection::Worsening {
            return self.deny(BreakerReason::LowConfidenceWorsening);
        }

        self.decision(true, BreakerReason::Continue)
    }

    /// Ask for a HALF_OPEN probation after the breaker opened.
    ///
    /// Returns `false` when the breaker is not OPEN, no probations remain, or
    /// the lineage is past its attempt budget or cascade ceiling.
    pub fn request_probation(&mut self) -> bool {
        if self.state.phase != BreakerPhase::Open
            || self.probations_remaining() == 0
            || self.state.attempt_count >= self.config.max_attempts
            || self.state.cascade_depth > self.config.cascade_ceiling
        {
            return false;
        }

        self.state.probations_used += 1;
        self.state.probation = Some(Probation {
            started_at_attempt: self.state.attempt_count,
            under_stagnation: self.state.trend.is_stagnant(),
        });
        self.state.open_reason = None;
        self.transition(BreakerPhase::HalfOpen);
        true
    }

    /// Record one more level of recursive patch spawning.
    ///
    /// The depth is clamped one past the ceiling; anything beyond the ceiling
    /// forces OPEN on the next decision.
    pub fn enter_cascade(&mut self) -> u32 {
        self.state.cascade_depth = (self.state.cascade_depth + 1).min(self.cascade_limit());
        self.state.cascade_depth
    }

    /// Raise the cascade depth to `depth`. Lowering it is invalid usage.
    pub fn set_cascade_depth(&mut self, depth: u32) -> DomainResult<u32> {
        if depth < self.state.cascade_depth {
            return Err(DomainError::CascadeRegression {
                current: self.state.cascade_depth,
                requested: depth,
            });
        }
        self.state.cascade_depth = depth.min(self.cascade_limit());
        Ok(self.state.cascade_depth)
    }

    /// OPEN with nothing left to try.
    pub fn is_terminal(&self) -> bool {
        self.state.phase == BreakerPhase::Open
            && (self.probations_remaining() == 0
                || self.state.attempt_count >= self.config.max_attempts
                || self.state.cascade_depth > self.config.cascade_ceiling)
    }

    fn cascade_limit(&self) -> u32 {
        self.config.cascade_ceiling.saturating_add(1)
    }

    fn decision(&self, allowed: bool, reason: BreakerReason) -> BreakerDecision {
        BreakerDecision {
            allowed,
            reason,
            trend: self.state.trend,
            phase: self.state.phase,
        }
    }

    fn deny(&mut self, reason: BreakerReason) -> BreakerDecision {
        self.state.open_reason = Some(reason);
        if self.state.phase != BreakerPhase::Open {
            self.state.opened_at = Some(Utc::now());
            self.state.open_count += 1;
            self.state.probation = None;
            self.transition(BreakerPhase::Open);
        }
        self.decision(false, reason)
    }

    fn close(&mut self) {
        self.state.probation = None;
        self.state.open_reason = None;
        self.state.opened_at = None;
        self.transition(BreakerPhase::Closed);
    }

    fn transition(&mut self, to: BreakerPhase) {
        info!(
            from = self.state.phase.as_str(),
            to = to.as_str(),
            attempt_count = self.state.attempt_count,
            reason = self.state.open_reason.map(|r| r.as_str()),
            "breaker phase changed"
        );
        self.state.phase = to;
        self.state.state_changed_at = Utc::now();
    }
}
