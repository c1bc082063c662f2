//! End-to-end tests for the retry governor over the in-memory adapter.

mod common;

use std::sync::Arc;

use common::{attempt_request, history, setup_test_logging, FlakyAdapter};
use futures::future::join_all;
use mender::domain::models::{BreakerPhase, BreakerReason, TrendDirection};
use mender::{
    BreakerConfig, CircuitBreaker, Config, DomainError, EnvelopeFilter, GovernorAction,
    InMemoryAdapter, MemoryAdapter, RetryGovernor,
};

fn scenario_config() -> BreakerConfig {
    BreakerConfig {
        max_attempts: 10,
        improvement_window: 3,
        stagnation_threshold: 5,
        confidence_floor: 0.6,
        ..Default::default()
    }
}

fn replay(errors: &[u32], confidences: &[f64]) -> (CircuitBreaker, mender::BreakerDecision) {
    let mut breaker = CircuitBreaker::new(scenario_config());
    let mut decision = breaker.can_attempt();
    for record in history(errors, confidences) {
        breaker.record(record).unwrap();
        decision = breaker.can_attempt();
    }
    (breaker, decision)
}

#[test]
fn test_improving_session_is_allowed() {
    let (breaker, decision) = replay(&[5, 3, 1, 0], &[0.3, 0.6, 0.8, 0.95]);
    assert!(decision.allowed);
    assert_eq!(decision.reason.as_str(), "continue");
    assert_eq!(decision.trend.direction, TrendDirection::Improving);
    assert_eq!(breaker.attempt_count(), 4);
}

#[test]
fn test_plateauing_session_reports_rising_stagnation() {
    let (_, after_three) = replay(&[3, 2, 2], &[0.4, 0.5, 0.5]);
    let (_, after_four) = replay(&[3, 2, 2, 2], &[0.4, 0.5, 0.5, 0.45]);
    assert_eq!(after_four.trend.direction, TrendDirection::Plateauing);
    assert!(after_four.trend.stagnation_risk > after_three.trend.stagnation_risk);
    assert!(after_four.trend.stagnation_risk < 1.0);
}

#[test]
fn test_budget_opens_exactly_at_max_attempts() {
    let config = BreakerConfig { max_attempts: 4, ..scenario_config() };
    let mut breaker = CircuitBreaker::new(config);
    for (i, record) in history(&[9, 8, 7, 6], &[0.9; 4]).into_iter().enumerate() {
        breaker.record(record).unwrap();
        let decision = breaker.can_attempt();
        if i < 3 {
            assert!(decision.allowed, "attempt {} should be allowed", i + 1);
        } else {
            assert!(!decision.allowed);
            assert_eq!(decision.reason, BreakerReason::BudgetExhausted);
            assert_eq!(breaker.phase(), BreakerPhase::Open);
        }
    }
}

#[tokio::test]
async fn test_governor_runs_lineage_to_success() {
    setup_test_logging();
    let adapter = Arc::new(InMemoryAdapter::new().unwrap());
    let governor = RetryGovernor::with_defaults(adapter.clone()).unwrap();

    let mut actions = Vec::new();
    for (errors, logic) in [(5, 0.3), (3, 0.6), (1, 0.8), (0, 0.95)] {
        let response = governor
            .run_attempt(attempt_request("lineage-1", errors, logic))
            .await
            .unwrap();
        actions.push(response.action);
    }
    assert_eq!(
        actions,
        vec![
            GovernorAction::Retry,
            GovernorAction::Retry,
            GovernorAction::Retry,
            GovernorAction::Success
        ]
    );

    let stored = governor.get_envelope("lineage-1").await.unwrap().unwrap();
    assert!(stored.success());
    assert_eq!(stored.attempts().len(), 4);
    assert!(stored.verify_integrity());
    assert_eq!(stored.patch_data()["language"], "python");

    let persisted = adapter
        .query_envelopes(&EnvelopeFilter::for_patch("lineage-1"))
        .await
        .unwrap();
    assert_eq!(persisted[0].hash(), stored.hash());
    assert_eq!(adapter.transmissions().await.len(), 4);
}

#[tokio::test]
async fn test_telemetry_is_scrubbed() {
    let adapter = Arc::new(InMemoryAdapter::new().unwrap());
    let governor = RetryGovernor::with_defaults(adapter.clone()).unwrap();

    let mut request = attempt_request("lineage-1", 2, 0.7);
    request.message = "401 from upstream: Authorization: Bearer abc.def.ghi".to_string();
    governor.run_attempt(request).await.unwrap();

    let transmissions = adapter.transmissions().await;
    let original = transmissions[0].original_error.as_deref().unwrap();
    assert!(!original.contains("abc.def.ghi"));
    assert_eq!(transmissions[0].language, "python");
    assert_eq!(transmissions[0].error_classification, "TypeError");
    assert!(transmissions[0].error_signature.is_some());
}

#[tokio::test]
async fn test_sessions_run_concurrently_and_stay_isolated() {
    let adapter = Arc::new(InMemoryAdapter::new().unwrap());
    let governor = Arc::new(RetryGovernor::with_defaults(adapter.clone()).unwrap());

    let lineages = (0..8).map(|n| {
        let governor = governor.clone();
        async move {
            let session = format!("lineage-{n}");
            for errors in [4, 3, 2] {
                governor
                    .run_attempt(attempt_request(&session, errors, 0.7))
                    .await
                    .unwrap();
            }
            session
        }
    });
    let sessions = join_all(lineages).await;

    assert_eq!(governor.session_count().await, 8);
    for session in sessions {
        let envelope = governor.get_envelope(&session).await.unwrap().unwrap();
        let numbers: Vec<u32> = envelope.attempts().iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
    assert_eq!(governor.list_recent(5).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_same_session_attempts_are_serialized() {
    let adapter = Arc::new(InMemoryAdapter::new().unwrap());
    let governor = Arc::new(RetryGovernor::with_defaults(adapter).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let governor = governor.clone();
            tokio::spawn(async move {
                governor
                    .run_attempt(attempt_request("shared", 3, 0.8))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let envelope = governor.get_envelope("shared").await.unwrap().unwrap();
    let numbers: Vec<u32> = envelope.attempts().iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_persistence_failure_is_reported_and_leaves_session_unchanged() {
    let adapter = FlakyAdapter::new();
    let governor = RetryGovernor::with_defaults(adapter.clone()).unwrap();
    governor
        .run_attempt(attempt_request("lineage-1", 4, 0.7))
        .await
        .unwrap();

    adapter.set_failing(true);
    let err = governor
        .run_attempt(attempt_request("lineage-1", 3, 0.7))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Persistence(_)));

    let envelope = governor.get_envelope("lineage-1").await.unwrap().unwrap();
    assert_eq!(envelope.attempts().len(), 1);

    adapter.set_failing(false);
    let response = governor
        .run_attempt(attempt_request("lineage-1", 3, 0.7))
        .await
        .unwrap();
    assert_eq!(response.extras["attempt_number"], 2);
    assert_eq!(adapter.inner().transmissions().await.len(), 2);
}

async fn numbers(governor: &RetryGovernor<FlakyAdapter>, session: &str) -> Vec<u32> {
    let envelope = governor.get_envelope(session).await.unwrap().unwrap();
    envelope.attempts().iter().map(|a| a.attempt_number).collect()
}

#[tokio::test]
async fn test_failed_envelope_store_does_not_break_restored_session() {
    let adapter = FlakyAdapter::new();
    let first = RetryGovernor::with_defaults(adapter.clone()).unwrap();
    first.run_attempt(attempt_request("lineage-1", 5, 0.7)).await.unwrap();

    adapter.fail_envelope_writes(true);
    let err = first
        .run_attempt(attempt_request("lineage-1", 4, 0.7))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Persistence(_)));
    adapter.fail_envelope_writes(false);

    let restored = RetryGovernor::with_defaults(adapter.clone()).unwrap();
    for (expected, errors) in [(2, 4), (3, 3), (4, 2)] {
        let response = restored
            .run_attempt(attempt_request("lineage-1", errors, 0.7))
            .await
            .unwrap();
        assert_eq!(response.action, GovernorAction::Retry);
        assert_eq!(response.extras["attempt_number"], expected);
    }
    assert_eq!(numbers(&restored, "lineage-1").await, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_failed_breaker_store_is_resynced_from_envelope() {
    let adapter = FlakyAdapter::new();
    let first = RetryGovernor::with_defaults(adapter.clone()).unwrap();
    first.run_attempt(attempt_request("lineage-1", 5, 0.7)).await.unwrap();

    // The envelope for attempt 2 lands, the breaker snapshot does not.
    adapter.fail_breaker_writes(true);
    assert!(first
        .run_attempt(attempt_request("lineage-1", 4, 0.7))
        .await
        .is_err());
    adapter.fail_breaker_writes(false);

    let restored = RetryGovernor::with_defaults(adapter.clone()).unwrap();
    let response = restored
        .run_attempt(attempt_request("lineage-1", 3, 0.7))
        .await
        .unwrap();
    assert_eq!(response.extras["attempt_number"], 3);
    assert_eq!(numbers(&restored, "lineage-1").await, vec![1, 2, 3]);

    let snapshot = adapter.inner().get_breaker_state("lineage-1").await.unwrap().unwrap();
    assert_eq!(snapshot.attempt_count, 3);
    assert_eq!(snapshot.last_attempt_number, Some(3));
}

#[tokio::test]
async fn test_request_budget_survives_restore() {
    let adapter = Arc::new(InMemoryAdapter::new().unwrap());
    let first = RetryGovernor::with_defaults(adapter.clone()).unwrap();
    let mut request = attempt_request("short", 9, 0.9);
    request.max_attempts = Some(2);
    first.run_attempt(request).await.unwrap();

    let second = RetryGovernor::with_defaults(adapter.clone()).unwrap();
    let response = second
        .run_attempt(attempt_request("short", 7, 0.9))
        .await
        .unwrap();
    assert_eq!(response.extras["reason"], "attempt budget exhausted");
    assert_eq!(response.extras["allowed"], false);

    let third = RetryGovernor::with_defaults(adapter).unwrap();
    let denied = third
        .run_attempt(attempt_request("short", 5, 0.9))
        .await
        .unwrap();
    assert_eq!(denied.action, GovernorAction::Halt);
    assert_eq!(denied.envelope.attempts().len(), 2);
}

#[tokio::test]
async fn test_finished_sessions_are_released_from_memory() {
    let adapter = Arc::new(InMemoryAdapter::new().unwrap());
    let governor = RetryGovernor::with_defaults(adapter).unwrap();

    governor.run_attempt(attempt_request("done", 2, 0.8)).await.unwrap();
    governor.run_attempt(attempt_request("open", 2, 0.8)).await.unwrap();
    assert_eq!(governor.session_count().await, 2);

    governor.run_attempt(attempt_request("done", 0, 0.95)).await.unwrap();
    assert_eq!(governor.session_count().await, 1);

    let stored = governor.get_envelope("done").await.unwrap().unwrap();
    assert!(stored.success());
    assert!(governor
        .run_attempt(attempt_request("done", 0, 0.95))
        .await
        .unwrap_err()
        .is_invalid_usage());
    assert_eq!(governor.session_count().await, 1);
}

#[tokio::test]
async fn test_request_max_attempts_overrides_budget() {
    let adapter = Arc::new(InMemoryAdapter::new().unwrap());
    let config = Config {
        breaker: BreakerConfig { max_probations: 0, ..Default::default() },
        ..Default::default()
    };
    let governor = RetryGovernor::new(adapter, config).unwrap();

    let mut last = None;
    for errors in [9, 7] {
        let mut request = attempt_request("short", errors, 0.9);
        request.max_attempts = Some(2);
        last = Some(governor.run_attempt(request).await.unwrap());
    }
    let response = last.unwrap();
    assert_eq!(response.extras["reason"], "attempt budget exhausted");
    assert_eq!(response.action, GovernorAction::Escalate);
    assert!(response.envelope.is_terminal());
    assert!(!governor.request_probation("short").await.unwrap());
}

#[tokio::test]
async fn test_zero_max_attempts_is_invalid() {
    let governor = RetryGovernor::with_defaults(Arc::new(InMemoryAdapter::new().unwrap())).unwrap();
    let mut request = attempt_request("bad", 3, 0.5);
    request.max_attempts = Some(0);
    assert!(governor.run_attempt(request).await.unwrap_err().is_invalid_usage());
}

#[tokio::test]
async fn test_cascade_depth_past_ceiling_halts() {
    let governor = RetryGovernor::with_defaults(Arc::new(InMemoryAdapter::new().unwrap())).unwrap();
    let mut request = attempt_request("nested", 3, 0.8);
    request.evaluation.cascade_depth = Some(9);
    let response = governor.run_attempt(request).await.unwrap();
    assert_eq!(response.extras["reason"], "cascade depth exceeded");
    assert_eq!(response.envelope.breaker_state().cascade_depth, 4);

    let mut shallower = attempt_request("nested", 2, 0.8);
    shallower.evaluation.cascade_depth = Some(1);
    let next = governor.run_attempt(shallower).await.unwrap();
    assert_eq!(next.action, GovernorAction::Halt);
}
