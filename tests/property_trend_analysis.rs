mod common;

use common::history;
use mender::domain::models::{analyze, merge, ConfidenceComponents, PartialConfidence, TrendSettings};
use mender::{BreakerConfig, BreakerReason, CircuitBreaker};
use proptest::prelude::*;

proptest! {
    /// Property: extending a run of unchanged error counts never lowers stagnation risk
    #[test]
    fn prop_stagnation_risk_is_monotonic(
        prefix in prop::collection::vec(0u32..20, 0..6),
        stalled in 1u32..20,
        run in 1usize..10,
        window in 1usize..6,
        threshold in 1usize..8,
    ) {
        let settings = TrendSettings {
            improvement_window: window,
            stagnation_threshold: threshold,
            ..Default::default()
        };
        let mut errors = prefix;
        errors.push(stalled);

        let mut previous = 0.0;
        for _ in 0..run {
            errors.push(stalled);
            let confidences = vec![0.5; errors.len()];
            let risk = analyze(&history(&errors, &confidences), &settings).stagnation_risk;
            prop_assert!(risk >= previous, "risk dropped from {} to {}", previous, risk);
            prop_assert!((0.0..=1.0).contains(&risk));
            previous = risk;
        }
    }

    /// Property: trend scores always stay within [0, 1]
    #[test]
    fn prop_trend_scores_are_bounded(
        errors in prop::collection::vec(0u32..1000, 0..15),
        window in 1usize..8,
    ) {
        let settings = TrendSettings { improvement_window: window, ..Default::default() };
        let confidences = vec![0.5; errors.len()];
        let trend = analyze(&history(&errors, &confidences), &settings);
        prop_assert!((0.0..=1.0).contains(&trend.velocity_score));
        prop_assert!((0.0..=1.0).contains(&trend.stagnation_risk));
    }

    /// Property: merged confidence components are always clamped into [0, 1]
    #[test]
    fn prop_merge_clamps(
        syntax in -10.0f64..10.0,
        logic in -10.0f64..10.0,
        risk in proptest::option::of(-10.0f64..10.0),
    ) {
        let mut update = PartialConfidence::default().syntax(syntax).logic(logic);
        if let Some(risk) = risk {
            update = update.risk(risk);
        }
        let merged = merge(&update, &ConfidenceComponents::new(0.5, 0.5, 0.5));
        for value in [merged.syntax, merged.logic, merged.risk] {
            prop_assert!((0.0..=1.0).contains(&value));
        }
        if risk.is_none() {
            prop_assert!((merged.risk - 0.5).abs() < f64::EPSILON);
        }
    }

    /// Property: attempt count equals the number of recorded attempts
    #[test]
    fn prop_attempt_count_matches_calls(
        errors in prop::collection::vec(0u32..50, 1..30),
    ) {
        let mut breaker = CircuitBreaker::new(BreakerConfig { max_attempts: 100, ..Default::default() });
        let confidences = vec![0.8; errors.len()];
        for record in history(&errors, &confidences) {
            breaker.record(record).unwrap();
            breaker.can_attempt();
        }
        prop_assert_eq!(breaker.attempt_count() as usize, errors.len());
        prop_assert!(breaker.history().len() <= breaker.config().retained_history());
    }

    /// Property: strictly improving sessions open only when the budget is spent
    #[test]
    fn prop_budget_is_the_only_stop_for_steady_progress(max_attempts in 1u32..15) {
        let mut breaker = CircuitBreaker::new(BreakerConfig { max_attempts, ..Default::default() });
        let errors: Vec<u32> = (0..max_attempts).map(|i| 100 - i).collect();
        let confidences = vec![0.9; errors.len()];
        let records = history(&errors, &confidences);
        let last = records.len() - 1;
        for (i, record) in records.into_iter().enumerate() {
            breaker.record(record).unwrap();
            let decision = breaker.can_attempt();
            if i < last {
                prop_assert!(decision.allowed);
            } else {
                prop_assert!(!decision.allowed);
                prop_assert_eq!(decision.reason, BreakerReason::BudgetExhausted);
            }
        }
    }
}
