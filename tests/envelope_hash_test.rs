//! Stable envelope hash: determinism, field coverage and storage round trips.

use mender::domain::models::{canonical_json, BreakerView, HASHED_FIELDS, HASH_SCHEMA_VERSION};
use mender::{
    AttemptRecord, BreakerConfig, CircuitBreaker, Envelope, EnvelopeFilter, EnvelopeValidator,
    InMemoryAdapter, MemoryAdapter, PartialConfidence, ResourceUsage,
};
use serde_json::json;

fn build(patch_id: &str) -> Envelope {
    let mut envelope = Envelope::new(
        patch_id,
        json!({"patch_code": "x = 1\n", "language": "python", "nested": {"b": 2, "a": 1}}),
    )
    .unwrap();
    envelope
        .append_attempt(AttemptRecord::new(1, 4, 0, 0.4, ["TypeError"]))
        .unwrap();
    envelope
        .append_attempt(AttemptRecord::new(2, 2, 2, 0.7, ["TypeError", "NameError"]))
        .unwrap();
    envelope
        .merge_confidence(&PartialConfidence::default().syntax(0.9).logic(0.6).risk(0.2))
        .unwrap();
    envelope
}

#[test]
fn test_independently_built_envelopes_hash_equal() {
    let first = build("patch-7");
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = build("patch-7");

    assert_ne!(first.metadata().created_at, second.metadata().created_at);
    assert_eq!(first.hash(), second.hash());
    assert_eq!(first.hash().len(), 64);
    assert!(first.hash().chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_patch_data_key_order_does_not_matter() {
    let a = Envelope::new("p", json!({"a": 1, "b": {"y": true, "x": false}})).unwrap();
    let b = Envelope::new("p", json!({"b": {"x": false, "y": true}, "a": 1})).unwrap();
    assert_eq!(a.hash(), b.hash());
}

#[test]
fn test_every_hashed_field_changes_the_hash() {
    let base = build("patch-7");
    let mutations: Vec<(&str, Box<dyn Fn(&mut Envelope)>)> = vec![
        (
            "patch_data",
            Box::new(|e| e.set_patch_data(json!({"patch_code": "x = 2\n"})).unwrap()),
        ),
        (
            "attempts",
            Box::new(|e| e.append_attempt(AttemptRecord::new(3, 1, 1, 0.8, ["TypeError"])).unwrap()),
        ),
        (
            "confidence_components",
            Box::new(|e| e.merge_confidence(&PartialConfidence::default().logic(0.1)).unwrap()),
        ),
        (
            "breaker_state.phase",
            Box::new(|e| {
                let mut breaker = CircuitBreaker::new(BreakerConfig {
                    max_attempts: 1,
                    ..Default::default()
                });
                breaker.record_attempt(1, 0, 0.5, Vec::<String>::new(), 1).unwrap();
                breaker.can_attempt();
                e.set_breaker_snapshot(BreakerView::from(&breaker)).unwrap();
            }),
        ),
        (
            "breaker_state.cascade_depth",
            Box::new(|e| {
                let mut breaker = CircuitBreaker::new(BreakerConfig::default());
                breaker.enter_cascade();
                e.set_breaker_snapshot(BreakerView::from(&breaker)).unwrap();
            }),
        ),
        ("success", Box::new(Envelope::mark_success)),
        (
            "flagged_for_developer",
            Box::new(|e| e.apply_developer_flag("schema change detected")),
        ),
        (
            "halt_reason",
            Box::new(|e| e.halt("resource quota exceeded: tokens")),
        ),
    ];

    for (field, mutate) in mutations {
        let mut envelope = base.clone();
        mutate(&mut envelope);
        assert_ne!(envelope.hash(), base.hash(), "{field} should be hashed");
        assert!(envelope.verify_integrity(), "{field} mutation must rehash");
    }

    let other_id = build("patch-8");
    assert_ne!(other_id.hash(), base.hash());
}

#[test]
fn test_volatile_fields_do_not_change_the_hash() {
    let base = build("patch-7");
    let mut envelope = base.clone();

    envelope.refresh_timestamp();
    envelope.label("host", "ci-runner-7");
    envelope.merge_resource_usage(&ResourceUsage {
        tokens: 1200,
        wall_time_ms: 350,
        ..Default::default()
    });

    assert_eq!(envelope.hash(), base.hash());
    assert!(envelope.verify_integrity());
}

#[test]
fn test_developer_message_text_is_not_hashed() {
    let mut a = build("patch-7");
    let mut b = build("patch-7");
    a.apply_developer_flag("schema change detected");
    b.apply_developer_flag("authentication change detected");
    assert_eq!(a.hash(), b.hash());
}

#[test]
fn test_hash_survives_json_round_trip() {
    let envelope = build("patch-7");
    let validator = EnvelopeValidator::new().unwrap();

    let raw = serde_json::to_string(&envelope.to_json().unwrap()).unwrap();
    let restored = validator.parse_str(&raw).unwrap();

    assert_eq!(restored.hash(), envelope.hash());
    assert_eq!(restored.compute_hash(), envelope.hash());
    assert_eq!(restored, envelope);
}

#[tokio::test]
async fn test_hash_survives_adapter_storage() {
    let adapter = InMemoryAdapter::new().unwrap();
    let envelope = build("patch-7");
    adapter.store_envelope(&envelope).await.unwrap();

    let stored = adapter
        .query_envelopes(&EnvelopeFilter::for_patch("patch-7"))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].hash(), envelope.hash());
    assert!(stored[0].verify_integrity());
}

#[test]
fn test_hashed_field_list_is_documented() {
    for field in ["patch_id", "patch_data", "success", "flagged_for_developer"] {
        assert!(HASHED_FIELDS.contains(&field));
    }
    assert!(!HASHED_FIELDS.iter().any(|f| f.starts_with("metadata")));
    assert!(!HASHED_FIELDS.contains(&"resource_usage"));
}

/// Digest computed with Python's `json.dumps(sort_keys=True, separators=(",", ":"))`
/// over the same stable view, with integral floats written as integers.
const GOLDEN_HASH: &str = "e2931d186496675ab406bdb703ba46f711dc2054f51b146e771f3535678dcc95";

#[test]
fn test_hash_matches_external_canonical_form() {
    let mut envelope = Envelope::new(
        "golden-1",
        json!({"patch_code": "x = 1", "language": "python"}),
    )
    .unwrap();
    envelope
        .append_attempt(AttemptRecord::new(1, 3, 0, 1.0, ["TypeError"]))
        .unwrap();
    envelope
        .append_attempt(AttemptRecord::new(2, 1, 2, 0.25, Vec::<String>::new()))
        .unwrap();
    envelope
        .merge_confidence(&PartialConfidence::default().syntax(1.0).logic(0.5).risk(0.0))
        .unwrap();

    assert_eq!(HASH_SCHEMA_VERSION, 2);
    assert_eq!(envelope.hash(), GOLDEN_HASH);
}

#[test]
fn test_integral_floats_are_written_without_fraction() {
    assert_eq!(
        canonical_json(&json!({"c": 1.0, "r": 0.0, "x": 1e21})),
        r#"{"c":1,"r":0,"x":1e+21}"#
    );
}
