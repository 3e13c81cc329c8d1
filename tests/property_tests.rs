//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use common::{Harness, test_settings};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use sync_queue::{
    ExternalError, ExternalWrite, ItemStatus, Operation, RetryPolicy, SyncQueueItem, TableMapper,
    TableMapping,
};

// =============================================================================
// Backoff Properties
// =============================================================================

fn policy(initial_ms: u64, max_ms: u64, factor: f64) -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::from_millis(max_ms),
        backoff_factor: factor,
        request_timeout: Duration::from_secs(1),
    }
}

proptest! {
    /// Delay never exceeds the configured ceiling, however many attempts
    #[test]
    fn backoff_is_capped(
        initial in 1u64..10_000,
        extra in 0u64..1_000_000,
        factor in 1.0f64..10.0,
        attempt in 0u32..u32::MAX,
    ) {
        let p = policy(initial, initial + extra, factor);
        prop_assert!(p.delay_for_attempt(attempt) <= p.max_delay);
    }

    /// Each further attempt waits at least as long as the previous one
    #[test]
    fn backoff_is_monotonic(
        initial in 1u64..10_000,
        extra in 0u64..1_000_000,
        factor in 1.0f64..10.0,
        attempt in 1u32..200,
    ) {
        let p = policy(initial, initial + extra, factor);
        prop_assert!(p.delay_for_attempt(attempt) <= p.delay_for_attempt(attempt + 1));
    }

    /// The first retry waits exactly the initial delay
    #[test]
    fn backoff_starts_at_initial_delay(initial in 1u64..10_000, extra in 0u64..1_000_000) {
        let p = policy(initial, initial + extra, 2.0);
        let first = p.delay_for_attempt(1);
        let drift = first.max(p.initial_delay) - first.min(p.initial_delay);
        prop_assert!(drift < Duration::from_micros(1), "first retry {:?}", first);
    }

    /// Budget is spent exactly at max_attempts
    #[test]
    fn exhaustion_boundary(max in 1u32..50, attempts in 0u32..100) {
        let p = RetryPolicy { max_attempts: max, ..RetryPolicy::default() };
        prop_assert_eq!(p.is_exhausted(attempts), attempts >= max);
    }
}

// =============================================================================
// Mapper Properties
// =============================================================================

fn listing_mapper() -> TableMapper {
    TableMapper::builder(1)
        .table(
            "listing",
            TableMapping::new("Listing")
                .field("title", "Name")
                .field("price", "Price")
                .field("secret", "Secret")
                .exclude("secret")
                .foreign_key("owner_id", "user"),
        )
        .build()
}

fn item(operation: Operation, payload: Map<String, Value>) -> SyncQueueItem {
    SyncQueueItem {
        sequence: 1,
        batch_id: "b".into(),
        table: "listing".into(),
        record_id: "L1".into(),
        operation,
        payload,
        status: ItemStatus::InFlight,
        attempts: 0,
        last_error: None,
        created_at: 0,
        updated_at: 0,
        processed_at: None,
        next_attempt_at: None,
        parked_on: None,
    }
}

fn arb_payload() -> impl Strategy<Value = Map<String, Value>> {
    let key = prop_oneof![
        Just("title".to_string()),
        Just("price".to_string()),
        Just("secret".to_string()),
        Just("owner_id".to_string()),
        "[a-z_]{1,12}",
    ];
    let value = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        ".{0,20}".prop_map(Value::from),
    ];
    prop::collection::hash_map(key, value, 0..12).prop_map(|m| m.into_iter().collect())
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![Just(Operation::Insert), Just(Operation::Update), Just(Operation::Delete)]
}

proptest! {
    /// Only mapped, non-excluded fields ever reach the external write
    #[test]
    fn translate_emits_only_mapped_fields(payload in arb_payload(), op in arb_operation()) {
        let mapper = listing_mapper();
        let write = mapper.translate(&item(op, payload.clone())).unwrap();

        for (external, value) in &write.fields {
            prop_assert!(external == "Name" || external == "Price", "leaked {}", external);
            let internal = if external == "Name" { "title" } else { "price" };
            prop_assert_eq!(Some(value), payload.get(internal));
        }
        if op == Operation::Delete {
            prop_assert!(write.fields.is_empty());
        }
    }

    /// Filtering at enqueue time is idempotent and never keeps excluded fields
    #[test]
    fn filter_payload_idempotent(payload in arb_payload()) {
        let mapper = listing_mapper();
        let once = mapper.filter_payload("listing", payload);
        let twice = mapper.filter_payload("listing", once.clone());

        prop_assert!(!once.contains_key("secret"));
        prop_assert!(once.keys().all(|k| k == "title" || k == "price" || k == "owner_id"));
        prop_assert_eq!(once, twice);
    }

    /// Idempotency keys are stable and distinguish sequences
    #[test]
    fn idempotency_key_stable(
        seq_a in 1i64..i64::MAX,
        seq_b in 1i64..i64::MAX,
        id in "[a-zA-Z0-9-]{1,24}",
        op in arb_operation(),
    ) {
        let write = |sequence| ExternalWrite {
            sequence,
            entity: "Listing".into(),
            external_id: id.clone(),
            operation: op,
            fields: Map::new(),
        };
        let key = write(seq_a).idempotency_key();
        prop_assert_eq!(&key, &write(seq_a).idempotency_key());
        prop_assert_eq!(key.len(), 64);
        if seq_a != seq_b {
            prop_assert_ne!(key, write(seq_b).idempotency_key());
        }
    }

    /// Status parsing never panics and round-trips known values
    #[test]
    fn status_parse_no_panic(s in ".{0,16}") {
        if let Ok(status) = s.parse::<ItemStatus>() {
            prop_assert_eq!(status.as_str(), s.as_str());
        }
        if let Ok(op) = s.parse::<Operation>() {
            prop_assert_eq!(op.as_str(), s.as_str());
        }
    }

    /// HTTP classification: 5xx and throttling retry, other errors abandon
    #[test]
    fn status_classification(status in 400u16..600) {
        let transient = ExternalError::from_status(status, "x").is_transient();
        let expected = matches!(status, 408 | 425 | 429 | 500..=599);
        prop_assert_eq!(transient, expected);
    }
}

// =============================================================================
// Per-record Ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Whatever the interleaving of records and transient failures, each
    /// record's writes are applied in enqueue order, each exactly once.
    #[test]
    fn per_record_order_survives_failures(
        records in prop::collection::vec(0usize..3, 1..12),
        failures in prop::collection::vec(any::<bool>(), 0..6),
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let mut settings = test_settings();
            settings.retry.max_attempts = 100;
            settings.retry.initial_delay = "1ms".into();
            settings.retry.max_delay = "2ms".into();
            let h = Harness::with_settings(settings).await;

            let errors = failures
                .iter()
                .filter(|fail| **fail)
                .map(|_| ExternalError::Transient("connection reset".into()))
                .collect();
            h.api.fail_next(errors).await;

            let mut expected: HashMap<String, Vec<i64>> = HashMap::new();
            for (i, record) in records.iter().enumerate() {
                let id = format!("L{}", record);
                let seq = h
                    .enqueue("listing", &id, Operation::Update, json!({"price": i}))
                    .await;
                expected.entry(id).or_default().push(seq);
            }

            h.drain_until_settled(200).await;

            let applied: Vec<ExternalWrite> = h.api.calls().await;
            for (id, sequences) in &expected {
                for seq in sequences {
                    assert_eq!(h.status(*seq).await, ItemStatus::Succeeded);
                }
                // Drop the failed deliveries: a retried item appears twice in
                // a row, and the later copy is the applied one.
                let mut order: Vec<i64> = applied
                    .iter()
                    .filter(|w| &w.external_id == id)
                    .map(|w| w.sequence)
                    .collect();
                order.dedup();
                assert_eq!(&order, sequences, "record {} out of order", id);
            }
        });
    }
}
