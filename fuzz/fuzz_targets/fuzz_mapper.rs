//! Fuzz target for payload filtering and translation.
//!
//! Arbitrary JSON must never panic the mapper, and excluded fields must
//! never appear in a translated write.

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use sync_queue::{ItemStatus, Operation, SyncQueueItem, TableMapper, TableMapping};

fuzz_target!(|data: (u8, &[u8])| {
    let (op, bytes) = data;
    let Ok(Value::Object(payload)) = serde_json::from_slice::<Value>(bytes) else {
        return;
    };

    let mapper = TableMapper::builder(1)
        .table(
            "proposal",
            TableMapping::new("Proposal")
                .field("amount", "Amount")
                .field("listing_id", "Listing")
                .field("notes", "Notes")
                .exclude("notes")
                .foreign_key("listing_id", "listing"),
        )
        .build();

    let operation = match op % 3 {
        0 => Operation::Insert,
        1 => Operation::Update,
        _ => Operation::Delete,
    };

    let filtered = mapper.filter_payload("proposal", payload);
    assert!(!filtered.contains_key("notes"));

    let item = SyncQueueItem {
        sequence: 1,
        batch_id: String::new(),
        table: "proposal".into(),
        record_id: "P1".into(),
        operation,
        payload: filtered,
        status: ItemStatus::Pending,
        attempts: 0,
        last_error: None,
        created_at: 0,
        updated_at: 0,
        processed_at: None,
        next_attempt_at: None,
        parked_on: None,
    };

    let write = mapper.translate(&item).expect("table is mapped");
    assert!(!write.fields.contains_key("Notes"));
    assert!(write.fields.keys().all(|k| k == "Amount" || k == "Listing"));
    let _ = write.idempotency_key();

    for parent in mapper.parent_refs(&item).expect("table is mapped") {
        assert_eq!(parent.table, "listing");
        assert!(!parent.record_id.is_empty());
    }
});
