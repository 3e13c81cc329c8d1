// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table/field mapper.
//!
//! Static translation from internal entities to the external system's write
//! shape. A mapping lists, per internal table:
//! - the external entity name
//! - `internal field -> external field` renames (fields absent are never replicated)
//! - excluded fields (never replicated even if mapped)
//! - foreign keys (`internal field -> parent table`) used for FK deferral
//!
//! The mapper is versioned alongside schema migrations of either store; bump
//! [`TableMapper::version`] whenever a mapping changes.
//!
//! ```rust
//! use sync_queue::mapper::{TableMapper, TableMapping};
//!
//! let mapper = TableMapper::builder(3)
//!     .table(
//!         "listing",
//!         TableMapping::new("Listing")
//!             .field("title", "Name")
//!             .field("host_id", "Host")
//!             .foreign_key("host_id", "user"),
//!     )
//!     .build();
//! assert!(mapper.contains("listing"));
//! ```

use crate::item::{Operation, RecordKey, SyncQueueItem};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Mapping failures. These are programmer/deployment errors, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("no mapping for table '{0}'")]
    UnmappedTable(String),
}

/// Mapping for one internal table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    pub external_entity: String,
    #[serde(default)]
    pub field_map: BTreeMap<String, String>,
    #[serde(default)]
    pub excluded_fields: BTreeSet<String>,
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, String>,
}

impl TableMapping {
    pub fn new(external_entity: impl Into<String>) -> Self {
        Self {
            external_entity: external_entity.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn field(mut self, internal: impl Into<String>, external: impl Into<String>) -> Self {
        self.field_map.insert(internal.into(), external.into());
        self
    }

    #[must_use]
    pub fn exclude(mut self, internal: impl Into<String>) -> Self {
        self.excluded_fields.insert(internal.into());
        self
    }

    /// Declare `internal` as a reference to a record of `parent_table`.
    #[must_use]
    pub fn foreign_key(mut self, internal: impl Into<String>, parent_table: impl Into<String>) -> Self {
        self.foreign_keys.insert(internal.into(), parent_table.into());
        self
    }

    fn replicates(&self, field: &str) -> bool {
        self.field_map.contains_key(field) && !self.excluded_fields.contains(field)
    }

    /// Fields worth persisting in the queue: replicated ones plus FK fields.
    fn retains(&self, field: &str) -> bool {
        self.replicates(field) || self.foreign_keys.contains_key(field)
    }
}

/// A translated write, ready for the external API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalWrite {
    pub sequence: i64,
    pub entity: String,
    pub external_id: String,
    pub operation: Operation,
    /// External field names. Empty for DELETE.
    pub fields: Map<String, Value>,
}

impl ExternalWrite {
    /// Stable key for duplicate suppression on the external side.
    ///
    /// Hex SHA-256 over entity, id, operation and sequence, so a redelivered
    /// item always carries the same key.
    pub fn idempotency_key(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.entity.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.external_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.operation.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.sequence.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Versioned lookup `table -> TableMapping`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMapper {
    pub version: u32,
    #[serde(default)]
    pub tables: HashMap<String, TableMapping>,
}

impl TableMapper {
    pub fn builder(version: u32) -> TableMapperBuilder {
        TableMapperBuilder {
            mapper: TableMapper {
                version,
                tables: HashMap::new(),
            },
        }
    }

    pub fn get(&self, table: &str) -> Result<&TableMapping, MappingError> {
        self.tables
            .get(table)
            .ok_or_else(|| MappingError::UnmappedTable(table.to_string()))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Drop every field the mapping would not replicate.
    ///
    /// Declared foreign keys are kept so parent references survive into the
    /// queue. Unmapped tables pass through untouched; the processor abandons them.
    pub fn filter_payload(&self, table: &str, payload: Map<String, Value>) -> Map<String, Value> {
        match self.tables.get(table) {
            Some(mapping) => payload
                .into_iter()
                .filter(|(field, _)| mapping.retains(field))
                .collect(),
            None => payload,
        }
    }

    /// Translate a queue item into the external write shape.
    pub fn translate(&self, item: &SyncQueueItem) -> Result<ExternalWrite, MappingError> {
        let mapping = self.get(&item.table)?;

        let fields = match item.operation {
            Operation::Delete => Map::new(),
            Operation::Insert | Operation::Update => item
                .payload
                .iter()
                .filter(|(field, _)| mapping.replicates(field))
                .filter_map(|(field, value)| {
                    mapping
                        .field_map
                        .get(field)
                        .map(|external| (external.clone(), value.clone()))
                })
                .collect(),
        };

        Ok(ExternalWrite {
            sequence: item.sequence,
            entity: mapping.external_entity.clone(),
            external_id: item.record_id.clone(),
            operation: item.operation,
            fields,
        })
    }

    /// Parent records referenced by the item's payload.
    ///
    /// Null and non-scalar FK values are ignored (no parent to wait for).
    pub fn parent_refs(&self, item: &SyncQueueItem) -> Result<Vec<RecordKey>, MappingError> {
        let mapping = self.get(&item.table)?;
        let mut parents = Vec::new();
        for (field, parent_table) in &mapping.foreign_keys {
            let parent_id = match item.payload.get(field) {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => continue,
            };
            let parent = RecordKey::new(parent_table, parent_id);
            // A self-reference cannot be waited on.
            if parent != item.record_key() {
                parents.push(parent);
            }
        }
        Ok(parents)
    }
}

/// Builder for [`TableMapper`].
#[derive(Debug)]
pub struct TableMapperBuilder {
    mapper: TableMapper,
}

impl TableMapperBuilder {
    #[must_use]
    pub fn table(mut self, table: impl Into<String>, mapping: TableMapping) -> Self {
        self.mapper.tables.insert(table.into(), mapping);
        self
    }

    pub fn build(self) -> TableMapper {
        self.mapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemStatus;
    use serde_json::json;

    fn mapper() -> TableMapper {
        TableMapper::builder(1)
            .table(
                "listing",
                TableMapping::new("Listing")
                    .field("title", "Name")
                    .field("price", "Price")
                    .field("host_id", "Host")
                    .field("internal_notes", "Notes")
                    .exclude("internal_notes")
                    .foreign_key("host_id", "user"),
            )
            .table("user", TableMapping::new("User").field("email", "Email"))
            .build()
    }

    fn item(table: &str, op: Operation, payload: Value) -> SyncQueueItem {
        SyncQueueItem {
            sequence: 10,
            batch_id: "b".into(),
            table: table.into(),
            record_id: "L1".into(),
            operation: op,
            payload: payload.as_object().cloned().unwrap_or_default(),
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

    #[test]
    fn test_filter_drops_unmapped_and_excluded() {
        let payload = json!({"title": "Loft", "secret": "x", "internal_notes": "n"});
        let filtered = mapper().filter_payload("listing", payload.as_object().cloned().unwrap());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered["title"], "Loft");
    }

    #[test]
    fn test_filter_keeps_foreign_keys() {
        let m = TableMapper::builder(1)
            .table(
                "proposal",
                TableMapping::new("Proposal")
                    .field("amount", "Amount")
                    .foreign_key("listing_id", "listing"),
            )
            .build();
        let payload = json!({"amount": 5, "listing_id": "L1", "draft": true});
        let filtered = m.filter_payload("proposal", payload.as_object().cloned().unwrap());
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered["listing_id"], "L1");
    }

    #[test]
    fn test_filter_passes_unmapped_table_through() {
        let payload = json!({"anything": 1}).as_object().cloned().unwrap();
        let filtered = mapper().filter_payload("ghost", payload.clone());
        assert_eq!(filtered, payload);
    }

    #[test]
    fn test_translate_renames_fields() {
        let write = mapper()
            .translate(&item("listing", Operation::Insert, json!({"title": "Loft", "price": 120})))
            .unwrap();
        assert_eq!(write.entity, "Listing");
        assert_eq!(write.external_id, "L1");
        assert_eq!(write.fields["Name"], "Loft");
        assert_eq!(write.fields["Price"], 120);
        assert!(!write.fields.contains_key("title"));
    }

    #[test]
    fn test_translate_delete_carries_no_fields() {
        let write = mapper()
            .translate(&item("listing", Operation::Delete, json!({"title": "Loft"})))
            .unwrap();
        assert!(write.fields.is_empty());
        assert_eq!(write.operation, Operation::Delete);
    }

    #[test]
    fn test_translate_unmapped_table() {
        let err = mapper()
            .translate(&item("ghost", Operation::Insert, json!({})))
            .unwrap_err();
        assert_eq!(err, MappingError::UnmappedTable("ghost".into()));
    }

    #[test]
    fn test_parent_refs() {
        let m = mapper();
        let refs = m
            .parent_refs(&item("listing", Operation::Update, json!({"host_id": "U7"})))
            .unwrap();
        assert_eq!(refs, vec![RecordKey::new("user", "U7")]);

        let numeric = m
            .parent_refs(&item("listing", Operation::Update, json!({"host_id": 42})))
            .unwrap();
        assert_eq!(numeric, vec![RecordKey::new("user", "42")]);

        let none = m
            .parent_refs(&item("listing", Operation::Update, json!({"host_id": null})))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_idempotency_key_is_stable_per_item() {
        let m = mapper();
        let a = m.translate(&item("listing", Operation::Update, json!({"title": "A"}))).unwrap();
        let b = m.translate(&item("listing", Operation::Update, json!({"title": "B"}))).unwrap();
        // Same entity/id/op/sequence -> same key regardless of field values
        assert_eq!(a.idempotency_key(), b.idempotency_key());
        assert_eq!(a.idempotency_key().len(), 64);

        let mut c = a.clone();
        c.sequence += 1;
        assert_ne!(a.idempotency_key(), c.idempotency_key());
    }

    #[test]
    fn test_mapper_deserializes_from_json() {
        let json = r#"{
            "version": 4,
            "tables": {
                "proposal": {
                    "external_entity": "Proposal",
                    "field_map": {"amount": "Amount"},
                    "foreign_keys": {"listing_id": "listing"}
                }
            }
        }"#;
        let m: TableMapper = serde_json::from_str(json).unwrap();
        assert_eq!(m.version, 4);
        let mapping = m.get("proposal").unwrap();
        assert_eq!(mapping.external_entity, "Proposal");
        assert!(mapping.excluded_fields.is_empty());
        assert_eq!(mapping.foreign_keys["listing_id"], "listing");
    }
}
