//! Persisted record layout and key-path scheme.
//!
//! One [`Record`] is stored per key under `records/<store>/<key>`. Its
//! `data` field is either the inline payload or a [`FileRef`] pointing at
//! size-bounded shards stored under `shards/<store>/<fileId>-<index>`.
//! Transaction markers live under `tx/<store>/<txId>` and lease entries
//! under `locks/<store>/<key>`; [`KeySpace`] centralizes the scheme so no
//! path is assembled anywhere else.
//!
//! The serialized field names (`data`, `appliedMigrations`, `pendingTx`,
//! `orphans`, `userIds`) are wire-stable; changing them strands existing
//! records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker value written under `tx/<store>/<txId>` at a transaction's
/// linearization point.
pub(crate) const TX_COMMITTED: &str = "committed";

/// Reference to a payload stored as shards.
///
/// `count` is carried redundantly with `shards.len()` so a reader can
/// verify the reference is complete before trusting it; a record whose
/// shard set does not match its count is never considered valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRef {
    /// Content-unique file identifier; fresh per encode.
    pub id: String,
    /// Shard ids, in index order: `<id>-0 … <id>-(count-1)`.
    pub shards: Vec<String>,
    /// Number of shards the payload was split into.
    pub count: usize,
}

/// A record's payload: inline for small documents, sharded above the
/// chunk-size bound.
///
/// Discriminated by shape on the wire: a file reference is exactly
/// `{id, shards, count}` and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordData {
    /// Payload stored as shards; see [`FileRef`].
    File(FileRef),
    /// Payload stored inline in the record.
    Inline(Value),
}

/// The durable top-level per-key object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Inline payload or file reference.
    pub data: RecordData,
    /// Names of migrations already applied, in application order.
    #[serde(default)]
    pub applied_migrations: Vec<String>,
    /// Identifier of the transaction this record is participating in, when
    /// one is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tx: Option<String>,
    /// Shard ids superseded by this record and awaiting deletion. May list
    /// shards already deleted; never omits a shard known to be
    /// unreferenced.
    #[serde(default)]
    pub orphans: Vec<String>,
    /// User identifiers associated with the key, forwarded to the data
    /// service for its compliance tagging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<i64>>,
}

impl Record {
    /// Returns the shard ids the current payload references, if sharded.
    #[must_use]
    pub fn shard_ids(&self) -> &[String] {
        match &self.data {
            RecordData::File(file) => &file.shards,
            RecordData::Inline(_) => &[],
        }
    }
}

/// Key-path scheme for one named store.
#[derive(Debug, Clone)]
pub(crate) struct KeySpace {
    name: String,
}

impl KeySpace {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// `records/<store>/<key>`
    pub(crate) fn record(&self, key: &str) -> String {
        format!("records/{}/{}", self.name, key)
    }

    /// `shards/<store>/<shardId>`
    pub(crate) fn shard(&self, shard_id: &str) -> String {
        format!("shards/{}/{}", self.name, shard_id)
    }

    /// `tx/<store>/<txId>`
    pub(crate) fn tx_marker(&self, tx_id: &str) -> String {
        format!("tx/{}/{}", self.name, tx_id)
    }

    /// `locks/<store>/<key>`
    pub(crate) fn lock(&self, key: &str) -> String {
        format!("locks/{}/{}", self.name, key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_round_trips_with_wire_field_names() {
        let record = Record {
            data: RecordData::Inline(json!({"coins": 5})),
            applied_migrations: vec!["v1".to_string()],
            pending_tx: Some("tx-1".to_string()),
            orphans: vec!["abc-0".to_string()],
            user_ids: Some(vec![42]),
        };

        let wire = serde_json::to_value(&record).unwrap();
        assert_eq!(wire["data"], json!({"coins": 5}));
        assert_eq!(wire["appliedMigrations"], json!(["v1"]));
        assert_eq!(wire["pendingTx"], json!("tx-1"));
        assert_eq!(wire["orphans"], json!(["abc-0"]));
        assert_eq!(wire["userIds"], json!([42]));

        let back: Record = serde_json::from_value(wire).unwrap();
        assert_eq!(back.data, record.data);
        assert_eq!(back.pending_tx, record.pending_tx);
    }

    #[test]
    fn absent_optional_fields_default() {
        let wire = json!({"data": {"coins": 1}});
        let record: Record = serde_json::from_value(wire).unwrap();
        assert!(record.applied_migrations.is_empty());
        assert!(record.pending_tx.is_none());
        assert!(record.orphans.is_empty());
        assert!(record.user_ids.is_none());
    }

    #[test]
    fn file_reference_is_shape_discriminated() {
        let wire = json!({
            "data": {"id": "f1", "shards": ["f1-0", "f1-1"], "count": 2},
        });
        let record: Record = serde_json::from_value(wire).unwrap();
        assert!(matches!(record.data, RecordData::File(ref f) if f.count == 2));

        // An inline object with extra fields is not mistaken for a file
        // reference.
        let wire = json!({
            "data": {"id": "f1", "shards": [], "count": 0, "extra": true},
        });
        let record: Record = serde_json::from_value(wire).unwrap();
        assert!(matches!(record.data, RecordData::Inline(_)));
    }

    #[test]
    fn key_space_paths() {
        let keys = KeySpace::new("players");
        assert_eq!(keys.record("p1"), "records/players/p1");
        assert_eq!(keys.shard("abc-0"), "shards/players/abc-0");
        assert_eq!(keys.tx_marker("t9"), "tx/players/t9");
        assert_eq!(keys.lock("p1"), "locks/players/p1");
    }
}
