//! Sharded file codec.
//!
//! Large documents do not fit the data service's per-value bound, so they
//! are serialized, split into chunks of at most the configured chunk size,
//! and each chunk is compressed and stored as its own shard under a fresh
//! content-unique file id. Small documents stay inline in the record.
//!
//! Shard values are zstd-compressed chunk bytes, base64-embedded so they
//! remain JSON values to the data service. Decoding fetches all shards
//! concurrently and refuses a record whose shard set is incomplete —
//! a partial set is never reassembled.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use datakeep_storage::DataService;
use serde_json::Value;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::{
    config::RetryPolicy,
    error::{StoreError, StoreResult},
    record::{FileRef, KeySpace, Record, RecordData},
    retry::with_data_retry,
};

/// zstd level for shard payloads. Level 0 is the library default, tuned
/// for the ratio/speed balance these JSON fragments want.
const SHARD_COMPRESSION_LEVEL: i32 = 0;

/// Result of encoding a document for persistence.
pub(crate) struct Encoded {
    /// What goes in the record's `data` field.
    pub data: RecordData,
    /// Shards to write before the record, as `(shard_id, value)` pairs.
    /// Empty for inline payloads.
    pub shards: Vec<(String, Value)>,
    /// The file reference when sharded, for session bookkeeping.
    pub file: Option<FileRef>,
}

/// Splits documents into size-bounded shards and reassembles them.
#[derive(Debug, Clone)]
pub(crate) struct ShardedCodec {
    max_chunk_size: usize,
}

impl ShardedCodec {
    pub(crate) fn new(max_chunk_size: usize) -> Self {
        Self { max_chunk_size }
    }

    /// Encodes a document: inline when its serialized form fits one chunk,
    /// sharded otherwise.
    pub(crate) fn encode(&self, doc: &Value) -> StoreResult<Encoded> {
        let bytes = serde_json::to_vec(doc).map_err(|err| StoreError::BackendFatal {
            detail: format!("document serialization failed: {err}"),
        })?;

        if bytes.len() <= self.max_chunk_size {
            return Ok(Encoded { data: RecordData::Inline(doc.clone()), shards: Vec::new(), file: None });
        }

        let file_id = Uuid::new_v4().to_string();
        let mut shards = Vec::new();
        for (index, chunk) in bytes.chunks(self.max_chunk_size).enumerate() {
            let compressed =
                zstd::encode_all(chunk, SHARD_COMPRESSION_LEVEL).map_err(|err| {
                    StoreError::BackendFatal { detail: format!("shard compression failed: {err}") }
                })?;
            let shard_id = format!("{file_id}-{index}");
            shards.push((shard_id, Value::String(BASE64.encode(compressed))));
        }

        let file = FileRef {
            id: file_id,
            shards: shards.iter().map(|(id, _)| id.clone()).collect(),
            count: shards.len(),
        };
        tracing::debug!(
            file_id = %file.id,
            shard_count = file.count,
            serialized_bytes = bytes.len(),
            "document sharded",
        );
        Ok(Encoded { data: RecordData::File(file.clone()), shards, file: Some(file) })
    }

    /// Decodes a record's payload, fetching shards concurrently when the
    /// payload is sharded.
    ///
    /// # Errors
    ///
    /// [`StoreError::IncompleteShards`] when any referenced shard is
    /// missing or the shard set does not match the reference's count.
    pub(crate) async fn decode(
        &self,
        key: &str,
        record: &Record,
        data_service: &Arc<dyn DataService>,
        keys: &KeySpace,
        policy: &RetryPolicy,
    ) -> StoreResult<Value> {
        let file = match &record.data {
            RecordData::Inline(doc) => return Ok(doc.clone()),
            RecordData::File(file) => file,
        };
        if file.shards.len() != file.count {
            return Err(StoreError::IncompleteShards {
                key: key.to_string(),
                missing: file.count.saturating_sub(file.shards.len()),
                expected: file.count,
            });
        }

        let mut tasks = JoinSet::new();
        for (index, shard_id) in file.shards.iter().enumerate() {
            let service = Arc::clone(data_service);
            let shard_key = keys.shard(shard_id);
            let policy = policy.clone();
            tasks.spawn(async move {
                let value =
                    with_data_retry(&policy, "get_shard", || service.get(&shard_key)).await?;
                Ok::<_, StoreError>((index, value))
            });
        }

        let mut chunks: Vec<Option<Vec<u8>>> = vec![None; file.count];
        let mut missing = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (index, value) = joined.map_err(|err| StoreError::BackendFatal {
                detail: format!("shard fetch task failed: {err}"),
            })??;
            match value {
                Some(value) => chunks[index] = Some(decode_shard_value(&value)?),
                None => missing += 1,
            }
        }
        if missing > 0 {
            return Err(StoreError::IncompleteShards {
                key: key.to_string(),
                missing,
                expected: file.count,
            });
        }

        let mut bytes = Vec::new();
        for chunk in chunks {
            // Every slot is filled: none missing, and each task wrote its
            // own index exactly once.
            match chunk {
                Some(part) => bytes.extend_from_slice(&part),
                None => {
                    return Err(StoreError::BackendFatal {
                        detail: "shard fetch completed with an unfilled slot".to_string(),
                    });
                },
            }
        }

        serde_json::from_slice(&bytes).map_err(|err| StoreError::BackendFatal {
            detail: format!("sharded document deserialization failed: {err}"),
        })
    }
}

/// Reverses the base64 + zstd embedding of one shard value.
fn decode_shard_value(value: &Value) -> StoreResult<Vec<u8>> {
    let text = value.as_str().ok_or_else(|| StoreError::BackendFatal {
        detail: "shard value is not a string".to_string(),
    })?;
    let compressed = BASE64.decode(text).map_err(|err| StoreError::BackendFatal {
        detail: format!("shard base64 decode failed: {err}"),
    })?;
    zstd::decode_all(compressed.as_slice()).map_err(|err| StoreError::BackendFatal {
        detail: format!("shard decompression failed: {err}"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use datakeep_storage::MemoryDataService;
    use serde_json::json;

    use super::*;
    use crate::config::DEFAULT_MAX_CHUNK_SIZE;

    fn service() -> Arc<dyn DataService> {
        Arc::new(MemoryDataService::new())
    }

    fn record(data: RecordData) -> Record {
        Record {
            data,
            applied_migrations: Vec::new(),
            pending_tx: None,
            orphans: Vec::new(),
            user_ids: None,
        }
    }

    #[test]
    fn small_documents_stay_inline() {
        let codec = ShardedCodec::new(DEFAULT_MAX_CHUNK_SIZE);
        let encoded = codec.encode(&json!({"coins": 100})).unwrap();
        assert!(matches!(encoded.data, RecordData::Inline(_)));
        assert!(encoded.shards.is_empty());
        assert!(encoded.file.is_none());
    }

    #[test]
    fn oversized_documents_shard_with_indexed_ids() {
        let codec = ShardedCodec::new(15);
        let encoded = codec.encode(&json!({"blob": "0123456789abcdef0123456789"})).unwrap();
        let file = encoded.file.expect("sharded");
        assert!(file.count >= 3, "expected at least 3 shards, got {}", file.count);
        assert_eq!(file.shards.len(), file.count);
        for (index, shard_id) in file.shards.iter().enumerate() {
            assert_eq!(*shard_id, format!("{}-{index}", file.id));
        }
    }

    #[tokio::test]
    async fn sharded_round_trip() {
        let data_service = service();
        let keys = KeySpace::new("s");
        let codec = ShardedCodec::new(15);
        let doc = json!({"blob": "0123456789abcdef0123456789", "n": 7});

        let encoded = codec.encode(&doc).unwrap();
        for (shard_id, value) in &encoded.shards {
            data_service.set(&keys.shard(shard_id), value.clone(), None).await.unwrap();
        }

        let rec = record(encoded.data);
        let decoded = codec
            .decode("k", &rec, &data_service, &keys, &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(decoded, doc);
    }

    #[tokio::test]
    async fn missing_shard_is_rejected() {
        let data_service = service();
        let keys = KeySpace::new("s");
        let codec = ShardedCodec::new(15);

        let encoded = codec.encode(&json!({"blob": "0123456789abcdef0123456789"})).unwrap();
        // Write all but the last shard.
        for (shard_id, value) in encoded.shards.iter().take(encoded.shards.len() - 1) {
            data_service.set(&keys.shard(shard_id), value.clone(), None).await.unwrap();
        }

        let rec = record(encoded.data);
        let err = codec
            .decode("k", &rec, &data_service, &keys, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IncompleteShards { missing: 1, .. }));
    }

    #[tokio::test]
    async fn count_mismatch_is_rejected_without_fetching() {
        let data_service = service();
        let keys = KeySpace::new("s");
        let codec = ShardedCodec::new(15);

        let rec = record(RecordData::File(FileRef {
            id: "f".to_string(),
            shards: vec!["f-0".to_string()],
            count: 2,
        }));
        let err = codec
            .decode("k", &rec, &data_service, &keys, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IncompleteShards { expected: 2, .. }));
    }

    #[test]
    fn fresh_file_id_per_encode() {
        let codec = ShardedCodec::new(15);
        let doc = json!({"blob": "0123456789abcdef0123456789"});
        let a = codec.encode(&doc).unwrap().file.unwrap();
        let b = codec.encode(&doc).unwrap().file.unwrap();
        assert_ne!(a.id, b.id);
    }
}
