//! Two-phase transaction coordinator.
//!
//! A transaction takes head-of-queue position on every participant
//! session, snapshots their frozen data, runs the caller's transform, and
//! commits the result through a marker protocol:
//!
//! 1. Each participant's record is rewritten with the new payload and a
//!    shared `pendingTx` id, conditionally on its lease.
//! 2. The marker `tx/<store>/<txId> = "committed"` is written. **This is
//!    the linearization point**: a loader that finds a pending record
//!    consults the marker — present means adopt, absent means roll back.
//! 3. Each participant clears `pendingTx` in a follow-up write and queues
//!    its replaced shards for orphan deletion. Once every participant has
//!    cleared, the marker itself is removed best-effort.
//!
//! A failure before the marker write aborts: records already rewritten are
//! restored to their captured pre-transaction value and the new shards are
//! removed. A crash after the marker write is completed by load-time
//! [`recover_pending`].
//!
//! A single-participant transaction degrades to a straight update and
//! save; no marker is needed because a single record write is already
//! atomic.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    error::{StoreError, StoreResult},
    queue::multi_add,
    record::{Record, RecordData, TX_COMMITTED},
    retry::with_data_retry,
    session::{ClosedReason, Session, SessionState, cleanup_orphans, close_core, save_pipeline, write_shards},
    store::StoreShared,
};

/// The unified transform the coordinator runs: snapshot in, replacement
/// map out (`None` aborts with no writes).
pub(crate) type TxApply = Box<
    dyn FnOnce(&BTreeMap<String, Arc<Value>>) -> StoreResult<Option<BTreeMap<String, Value>>>
        + Send,
>;

/// One participant's phase-1 write, retained for abort and phase 3.
struct PendingWrite {
    session: Session,
    new_data: Arc<Value>,
    new_file: Option<crate::record::FileRef>,
    new_shards: Vec<String>,
    /// The record value the phase-1 write replaced (`None` when the key
    /// had no record yet).
    previous: Option<Value>,
    /// Shards referenced by the replaced record, to orphan in phase 3.
    old_shards: Vec<String>,
}

/// Runs a transaction across `participants`, which the caller supplies
/// sorted by key (a canonical order keeps overlapping transactions
/// deadlock-free).
pub(crate) async fn run_transaction(
    shared: &Arc<StoreShared>,
    participants: Vec<Session>,
    apply: TxApply,
) -> StoreResult<bool> {
    let queues: Vec<_> = participants.iter().map(Session::queue).collect();
    multi_add(&queues, || transaction_body(shared, &participants, apply)).await
}

async fn transaction_body(
    shared: &Arc<StoreShared>,
    participants: &[Session],
    apply: TxApply,
) -> StoreResult<bool> {
    // Snapshot every participant's frozen data.
    let mut snapshot = BTreeMap::new();
    for session in participants {
        let data = session.get()?;
        snapshot.insert(session.inner.key.clone(), data);
    }

    let Some(replacement) = apply(&snapshot)? else {
        return Ok(false);
    };

    if replacement.len() != snapshot.len()
        || !replacement.keys().eq(snapshot.keys())
    {
        return Err(StoreError::TxKeysModified);
    }
    for value in replacement.values() {
        shared.validate(value)?;
    }

    // One participant: a single record write is already atomic.
    if participants.len() == 1 {
        let session = &participants[0];
        let (_, value) = replacement.into_iter().next().unwrap_or_default();
        {
            let mut core = session.inner.core.lock();
            core.data = Arc::new(value);
            core.dirty = true;
        }
        save_pipeline(&session.inner).await?;
        return Ok(true);
    }

    let tx_id = Uuid::new_v4().to_string();
    tracing::debug!(tx_id = %tx_id, participants = participants.len(), "transaction begins");

    // Phase 1: pending writes.
    let mut written: Vec<PendingWrite> = Vec::with_capacity(participants.len());
    for session in participants {
        let key = session.inner.key.clone();
        let new_value = replacement
            .get(&key)
            .cloned()
            .unwrap_or(Value::Null);

        match write_pending(shared, session, &tx_id, new_value).await {
            Ok(pending) => written.push(pending),
            Err(err) => {
                tracing::warn!(tx_id = %tx_id, key = %key, error = %err, "transaction aborting");
                abort(shared, &written).await;
                return Err(err);
            },
        }
    }

    // Phase 2: the marker write is the linearization point.
    let marker_key = shared.keys.tx_marker(&tx_id);
    let marker = with_data_retry(&shared.config.data_retry, "write_tx_marker", || {
        shared.data.set(&marker_key, json!(TX_COMMITTED), None)
    })
    .await;
    if let Err(err) = marker {
        tracing::warn!(tx_id = %tx_id, error = %err, "marker write failed, transaction aborting");
        abort(shared, &written).await;
        return Err(err);
    }
    tracing::debug!(tx_id = %tx_id, "transaction committed");

    // Phase 3: clear pending markers and adopt in memory.
    let mut all_cleared = true;
    for pending in &written {
        if !clear_pending(shared, pending, &tx_id).await {
            all_cleared = false;
        }
    }

    // The marker only matters while some record still points at it.
    if all_cleared {
        let marker_key = shared.keys.tx_marker(&tx_id);
        if let Err(err) = with_data_retry(&shared.config.data_retry, "remove_tx_marker", || {
            shared.data.remove(&marker_key)
        })
        .await
        {
            tracing::debug!(tx_id = %tx_id, error = %err, "marker removal deferred");
        }
    }

    for pending in &written {
        cleanup_orphans(&pending.session.inner, None).await;
    }
    Ok(true)
}

/// Phase 1 for one participant: shards, then the pending record write,
/// capturing the replaced record for abort.
async fn write_pending(
    shared: &Arc<StoreShared>,
    session: &Session,
    tx_id: &str,
    new_value: Value,
) -> StoreResult<PendingWrite> {
    let (applied, user_ids, orphans, old_file) = {
        let core = session.inner.core.lock();
        match core.state {
            SessionState::Active => {},
            SessionState::Closed(_) => {
                return Err(StoreError::session_closed("participant closed mid-transaction"));
            },
        }
        (
            core.applied_migrations.clone(),
            core.user_ids.clone(),
            core.orphans.clone(),
            core.file.clone(),
        )
    };

    let encoded = shared.codec.encode(&new_value)?;
    write_shards(&session.inner, &encoded.shards, user_ids.as_deref()).await?;

    let record = Record {
        data: encoded.data,
        applied_migrations: applied,
        pending_tx: Some(tx_id.to_string()),
        orphans,
        user_ids: user_ids.clone(),
    };
    let record_value = serde_json::to_value(&record).map_err(|err| StoreError::BackendFatal {
        detail: format!("record serialization failed: {err}"),
    })?;
    let record_key = shared.keys.record(&session.inner.key);

    // Capture what the write replaces so an abort can put it back.
    let previous: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let committed = with_data_retry(&shared.config.data_retry, "write_pending_record", || {
        let data = Arc::clone(&shared.data);
        let record_key = record_key.clone();
        let record_value = record_value.clone();
        let lease = session.inner.lease.clone();
        let previous = Arc::clone(&previous);
        let user_ids = user_ids.clone();
        async move {
            let mut mutator = move |prev: Option<Value>| {
                if !lease.is_locked() {
                    return None;
                }
                *previous.lock() = prev;
                Some(record_value.clone())
            };
            data.update(&record_key, &mut mutator, user_ids.as_deref()).await
        }
    })
    .await?;

    if committed.is_none() {
        close_core(&session.inner, ClosedReason::LockLost);
        return Err(StoreError::LockLost { key: session.inner.key.clone() });
    }

    Ok(PendingWrite {
        session: session.clone(),
        new_data: Arc::new(new_value),
        new_shards: encoded.shards.iter().map(|(id, _)| id.clone()).collect(),
        new_file: encoded.file,
        previous: previous.lock().take(),
        old_shards: old_file.map(|f| f.shards).unwrap_or_default(),
    })
}

/// Restores every phase-1 write and removes the transaction's shards.
///
/// Best-effort: a participant whose restore fails is left with its
/// pending marker and no committed marker, which load-time recovery rolls
/// back through the version history.
async fn abort(shared: &Arc<StoreShared>, written: &[PendingWrite]) {
    for pending in written {
        let record_key = shared.keys.record(&pending.session.inner.key);
        let restore = match &pending.previous {
            Some(previous) => {
                let previous = previous.clone();
                with_data_retry(&shared.config.data_retry, "restore_record", || {
                    let data = Arc::clone(&shared.data);
                    let record_key = record_key.clone();
                    let previous = previous.clone();
                    async move {
                        let mut mutator = move |_: Option<Value>| Some(previous.clone());
                        data.update(&record_key, &mut mutator, None).await.map(|_| ())
                    }
                })
                .await
            },
            None => {
                with_data_retry(&shared.config.data_retry, "remove_pending_record", || {
                    shared.data.remove(&record_key)
                })
                .await
            },
        };
        if let Err(err) = restore {
            tracing::warn!(
                key = %pending.session.inner.key,
                error = %err,
                "transaction abort could not restore the record; load recovery will",
            );
        }

        for shard_id in &pending.new_shards {
            let shard_key = shared.keys.shard(shard_id);
            if let Err(err) = with_data_retry(&shared.config.data_retry, "remove_tx_shard", || {
                shared.data.remove(&shard_key)
            })
            .await
            {
                tracing::warn!(shard = %shard_id, error = %err, "transaction shard removal failed");
            }
        }
    }
}

/// Phase 3 for one participant: clear `pendingTx`, queue replaced shards
/// as orphans, and adopt the new value in memory.
///
/// Returns whether the stored record was cleared.
async fn clear_pending(shared: &Arc<StoreShared>, pending: &PendingWrite, tx_id: &str) -> bool {
    let session = &pending.session;
    let record_key = shared.keys.record(&session.inner.key);
    let old_shards = pending.old_shards.clone();

    let outcome = with_data_retry(&shared.config.data_retry, "clear_pending_tx", || {
        let data = Arc::clone(&shared.data);
        let record_key = record_key.clone();
        let old_shards = old_shards.clone();
        let lease = session.inner.lease.clone();
        let tx_id = tx_id.to_string();
        async move {
            let mut mutator = move |prev: Option<Value>| {
                if !lease.is_locked() {
                    return None;
                }
                let mut record: Record = serde_json::from_value(prev?).ok()?;
                if record.pending_tx.as_deref() != Some(tx_id.as_str()) {
                    return None;
                }
                record.pending_tx = None;
                record.orphans.extend(old_shards.iter().cloned());
                serde_json::to_value(&record).ok()
            };
            data.update(&record_key, &mut mutator, None).await
        }
    })
    .await;

    let cleared = matches!(outcome, Ok(Some(_)));
    if !cleared {
        tracing::warn!(
            key = %session.inner.key,
            tx_id = %tx_id,
            "pending marker not cleared; load recovery will adopt",
        );
    }

    // Adopt in memory either way: the marker is durable, so the committed
    // values are authoritative.
    let mut orphans = {
        let core = session.inner.core.lock();
        core.orphans.clone()
    };
    orphans.extend(pending.old_shards.iter().cloned());
    {
        let mut core = session.inner.core.lock();
        core.data = Arc::clone(&pending.new_data);
        core.dirty = false;
        core.file = pending.new_file.clone();
        core.orphans = orphans;
        core.pending_tx = None;
    }
    cleared
}

/// Load-time recovery for a record carrying a pending transaction.
///
/// Returns the authoritative record plus whether the caller must write it
/// back (it must whenever the stored record and the returned one differ).
///
/// - Marker present and committed: the record is adopted as written, with
///   `pendingTx` cleared.
/// - Marker absent: the newest version not tagged with this transaction
///   is restored; the abandoned write's shards become orphans.
///
/// # Errors
///
/// [`StoreError::TxRecoveryFailed`] when rollback is required but no
/// untagged prior version can be found.
pub(crate) async fn recover_pending(
    shared: &Arc<StoreShared>,
    key: &str,
    record: Record,
) -> StoreResult<(Record, bool)> {
    let Some(tx_id) = record.pending_tx.clone() else {
        return Ok((record, false));
    };

    let marker_key = shared.keys.tx_marker(&tx_id);
    let marker = with_data_retry(&shared.config.data_retry, "read_tx_marker", || {
        shared.data.get(&marker_key)
    })
    .await?;

    if marker.as_ref().and_then(Value::as_str) == Some(TX_COMMITTED) {
        tracing::info!(key = %key, tx_id = %tx_id, "adopting committed transaction");
        let mut adopted = record;
        adopted.pending_tx = None;
        return Ok((adopted, true));
    }

    tracing::info!(key = %key, tx_id = %tx_id, "rolling back uncommitted transaction");
    let record_key = shared.keys.record(key);
    let mut cursor = None;
    loop {
        let page = with_data_retry(&shared.config.data_retry, "list_record_versions", || {
            shared.data.list_versions(
                &record_key,
                datakeep_storage::VersionQuery { limit: Some(16), cursor: cursor.clone() },
            )
        })
        .await?;

        if page.versions.is_empty() {
            return Err(StoreError::TxRecoveryFailed {
                key: key.to_string(),
                reason: "no prior version without the pending transaction".to_string(),
            });
        }

        for info in &page.versions {
            let version = with_data_retry(&shared.config.data_retry, "read_record_version", || {
                shared.data.get_version(&record_key, &info.id)
            })
            .await?;
            let Some(value) = version else { continue };
            let Ok(prior) = serde_json::from_value::<Record>(value) else { continue };
            if prior.pending_tx.as_deref() == Some(tx_id.as_str()) {
                continue;
            }

            let mut restored = prior;
            restored.pending_tx = None;
            // The abandoned write's shards are unreferenced once the prior
            // record is restored.
            let kept: Vec<&String> = restored.shard_ids().iter().collect();
            let abandoned: Vec<String> = match &record.data {
                RecordData::File(file) => file
                    .shards
                    .iter()
                    .filter(|id| !kept.contains(id))
                    .cloned()
                    .collect(),
                RecordData::Inline(_) => Vec::new(),
            };
            restored.orphans.extend(abandoned);
            return Ok((restored, true));
        }

        match page.cursor {
            Some(next) => cursor = Some(next),
            None => {
                return Err(StoreError::TxRecoveryFailed {
                    key: key.to_string(),
                    reason: "version history exhausted without an untagged version".to_string(),
                });
            },
        }
    }
}
