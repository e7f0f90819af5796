//! Per-key session: the in-memory owner of a key while its lease is held.
//!
//! A session holds the current validated working copy (frozen behind an
//! [`Arc`]), a dirty flag, the shard-file bookkeeping for the key's record,
//! and the serial queue every mutating operation runs on. Because the
//! queue executes one item at a time and transforms are synchronous, the
//! session's state is consistent between suspension points without any
//! finer-grained locking — the mutex below only guards against readers on
//! other tasks.
//!
//! The save pipeline (shards first, then a conditional record write, then
//! orphan cleanup) is linearized on the queue. The record write re-verifies
//! lease ownership *inside* the data-service mutator, closing the window
//! between "we believed we held the lock" and "the write landed".

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Weak},
    time::Duration,
};

use datakeep_storage::RequestKind;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    error::{StoreError, StoreResult},
    lease::LockLease,
    patch::{apply_patch, create_patch},
    queue::{SerialQueue, TaskHandle},
    record::{FileRef, Record},
    retry::with_data_retry,
    store::StoreShared,
};

/// How long one orphan-cleanup pass will wait for removal budget before
/// giving up and leaving the orphans for a later save.
const ORPHAN_BUDGET_WAIT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for removal budget.
const ORPHAN_BUDGET_POLL: Duration = Duration::from_millis(500);

/// Why a session stopped accepting operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosedReason {
    Unloaded,
    LockLost,
    StoreClosed,
}

impl ClosedReason {
    fn message(self) -> &'static str {
        match self {
            Self::Unloaded => "session was unloaded",
            Self::LockLost => "session lost its lock",
            Self::StoreClosed => "store was closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Active,
    Closed(ClosedReason),
}

/// The mutable heart of a session. Guarded by one mutex; every mutation
/// happens on the session's serial queue.
pub(crate) struct SessionCore {
    pub data: Arc<Value>,
    pub dirty: bool,
    pub applied_migrations: Vec<String>,
    pub user_ids: Option<Vec<i64>>,
    /// Shard ids superseded but not yet confirmed deleted.
    pub orphans: Vec<String>,
    /// The shard file backing `data` in the stored record, when sharded.
    pub file: Option<FileRef>,
    /// Mirror of the stored record's pending transaction marker.
    pub pending_tx: Option<String>,
    pub state: SessionState,
}

pub(crate) struct SessionInner {
    pub key: String,
    pub shared: Arc<StoreShared>,
    pub queue: Arc<SerialQueue>,
    pub lease: LockLease,
    pub core: Mutex<SessionCore>,
    autosave: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to one key's session.
#[derive(Clone)]
pub(crate) struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Constructs an active session from freshly loaded state and starts
    /// its autosave timer.
    ///
    /// The lease's loss observer is wired here: losing the lease closes
    /// the session immediately, before any queued operation gets another
    /// chance to run.
    pub(crate) fn start(
        shared: Arc<StoreShared>,
        key: String,
        lease: LockLease,
        core: SessionCore,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            key,
            queue: Arc::new(SerialQueue::new(shared.config.queue_item_timeout)),
            shared,
            lease,
            core: Mutex::new(core),
            autosave: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let _subscription = inner.lease.on_lost(move || {
            if let Some(inner) = weak.upgrade() {
                close_core(&inner, ClosedReason::LockLost);
            }
        });

        let session = Self { inner };
        session.start_autosave();
        session
    }

    fn start_autosave(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.shared.config.autosave_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = Weak::upgrade(&weak) else {
                    return;
                };
                let (active, dirty) = {
                    let core = inner.core.lock();
                    (core.state == SessionState::Active, core.dirty)
                };
                if !active {
                    return;
                }
                if dirty {
                    tracing::debug!(key = %inner.key, "autosave");
                    let handle = enqueue_save(&inner);
                    if let Err(err) = handle.await {
                        tracing::warn!(key = %inner.key, error = %err, "autosave failed");
                    }
                }
            }
        });
        *self.inner.autosave.lock() = Some(handle);
    }

    /// Returns the current frozen working copy.
    pub(crate) fn get(&self) -> StoreResult<Arc<Value>> {
        let core = self.inner.core.lock();
        match core.state {
            SessionState::Active => Ok(Arc::clone(&core.data)),
            SessionState::Closed(reason) => Err(StoreError::session_closed(reason.message())),
        }
    }

    /// Replaces the working copy after validation and marks the session
    /// dirty.
    pub(crate) fn set_data(&self, value: Value) -> TaskHandle<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.add(move || async move {
            ensure_active(&inner)?;
            inner.shared.validate(&value)?;
            let mut core = inner.core.lock();
            core.data = Arc::new(value);
            core.dirty = true;
            Ok(())
        })
    }

    /// Mutable update path: `transform` receives a deep copy of the
    /// current data and returns whether to commit it.
    pub(crate) fn update<F>(&self, transform: F) -> TaskHandle<bool>
    where
        F: FnOnce(&mut Value) -> bool + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.add(move || async move {
            ensure_active(&inner)?;
            let old = { Arc::clone(&inner.core.lock().data) };

            let mut working = (*old).clone();
            let commit = catch_unwind(AssertUnwindSafe(|| transform(&mut working)))
                .map_err(|_| StoreError::bad_transform("update transform panicked"))?;
            if !commit {
                return Ok(false);
            }

            inner.shared.validate(&working)?;

            // Reconcile through the diff so the committed document differs
            // from the old one exactly where the transform touched it.
            let ops = create_patch(&old, &working);
            let new_doc = apply_patch((*old).clone(), &ops).map_err(|err| {
                StoreError::bad_transform(format!("change reconciliation failed: {err}"))
            })?;
            let new = Arc::new(new_doc);
            {
                let mut core = inner.core.lock();
                core.data = Arc::clone(&new);
                core.dirty = true;
            }
            for callback in &inner.shared.config.change_callbacks {
                callback(&inner.key, &new, &old);
            }
            Ok(true)
        })
    }

    /// Immutable update path: `transform` reads the frozen copy and
    /// returns a replacement, or `None` to abort.
    ///
    /// A replacement structurally equal to the current data is a no-op:
    /// no dirty flag, no change callbacks.
    pub(crate) fn update_immutable<F>(&self, transform: F) -> TaskHandle<bool>
    where
        F: FnOnce(&Value) -> Option<Value> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.add(move || async move {
            ensure_active(&inner)?;
            let old = { Arc::clone(&inner.core.lock().data) };

            let replacement = catch_unwind(AssertUnwindSafe(|| transform(&old)))
                .map_err(|_| StoreError::bad_transform("update transform panicked"))?;
            let Some(new_doc) = replacement else {
                return Ok(false);
            };

            inner.shared.validate(&new_doc)?;
            if new_doc == *old {
                return Ok(true);
            }

            let new = Arc::new(new_doc);
            {
                let mut core = inner.core.lock();
                core.data = Arc::clone(&new);
                core.dirty = true;
            }
            for callback in &inner.shared.config.change_callbacks {
                callback(&inner.key, &new, &old);
            }
            Ok(true)
        })
    }

    /// Flushes pending changes through the save pipeline.
    pub(crate) fn save(&self) -> TaskHandle<()> {
        enqueue_save(&self.inner)
    }

    /// Final save, lease release, and transition to closed.
    ///
    /// Idempotent: unloading a closed session resolves without error. The
    /// lease is released even when the final save fails — a stuck lock is
    /// worse than an unsaved buffer that the caller is told about.
    pub(crate) fn unload(&self) -> TaskHandle<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.add(move || async move {
            if !is_active(&inner) {
                return Ok(());
            }
            let save_result = save_pipeline(&inner).await;
            close_core(&inner, ClosedReason::Unloaded);
            inner.lease.release().await;
            tracing::debug!(key = %inner.key, "session unloaded");
            save_result
        })
    }

    /// Marks the session closed on behalf of a store-wide close, without
    /// saving. Used only after `unload` has already run or been scheduled.
    pub(crate) fn mark_store_closed(&self) {
        close_core(&self.inner, ClosedReason::StoreClosed);
    }

    /// Tears down a session that was never registered: closes it and
    /// releases the lease without saving. Used when a load is cancelled
    /// after the session was constructed.
    pub(crate) async fn abandon(&self) {
        close_core(&self.inner, ClosedReason::Unloaded);
        self.inner.lease.release().await;
    }

    /// The key this session owns.
    pub(crate) fn key(&self) -> &str {
        &self.inner.key
    }

    /// The session's serial queue, for the transaction coordinator's
    /// cross-queue acquisition.
    pub(crate) fn queue(&self) -> Arc<SerialQueue> {
        Arc::clone(&self.inner.queue)
    }
}

fn is_active(inner: &Arc<SessionInner>) -> bool {
    inner.core.lock().state == SessionState::Active
}

fn ensure_active(inner: &Arc<SessionInner>) -> StoreResult<()> {
    match inner.core.lock().state {
        SessionState::Active => Ok(()),
        SessionState::Closed(reason) => Err(StoreError::session_closed(reason.message())),
    }
}

/// Closes the session and stops its autosave timer. Safe to call from any
/// task; repeated calls keep the first reason.
pub(crate) fn close_core(inner: &Arc<SessionInner>, reason: ClosedReason) {
    {
        let mut core = inner.core.lock();
        if core.state != SessionState::Active {
            return;
        }
        core.state = SessionState::Closed(reason);
    }
    if let Some(task) = inner.autosave.lock().take() {
        task.abort();
    }
    tracing::debug!(key = %inner.key, reason = ?reason, "session closed");
}

fn enqueue_save(inner: &Arc<SessionInner>) -> TaskHandle<()> {
    let queue = Arc::clone(&inner.queue);
    let inner = Arc::clone(inner);
    queue.add(move || async move {
        ensure_active(&inner)?;
        save_pipeline(&inner).await
    })
}

/// The save pipeline. Runs only on the session's serial queue.
///
/// 1. Encode the working copy (shards + record payload).
/// 2. Write new shards; on any failure, best-effort remove every shard of
///    the new file and fail the save.
/// 3. Conditionally update the record: the mutator declines when the
///    lease is no longer held, which closes the session with `LockLost`.
///    The update moves the replaced file's shards onto the orphan list in
///    the same write that publishes the new reference.
/// 4. Delete orphans and clear them from the record in a follow-up write.
///    Failures here are logged, never propagated; unresolved orphans ride
///    along to the next save.
pub(crate) async fn save_pipeline(inner: &Arc<SessionInner>) -> StoreResult<()> {
    let shared = &inner.shared;
    let (doc, applied, user_ids, prior_orphans, old_file, pending_tx) = {
        let core = inner.core.lock();
        if !core.dirty {
            return Ok(());
        }
        (
            Arc::clone(&core.data),
            core.applied_migrations.clone(),
            core.user_ids.clone(),
            core.orphans.clone(),
            core.file.clone(),
            core.pending_tx.clone(),
        )
    };

    let encoded = shared.codec.encode(&doc)?;
    write_shards(inner, &encoded.shards, user_ids.as_deref()).await?;

    let mut orphans = prior_orphans;
    if let Some(old) = &old_file {
        orphans.extend(old.shards.iter().cloned());
    }

    let record = Record {
        data: encoded.data,
        applied_migrations: applied,
        pending_tx,
        orphans: orphans.clone(),
        user_ids: user_ids.clone(),
    };
    let committed = write_record_with_lease(shared, &inner.key, &inner.lease, &record).await?;
    if !committed {
        close_core(inner, ClosedReason::LockLost);
        return Err(StoreError::LockLost { key: inner.key.clone() });
    }

    {
        let mut core = inner.core.lock();
        core.dirty = false;
        core.file = encoded.file;
        core.orphans = orphans.clone();
        core.pending_tx = None;
    }
    tracing::debug!(key = %inner.key, sharded = record.shard_ids().len(), "record saved");

    cleanup_orphans(inner, user_ids.as_deref()).await;
    Ok(())
}

/// Writes the shards of a new file, undoing all of them on any failure.
pub(crate) async fn write_shards(
    inner: &Arc<SessionInner>,
    shards: &[(String, Value)],
    user_ids: Option<&[i64]>,
) -> StoreResult<()> {
    let shared = &inner.shared;
    for (shard_id, value) in shards {
        let shard_key = shared.keys.shard(shard_id);
        let write = with_data_retry(&shared.config.data_retry, "put_shard", || {
            shared.data.set(&shard_key, value.clone(), user_ids)
        })
        .await;

        if let Err(err) = write {
            tracing::warn!(
                key = %inner.key,
                shard = %shard_id,
                error = %err,
                "shard write failed, removing partial file",
            );
            for (cleanup_id, _) in shards {
                let cleanup_key = shared.keys.shard(cleanup_id);
                if let Err(cleanup_err) =
                    with_data_retry(&shared.config.data_retry, "remove_partial_shard", || {
                        shared.data.remove(&cleanup_key)
                    })
                    .await
                {
                    tracing::warn!(
                        key = %inner.key,
                        shard = %cleanup_id,
                        error = %cleanup_err,
                        "partial shard removal failed",
                    );
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Writes a record conditionally on lease ownership.
///
/// Returns `Ok(false)` when the mutator declined because the lease is no
/// longer held.
pub(crate) async fn write_record_with_lease(
    shared: &Arc<StoreShared>,
    key: &str,
    lease: &LockLease,
    record: &Record,
) -> StoreResult<bool> {
    let record_value = serde_json::to_value(record).map_err(|err| StoreError::BackendFatal {
        detail: format!("record serialization failed: {err}"),
    })?;
    let record_key = shared.keys.record(key);
    let user_ids = record.user_ids.clone();

    let committed = with_data_retry(&shared.config.data_retry, "update_record", || {
        let data = Arc::clone(&shared.data);
        let record_key = record_key.clone();
        let record_value = record_value.clone();
        let lease = lease.clone();
        let user_ids = user_ids.clone();
        async move {
            let mut mutator = move |_previous: Option<Value>| {
                if lease.is_locked() { Some(record_value.clone()) } else { None }
            };
            data.update(&record_key, &mut mutator, user_ids.as_deref()).await
        }
    })
    .await?;
    Ok(committed.is_some())
}

/// Deletes this session's orphaned shards and clears them from the record.
///
/// Never fails the caller: every error is logged and the affected orphans
/// stay queued for the next pass.
pub(crate) async fn cleanup_orphans(inner: &Arc<SessionInner>, user_ids: Option<&[i64]>) {
    let shared = &inner.shared;
    let orphans = { inner.core.lock().orphans.clone() };
    if orphans.is_empty() {
        return;
    }

    let mut deleted = Vec::new();
    let wait_deadline = tokio::time::Instant::now() + ORPHAN_BUDGET_WAIT;
    for shard_id in &orphans {
        // Orphan deletion is background work; yield to the service's
        // removal budget rather than competing with foreground traffic.
        while shared.data.budget(RequestKind::Remove) <= 0 {
            if tokio::time::Instant::now() >= wait_deadline {
                tracing::warn!(
                    key = %inner.key,
                    pending = orphans.len() - deleted.len(),
                    "orphan cleanup out of budget, deferring",
                );
                clear_deleted_orphans(inner, &deleted, user_ids).await;
                return;
            }
            tokio::time::sleep(ORPHAN_BUDGET_POLL).await;
        }

        let shard_key = shared.keys.shard(shard_id);
        match with_data_retry(&shared.config.data_retry, "remove_orphan", || {
            shared.data.remove(&shard_key)
        })
        .await
        {
            Ok(()) => deleted.push(shard_id.clone()),
            Err(err) => {
                tracing::warn!(
                    key = %inner.key,
                    shard = %shard_id,
                    error = %err,
                    "orphan removal failed, will retry on a later save",
                );
            },
        }
    }

    clear_deleted_orphans(inner, &deleted, user_ids).await;
}

/// Follow-up record write removing confirmed-deleted orphans.
async fn clear_deleted_orphans(
    inner: &Arc<SessionInner>,
    deleted: &[String],
    user_ids: Option<&[i64]>,
) {
    if deleted.is_empty() {
        return;
    }
    let shared = &inner.shared;
    let record_key = shared.keys.record(&inner.key);
    let deleted_set: Vec<String> = deleted.to_vec();

    let outcome = with_data_retry(&shared.config.data_retry, "clear_orphans", || {
        let data = Arc::clone(&shared.data);
        let record_key = record_key.clone();
        let deleted_set = deleted_set.clone();
        let lease = inner.lease.clone();
        let user_ids = user_ids.map(<[i64]>::to_vec);
        async move {
            let mut mutator = move |previous: Option<Value>| {
                if !lease.is_locked() {
                    return None;
                }
                let mut record: Record = serde_json::from_value(previous?).ok()?;
                record.orphans.retain(|id| !deleted_set.contains(id));
                serde_json::to_value(&record).ok()
            };
            data.update(&record_key, &mut mutator, user_ids.as_deref()).await
        }
    })
    .await;

    match outcome {
        Ok(Some(_)) => {
            let mut core = inner.core.lock();
            core.orphans.retain(|id| !deleted.contains(id));
        },
        Ok(None) => {
            tracing::warn!(key = %inner.key, "orphan clear declined, deferring");
        },
        Err(err) => {
            tracing::warn!(
                key = %inner.key,
                error = %err,
                "orphan clear failed, deferring",
            );
        },
    }
}
