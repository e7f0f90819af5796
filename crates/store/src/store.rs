//! The store: lifecycle of sessions keyed by string.
//!
//! A [`Store`] owns at most one [`Session`](crate::session::Session) per
//! key. `load` acquires the key's lease, reads and migrates the record,
//! and registers the session; `unload` drains the session with a final
//! save and releases the lease; `close` does that for every session at
//! once and rejects everything afterwards. The single-key operations
//! (`get`, `update`, `save`, …) delegate to the loaded session, and the
//! multi-key `tx` operations hand off to the transaction coordinator.
//!
//! `peek` is the one read that bypasses sessions entirely: it fetches the
//! record without the lease, migrates in memory only, and never writes
//! anything back.

use std::{
    collections::{BTreeMap, HashMap},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use datakeep_storage::{CoordinationMap, DataService, VersionPage, VersionQuery};
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    codec::ShardedCodec,
    config::StoreConfig,
    error::{StoreError, StoreResult},
    lease::{self, LeaseSettings, LockLease},
    migration::Migrated,
    queue::TaskHandle,
    record::{KeySpace, Record, RecordData},
    retry::{CancelHandle, with_data_retry},
    session::{Session, SessionCore, SessionState, write_record_with_lease},
    tx::{self, TxApply},
};

/// State shared by the store, its sessions, and the transaction
/// coordinator.
pub(crate) struct StoreShared {
    pub config: StoreConfig,
    pub data: Arc<dyn DataService>,
    pub map: Arc<dyn CoordinationMap>,
    pub keys: KeySpace,
    pub codec: ShardedCodec,
    pub closed: AtomicBool,
}

impl StoreShared {
    /// Applies the configured schema check, if any.
    pub(crate) fn validate(&self, doc: &Value) -> StoreResult<()> {
        match &self.config.schema_check {
            Some(check) => check(doc).map_err(StoreError::schema_invalid),
            None => Ok(()),
        }
    }

    pub(crate) fn lease_settings(&self) -> LeaseSettings {
        LeaseSettings {
            ttl: self.config.lock_ttl,
            refresh_interval: self.config.lock_refresh_interval,
            acquire_timeout: self.config.lock_acquire_timeout,
            retry: self.config.map_retry.clone(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<String, Session>,
    /// Cancel handles for in-flight loads, keyed by key.
    loads: HashMap<String, CancelHandle>,
}

/// A durable, session-locked, transactional key/value store.
///
/// Cheaply cloneable; all clones share the same sessions.
///
/// # Example
///
/// ```
/// use datakeep_store::{Store, StoreConfig};
/// use datakeep_storage::{MemoryCoordinationMap, MemoryDataService};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let config = StoreConfig::builder("players")
///     .template(json!({"coins": 0, "inventory": []}))
///     .build()
///     .unwrap();
/// let store = Store::new(
///     config,
///     Arc::new(MemoryDataService::new()),
///     Arc::new(MemoryCoordinationMap::new()),
/// );
///
/// store.load("p1", None).await.unwrap();
/// store
///     .update("p1", |data| {
///         data["coins"] = json!(100);
///         true
///     })
///     .await
///     .unwrap();
/// assert_eq!(store.get("p1").unwrap()["coins"], json!(100));
/// store.unload("p1").await.unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
    state: Arc<Mutex<StoreState>>,
}

impl Store {
    /// Creates a store over the given backing services.
    #[must_use]
    pub fn new(
        config: StoreConfig,
        data: Arc<dyn DataService>,
        map: Arc<dyn CoordinationMap>,
    ) -> Self {
        let keys = KeySpace::new(config.name.clone());
        let codec = ShardedCodec::new(config.max_chunk_size);
        Self {
            shared: Arc::new(StoreShared {
                config,
                data,
                map,
                keys,
                codec,
                closed: AtomicBool::new(false),
            }),
            state: Arc::new(Mutex::new(StoreState::default())),
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StoreError::StoreClosed);
        }
        Ok(())
    }

    fn session(&self, key: &str) -> StoreResult<Session> {
        self.ensure_open()?;
        self.state
            .lock()
            .sessions
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::key_not_loaded(key))
    }

    /// Returns `true` when a session is registered for `key`.
    #[must_use]
    pub fn is_loaded(&self, key: &str) -> bool {
        self.state.lock().sessions.contains_key(key)
    }

    /// Returns the keys with registered sessions.
    #[must_use]
    pub fn loaded_keys(&self) -> Vec<String> {
        self.state.lock().sessions.keys().cloned().collect()
    }

    /// Loads a key: acquires its lease, reads and migrates its record, and
    /// registers a session.
    ///
    /// Resolves immediately when the key is already loaded. Fails with
    /// [`StoreError::LoadInProgress`] when another load for the same key is
    /// in flight, and with [`StoreError::LoadCancelled`] when a concurrent
    /// `unload` or `close` cancels this one.
    pub async fn load(&self, key: &str, user_ids: Option<Vec<i64>>) -> StoreResult<()> {
        self.ensure_open()?;
        let cancel = {
            let mut state = self.state.lock();
            if state.sessions.contains_key(key) {
                return Ok(());
            }
            if state.loads.contains_key(key) {
                return Err(StoreError::LoadInProgress { key: key.to_string() });
            }
            let cancel = CancelHandle::new();
            state.loads.insert(key.to_string(), cancel.clone());
            cancel
        };

        let result = do_load(
            Arc::clone(&self.shared),
            key.to_string(),
            user_ids,
            cancel.clone(),
        )
        .await;

        match result {
            Ok(session) => {
                let registered = {
                    let mut state = self.state.lock();
                    state.loads.remove(key);
                    if cancel.is_cancelled() || self.shared.closed.load(Ordering::Acquire) {
                        false
                    } else {
                        state.sessions.insert(key.to_string(), session.clone());
                        true
                    }
                };
                if registered {
                    tracing::debug!(key = %key, "key loaded");
                    Ok(())
                } else {
                    session.abandon().await;
                    Err(StoreError::LoadCancelled)
                }
            },
            Err(err) => {
                self.state.lock().loads.remove(key);
                Err(err)
            },
        }
    }

    /// Unloads a key: final save, lease release, session removal.
    ///
    /// Idempotent — unloading an unknown key resolves without error.
    /// Unloading a key whose load is still in flight cancels the load.
    pub async fn unload(&self, key: &str) -> StoreResult<()> {
        let session = {
            let state = self.state.lock();
            if let Some(load_cancel) = state.loads.get(key) {
                load_cancel.cancel();
                return Ok(());
            }
            state.sessions.get(key).cloned()
        };
        let Some(session) = session else {
            return Ok(());
        };

        let result = session.unload().await;
        self.state.lock().sessions.remove(key);
        result
    }

    /// Returns the current frozen working copy for a loaded key.
    pub fn get(&self, key: &str) -> StoreResult<Arc<Value>> {
        self.session(key)?.get()
    }

    /// Replaces a loaded key's working copy after validation.
    pub fn set(&self, key: &str, value: Value) -> TaskHandle<()> {
        match self.session(key) {
            Ok(session) => session.set_data(value),
            Err(err) => TaskHandle::ready(Err(err)),
        }
    }

    /// Mutable update: `transform` receives a deep copy of the current
    /// data and returns whether to commit. Operations on one key apply in
    /// call order.
    pub fn update<F>(&self, key: &str, transform: F) -> TaskHandle<bool>
    where
        F: FnOnce(&mut Value) -> bool + Send + 'static,
    {
        match self.session(key) {
            Ok(session) => session.update(transform),
            Err(err) => TaskHandle::ready(Err(err)),
        }
    }

    /// Immutable update: `transform` reads the frozen copy and returns a
    /// replacement, or `None` to abort.
    pub fn update_immutable<F>(&self, key: &str, transform: F) -> TaskHandle<bool>
    where
        F: FnOnce(&Value) -> Option<Value> + Send + 'static,
    {
        match self.session(key) {
            Ok(session) => session.update_immutable(transform),
            Err(err) => TaskHandle::ready(Err(err)),
        }
    }

    /// Flushes a loaded key's pending changes.
    pub fn save(&self, key: &str) -> TaskHandle<()> {
        match self.session(key) {
            Ok(session) => session.save(),
            Err(err) => TaskHandle::ready(Err(err)),
        }
    }

    /// Atomic multi-key transaction over loaded keys.
    ///
    /// `transform` receives a map of deep copies of every participant's
    /// data and returns whether to commit. Duplicate keys are coalesced.
    /// Either every participant's record reflects the new values after a
    /// subsequent load, or none does.
    pub async fn tx<F>(&self, keys: &[&str], transform: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> bool + Send + 'static,
    {
        let apply: TxApply = Box::new(move |snapshot| {
            let mut working: BTreeMap<String, Value> =
                snapshot.iter().map(|(k, v)| (k.clone(), (**v).clone())).collect();
            let commit = catch_unwind(AssertUnwindSafe(|| transform(&mut working)))
                .map_err(|_| StoreError::bad_transform("transaction transform panicked"))?;
            Ok(commit.then_some(working))
        });
        self.run_tx(keys, apply).await
    }

    /// Immutable variant of [`tx`](Store::tx): `transform` reads the
    /// frozen snapshots and returns the replacement map, or `None` to
    /// abort.
    pub async fn tx_immutable<F>(&self, keys: &[&str], transform: F) -> StoreResult<bool>
    where
        F: FnOnce(&BTreeMap<String, Arc<Value>>) -> Option<BTreeMap<String, Value>>
            + Send
            + 'static,
    {
        let apply: TxApply = Box::new(move |snapshot| {
            catch_unwind(AssertUnwindSafe(|| transform(snapshot)))
                .map_err(|_| StoreError::bad_transform("transaction transform panicked"))
        });
        self.run_tx(keys, apply).await
    }

    async fn run_tx(&self, keys: &[&str], apply: TxApply) -> StoreResult<bool> {
        self.ensure_open()?;

        // Canonical participant order keeps overlapping transactions from
        // deadlocking during cross-queue acquisition.
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut participants = Vec::with_capacity(sorted.len());
        for key in sorted {
            participants.push(self.session(key)?);
        }
        tx::run_transaction(&self.shared, participants, apply).await
    }

    /// Closes the store: cancels in-flight loads, unloads every session
    /// concurrently, and rejects all subsequent operations.
    pub async fn close(&self) -> StoreResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(store = %self.shared.config.name, "store closing");

        let (loads, sessions) = {
            let state = self.state.lock();
            (
                state.loads.values().cloned().collect::<Vec<_>>(),
                state.sessions.values().cloned().collect::<Vec<_>>(),
            )
        };
        for cancel in loads {
            cancel.cancel();
        }

        let mut unloads = tokio::task::JoinSet::new();
        for session in sessions {
            unloads.spawn(async move {
                let key = session.key().to_string();
                let result = session.unload().await;
                session.mark_store_closed();
                (key, result)
            });
        }
        let mut first_error = None;
        while let Some(joined) = unloads.join_next().await {
            match joined {
                Ok((key, Ok(()))) => {
                    self.state.lock().sessions.remove(&key);
                },
                Ok((key, Err(err))) => {
                    tracing::warn!(key = %key, error = %err, "unload during close failed");
                    self.state.lock().sessions.remove(&key);
                    first_error.get_or_insert(err);
                },
                Err(join_err) => {
                    tracing::error!(error = %join_err, "unload task failed during close");
                },
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Reads a key's record without a session or lease: fetch, decode,
    /// migrate in memory, return. Never writes anything back; a record
    /// mid-transaction is returned as written.
    pub async fn peek(&self, key: &str) -> StoreResult<Option<Value>> {
        self.ensure_open()?;
        let record_key = self.shared.keys.record(key);
        let stored = with_data_retry(&self.shared.config.data_retry, "peek_record", || {
            self.shared.data.get(&record_key)
        })
        .await?;
        let Some(value) = stored else {
            return Ok(None);
        };

        let record: Record =
            serde_json::from_value(value).map_err(|err| StoreError::BackendFatal {
                detail: format!("stored record is not parseable: {err}"),
            })?;
        let doc = self
            .shared
            .codec
            .decode(
                key,
                &record,
                &self.shared.data,
                &self.shared.keys,
                &self.shared.config.data_retry,
            )
            .await?;
        let migrated: Migrated =
            self.shared.config.migrations.apply_pending(doc, &record.applied_migrations)?;
        Ok(Some(migrated.doc))
    }

    /// Reports whether a live lease entry exists for `key`.
    pub async fn probe_lock_active(&self, key: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        lease::probe_active(
            &self.shared.map,
            &self.shared.keys.lock(key),
            &self.shared.config.map_retry,
        )
        .await
    }

    /// Enumerates stored versions of a key's record, newest first.
    pub async fn list_versions(&self, key: &str, query: VersionQuery) -> StoreResult<VersionPage> {
        self.ensure_open()?;
        let record_key = self.shared.keys.record(key);
        with_data_retry(&self.shared.config.data_retry, "list_versions", || {
            self.shared.data.list_versions(&record_key, query.clone())
        })
        .await
    }

    /// Reads one stored version of a key's record, as written.
    pub async fn read_version(&self, key: &str, version_id: &str) -> StoreResult<Option<Value>> {
        self.ensure_open()?;
        let record_key = self.shared.keys.record(key);
        with_data_retry(&self.shared.config.data_retry, "read_version", || {
            self.shared.data.get_version(&record_key, version_id)
        })
        .await
    }
}

/// Acquires the lease and builds the session state for one load.
async fn do_load(
    shared: Arc<StoreShared>,
    key: String,
    user_ids: Option<Vec<i64>>,
    cancel: CancelHandle,
) -> StoreResult<Session> {
    let lease = LockLease::acquire(
        Arc::clone(&shared.map),
        shared.keys.lock(&key),
        &key,
        shared.lease_settings(),
        &cancel,
    )
    .await
    .map_err(|err| match err {
        StoreError::Cancelled => StoreError::LoadCancelled,
        other => other,
    })?;

    match load_with_lease(&shared, &key, user_ids, &cancel, &lease).await {
        Ok(core) => Ok(Session::start(shared, key, lease, core)),
        Err(err) => {
            lease.release().await;
            Err(err)
        },
    }
}

fn ensure_not_cancelled(cancel: &CancelHandle) -> StoreResult<()> {
    if cancel.is_cancelled() {
        return Err(StoreError::LoadCancelled);
    }
    Ok(())
}

async fn load_with_lease(
    shared: &Arc<StoreShared>,
    key: &str,
    user_ids: Option<Vec<i64>>,
    cancel: &CancelHandle,
    lease: &LockLease,
) -> StoreResult<SessionCore> {
    ensure_not_cancelled(cancel)?;
    let record_key = shared.keys.record(key);
    let stored = with_data_retry(&shared.config.data_retry, "get_record", || {
        shared.data.get(&record_key)
    })
    .await?;
    ensure_not_cancelled(cancel)?;

    match stored {
        Some(value) => {
            let record: Record =
                serde_json::from_value(value).map_err(|err| StoreError::BackendFatal {
                    detail: format!("stored record is not parseable: {err}"),
                })?;

            let (record, needs_writeback) = tx::recover_pending(shared, key, record).await?;
            ensure_not_cancelled(cancel)?;
            if needs_writeback {
                let committed = write_record_with_lease(shared, key, lease, &record).await?;
                if !committed {
                    return Err(StoreError::LockLost { key: key.to_string() });
                }
            }

            let doc = shared
                .codec
                .decode(key, &record, &shared.data, &shared.keys, &shared.config.data_retry)
                .await?;
            ensure_not_cancelled(cancel)?;

            let migrated =
                shared.config.migrations.apply_pending(doc, &record.applied_migrations)?;
            shared.validate(&migrated.doc)?;

            let file = match record.data {
                RecordData::File(file) => Some(file),
                RecordData::Inline(_) => None,
            };
            Ok(SessionCore {
                data: Arc::new(migrated.doc),
                dirty: migrated.changed,
                applied_migrations: migrated.applied,
                user_ids: user_ids.or(record.user_ids),
                orphans: record.orphans,
                file,
                pending_tx: None,
                state: SessionState::Active,
            })
        },
        None => {
            let imported = match &shared.config.import_legacy {
                Some(importer) => importer(key.to_string()).await?,
                None => None,
            };
            ensure_not_cancelled(cancel)?;

            let was_imported = imported.is_some();
            if was_imported {
                tracing::info!(key = %key, "seeded from legacy import");
            }
            let doc = imported.unwrap_or_else(|| shared.config.template.clone());
            let migrated = shared.config.migrations.apply_pending(doc, &[])?;
            shared.validate(&migrated.doc)?;

            Ok(SessionCore {
                data: Arc::new(migrated.doc),
                dirty: was_imported || migrated.changed,
                applied_migrations: migrated.applied,
                user_ids,
                orphans: Vec::new(),
                file: None,
                pending_tx: None,
                state: SessionState::Active,
            })
        },
    }
}
