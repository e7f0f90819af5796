//! TTL-bounded exclusive lease over a coordination-map entry.
//!
//! One lease entry exists per key, holding an opaque lease id (a fresh
//! UUID per acquisition). Acquisition and refresh both go through the
//! map's compare-and-set `update`: the mutator claims the entry only when
//! it is absent (expired counts as absent) or already carries this lease's
//! id, and declines otherwise. Holding the entry means at most one session
//! cluster-wide owns the key.
//!
//! State machine: `Acquiring → Held → (Released | Lost)`. `Lost` is
//! entered when a refresh observes a different lease id, or when refresh
//! failures persist past the TTL (at which point another member may
//! already have claimed the entry). Observers registered with
//! [`LockLease::on_lost`] are invoked exactly once on the transition.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use datakeep_storage::CoordinationMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    config::RetryPolicy,
    error::{StoreError, StoreResult},
    retry::{CancelHandle, with_map_retry},
};

/// Base delay between acquisition polls of a contested entry.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the random extra delay added to each acquisition poll.
const ACQUIRE_POLL_JITTER_MS: u64 = 500;

/// Tuning for one lease, derived from the store configuration.
#[derive(Debug, Clone)]
pub(crate) struct LeaseSettings {
    pub ttl: Duration,
    pub refresh_interval: Duration,
    pub acquire_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Held,
    Released,
    Lost,
}

type LostCallback = Box<dyn FnOnce() + Send>;

struct LeaseInner {
    map: Arc<dyn CoordinationMap>,
    lock_key: String,
    lease_id: String,
    settings: LeaseSettings,
    state: Mutex<LeaseState>,
    observers: Mutex<Vec<(u64, LostCallback)>>,
    next_observer_id: AtomicU64,
    refresh_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LeaseInner {
    /// One claim attempt: commits the entry when it is free or already
    /// ours, declines when another id holds it. Returns whether the entry
    /// was committed.
    async fn try_claim(&self, cancel: Option<&CancelHandle>) -> StoreResult<bool> {
        let committed = with_map_retry(&self.settings.retry, cancel, "claim_lease", || {
            let map = Arc::clone(&self.map);
            let lock_key = self.lock_key.clone();
            let lease_id = self.lease_id.clone();
            let ttl = self.settings.ttl;
            async move {
                let mut mutator = move |current: Option<Value>| match current {
                    None => Some(Value::String(lease_id.clone())),
                    Some(value) if value.as_str() == Some(lease_id.as_str()) => Some(value),
                    Some(_) => None,
                };
                map.update(&lock_key, &mut mutator, ttl).await
            }
        })
        .await?;
        Ok(committed.is_some())
    }

    /// Transitions `Held → Lost` and fires observers exactly once.
    fn mark_lost(&self) {
        {
            let mut state = self.state.lock();
            if *state != LeaseState::Held {
                return;
            }
            *state = LeaseState::Lost;
        }
        tracing::warn!(lock_key = %self.lock_key, "lease lost");
        let observers: Vec<_> = self.observers.lock().drain(..).collect();
        for (_, callback) in observers {
            callback();
        }
    }
}

/// Handle to a held (or formerly held) lease.
///
/// Cheaply cloneable; all clones observe the same state. The periodic
/// refresh stops when the lease is released or lost, or when every handle
/// is dropped.
#[derive(Clone)]
pub struct LockLease {
    inner: Arc<LeaseInner>,
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease").finish_non_exhaustive()
    }
}

impl LockLease {
    /// Acquires the lease for `lock_key`, polling the entry with bounded
    /// backoff until the settings' overall deadline.
    ///
    /// On success the entry holds a fresh lease id and a periodic refresh
    /// task keeps it alive every `refresh_interval`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::LockUnavailable`] when the deadline passes with the
    ///   entry still held by someone else
    /// - [`StoreError::Cancelled`] when `cancel` fires mid-acquisition
    pub(crate) async fn acquire(
        map: Arc<dyn CoordinationMap>,
        lock_key: String,
        display_key: &str,
        settings: LeaseSettings,
        cancel: &CancelHandle,
    ) -> StoreResult<Self> {
        let inner = Arc::new(LeaseInner {
            map,
            lock_key,
            lease_id: Uuid::new_v4().to_string(),
            settings,
            state: Mutex::new(LeaseState::Held),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
            refresh_task: Mutex::new(None),
        });

        let deadline = Instant::now() + inner.settings.acquire_timeout;
        loop {
            if inner.try_claim(Some(cancel)).await? {
                break;
            }

            // Contested: poll again with jitter until the deadline.
            let jitter =
                Duration::from_millis(rand::rng().random_range(0..=ACQUIRE_POLL_JITTER_MS));
            let wait = ACQUIRE_POLL_INTERVAL + jitter;
            if Instant::now() + wait >= deadline {
                return Err(StoreError::LockUnavailable { key: display_key.to_string() });
            }
            tracing::debug!(lock_key = %inner.lock_key, "lease contested, polling again");
            tokio::select! {
                () = cancel.cancelled() => return Err(StoreError::Cancelled),
                () = tokio::time::sleep(wait) => {},
            }
        }

        let lease = Self { inner };
        lease.spawn_refresh();
        tracing::debug!(lock_key = %lease.inner.lock_key, lease_id = %lease.inner.lease_id, "lease acquired");
        Ok(lease)
    }

    fn spawn_refresh(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut last_success = Instant::now();
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = Weak::upgrade(&weak) else {
                    return;
                };
                if *inner.state.lock() != LeaseState::Held {
                    return;
                }

                match inner.try_claim(None).await {
                    Ok(true) => last_success = Instant::now(),
                    Ok(false) => {
                        // Another id holds the entry.
                        inner.mark_lost();
                        return;
                    },
                    Err(err) => {
                        tracing::warn!(
                            lock_key = %inner.lock_key,
                            error = %err,
                            "lease refresh failed",
                        );
                        if last_success.elapsed() >= inner.settings.ttl {
                            inner.mark_lost();
                            return;
                        }
                    },
                }
            }
        });
        *self.inner.refresh_task.lock() = Some(handle);
    }

    /// Returns `true` while the lease is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        *self.inner.state.lock() == LeaseState::Held
    }

    /// Registers an observer invoked exactly once if the lease is lost.
    ///
    /// An observer registered after the loss is invoked immediately.
    /// Dropping the returned subscription keeps the observer; call
    /// [`LostSubscription::unsubscribe`] to remove it.
    pub fn on_lost(&self, callback: impl FnOnce() + Send + 'static) -> LostSubscription {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        {
            let state = self.inner.state.lock();
            if *state == LeaseState::Lost {
                drop(state);
                callback();
                return LostSubscription { inner: Weak::new(), id };
            }
            self.inner.observers.lock().push((id, Box::new(callback)));
        }
        LostSubscription { inner: Arc::downgrade(&self.inner), id }
    }

    /// Releases the lease: stops the refresh task and clears the entry
    /// best-effort.
    ///
    /// Idempotent; releasing a lost or already-released lease is a no-op.
    pub(crate) async fn release(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != LeaseState::Held {
                return;
            }
            *state = LeaseState::Released;
        }
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.abort();
        }

        // Clear the entry only if it is still ours. The read-check-remove
        // window is acceptable: the entry expires on its own either way.
        let current = self.inner.map.get(&self.inner.lock_key).await;
        match current {
            Ok(Some(value)) if value.as_str() == Some(self.inner.lease_id.as_str()) => {
                if let Err(err) = self.inner.map.remove(&self.inner.lock_key).await {
                    tracing::warn!(
                        lock_key = %self.inner.lock_key,
                        error = %err,
                        "lease release could not clear the entry",
                    );
                }
            },
            Ok(_) => {},
            Err(err) => {
                tracing::warn!(
                    lock_key = %self.inner.lock_key,
                    error = %err,
                    "lease release could not read the entry",
                );
            },
        }
        tracing::debug!(lock_key = %self.inner.lock_key, "lease released");
    }
}

/// Subscription returned by [`LockLease::on_lost`].
pub struct LostSubscription {
    inner: Weak<LeaseInner>,
    id: u64,
}

impl LostSubscription {
    /// Removes the observer if it has not fired.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.observers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Reads whether a live lease entry exists for `lock_key`.
pub(crate) async fn probe_active(
    map: &Arc<dyn CoordinationMap>,
    lock_key: &str,
    policy: &RetryPolicy,
) -> StoreResult<bool> {
    let value = with_map_retry(policy, None, "probe_lease", || map.get(lock_key)).await?;
    Ok(value.is_some())
}
