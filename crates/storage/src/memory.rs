//! In-memory data service implementation.
//!
//! This module provides [`MemoryDataService`], an in-memory implementation
//! of [`DataService`] suitable for testing and development.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Versioned**: every committed write appends to a per-key version
//!   history, backing `list_versions`/`get_version`
//! - **Budgeted**: per-operation-class request budgets, settable from tests
//! - **Fault injection**: scoped one-shot failures keyed by operation class
//!   and key substring, for exercising partial-failure paths
//!
//! # Example
//!
//! ```
//! use datakeep_storage::{DataService, MemoryDataService};
//! use serde_json::json;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let service = MemoryDataService::new();
//!
//! service.set("greeting", json!({"text": "hello"}), None).await.unwrap();
//! let value = service.get("greeting").await.unwrap();
//! assert_eq!(value, Some(json!({"text": "hello"})));
//! # });
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - Version history is unbounded (acceptable for tests)

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::{
    data::{DataService, RequestKind, VersionInfo, VersionPage, VersionQuery},
    error::{DataError, DataResult},
};

/// One stored key: its current value plus the full version history.
///
/// `current` is `None` after a remove; history survives removal so that
/// version reads keep working, matching the real service.
#[derive(Debug, Default)]
struct Entry {
    current: Option<Value>,
    /// `(version_id, value)` pairs, oldest first.
    versions: Vec<(String, Value)>,
}

/// A scoped injected failure, consumed as matching operations arrive.
#[derive(Debug)]
struct Fault {
    op: RequestKind,
    key_fragment: String,
    code: u16,
    remaining: usize,
}

/// In-memory data service using [`BTreeMap`].
///
/// Primarily intended for testing. All committed writes are versioned with
/// monotonically increasing, zero-padded version ids so lexicographic order
/// matches commit order.
///
/// # Cloning
///
/// `MemoryDataService` is cheaply cloneable via [`Arc`]. All clones share
/// the same underlying data, budgets, and injected faults.
#[derive(Clone, Default)]
pub struct MemoryDataService {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    data: RwLock<BTreeMap<String, Entry>>,
    /// Overridden budgets per operation class; absent means unlimited.
    budgets: RwLock<BTreeMap<&'static str, i64>>,
    faults: Mutex<Vec<Fault>>,
    version_counter: AtomicU64,
}

fn budget_slot(op: RequestKind) -> &'static str {
    match op {
        RequestKind::Get => "get",
        RequestKind::Set => "set",
        RequestKind::Remove => "remove",
        RequestKind::ListVersions => "list_versions",
    }
}

impl MemoryDataService {
    /// Creates a new, empty in-memory data service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the advisory budget for one operation class.
    ///
    /// Budgets default to unlimited. Tests drive budget-waiting paths by
    /// setting a non-positive value and raising it later.
    pub fn set_budget(&self, op: RequestKind, remaining: i64) {
        self.inner.budgets.write().insert(budget_slot(op), remaining);
    }

    /// Arranges for the next `times` operations of class `op` whose key
    /// contains `key_fragment` to fail with the given service code.
    ///
    /// Faults are consumed in injection order and shared by all clones.
    pub fn inject_fault(&self, op: RequestKind, key_fragment: &str, code: u16, times: usize) {
        self.inner.faults.lock().push(Fault {
            op,
            key_fragment: key_fragment.to_string(),
            code,
            remaining: times,
        });
    }

    /// Returns the number of keys with a current value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.data.read().values().filter(|e| e.current.is_some()).count()
    }

    /// Returns `true` when no key has a current value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the keys with a current value whose name contains `fragment`.
    ///
    /// Test helper for asserting on shard and marker populations.
    #[must_use]
    pub fn keys_containing(&self, fragment: &str) -> Vec<String> {
        self.inner
            .data
            .read()
            .iter()
            .filter(|(k, e)| e.current.is_some() && k.contains(fragment))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn check_fault(&self, op: RequestKind, key: &str) -> DataResult<()> {
        let mut faults = self.inner.faults.lock();
        for fault in faults.iter_mut() {
            if fault.op == op && fault.remaining > 0 && key.contains(&fault.key_fragment) {
                fault.remaining -= 1;
                let code = fault.code;
                tracing::debug!(key = %key, code, "firing injected fault");
                return Err(DataError::service(code, format!("injected fault on {key}")));
            }
        }
        faults.retain(|f| f.remaining > 0);
        Ok(())
    }

    fn next_version_id(&self) -> String {
        let n = self.inner.version_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{n:010}")
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn get(&self, key: &str) -> DataResult<Option<Value>> {
        self.check_fault(RequestKind::Get, key)?;
        Ok(self.inner.data.read().get(key).and_then(|e| e.current.clone()))
    }

    async fn set(&self, key: &str, value: Value, _user_ids: Option<&[i64]>) -> DataResult<()> {
        self.check_fault(RequestKind::Set, key)?;
        let version_id = self.next_version_id();
        let mut data = self.inner.data.write();
        let entry = data.entry(key.to_string()).or_default();
        entry.versions.push((version_id, value.clone()));
        entry.current = Some(value);
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        mutator: &mut (dyn FnMut(Option<Value>) -> Option<Value> + Send),
        _user_ids: Option<&[i64]>,
    ) -> DataResult<Option<Value>> {
        self.check_fault(RequestKind::Set, key)?;
        let version_id = self.next_version_id();
        let mut data = self.inner.data.write();
        let current = data.get(key).and_then(|e| e.current.clone());
        match mutator(current) {
            Some(next) => {
                let entry = data.entry(key.to_string()).or_default();
                entry.versions.push((version_id, next.clone()));
                entry.current = Some(next.clone());
                Ok(Some(next))
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> DataResult<()> {
        self.check_fault(RequestKind::Remove, key)?;
        if let Some(entry) = self.inner.data.write().get_mut(key) {
            entry.current = None;
        }
        Ok(())
    }

    async fn list_versions(&self, key: &str, query: VersionQuery) -> DataResult<VersionPage> {
        self.check_fault(RequestKind::ListVersions, key)?;
        let data = self.inner.data.read();
        let Some(entry) = data.get(key) else {
            return Ok(VersionPage::default());
        };

        // Newest first; the cursor is the version id to resume strictly after.
        let mut ids: Vec<&(String, Value)> = entry.versions.iter().rev().collect();
        if let Some(cursor) = &query.cursor {
            ids.retain(|(id, _)| id < cursor);
        }
        let limit = query.limit.unwrap_or(ids.len());
        let page: Vec<VersionInfo> =
            ids.iter().take(limit).map(|(id, _)| VersionInfo { id: id.clone() }).collect();
        let cursor = if ids.len() > limit { page.last().map(|v| v.id.clone()) } else { None };
        Ok(VersionPage { versions: page, cursor })
    }

    async fn get_version(&self, key: &str, version_id: &str) -> DataResult<Option<Value>> {
        self.check_fault(RequestKind::ListVersions, key)?;
        let data = self.inner.data.read();
        Ok(data.get(key).and_then(|e| {
            e.versions.iter().find(|(id, _)| id == version_id).map(|(_, v)| v.clone())
        }))
    }

    fn budget(&self, op: RequestKind) -> i64 {
        self.inner.budgets.read().get(budget_slot(op)).copied().unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let service = MemoryDataService::new();
        service.set("k", json!({"a": 1}), None).await.unwrap();
        assert_eq!(service.get("k").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_preserves_history() {
        let service = MemoryDataService::new();
        service.set("k", json!(1), None).await.unwrap();
        service.remove("k").await.unwrap();
        service.remove("k").await.unwrap();
        assert_eq!(service.get("k").await.unwrap(), None);

        let page = service.list_versions("k", VersionQuery::default()).await.unwrap();
        assert_eq!(page.versions.len(), 1);
    }

    #[tokio::test]
    async fn update_commits_mutator_result() {
        let service = MemoryDataService::new();
        service.set("k", json!(1), None).await.unwrap();

        let committed = service
            .update(
                "k",
                &mut |current| {
                    let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
                    Some(json!(n + 1))
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(committed, Some(json!(2)));
        assert_eq!(service.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn update_decline_writes_nothing() {
        let service = MemoryDataService::new();
        service.set("k", json!(1), None).await.unwrap();

        let committed = service.update("k", &mut |_| None, None).await.unwrap();
        assert_eq!(committed, None);
        assert_eq!(service.get("k").await.unwrap(), Some(json!(1)));

        // A declined update must not leave a version behind.
        let page = service.list_versions("k", VersionQuery::default()).await.unwrap();
        assert_eq!(page.versions.len(), 1);
    }

    #[tokio::test]
    async fn versions_list_newest_first() {
        let service = MemoryDataService::new();
        for i in 0..3 {
            service.set("k", json!(i), None).await.unwrap();
        }
        let page = service.list_versions("k", VersionQuery::default()).await.unwrap();
        assert_eq!(page.versions.len(), 3);

        let newest = service.get_version("k", &page.versions[0].id).await.unwrap();
        assert_eq!(newest, Some(json!(2)));
        let oldest = service.get_version("k", &page.versions[2].id).await.unwrap();
        assert_eq!(oldest, Some(json!(0)));
    }

    #[tokio::test]
    async fn version_query_limit_and_cursor_paginate() {
        let service = MemoryDataService::new();
        for i in 0..5 {
            service.set("k", json!(i), None).await.unwrap();
        }
        let first = service
            .list_versions("k", VersionQuery { limit: Some(2), cursor: None })
            .await
            .unwrap();
        assert_eq!(first.versions.len(), 2);
        let cursor = first.cursor.clone().expect("more pages expected");

        let second = service
            .list_versions("k", VersionQuery { limit: Some(10), cursor: Some(cursor) })
            .await
            .unwrap();
        assert_eq!(second.versions.len(), 3);
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn injected_fault_fires_then_clears() {
        let service = MemoryDataService::new();
        service.inject_fault(RequestKind::Set, "shard", 502, 1);

        let err = service.set("shards/s/abc-1", json!("x"), None).await.unwrap_err();
        assert_eq!(err.code(), Some(502));

        // Fault consumed; the retry succeeds.
        service.set("shards/s/abc-1", json!("x"), None).await.unwrap();
        // Unrelated keys never matched.
        service.set("records/s/p1", json!("y"), None).await.unwrap();
    }

    #[tokio::test]
    async fn budgets_default_unlimited_and_are_settable() {
        let service = MemoryDataService::new();
        assert_eq!(service.budget(RequestKind::Remove), i64::MAX);
        service.set_budget(RequestKind::Remove, 0);
        assert_eq!(service.budget(RequestKind::Remove), 0);
        service.set_budget(RequestKind::Remove, 10);
        assert_eq!(service.budget(RequestKind::Remove), 10);
    }

    #[tokio::test]
    async fn clone_shares_data() {
        let a = MemoryDataService::new();
        let b = a.clone();
        a.set("k", json!(true), None).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(json!(true)));
    }
}
