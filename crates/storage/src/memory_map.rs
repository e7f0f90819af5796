//! In-memory coordination map implementation.
//!
//! This module provides [`MemoryCoordinationMap`], an in-memory
//! implementation of [`CoordinationMap`] suitable for testing and
//! development.
//!
//! Expiry is enforced on read: an entry past its deadline is reported
//! absent even before the sweep removes it, so TTL semantics are exact
//! regardless of sweep cadence.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
// The tokio clock (not the std one) so tests can pause and advance time.
use tokio::time::{Instant, sleep};

use crate::{error::MapResult, map::CoordinationMap};

/// How often the background sweep removes expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct TimedEntry {
    value: Value,
    expires_at: Instant,
}

/// In-memory TTL map using [`BTreeMap`].
///
/// Primarily intended for testing. A background task sweeps expired
/// entries; reads additionally check the deadline so expiry is precise.
///
/// # Cloning
///
/// `MemoryCoordinationMap` is cheaply cloneable via [`Arc`]. All clones
/// share the same underlying entries.
#[derive(Clone)]
pub struct MemoryCoordinationMap {
    entries: Arc<RwLock<BTreeMap<String, TimedEntry>>>,
}

impl MemoryCoordinationMap {
    /// Creates a new in-memory coordination map and spawns its expiry
    /// sweep task.
    #[must_use]
    pub fn new() -> Self {
        let map = Self { entries: Arc::new(RwLock::new(BTreeMap::new())) };

        let sweep = map.clone();
        tokio::spawn(async move {
            loop {
                sleep(SWEEP_INTERVAL).await;
                let now = Instant::now();
                let mut entries = sweep.entries.write();
                let before = entries.len();
                entries.retain(|_, e| e.expires_at > now);
                let swept = before - entries.len();
                if swept > 0 {
                    tracing::trace!(swept, "expired map entries removed");
                }
            }
        });

        map
    }

    /// Directly overwrites an entry, bypassing `update` atomicity.
    ///
    /// Test helper for simulating another cluster member stealing a lease.
    pub fn put_raw(&self, key: &str, value: Value, ttl: Duration) {
        self.entries
            .write()
            .insert(key.to_string(), TimedEntry { value, expires_at: Instant::now() + ttl });
    }

    fn live_value(entries: &BTreeMap<String, TimedEntry>, key: &str) -> Option<Value> {
        entries.get(key).filter(|e| e.expires_at > Instant::now()).map(|e| e.value.clone())
    }
}

impl Default for MemoryCoordinationMap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationMap for MemoryCoordinationMap {
    async fn get(&self, key: &str) -> MapResult<Option<Value>> {
        Ok(Self::live_value(&self.entries.read(), key))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> MapResult<()> {
        self.entries
            .write()
            .insert(key.to_string(), TimedEntry { value, expires_at: Instant::now() + ttl });
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        mutator: &mut (dyn FnMut(Option<Value>) -> Option<Value> + Send),
        ttl: Duration,
    ) -> MapResult<Option<Value>> {
        // The write lock spans read-mutate-write, which is what makes this
        // update atomic against concurrent updates of the same key.
        let mut entries = self.entries.write();
        let current = Self::live_value(&entries, key);
        match mutator(current) {
            Some(next) => {
                entries.insert(
                    key.to_string(),
                    TimedEntry { value: next.clone(), expires_at: Instant::now() + ttl },
                );
                Ok(Some(next))
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> MapResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let map = MemoryCoordinationMap::new();
        map.set("k", json!("v"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(map.get("k").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_reads_as_absent() {
        let map = MemoryCoordinationMap::new();
        map.set("k", json!("v"), Duration::from_secs(2)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(map.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn update_sees_none_after_expiry() {
        let map = MemoryCoordinationMap::new();
        map.set("k", json!("old"), Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut observed = None;
        map.update(
            "k",
            &mut |current| {
                observed = Some(current.is_none());
                Some(json!("new"))
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(observed, Some(true));
        assert_eq!(map.get("k").await.unwrap(), Some(json!("new")));
    }

    #[tokio::test]
    async fn update_decline_leaves_entry_untouched() {
        let map = MemoryCoordinationMap::new();
        map.set("k", json!("keep"), Duration::from_secs(60)).await.unwrap();

        let committed = map.update("k", &mut |_| None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(committed, None);
        assert_eq!(map.get("k").await.unwrap(), Some(json!("keep")));
    }

    #[tokio::test(start_paused = true)]
    async fn update_resets_ttl() {
        let map = MemoryCoordinationMap::new();
        map.set("k", json!("v"), Duration::from_secs(2)).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        map.update("k", &mut |v| v, Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(map.get("k").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let map = MemoryCoordinationMap::new();
        map.set("k", json!("v"), Duration::from_secs(60)).await.unwrap();
        map.remove("k").await.unwrap();
        map.remove("k").await.unwrap();
        assert_eq!(map.get("k").await.unwrap(), None);
    }
}
