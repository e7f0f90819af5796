//! Coordination map trait definition.
//!
//! This module defines [`CoordinationMap`], the contract for the volatile,
//! cluster-wide map with per-entry TTL. The engine uses it for exactly one
//! purpose: lease entries, mutated through compare-and-set
//! [`update`](CoordinationMap::update) calls.
//!
//! Entries auto-expire at their TTL; an expired entry is indistinguishable
//! from an absent one. Nothing stored here is durable — a service restart
//! may drop the whole map, which the engine tolerates because every entry
//! can be re-derived (a dropped lease entry merely lets another session
//! acquire the lock after the TTL window).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::MapResult;

/// Abstract volatile map with per-entry TTL.
///
/// Implementations are expected to be thread-safe (`Send + Sync`). The
/// [`update`](CoordinationMap::update) operation must be atomic with
/// respect to concurrent updates of the same key — this is the primitive
/// the engine's lease protocol is built on.
#[async_trait]
pub trait CoordinationMap: Send + Sync {
    /// Retrieves the current value of a key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` if the key exists and has not expired
    /// - `Ok(None)` otherwise
    #[must_use = "service operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> MapResult<Option<Value>>;

    /// Stores a value with the given TTL, overwriting any existing value.
    #[must_use = "service operations may fail and errors must be handled"]
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> MapResult<()>;

    /// Atomically reads, transforms, and writes a key, resetting its TTL.
    ///
    /// The `mutator` receives the current value (`None` when the key does
    /// not exist or has expired) and returns the value to store. Returning
    /// `None` declines the write: nothing is stored, the existing TTL is
    /// untouched, and the call resolves `Ok(None)`.
    ///
    /// Concurrent `update` calls on the same key are serialized by the
    /// service; the mutator always observes a committed value.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` — the value that was committed
    /// - `Ok(None)` — the mutator declined; nothing was written
    /// - `Err(...)` on service errors
    #[must_use = "service operations may fail and errors must be handled"]
    async fn update(
        &self,
        key: &str,
        mutator: &mut (dyn FnMut(Option<Value>) -> Option<Value> + Send),
        ttl: Duration,
    ) -> MapResult<Option<Value>>;

    /// Deletes a key.
    ///
    /// Deleting a missing or expired key is a no-op (returns `Ok(())`).
    #[must_use = "service operations may fail and errors must be handled"]
    async fn remove(&self, key: &str) -> MapResult<()>;
}
