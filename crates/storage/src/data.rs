//! Durable data service trait definition.
//!
//! This module defines [`DataService`], the contract for the durable,
//! versioned key/value service the engine persists records and shards to.
//!
//! # Design
//!
//! - **Values are JSON documents**: the service accepts any
//!   JSON-serializable value; the engine layers its record format on top.
//! - **Async by default**: every operation may cross a network boundary.
//! - **Read-modify-write via mutator**: [`update`](DataService::update)
//!   passes the current value to a caller-supplied closure and commits the
//!   closure's result atomically. Returning `None` from the closure declines
//!   the write, leaving the stored value untouched — the engine relies on
//!   this to re-verify lease ownership inside the write itself.
//! - **Versioned**: superseded values remain readable through
//!   [`list_versions`](DataService::list_versions) and
//!   [`get_version`](DataService::get_version).
//! - **Budgeted**: the service meters requests per operation class;
//!   [`budget`](DataService::budget) exposes the remaining allowance so
//!   background work can yield when the budget runs dry.
//!
//! See [`MemoryDataService`](crate::MemoryDataService) for a reference
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DataResult;

/// Operation classes the data service meters separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Single-key reads.
    Get,
    /// Single-key writes, including mutator updates.
    Set,
    /// Single-key removals.
    Remove,
    /// Version-history reads.
    ListVersions,
}

/// Query parameters for [`DataService::list_versions`].
///
/// The default query returns the newest versions first with a service-chosen
/// page size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionQuery {
    /// Maximum number of versions to return. `None` lets the service choose.
    pub limit: Option<usize>,
    /// Opaque cursor from a previous [`VersionPage`], for pagination.
    pub cursor: Option<String>,
}

/// Metadata for one stored version of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Opaque version identifier, usable with
    /// [`DataService::get_version`].
    pub id: String,
}

/// One page of version metadata, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionPage {
    /// Version metadata in reverse chronological order.
    pub versions: Vec<VersionInfo>,
    /// Cursor for the next page, when more versions exist.
    pub cursor: Option<String>,
}

/// Abstract durable, versioned key/value service.
///
/// Implementations are expected to be thread-safe (`Send + Sync`) and to
/// support concurrent callers. The service itself provides no mutual
/// exclusion across writers; the engine supplies that with leases.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](DataService::get) | Retrieve the current value of a key |
/// | [`set`](DataService::set) | Store a value unconditionally |
/// | [`update`](DataService::update) | Atomic read-modify-write via mutator |
/// | [`remove`](DataService::remove) | Delete a key |
/// | [`list_versions`](DataService::list_versions) | Enumerate stored versions |
/// | [`get_version`](DataService::get_version) | Read one stored version |
/// | [`budget`](DataService::budget) | Remaining request allowance |
#[async_trait]
pub trait DataService: Send + Sync {
    /// Retrieves the current value of a key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` if the key exists
    /// - `Ok(None)` if the key doesn't exist
    /// - `Err(...)` on service errors
    #[must_use = "service operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> DataResult<Option<Value>>;

    /// Stores a value unconditionally, overwriting any existing value.
    ///
    /// `user_ids` tags the write with the user identifiers associated with
    /// the data, for the service's compliance tooling.
    #[must_use = "service operations may fail and errors must be handled"]
    async fn set(&self, key: &str, value: Value, user_ids: Option<&[i64]>) -> DataResult<()>;

    /// Atomically reads, transforms, and writes a key.
    ///
    /// The `mutator` receives the current value (`None` when the key does
    /// not exist) and returns the value to store. Returning `None` declines
    /// the write: nothing is stored and the call resolves `Ok(None)`.
    ///
    /// The mutator may be invoked more than once if the service retries
    /// internally; it must be free of side effects beyond computing the new
    /// value.
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
        user_ids: Option<&[i64]>,
    ) -> DataResult<Option<Value>>;

    /// Deletes a key.
    ///
    /// Deleting a missing key is a no-op (returns `Ok(())`).
    #[must_use = "service operations may fail and errors must be handled"]
    async fn remove(&self, key: &str) -> DataResult<()>;

    /// Enumerates stored versions of a key, newest first.
    #[must_use = "service operations may fail and errors must be handled"]
    async fn list_versions(&self, key: &str, query: VersionQuery) -> DataResult<VersionPage>;

    /// Reads one stored version of a key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` if the version exists
    /// - `Ok(None)` if the key or version doesn't exist
    /// - `Err(...)` on service errors
    #[must_use = "service operations may fail and errors must be handled"]
    async fn get_version(&self, key: &str, version_id: &str) -> DataResult<Option<Value>>;

    /// Returns the remaining request allowance for an operation class.
    ///
    /// A non-positive value means callers should back off before issuing
    /// more requests of that class. The allowance is advisory; the service
    /// still throttles on its own.
    fn budget(&self, op: RequestKind) -> i64;
}
