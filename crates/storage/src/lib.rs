//! Backing-service contracts for DataKeep.
//!
//! This crate defines the two external services the DataKeep engine is built
//! on, as traits, together with in-memory implementations suitable for
//! testing and development:
//!
//! - [`DataService`] — the durable, versioned key/value service. Values are
//!   JSON documents; every write may carry user-id tags for the service's
//!   compliance tooling; superseded values remain readable through the
//!   version-listing API.
//! - [`CoordinationMap`] — the volatile, cluster-wide map with per-entry
//!   TTL. The engine uses it exclusively for compare-and-set lease
//!   mutations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     datakeep-store                          │
//! │   sessions │ leases │ sharded codec │ transactions          │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │         DataService          │       CoordinationMap        │
//! │   (durable, versioned KV)    │     (volatile TTL map)       │
//! ├──────────────────────────────┼──────────────────────────────┤
//! │      MemoryDataService       │    MemoryCoordinationMap     │
//! │         (testing)            │         (testing)            │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Error Handling
//!
//! Each service has its own error type with its own transient-failure
//! classification: [`DataError`] classifies by numeric service code,
//! [`MapError`] by message substring. The engine's retry wrappers consult
//! `is_transient()` and nothing else.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers
//!   (document generators, assertion macros). Enable this in
//!   `[dev-dependencies]` for integration tests.

#![deny(unsafe_code)]

pub mod data;
pub mod error;
pub mod map;
pub mod memory;
pub mod memory_map;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

pub use data::{DataService, RequestKind, VersionInfo, VersionPage, VersionQuery};
pub use error::{BoxError, DataError, DataResult, MapError, MapResult};
pub use map::CoordinationMap;
pub use memory::MemoryDataService;
pub use memory_map::MemoryCoordinationMap;
