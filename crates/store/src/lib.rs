//! DataKeep engine: durable, session-locked, transactional key/value
//! persistence.
//!
//! A [`Store`] manages per-key sessions over two backing services — the
//! durable, versioned [`DataService`](datakeep_storage::DataService) and
//! the volatile TTL [`CoordinationMap`](datakeep_storage::CoordinationMap).
//! Each loaded key is owned by exactly one session cluster-wide, enforced
//! by a lease entry in the coordination map that the session refreshes
//! for as long as it lives.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Store                               │
//! │      load / unload / update / tx / save / close / peek      │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Session (per key)              Transaction coordinator    │
//! │   working copy │ serial queue    two-phase marker protocol  │
//! │   lock lease   │ autosave                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │   sharded codec │ migration chain │ retry wrappers          │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │         DataService          │       CoordinationMap        │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **One writer per key.** A session exists only while its lease is
//!   held; every record write re-verifies the lease inside the write.
//! - **Ordered operations.** Operations on one key complete in submission
//!   order; each session executes one operation at a time.
//! - **Atomic multi-key transactions.** A durable marker write is the
//!   commit point; crash recovery on load yields all-new or all-old
//!   values, never a mixture.
//! - **No torn large values.** Oversized documents are sharded; a reader
//!   never observes a record pointing at deleted shards, and superseded
//!   shards are reconciled through the record's orphan list.
//!
//! # Suspension
//!
//! Caller-supplied transforms are synchronous closures: they cannot
//! suspend, so a session's state is consistent between its own awaits
//! without internal locking games. Side effects against the backing
//! services all go through retry wrappers.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod migration;
pub mod patch;
pub mod record;

mod codec;
mod lease;
mod queue;
mod retry;
mod session;
mod store;
mod tx;

pub use config::{
    BoxFuture, ChangeCallback, DEFAULT_AUTOSAVE_INTERVAL, DEFAULT_LOCK_REFRESH_INTERVAL,
    DEFAULT_LOCK_TTL, DEFAULT_MAX_CHUNK_SIZE, LegacyImporter, MAX_VALUE_SIZE, RECORD_RESERVE,
    RetryPolicy, SchemaCheck, StoreConfig, StoreConfigBuilder,
};
pub use error::{ConfigError, StoreError, StoreResult};
pub use migration::{Migration, MigrationChain};
pub use patch::{PatchOp, apply_patch, create_patch};
pub use queue::TaskHandle;
pub use record::{FileRef, Record, RecordData};
pub use store::Store;
