//! Engine error types and result alias.
//!
//! [`StoreError`] is the closed set of failures surfaced to callers.
//! Backing-service failures reach callers only after the retry wrappers
//! have classified them: transient failures that survive every retry
//! attempt become [`StoreError::BackendTransient`], everything else becomes
//! [`StoreError::BackendFatal`].
//!
//! Caller mistakes (schema violations, transform panics, modified
//! transaction key sets) short-circuit the current operation without
//! affecting the session. [`StoreError::LockLost`] is the one error that
//! closes its session; the store as a whole stays open.

use thiserror::Error;

/// Result type alias for engine operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store, session, and transaction operations.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases; downstream match
/// expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store has been closed; no further operations are accepted.
    #[error("store is closed")]
    StoreClosed,

    /// The operation names a key with no loaded session.
    #[error("key {key:?} is not loaded")]
    KeyNotLoaded {
        /// The key that has no session.
        key: String,
    },

    /// A load for this key is already in flight.
    #[error("a load for key {key:?} is already in progress")]
    LoadInProgress {
        /// The key being loaded.
        key: String,
    },

    /// The load was cancelled by a concurrent unload or store close.
    #[error("load was cancelled")]
    LoadCancelled,

    /// The exclusive lease could not be acquired before the deadline.
    #[error("lock unavailable for key {key:?}")]
    LockUnavailable {
        /// The key whose lease was contested.
        key: String,
    },

    /// The session's lease was lost; the session is closed.
    #[error("lock lost for key {key:?}")]
    LockLost {
        /// The key whose lease was lost.
        key: String,
    },

    /// The session is closed; only `unload` remains valid.
    #[error("session is closed: {reason}")]
    SessionClosed {
        /// Why the session closed (unloaded, lock lost, store closed).
        reason: String,
    },

    /// A value failed the configured schema check.
    #[error("schema check failed: {reason}")]
    SchemaInvalid {
        /// The reason reported by the schema check.
        reason: String,
    },

    /// A caller-supplied transform misbehaved (panicked).
    #[error("transform failed: {reason}")]
    BadTransform {
        /// Description of the misbehavior.
        reason: String,
    },

    /// A transaction transform added or removed keys from the state map.
    #[error("transaction transform modified the key set")]
    TxKeysModified,

    /// A record carried a pending transaction that could not be resolved.
    #[error("transaction recovery failed for key {key:?}: {reason}")]
    TxRecoveryFailed {
        /// The participant key under recovery.
        key: String,
        /// Why recovery was impossible.
        reason: String,
    },

    /// The record's applied migrations do not prefix-match the configured
    /// chain.
    #[error("migration mismatch: {reason}")]
    MigrationMismatch {
        /// The mismatching name and position.
        reason: String,
    },

    /// A sharded record was missing one or more of its shards.
    #[error("record {key:?} is missing {missing} of {expected} shards")]
    IncompleteShards {
        /// The record key.
        key: String,
        /// Number of shards that could not be fetched.
        missing: usize,
        /// Number of shards the record references.
        expected: usize,
    },

    /// A transient backend failure survived every retry attempt.
    #[error("backend unavailable after {attempts} attempts")]
    BackendTransient {
        /// How many attempts were made.
        attempts: u32,
        /// The final attempt's diagnostic.
        detail: String,
    },

    /// A non-retryable backend failure.
    #[error("backend error: {detail}")]
    BackendFatal {
        /// The backend's diagnostic.
        detail: String,
    },

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// A queued operation exceeded the per-item execution bound.
    #[error("queued operation timed out")]
    QueueTimeout,
}

impl StoreError {
    /// Creates a `KeyNotLoaded` error for the given key.
    #[must_use]
    pub fn key_not_loaded(key: impl Into<String>) -> Self {
        Self::KeyNotLoaded { key: key.into() }
    }

    /// Creates a `SessionClosed` error with the given reason.
    #[must_use]
    pub fn session_closed(reason: impl Into<String>) -> Self {
        Self::SessionClosed { reason: reason.into() }
    }

    /// Creates a `SchemaInvalid` error with the given reason.
    #[must_use]
    pub fn schema_invalid(reason: impl Into<String>) -> Self {
        Self::SchemaInvalid { reason: reason.into() }
    }

    /// Creates a `BadTransform` error with the given reason.
    #[must_use]
    pub fn bad_transform(reason: impl Into<String>) -> Self {
        Self::BadTransform { reason: reason.into() }
    }

    /// Returns `true` when the error indicates the session (not the caller)
    /// is no longer usable.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::LockLost { .. } | Self::SessionClosed { .. })
    }
}

/// Error returned when a configuration value fails validation.
///
/// Each variant names the field that was invalid and the constraint it
/// violated.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A field that must be positive was zero or a zero-length duration.
    #[error("invalid {field}: must be positive (got {value})")]
    MustBePositive {
        /// The name of the configuration field.
        field: &'static str,
        /// A human-readable representation of the invalid value.
        value: String,
    },

    /// A relational constraint between two fields was violated.
    #[error("invalid config: {field_a} ({value_a}) must be <= {field_b} ({value_b})")]
    InvalidRelation {
        /// The field that should be the smaller value.
        field_a: &'static str,
        /// The actual value of `field_a` (human-readable).
        value_a: String,
        /// The field that should be the larger value.
        field_b: &'static str,
        /// The actual value of `field_b` (human-readable).
        value_b: String,
    },

    /// Two migrations in the configured chain share a name.
    #[error("duplicate migration name {name:?} in chain")]
    DuplicateMigration {
        /// The repeated name.
        name: String,
    },
}
