//! Store configuration.
//!
//! This module provides [`StoreConfig`], which names a store, supplies its
//! template document and validation hook, and carries every tuning knob the
//! engine exposes. Defaults match production expectations; tests tighten
//! the durations and shrink the chunk size.

use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    error::{ConfigError, StoreResult},
    migration::MigrationChain,
};

/// Default TTL of a lease entry in the coordination map.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(90);

/// Default interval between lease refreshes.
pub const DEFAULT_LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Default overall deadline for acquiring a contested lease.
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default execution bound for one queued session operation.
pub const DEFAULT_QUEUE_ITEM_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between autosave passes.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(300);

/// Largest value the data service accepts.
pub const MAX_VALUE_SIZE: usize = 4 * 1024 * 1024;

/// Bytes reserved within [`MAX_VALUE_SIZE`] for record metadata.
pub const RECORD_RESERVE: usize = 10 * 1024;

/// Default upper bound on one shard's serialized span; payloads above this
/// bound are split across shards.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = MAX_VALUE_SIZE - RECORD_RESERVE;

/// Default number of attempts a retry wrapper makes before giving up.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Default first-retry delay; doubles with each subsequent attempt.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Boxed future alias for the callback types below.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Predicate called on every validated data boundary.
///
/// Returns `Ok(())` to accept the document or `Err(reason)` to reject it.
pub type SchemaCheck = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Observer invoked after a committed update as `(key, new, old)`.
pub type ChangeCallback = Arc<dyn Fn(&str, &Value, &Value) + Send + Sync>;

/// Importer consulted when a key has no record; returns the document to
/// seed the session with, or `None` to fall back to the template.
pub type LegacyImporter =
    Arc<dyn Fn(String) -> BoxFuture<StoreResult<Option<Value>>> + Send + Sync>;

/// Retry policy for one backing service.
///
/// Attempt `n` (1-based) sleeps `base_delay · 2^(n-1)` before retrying, so
/// the default policy waits 1 s, 2 s, 4 s, 8 s between its five attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Minimum 1.
    pub(crate) attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub(crate) base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] when `attempts` is zero.
    pub fn new(attempts: u32, base_delay: Duration) -> Result<Self, ConfigError> {
        if attempts == 0 {
            return Err(ConfigError::MustBePositive {
                field: "retry.attempts",
                value: attempts.to_string(),
            });
        }
        Ok(Self { attempts, base_delay })
    }

    /// Returns the total number of attempts.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the base delay.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: DEFAULT_RETRY_ATTEMPTS, base_delay: DEFAULT_RETRY_BASE_DELAY }
    }
}

/// Configuration for a [`Store`](crate::Store).
///
/// Construct through [`StoreConfig::builder`]; `build` validates the
/// relational constraints (refresh interval within TTL, unique migration
/// names, positive bounds).
#[derive(Clone)]
pub struct StoreConfig {
    pub(crate) name: String,
    pub(crate) template: Value,
    pub(crate) schema_check: Option<SchemaCheck>,
    pub(crate) migrations: MigrationChain,
    pub(crate) change_callbacks: Vec<ChangeCallback>,
    pub(crate) import_legacy: Option<LegacyImporter>,
    pub(crate) lock_ttl: Duration,
    pub(crate) lock_refresh_interval: Duration,
    pub(crate) lock_acquire_timeout: Duration,
    pub(crate) queue_item_timeout: Duration,
    pub(crate) autosave_interval: Duration,
    pub(crate) max_chunk_size: usize,
    pub(crate) data_retry: RetryPolicy,
    pub(crate) map_retry: RetryPolicy,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("name", &self.name)
            .field("migrations", &self.migrations.names())
            .field("change_callbacks", &self.change_callbacks.len())
            .field("lock_ttl", &self.lock_ttl)
            .field("lock_refresh_interval", &self.lock_refresh_interval)
            .field("autosave_interval", &self.autosave_interval)
            .field("max_chunk_size", &self.max_chunk_size)
            .finish_non_exhaustive()
    }
}

impl StoreConfig {
    /// Starts a builder for a store with the given name.
    ///
    /// The name scopes every persisted key
    /// (`records/<name>/…`, `shards/<name>/…`, `tx/<name>/…`,
    /// `locks/<name>/…`), so two stores with different names never collide.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> StoreConfigBuilder {
        StoreConfigBuilder {
            name: name.into(),
            template: Value::Null,
            schema_check: None,
            migrations: MigrationChain::default(),
            change_callbacks: Vec::new(),
            import_legacy: None,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_refresh_interval: DEFAULT_LOCK_REFRESH_INTERVAL,
            lock_acquire_timeout: DEFAULT_LOCK_ACQUIRE_TIMEOUT,
            queue_item_timeout: DEFAULT_QUEUE_ITEM_TIMEOUT,
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            data_retry: RetryPolicy::default(),
            map_retry: RetryPolicy::default(),
        }
    }

    /// Returns the store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder for [`StoreConfig`].
pub struct StoreConfigBuilder {
    name: String,
    template: Value,
    schema_check: Option<SchemaCheck>,
    migrations: MigrationChain,
    change_callbacks: Vec<ChangeCallback>,
    import_legacy: Option<LegacyImporter>,
    lock_ttl: Duration,
    lock_refresh_interval: Duration,
    lock_acquire_timeout: Duration,
    queue_item_timeout: Duration,
    autosave_interval: Duration,
    max_chunk_size: usize,
    data_retry: RetryPolicy,
    map_retry: RetryPolicy,
}

impl StoreConfigBuilder {
    /// Sets the template document used for keys with no stored record.
    #[must_use]
    pub fn template(mut self, template: Value) -> Self {
        self.template = template;
        self
    }

    /// Sets the schema check applied at every validated data boundary.
    #[must_use]
    pub fn schema_check(
        mut self,
        check: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.schema_check = Some(Arc::new(check));
        self
    }

    /// Sets the migration chain.
    #[must_use]
    pub fn migrations(mut self, migrations: MigrationChain) -> Self {
        self.migrations = migrations;
        self
    }

    /// Registers a change callback, invoked as `(key, new, old)` after
    /// every committed update.
    #[must_use]
    pub fn on_change(mut self, callback: impl Fn(&str, &Value, &Value) + Send + Sync + 'static) -> Self {
        self.change_callbacks.push(Arc::new(callback));
        self
    }

    /// Sets the legacy importer consulted when a key has no record.
    #[must_use]
    pub fn import_legacy(
        mut self,
        importer: impl Fn(String) -> BoxFuture<StoreResult<Option<Value>>> + Send + Sync + 'static,
    ) -> Self {
        self.import_legacy = Some(Arc::new(importer));
        self
    }

    /// Sets the lease TTL.
    #[must_use]
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Sets the lease refresh interval.
    #[must_use]
    pub fn lock_refresh_interval(mut self, interval: Duration) -> Self {
        self.lock_refresh_interval = interval;
        self
    }

    /// Sets the overall deadline for acquiring a contested lease.
    #[must_use]
    pub fn lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout = timeout;
        self
    }

    /// Sets the execution bound for one queued session operation.
    #[must_use]
    pub fn queue_item_timeout(mut self, timeout: Duration) -> Self {
        self.queue_item_timeout = timeout;
        self
    }

    /// Sets the autosave interval.
    #[must_use]
    pub fn autosave_interval(mut self, interval: Duration) -> Self {
        self.autosave_interval = interval;
        self
    }

    /// Sets the per-shard serialized-size bound.
    #[must_use]
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Sets the retry policy for the data service.
    #[must_use]
    pub fn data_retry(mut self, policy: RetryPolicy) -> Self {
        self.data_retry = policy;
        self
    }

    /// Sets the retry policy for the coordination map.
    #[must_use]
    pub fn map_retry(mut self, policy: RetryPolicy) -> Self {
        self.map_retry = policy;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MustBePositive`] for zero durations or a zero chunk
    ///   size
    /// - [`ConfigError::InvalidRelation`] when the refresh interval exceeds
    ///   the lease TTL
    /// - [`ConfigError::DuplicateMigration`] when two chain entries share a
    ///   name
    pub fn build(self) -> Result<StoreConfig, ConfigError> {
        fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
            if value.is_zero() {
                return Err(ConfigError::MustBePositive { field, value: format!("{value:?}") });
            }
            Ok(())
        }

        positive("lock_ttl", self.lock_ttl)?;
        positive("lock_refresh_interval", self.lock_refresh_interval)?;
        positive("lock_acquire_timeout", self.lock_acquire_timeout)?;
        positive("queue_item_timeout", self.queue_item_timeout)?;
        positive("autosave_interval", self.autosave_interval)?;
        if self.max_chunk_size == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_chunk_size",
                value: "0".to_string(),
            });
        }
        if self.lock_refresh_interval > self.lock_ttl {
            return Err(ConfigError::InvalidRelation {
                field_a: "lock_refresh_interval",
                value_a: format!("{:?}", self.lock_refresh_interval),
                field_b: "lock_ttl",
                value_b: format!("{:?}", self.lock_ttl),
            });
        }
        if let Some(name) = self.migrations.first_duplicate_name() {
            return Err(ConfigError::DuplicateMigration { name });
        }

        Ok(StoreConfig {
            name: self.name,
            template: self.template,
            schema_check: self.schema_check,
            migrations: self.migrations,
            change_callbacks: self.change_callbacks,
            import_legacy: self.import_legacy,
            lock_ttl: self.lock_ttl,
            lock_refresh_interval: self.lock_refresh_interval,
            lock_acquire_timeout: self.lock_acquire_timeout,
            queue_item_timeout: self.queue_item_timeout,
            autosave_interval: self.autosave_interval,
            max_chunk_size: self.max_chunk_size,
            data_retry: self.data_retry,
            map_retry: self.map_retry,
        })
    }
}
