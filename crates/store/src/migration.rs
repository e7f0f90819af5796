//! Migration chain.
//!
//! A chain is an append-only, ordered list of named transforms. A record
//! remembers which names have been applied; on load, the remembered list
//! must be a prefix of the configured chain, and the unapplied suffix runs
//! in order. A remembered name that is missing from the chain, or present
//! out of order, is a fatal load error — the record is left untouched
//! rather than migrated down an incompatible path.

use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// The transform half of a migration: old document in, new document out.
pub type MigrationFn = Arc<dyn Fn(Value) -> StoreResult<Value> + Send + Sync>;

/// One named transform in a chain.
#[derive(Clone)]
pub struct Migration {
    name: String,
    apply: MigrationFn,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Migration {
    /// Creates a migration from a name and transform.
    #[must_use]
    pub fn transform(
        name: impl Into<String>,
        apply: impl Fn(Value) -> StoreResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), apply: Arc::new(apply) }
    }

    /// Creates a migration that inserts each of `defaults`' members into
    /// the document unless already present.
    ///
    /// Non-object documents are replaced by `defaults` wholesale.
    ///
    /// # Panics
    ///
    /// Panics if `defaults` is not a JSON object.
    #[must_use]
    pub fn add_fields(name: impl Into<String>, defaults: Value) -> Self {
        let defaults = match defaults {
            Value::Object(map) => map,
            other => panic!("add_fields defaults must be an object, got {other:?}"),
        };
        Self::transform(name, move |doc| {
            let mut map = match doc {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            for (key, value) in &defaults {
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
            Ok(Value::Object(map))
        })
    }

    /// Returns the migration's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The outcome of running the unapplied suffix of a chain.
#[derive(Debug)]
pub(crate) struct Migrated {
    /// The document after all pending transforms.
    pub doc: Value,
    /// The full applied-name list, chain order.
    pub applied: Vec<String>,
    /// Whether any transform actually ran.
    pub changed: bool,
}

/// An ordered, append-only list of named migrations.
#[derive(Clone, Default)]
pub struct MigrationChain {
    entries: Vec<Migration>,
}

impl fmt::Debug for MigrationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationChain").field("names", &self.names()).finish()
    }
}

impl MigrationChain {
    /// Creates a chain from entries in application order.
    #[must_use]
    pub fn new(entries: Vec<Migration>) -> Self {
        Self { entries }
    }

    /// Returns the chain's names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|m| m.name()).collect()
    }

    /// Returns the first name appearing more than once, if any.
    #[must_use]
    pub(crate) fn first_duplicate_name(&self) -> Option<String> {
        let mut seen = std::collections::BTreeSet::new();
        self.entries.iter().find(|m| !seen.insert(m.name())).map(|m| m.name().to_string())
    }

    /// Runs the transforms not yet named in `applied`, in chain order.
    ///
    /// # Errors
    ///
    /// [`StoreError::MigrationMismatch`] when `applied` is not a prefix of
    /// the chain's names; the document is returned untransformed inside the
    /// error path (the caller must not write it back).
    pub(crate) fn apply_pending(&self, doc: Value, applied: &[String]) -> StoreResult<Migrated> {
        if applied.len() > self.entries.len() {
            return Err(StoreError::MigrationMismatch {
                reason: format!(
                    "record lists {} applied migrations but the chain has {}",
                    applied.len(),
                    self.entries.len(),
                ),
            });
        }
        for (position, name) in applied.iter().enumerate() {
            let expected = self.entries[position].name();
            if name != expected {
                return Err(StoreError::MigrationMismatch {
                    reason: format!(
                        "record lists {name:?} at position {position}, chain has {expected:?}",
                    ),
                });
            }
        }

        let mut doc = doc;
        let mut names: Vec<String> = applied.to_vec();
        let pending = &self.entries[applied.len()..];
        let changed = !pending.is_empty();
        for migration in pending {
            tracing::info!(migration = migration.name(), "applying migration");
            doc = (migration.apply)(doc)?;
            names.push(migration.name().to_string());
        }
        Ok(Migrated { doc, applied: names, changed })
    }
}
