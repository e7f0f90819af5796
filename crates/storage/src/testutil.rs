//! Shared test utilities for service-contract testing.
//!
//! This module provides common helpers for generating test documents and
//! asserting on service results. It is feature-gated behind `testutil` to
//! prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! datakeep-storage = { path = "../storage", features = ["testutil"] }
//! ```

use serde_json::{Value, json};

/// Creates a small player-shaped document with the given coin count.
///
/// The shape matches the template used throughout the engine tests:
/// `{"coins": n, "inventory": []}`.
#[must_use]
pub fn player_doc(coins: i64) -> Value {
    json!({ "coins": coins, "inventory": [] })
}

/// Creates a document whose serialized form is at least `size` bytes.
///
/// Useful for forcing the sharded path in codec tests without caring about
/// the content.
#[must_use]
pub fn bulky_doc(size: usize) -> Value {
    json!({ "blob": "x".repeat(size) })
}

/// Assert that a result is a transient service error.
///
/// Works with both `DataResult` and `MapResult`.
#[macro_export]
macro_rules! assert_transient {
    ($result:expr) => {
        match &$result {
            Err(err) => {
                assert!(err.is_transient(), "expected a transient error, got: {:?}", err)
            },
            Ok(_) => panic!("expected a transient error, got Ok"),
        }
    };
}
