//! Retry wrappers for the two backing services.
//!
//! One wrapper per service, sharing a shape: execute the operation; on a
//! transient failure, sleep `base_delay · 2^(attempt-1)` and try again, up
//! to the policy's attempt count; on a non-transient failure, give up
//! immediately. Transience is the service error type's own
//! `is_transient()` — numeric code bands for the data service, message
//! substrings for the coordination map.
//!
//! The coordination-map wrapper additionally accepts a [`CancelHandle`]
//! that short-circuits further attempts, including mid-backoff. The engine
//! wires store close into it so no retry loop outlives the store.
//!
//! Exhaustion surfaces as [`StoreError::BackendTransient`]; a
//! non-transient failure surfaces as [`StoreError::BackendFatal`]. Callers
//! never see the raw service error types.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use datakeep_storage::{DataError, MapError};
use tokio::sync::Notify;

use crate::{
    config::RetryPolicy,
    error::{StoreError, StoreResult},
};

/// A cooperative cancellation handle.
///
/// Cloneable; all clones observe the same flag. Once cancelled, a handle
/// stays cancelled.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// Creates a new, un-cancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the handle, waking every waiter.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` once [`cancel`](CancelHandle::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolves once the handle is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering, so a cancel that raced the
            // registration is not missed.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn backoff(policy: &RetryPolicy, completed_attempt: u32) -> std::time::Duration {
    policy
        .base_delay
        .saturating_mul(1u32.checked_shl(completed_attempt.saturating_sub(1)).unwrap_or(u32::MAX))
}

/// Executes a data-service operation with automatic retry on transient
/// errors.
///
/// Returns the result of the first successful call;
/// [`StoreError::BackendTransient`] when every attempt failed transiently;
/// [`StoreError::BackendFatal`] on the first non-transient failure.
pub(crate) async fn with_data_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DataError>>,
{
    for attempt in 1..=policy.attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "data operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let delay = backoff(policy, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.detail(),
                    "transient data error, retrying after backoff",
                );
                tokio::time::sleep(delay).await;
            },
            Err(err) if err.is_transient() => {
                return Err(StoreError::BackendTransient {
                    attempts: policy.attempts,
                    detail: err.detail(),
                });
            },
            Err(err) => return Err(StoreError::BackendFatal { detail: err.detail() }),
        }
    }

    // Unreachable: the loop always returns on its final attempt.
    Err(StoreError::BackendFatal { detail: "retry loop exited without a result".to_string() })
}

/// Executes a coordination-map operation with automatic retry on transient
/// errors and cancellation support.
///
/// Cancellation short-circuits both in-flight backoff sleeps and further
/// attempts with [`StoreError::Cancelled`]. The operation itself is not
/// interrupted once started.
pub(crate) async fn with_map_retry<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: Option<&CancelHandle>,
    operation_name: &str,
    mut operation: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MapError>>,
{
    for attempt in 1..=policy.attempts {
        if let Some(cancel) = cancel
            && cancel.is_cancelled()
        {
            return Err(StoreError::Cancelled);
        }

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "map operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let delay = backoff(policy, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.detail(),
                    "transient map error, retrying after backoff",
                );
                match cancel {
                    Some(cancel) => {
                        tokio::select! {
                            () = cancel.cancelled() => return Err(StoreError::Cancelled),
                            () = tokio::time::sleep(delay) => {},
                        }
                    },
                    None => tokio::time::sleep(delay).await,
                }
            },
            Err(err) if err.is_transient() => {
                return Err(StoreError::BackendTransient {
                    attempts: policy.attempts,
                    detail: err.detail(),
                });
            },
            Err(err) => return Err(StoreError::BackendFatal { detail: err.detail() }),
        }
    }

    Err(StoreError::BackendFatal { detail: "retry loop exited without a result".to_string() })
}
