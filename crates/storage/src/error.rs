//! Service error types and result aliases.
//!
//! Each backing service surfaces failures through its own error type, and
//! each carries its own transient-failure classification:
//!
//! - [`DataError`] — errors from the durable data service. The service
//!   reports numeric status codes; codes `301..=306` and `500..=505` are
//!   classified transient.
//! - [`MapError`] — errors from the coordination map. The service reports
//!   free-form messages; a fixed set of substrings marks an error transient.
//!
//! Retry policy lives in the engine crate; this module only answers
//! "is this worth retrying".

use std::{fmt, sync::Arc};

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for data-service operations.
pub type DataResult<T> = Result<T, DataError>;

/// Result type alias for coordination-map operations.
pub type MapResult<T> = Result<T, MapError>;

/// Service codes classified as transient for the data service.
///
/// `503` is included deliberately: the service documents it as "key not
/// found" but in practice emits it under load, so it is retried. Revisit if
/// the service ever starts using 503 for its documented meaning.
const TRANSIENT_DATA_CODES: [std::ops::RangeInclusive<u16>; 2] = [301..=306, 500..=505];

/// Message substrings classified as transient for the coordination map.
const TRANSIENT_MAP_MARKERS: [&str; 6] = [
    "TotalRequestsOverLimit",
    "InternalError",
    "RequestThrottled",
    "PartitionRequestsOverLimit",
    "Throttled",
    "Timeout",
];

/// Errors that can occur during data-service operations.
///
/// Backend implementations map their internal failures to these variants.
/// The `Service` variant carries the numeric status code the service
/// reported; all other variants are client-side failures.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases; downstream match
/// expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DataError {
    /// The service rejected or failed the request with a numeric status
    /// code.
    Service {
        /// The numeric status code reported by the service.
        code: u16,
        /// The service's diagnostic message.
        message: String,
    },

    /// Data could not be encoded for storage or decoded on retrieval.
    Serialization {
        /// Description of the serialization failure.
        message: String,
        /// The underlying error, when one exists.
        #[source]
        source: Option<BoxError>,
    },

    /// A client-side failure that is not attributable to the service.
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying error, when one exists.
        #[source]
        source: Option<BoxError>,
    },
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service { code, .. } => write!(f, "Data service error ({code})"),
            Self::Serialization { .. } => write!(f, "Serialization error"),
            Self::Internal { .. } => write!(f, "Internal error"),
        }
    }
}

impl DataError {
    /// Creates a new `Service` error with the given status code and message.
    #[must_use]
    pub fn service(code: u16, message: impl Into<String>) -> Self {
        Self::Service { code, message: message.into() }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Returns the numeric service code, when the service reported one.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Service { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` if this error is transient and the operation may
    /// succeed on retry.
    ///
    /// Classification is by service code: `301..=306` (per-key throttling
    /// band) and `500..=505` (service-side failure band). Client-side
    /// errors are never transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Service { code, .. } => {
                TRANSIENT_DATA_CODES.iter().any(|range| range.contains(code))
            },
            _ => false,
        }
    }

    /// Returns a detailed diagnostic string for server-side logging.
    ///
    /// Unlike [`Display`], which produces generic messages safe for external
    /// consumers, this includes the service's diagnostic message. Never
    /// expose this output to external callers.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Service { code, message } => format!("Data service error ({code}): {message}"),
            Self::Serialization { message, .. } => format!("Serialization error: {message}"),
            Self::Internal { message, .. } => format!("Internal error: {message}"),
        }
    }
}

/// Errors that can occur during coordination-map operations.
///
/// The map service reports free-form diagnostic messages rather than
/// status codes, so classification is by substring.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases; downstream match
/// expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MapError {
    /// The service rejected or failed the request.
    Service {
        /// The service's diagnostic message.
        message: String,
    },

    /// A client-side failure that is not attributable to the service.
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying error, when one exists.
        #[source]
        source: Option<BoxError>,
    },
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service { .. } => write!(f, "Coordination map error"),
            Self::Internal { .. } => write!(f, "Internal error"),
        }
    }
}

impl MapError {
    /// Creates a new `Service` error with the given message.
    #[must_use]
    pub fn service(message: impl Into<String>) -> Self {
        Self::Service { message: message.into() }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Returns `true` if this error is transient and the operation may
    /// succeed on retry.
    ///
    /// Classification is by message substring against the service's known
    /// throttling and availability markers.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Service { message } => {
                TRANSIENT_MAP_MARKERS.iter().any(|marker| message.contains(marker))
            },
            _ => false,
        }
    }

    /// Returns a detailed diagnostic string for server-side logging.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Service { message } => format!("Coordination map error: {message}"),
            Self::Internal { message, .. } => format!("Internal error: {message}"),
        }
    }
}
