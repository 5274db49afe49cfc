//! Store error types and result alias.
//!
//! Every layer of the store (adapters, reader, writer, identity resolution and
//! the façade) reports failures through [`StoreError`]. Adapters map their
//! engine-specific errors onto these variants so callers can make the same
//! retry and status-code decisions whichever engine is configured.
//!
//! # Error Kinds
//!
//! | Variant | [`ErrorKind`] | HTTP | Persisted anything? |
//! |---------|---------------|------|---------------------|
//! | [`StoreError::Validation`] | `Validation` | 400 | no |
//! | [`StoreError::DuplicateInBatch`] | `DuplicateInBatch` | 400 | no |
//! | [`StoreError::Parameter`] | `Parameter` | 400 | no |
//! | [`StoreError::Conflict`] | `Conflict` | 409 | no |
//! | [`StoreError::BackendUnavailable`] | `BackendUnavailable` | 500 | maybe |
//! | [`StoreError::Timeout`] | `BackendUnavailable` | 500 | maybe |
//! | [`StoreError::PartialWrite`] | kind of the chunk failure | 500 | earlier chunks |
//! | [`StoreError::Serialization`] / [`StoreError::Internal`] | `Internal` | 500 | maybe |
//!
//! # Example
//!
//! ```
//! use lrs_store::{ErrorKind, StatementId, StoreError, StoreResult};
//!
//! fn insert(id: StatementId) -> StoreResult<()> {
//!     Err(StoreError::conflict(id))
//! }
//!
//! let err = insert(StatementId::new_v4()).unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Conflict);
//! assert_eq!(err.kind().http_status(), 409);
//! ```

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;

use crate::statement::StatementId;

/// A shared boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading, writing or probing statements.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The submitted record is not a well-formed statement.
    ///
    /// Never retried; the message is surfaced to the caller verbatim.
    #[error("Invalid statement: {message}")]
    Validation {
        /// Description of what is malformed.
        message: String,
    },

    /// Two statements of the same write batch share an identifier.
    ///
    /// The whole batch is rejected and nothing is persisted.
    #[error("Duplicate statement id in batch: {id}")]
    DuplicateInBatch {
        /// The repeated identifier.
        id: StatementId,
    },

    /// A statement with this identifier is already stored with different content.
    #[error("Conflicting statement already stored: {id}")]
    Conflict {
        /// The identifier shared by the stored and submitted statements.
        id: StatementId,
    },

    /// The backend engine could not be reached or refused the operation.
    ///
    /// Transient: eligible for caller-level retry on reads and for the
    /// writer's fail-fast / ignore policy on chunks.
    #[error("Backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the failure.
        message: String,
        /// The underlying error, when one is available.
        #[source]
        source: Option<BoxError>,
    },

    /// A single network call exceeded its own timeout.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        /// The operation that timed out (e.g. `fetch_page`, `insert_page`).
        operation: &'static str,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// An operation was configured with invalid parameters.
    ///
    /// Always raised before any network call is issued.
    #[error("Invalid parameter: {0}")]
    Parameter(#[from] ConfigError),

    /// A chunked write lost at least one chunk after others had been committed.
    ///
    /// Chunks are not transactional: `inserted` statements are durably
    /// stored even though the operation as a whole failed.
    #[error("Write inserted only {inserted} of {requested} statements: {source}")]
    PartialWrite {
        /// Number of statements committed before the failure.
        inserted: usize,
        /// Number of statements the write attempted to insert.
        requested: usize,
        /// The chunk failure that aborted the write.
        #[source]
        source: Arc<StoreError>,
    },

    /// A statement or cursor could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error, when one is available.
        #[source]
        source: Option<BoxError>,
    },

    /// Catch-all for adapter failures that fit no other category.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error, when one is available.
        #[source]
        source: Option<BoxError>,
    },
}

/// Coarse classification of a [`StoreError`], used by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input.
    Validation,
    /// Repeated identifier inside one batch.
    DuplicateInBatch,
    /// Identifier already stored with different content.
    Conflict,
    /// Transient backend or network failure, including timeouts.
    BackendUnavailable,
    /// Invalid operation configuration.
    Parameter,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Returns the HTTP status code the statements resource answers with.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::Validation | Self::DuplicateInBatch | Self::Parameter => 400,
            Self::Conflict => 409,
            Self::BackendUnavailable | Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::DuplicateInBatch => "duplicate_in_batch",
            Self::Conflict => "conflict",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Parameter => "parameter",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl StoreError {
    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a new `DuplicateInBatch` error.
    #[must_use]
    pub fn duplicate_in_batch(id: StatementId) -> Self {
        Self::DuplicateInBatch { id }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict(id: StatementId) -> Self {
        Self::Conflict { id }
    }

    /// Creates a new `BackendUnavailable` error with the given message.
    #[must_use]
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable { message: message.into(), source: None }
    }

    /// Creates a new `BackendUnavailable` error with a message and source error.
    #[must_use]
    pub fn backend_unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendUnavailable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
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

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns the coarse classification of this error.
    ///
    /// A [`PartialWrite`](Self::PartialWrite) reports the kind of the chunk
    /// failure that aborted it.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::DuplicateInBatch { .. } => ErrorKind::DuplicateInBatch,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::BackendUnavailable { .. } | Self::Timeout { .. } => {
                ErrorKind::BackendUnavailable
            },
            Self::Parameter(_) => ErrorKind::Parameter,
            Self::PartialWrite { source, .. } => source.kind(),
            Self::Serialization { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns `true` if retrying the same call may succeed.
    ///
    /// Only connection failures and timeouts are transient. Validation,
    /// identity and parameter errors never change on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BackendUnavailable { .. } | Self::Timeout { .. } => true,
            Self::PartialWrite { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Errors raised while validating configuration values.
///
/// Converted into [`StoreError::Parameter`] when surfaced from an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// The rejected value.
        value: String,
    },

    /// A numeric field is above its allowed maximum.
    #[error("{field} must be at most {max}, got {value}")]
    AboveMaximum {
        /// Name of the offending field.
        field: &'static str,
        /// Largest accepted value.
        max: String,
        /// The rejected value.
        value: String,
    },

    /// A field holds a value that cannot be used.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Checks that `value` is strictly positive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] naming `field` when `value` is zero.
    pub fn require_positive(field: &'static str, value: usize) -> Result<usize, Self> {
        if value == 0 {
            return Err(Self::BelowMinimum { field, min: "1".into(), value: "0".into() });
        }
        Ok(value)
    }
}
