//! Error types for the HTTP side of the statement store.
//!
//! [`HttpError`] describes what went wrong talking to a remote LRS or a
//! forwarding target. It converts into the generic
//! [`StoreError`](lrs_store::StoreError) so adapter callers only ever see
//! the core taxonomy.

use std::sync::Arc;

use lrs_store::{StatementId, StoreError};
use reqwest::StatusCode;
use thiserror::Error;

/// Result type alias for HTTP operations.
pub type Result<T> = std::result::Result<T, HttpError>;

/// Errors raised by HTTP requests.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum HttpError {
    /// The request never produced a response (DNS, connect, reset).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },

    /// The request did not complete within its timeout.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The peer answered with a non-success status.
    #[error("{url} answered {status}: {body}")]
    Status { url: String, status: StatusCode, body: String },

    /// The response body could not be decoded.
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },

    /// Configuration or request construction error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl HttpError {
    /// Classifies a `reqwest` error raised while sending to `url`.
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { url: url.to_owned() }
        } else if err.is_decode() {
            Self::Decode { url: url.to_owned(), message: err.to_string() }
        } else {
            Self::Transport { url: url.to_owned(), source: Arc::new(err) }
        }
    }

    /// Returns `true` if the request may succeed when retried.
    ///
    /// Transport failures, timeouts, `429` and `5xx` answers are transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            },
            Self::Decode { .. } | Self::Config(_) => false,
        }
    }

    /// Returns `true` if no response was received at all.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// The HTTP status of the answer, if one was received.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Converts a failed insert into a [`StoreError`].
    ///
    /// A `409` answer becomes [`StoreError::Conflict`] on `first`, the first
    /// statement of the rejected chunk, since the remote does not say which
    /// id collided.
    pub(crate) fn into_insert_error(self, first: Option<StatementId>) -> StoreError {
        if self.status() == Some(StatusCode::CONFLICT)
            && let Some(id) = first
        {
            return StoreError::conflict(id);
        }
        self.into()
    }
}

impl From<HttpError> for StoreError {
    fn from(err: HttpError) -> Self {
        let message = err.to_string();
        if let HttpError::Status { status, body, .. } = &err
            && *status == StatusCode::BAD_REQUEST
        {
            return StoreError::validation(format!("remote LRS rejected the request: {body}"));
        }
        if err.is_transient() {
            return StoreError::backend_unavailable_with_source(message, err);
        }
        if matches!(err, HttpError::Decode { .. }) {
            return StoreError::serialization_with_source(message, err);
        }
        StoreError::internal_with_source(message, err)
    }
}
