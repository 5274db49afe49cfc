//! Delivery of forwarded batches to a target.

use async_trait::async_trait;
use lrs_store::Statement;
use reqwest::Client;
use tracing::debug;

use crate::{
    error::{HttpError, Result},
    target::ForwardingTarget,
};

/// Sends one batch to one target, once.
///
/// Retries, timeouts and concurrency are handled by the
/// [`Forwarder`](crate::Forwarder); an implementation performs a single
/// attempt and reports whether the target accepted the batch.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Delivers `statements` to `target`.
    ///
    /// # Errors
    ///
    /// Returns an [`HttpError`] if the request fails or the target answers
    /// with a non-success status.
    async fn deliver(&self, target: &ForwardingTarget, statements: &[Statement]) -> Result<()>;
}

/// [`DeliveryClient`] POSTing JSON arrays with `reqwest`.
///
/// The underlying connection pool is shared by every target.
#[derive(Debug, Clone)]
pub struct HttpDeliveryClient {
    client: Client,
    xapi_version: String,
}

impl HttpDeliveryClient {
    /// Creates a client sending the given `X-Experience-API-Version` header.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Config`] if the TLS backend cannot be initialised.
    pub fn new(xapi_version: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| HttpError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, xapi_version: xapi_version.into() })
    }

    /// Creates a client reusing an existing `reqwest` client.
    #[must_use]
    pub fn with_client(client: Client, xapi_version: impl Into<String>) -> Self {
        Self { client, xapi_version: xapi_version.into() }
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn deliver(&self, target: &ForwardingTarget, statements: &[Statement]) -> Result<()> {
        let mut request = self
            .client
            .post(&target.url)
            .header("X-Experience-API-Version", &self.xapi_version)
            .timeout(target.timeout)
            .json(statements);
        if let Some(credentials) = &target.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response =
            request.send().await.map_err(|e| HttpError::from_reqwest(&target.url, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status { url: target.url.clone(), status, body });
        }
        debug!(url = %target.url, count = statements.len(), "Forwarded statements");
        Ok(())
    }
}
