//! [`BackendAdapter`] over the statements resource of a remote LRS.
//!
//! | Adapter operation | HTTP |
//! |-------------------|------|
//! | `fetch_page` | `GET {statements}?{query}&limit=n`, then the `more` link |
//! | `insert_page` | `POST {statements}` with a JSON array |
//! | `lookup_by_ids` | `GET {statements}?statementId=…` per id, falling back to `voidedStatementId` |
//! | `health_probe` | `GET {heartbeat}` |
//!
//! Reads and lookups are retried on transient failures; inserts are not,
//! the [`BatchedWriter`](lrs_store::BatchedWriter) decides what to do with a
//! failed chunk.

use std::{collections::HashSet, sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use lrs_store::{
    BackendAdapter, ConfigError, Cursor, FetchHistory, Health, HealthMetadata, Page, Statement,
    StatementId, StatementQuery, StoreError, StoreResult,
};
use reqwest::{
    Client, Method, RequestBuilder, StatusCode, Url,
    header::{HeaderMap, HeaderValue},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{config::LrsAdapterConfig, error::HttpError, retry::with_retry};

/// Body of a statements `GET` without a statement id.
#[derive(Debug, Deserialize)]
struct StatementResult {
    statements: Vec<Statement>,
    #[serde(default)]
    more: Option<String>,
}

/// A remote LRS used as the storage engine.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use lrs_store::{StatementStore, StoreConfig};
/// use lrs_store_http::{Credentials, LrsAdapter, LrsAdapterConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = LrsAdapterConfig::builder()
///     .base_url("http://lrs.example.com:8100")
///     .credentials(Credentials::new("ralph", "secret"))
///     .build()?;
/// let store = StatementStore::new(Arc::new(LrsAdapter::new(config)?), StoreConfig::default())?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LrsAdapter {
    client: Client,
    config: LrsAdapterConfig,
    statements_url: Url,
    status_url: Url,
    history: Option<Arc<dyn FetchHistory>>,
}

impl std::fmt::Debug for LrsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LrsAdapter")
            .field("statements_url", &self.statements_url.as_str())
            .field("history", &self.history.is_some())
            .finish_non_exhaustive()
    }
}

impl LrsAdapter {
    /// Creates an adapter for the LRS described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parameter`] if the configuration is invalid and
    /// [`StoreError::Internal`] if the HTTP client cannot be built.
    pub fn new(config: LrsAdapterConfig) -> StoreResult<Self> {
        config.validate()?;
        let mut headers = HeaderMap::new();
        let version = HeaderValue::from_str(&config.xapi_version).map_err(|e| {
            ConfigError::Invalid { field: "xapi_version", reason: e.to_string() }
        })?;
        headers.insert("X-Experience-API-Version", version);
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| StoreError::internal_with_source("cannot build HTTP client", e))?;

        Ok(Self {
            client,
            statements_url: config.statements_url()?,
            status_url: config.status_url()?,
            config,
            history: None,
        })
    }

    /// Skips statements already recorded in `history` when fetching, and
    /// records every statement returned.
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn FetchHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// The adapter configuration.
    #[must_use]
    pub fn config(&self) -> &LrsAdapterConfig {
        &self.config
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.config.credentials {
            Some(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            },
            None => request,
        }
    }

    /// Sends a `GET` and decodes the JSON body. `404` yields `None`.
    async fn get_json(&self, url: Url) -> Result<Option<Value>, HttpError> {
        let target = url.to_string();
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|e| HttpError::from_reqwest(&target, e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status { url: target, status, body });
        }
        let body = response.json::<Value>().await.map_err(|e| HttpError::Decode {
            url: target.clone(),
            message: e.to_string(),
        })?;
        Ok(Some(body))
    }

    fn decode<T: serde::de::DeserializeOwned>(url: &Url, body: Value) -> StoreResult<T> {
        serde_json::from_value(body).map_err(|e| {
            HttpError::Decode { url: url.to_string(), message: e.to_string() }.into()
        })
    }

    async fn fetch_once(&self, url: &Url, single: bool) -> StoreResult<Page> {
        let Some(body) = self.get_json(url.clone()).await? else {
            return Ok(Page::default());
        };
        if single {
            return Ok(Page::last(vec![Self::decode::<Statement>(url, body)?]));
        }
        let result = Self::decode::<StatementResult>(url, body)?;
        let more = result
            .more
            .filter(|link| !link.trim().is_empty())
            .map(Cursor::new);
        Ok(Page { statements: result.statements, more })
    }

    /// Drops statements already in the fetch history and records the rest,
    /// once for the whole page.
    async fn apply_history(&self, page: Page) -> StoreResult<Page> {
        let Some(history) = &self.history else {
            return Ok(page);
        };
        let total = page.statements.len();
        let mut fresh = Vec::with_capacity(total);
        let mut recorded = Vec::with_capacity(total);
        let mut in_page = HashSet::with_capacity(total);
        for statement in page.statements {
            if let Some(id) = statement.id {
                if history.has_been_fetched(&id) || !in_page.insert(id) {
                    continue;
                }
                recorded.push(id);
            }
            fresh.push(statement);
        }
        if !recorded.is_empty() {
            history.record_fetched_all(&recorded).await?;
        }
        if fresh.len() < total {
            debug!(skipped = total - fresh.len(), "Skipped previously fetched statements");
        }
        Ok(Page { statements: fresh, more: page.more })
    }

    async fn get_statement(
        &self,
        parameter: &str,
        id: StatementId,
    ) -> StoreResult<Option<Statement>> {
        let mut url = self.statements_url.clone();
        url.query_pairs_mut().append_pair(parameter, &id.to_string());
        let target = &url;
        let body = with_retry(&self.config.retry, "lookup_by_ids", move || async move {
            self.get_json(target.clone()).await.map_err(StoreError::from)
        })
        .await?;
        body.map(|body| Self::decode::<Statement>(&url, body)).transpose()
    }

    async fn lookup_one(&self, id: StatementId) -> StoreResult<Option<Statement>> {
        if let Some(statement) = self.get_statement("statementId", id).await? {
            return Ok(Some(statement));
        }
        self.get_statement("voidedStatementId", id).await
    }
}

#[async_trait]
impl BackendAdapter for LrsAdapter {
    fn name(&self) -> &str {
        "lrs"
    }

    #[tracing::instrument(skip_all, fields(page_size = page_size, resumed = cursor.is_some()))]
    async fn fetch_page(
        &self,
        query: &StatementQuery,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> StoreResult<Page> {
        ConfigError::require_positive("page_size", page_size)?;
        let single = cursor.is_none()
            && (query.statement_id.is_some() || query.voided_statement_id.is_some());
        let url = match cursor {
            Some(cursor) => self.statements_url.join(cursor.as_str()).map_err(|e| {
                StoreError::validation(format!("invalid continuation cursor '{cursor}': {e}"))
            })?,
            None => {
                let mut url = self.statements_url.clone();
                {
                    let mut pairs = url.query_pairs_mut();
                    for (name, value) in query.to_xapi_params() {
                        pairs.append_pair(name, &value);
                    }
                    if !single {
                        pairs.append_pair("limit", &page_size.to_string());
                    }
                }
                url
            },
        };

        let target = &url;
        let page =
            with_retry(&self.config.retry, "fetch_page", move || self.fetch_once(target, single))
                .await?;
        debug!(
            returned = page.statements.len(),
            has_more = page.more.is_some(),
            "Fetched page from remote LRS"
        );
        self.apply_history(page).await
    }

    #[tracing::instrument(skip_all, fields(count = statements.len()))]
    async fn insert_page(&self, statements: Vec<Statement>) -> StoreResult<usize> {
        if statements.is_empty() {
            return Ok(0);
        }
        let first = statements.first().and_then(|s| s.id);
        let target = self.statements_url.to_string();
        let response = self
            .request(Method::POST, self.statements_url.clone())
            .json(&statements)
            .send()
            .await
            .map_err(|e| HttpError::from_reqwest(&target, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = HttpError::Status { url: target, status, body };
            warn!(status = %status, "Remote LRS rejected statements");
            return Err(err.into_insert_error(first));
        }
        debug!("Posted statements to remote LRS");
        Ok(statements.len())
    }

    #[tracing::instrument(skip_all, fields(count = ids.len()))]
    async fn lookup_by_ids(&self, ids: &[StatementId]) -> StoreResult<Vec<Statement>> {
        let found: Vec<Option<Statement>> = stream::iter(ids.iter().copied())
            .map(|id| self.lookup_one(id))
            .buffered(self.config.lookup_concurrency)
            .try_collect()
            .await?;
        Ok(found.into_iter().flatten().collect())
    }

    async fn health_probe(&self) -> StoreResult<Health> {
        let start = Instant::now();
        let target = self.status_url.to_string();
        let outcome = self.request(Method::GET, self.status_url.clone()).send().await;
        let metadata = |start: Instant| {
            HealthMetadata::new(start.elapsed(), self.name()).with_detail("url", target.clone())
        };
        let health = match outcome {
            Ok(response) if response.status().is_success() => Health::healthy(metadata(start)),
            Ok(response) => {
                let status = response.status();
                warn!(status = %status, "Remote LRS heartbeat answered with an error");
                Health::degraded(metadata(start), format!("heartbeat answered {status}"))
            },
            Err(err) => {
                let err = HttpError::from_reqwest(&target, err);
                warn!(error = %err, "Remote LRS unreachable");
                Health::unreachable(metadata(start), err.to_string())
            },
        };
        Ok(health)
    }
}
