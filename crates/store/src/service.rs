//! The statement store façade.
//!
//! [`StatementStore`] is what the statements resource talks to. It owns no
//! persistence of its own: it composes an injected [`BackendAdapter`] with
//! identity resolution, chunked writes and cursor reads, and hands accepted
//! statements to an optional [`AcceptedStatementsSink`] (the forwarder).
//!
//! # Write Path
//!
//! ```text
//! submission ─▶ validation ─▶ identity resolution ─▶ enrichment ─▶ chunked insert ─▶ sink
//!                 (400)        (400 duplicate,        (timestamp,     (500 backend)     (never
//!                               409 conflict)          stored,                           fails)
//!                                                      authority)
//! ```
//!
//! Identity and validation failures abort before anything is written.
//! Enrichment happens after resolution, so server-stamped fields never
//! take part in the equivalence check.
//!
//! [`StatementStore::write`] succeeds only when every statement is stored.
//! [`StatementStore::write_outcome`] also returns the per-id accounting of
//! an `ignore_errors` write that lost chunks.

use std::{collections::HashSet, sync::Arc, time::Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    adapter::BackendAdapter,
    config::StoreConfig,
    error::{StoreError, StoreResult},
    health::{Health, HealthMetadata},
    identity::{ConflictReconciler, Decision, IdentityResolver},
    query::{Cursor, StatementQuery},
    reader::{PaginatedReader, ReadOptions},
    statement::{LaxValidator, Statement, StatementId, StatementValidator},
    writer::{BatchedWriter, ChunkFailure, WriteOptions},
};

/// Receives statements after they have been durably accepted.
///
/// Implementations must return promptly: `submit` runs on the write path.
/// Anything slow belongs on the implementation's own worker.
pub trait AcceptedStatementsSink: Send + Sync {
    /// Hands over a batch of newly accepted statements, in input order.
    fn submit(&self, statements: Vec<Statement>);
}

/// Per-request write context.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    /// Authority stamped on statements that do not carry one.
    pub authority: Option<Value>,
    /// Overrides the store's default write options.
    pub options: Option<WriteOptions>,
}

impl WriteContext {
    /// A context with no authority and default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the authority of the calling agent.
    #[must_use]
    pub fn with_authority(mut self, authority: Value) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Overrides write options for this request.
    #[must_use]
    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Per-id accounting of a write.
///
/// Every submitted id lands in exactly one of `accepted`, `already_stored`
/// or `failed`.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Ids inserted by this call, in input order.
    pub accepted: Vec<StatementId>,
    /// Ids already stored with equivalent content, in input order.
    pub already_stored: Vec<StatementId>,
    /// Ids in chunks that failed. None of them was stored by this call.
    pub failed: Vec<StatementId>,
    /// Statements this call tried to insert.
    pub requested: usize,
    /// Statements the backend reported as inserted.
    pub inserted: usize,
    pub failed_chunks: Vec<ChunkFailure>,
}

impl WriteOutcome {
    /// Returns `true` if no chunk failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty()
    }

    /// The accepted ids, or the failure of the first failed chunk.
    ///
    /// The failure is wrapped in [`StoreError::PartialWrite`] when other
    /// chunks were inserted.
    ///
    /// # Errors
    ///
    /// Returns the first chunk failure if the write is not complete.
    pub fn into_result(mut self) -> StoreResult<Vec<StatementId>> {
        if self.failed_chunks.is_empty() {
            return Ok(self.accepted);
        }
        let mut source = self.failed_chunks.swap_remove(0).error;
        if self.inserted == 0 {
            match Arc::try_unwrap(source) {
                Ok(error) => return Err(error),
                Err(shared) => source = shared,
            }
        }
        Err(StoreError::PartialWrite { inserted: self.inserted, requested: self.requested, source })
    }
}

/// Result of a single read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementPage {
    pub statements: Vec<Statement>,
    /// Cursor for the next page; `None` iff no further page exists.
    pub more: Option<Cursor>,
}

/// Statement store service over one backend adapter.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use lrs_store::{MemoryAdapter, Statement, StatementQuery, StatementStore, StoreConfig, WriteContext};
/// use serde_json::json;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = StatementStore::new(Arc::new(MemoryAdapter::new()), StoreConfig::default()).unwrap();
/// let statement = Statement::new(
///     json!({"mbox": "mailto:learner@example.com"}),
///     json!({"id": "http://adlnet.gov/expapi/verbs/completed"}),
///     json!({"id": "http://example.com/course"}),
/// );
///
/// let ids = store.write(vec![statement], &WriteContext::new()).await.unwrap();
/// assert_eq!(ids.len(), 1);
///
/// let page = store.read(&StatementQuery::by_id(ids[0]), None, None).await.unwrap();
/// assert!(page.statements[0].stored.is_some());
/// # });
/// ```
pub struct StatementStore {
    adapter: Arc<dyn BackendAdapter>,
    config: StoreConfig,
    resolver: IdentityResolver,
    validator: Arc<dyn StatementValidator>,
    sink: Option<Arc<dyn AcceptedStatementsSink>>,
}

impl StatementStore {
    /// Creates a store over `adapter`.
    ///
    /// Uses [`LaxValidator`] and no sink until configured otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parameter`] if `config` is invalid.
    pub fn new(adapter: Arc<dyn BackendAdapter>, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        debug!(adapter = adapter.name(), "Created statement store");
        Ok(Self {
            adapter,
            resolver: IdentityResolver::new(config.equivalence().clone()),
            config,
            validator: Arc::new(LaxValidator),
            sink: None,
        })
    }

    /// Replaces the content validator used by [`write_json`](Self::write_json).
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn StatementValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the sink receiving accepted statements.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AcceptedStatementsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The adapter this store writes through.
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    /// The store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Writes one statement or an ordered batch.
    ///
    /// Returns the ids of the statements inserted by this call, in input
    /// order. An id missing from the result was already stored with
    /// equivalent content.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DuplicateInBatch`] or [`StoreError::Conflict`]: nothing was written
    /// - [`StoreError::Parameter`]: invalid write options, nothing was written
    /// - [`StoreError::PartialWrite`]: some chunks were stored, including
    ///   `ignore_errors` writes that lost a chunk
    /// - a backend error: no chunk was stored
    #[tracing::instrument(skip_all, fields(batch = statements.len()))]
    pub async fn write(
        &self,
        statements: Vec<Statement>,
        context: &WriteContext,
    ) -> StoreResult<Vec<StatementId>> {
        self.write_outcome(statements, context).await?.into_result()
    }

    /// Writes like [`write`](Self::write) but reports chunk failures of an
    /// `ignore_errors` write in the outcome instead of as an error.
    ///
    /// Statements of committed chunks are handed to the sink either way.
    ///
    /// # Errors
    ///
    /// As [`write`](Self::write), except that failed chunks of an
    /// `ignore_errors` write show up in [`WriteOutcome::failed_chunks`].
    #[tracing::instrument(skip_all, fields(adapter = self.adapter.name(), batch = statements.len()))]
    pub async fn write_outcome(
        &self,
        statements: Vec<Statement>,
        context: &WriteContext,
    ) -> StoreResult<WriteOutcome> {
        if statements.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let options = context.options.clone().unwrap_or_else(|| self.config.write().clone());
        let writer = BatchedWriter::new(Arc::clone(&self.adapter), options)?;

        let resolution = self.resolver.resolve(self.adapter.as_ref(), statements).await?;
        let mut outcome = WriteOutcome::default();
        let input_order: Vec<StatementId> =
            resolution.decisions.iter().filter_map(Decision::id).collect();
        let now = Utc::now();
        let mut submitted = Vec::with_capacity(resolution.insert_count());
        let mut to_insert = Vec::with_capacity(resolution.insert_count());
        for decision in resolution.decisions {
            let mut statement = match decision {
                Decision::Insert(statement) => statement,
                Decision::AlreadyStored(id) => {
                    outcome.already_stored.push(id);
                    continue;
                },
            };
            if statement.id.is_none() {
                continue;
            }
            submitted.push(statement.clone());
            statement.timestamp.get_or_insert(now);
            statement.stored = Some(now);
            if statement.authority.is_none() {
                statement.authority.clone_from(&context.authority);
            }
            to_insert.push(statement);
        }
        if to_insert.is_empty() {
            debug!("Every statement already stored");
            return Ok(outcome);
        }

        let writer =
            writer.with_reconciler(ConflictReconciler::new(self.resolver.clone(), submitted));
        let forwarded = self.sink.is_some().then(|| to_insert.clone());
        let ids: Vec<StatementId> = to_insert.iter().filter_map(|s| s.id).collect();
        let report = writer.write(to_insert).await?;

        let raced: HashSet<StatementId> = report.already_stored.iter().copied().collect();
        let mut accepted = HashSet::with_capacity(ids.len());
        for (position, id) in ids.iter().enumerate() {
            if report.is_failed(position) {
                outcome.failed.push(*id);
            } else if !raced.contains(id) {
                accepted.insert(*id);
                outcome.accepted.push(*id);
            }
        }
        if !raced.is_empty() {
            let stored: HashSet<StatementId> =
                outcome.already_stored.drain(..).chain(raced).collect();
            outcome.already_stored =
                input_order.into_iter().filter(|id| stored.contains(id)).collect();
        }

        if let (Some(sink), Some(statements)) = (&self.sink, forwarded) {
            let statements: Vec<Statement> = statements
                .into_iter()
                .filter(|statement| statement.id.is_some_and(|id| accepted.contains(&id)))
                .collect();
            if !statements.is_empty() {
                sink.submit(statements);
            }
        }

        outcome.requested = report.requested;
        outcome.inserted = report.inserted;
        outcome.failed_chunks = report.failed_chunks;
        debug!(
            accepted = outcome.accepted.len(),
            already_stored = outcome.already_stored.len(),
            failed = outcome.failed.len(),
            "Write completed"
        );
        Ok(outcome)
    }

    /// Validates raw JSON (one statement object or an array) and writes it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for malformed input, otherwise as
    /// [`write`](Self::write).
    pub async fn write_json(
        &self,
        raw: Value,
        context: &WriteContext,
    ) -> StoreResult<Vec<StatementId>> {
        let records = match raw {
            Value::Array(records) => records,
            record @ Value::Object(_) => vec![record],
            _ => return Err(StoreError::validation("expected a statement object or an array")),
        };
        let statements = records
            .into_iter()
            .map(|record| self.validator.validate(record))
            .collect::<StoreResult<Vec<_>>>()?;
        self.write(statements, context).await
    }

    /// Stores `statement` under `id`.
    ///
    /// Returns `true` if the statement was inserted and `false` if an
    /// equivalent one was already stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if the body carries a different id,
    /// otherwise as [`write`](Self::write).
    pub async fn put(
        &self,
        id: StatementId,
        mut statement: Statement,
        context: &WriteContext,
    ) -> StoreResult<bool> {
        match statement.id {
            Some(body_id) if body_id != id => {
                return Err(StoreError::validation(format!(
                    "statement id {body_id} does not match requested id {id}"
                )));
            },
            _ => statement.id = Some(id),
        }
        let ids = self.write(vec![statement], context).await?;
        Ok(!ids.is_empty())
    }

    /// Reads one page of statements.
    ///
    /// `limit` (or `query.limit` when `None`) is clamped to the configured
    /// maximum; `0` means the maximum.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if the adapter call exceeds the read
    /// timeout, otherwise any adapter error.
    #[tracing::instrument(skip_all, fields(adapter = self.adapter.name()))]
    pub async fn read(
        &self,
        query: &StatementQuery,
        cursor: Option<&Cursor>,
        limit: Option<usize>,
    ) -> StoreResult<StatementPage> {
        let limit = self.config.effective_limit(limit.or(query.limit));
        let after = self.config.read_timeout();
        let page = tokio::time::timeout(after, self.adapter.fetch_page(query, cursor, limit))
            .await
            .map_err(|_| StoreError::timeout("fetch_page", after))??;
        debug!(limit, returned = page.statements.len(), has_more = page.more.is_some(), "Read page");
        Ok(StatementPage { statements: page.statements, more: page.more })
    }

    /// Creates a [`PaginatedReader`] over this store's adapter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parameter`] if the options are invalid.
    pub fn reader(
        &self,
        query: StatementQuery,
        start: Option<Cursor>,
        options: &ReadOptions,
    ) -> StoreResult<PaginatedReader> {
        PaginatedReader::new(Arc::clone(&self.adapter), query, start, options)
    }

    /// Reports backend health.
    ///
    /// Never fails: probe errors and timeouts are reported as
    /// [`Health::Unreachable`].
    pub async fn status(&self) -> Health {
        let start = Instant::now();
        let after = self.config.health_timeout();
        let reason = match tokio::time::timeout(after, self.adapter.health_probe()).await {
            Ok(Ok(health)) => return health,
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("health probe timed out after {}ms", after.as_millis()),
        };
        warn!(adapter = self.adapter.name(), reason = %reason, "Backend unreachable");
        Health::unreachable(HealthMetadata::new(start.elapsed(), self.adapter.name()), reason)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::testutil::{InstrumentedAdapter, ids_of, make_statement, make_statements};

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<Statement>>>,
    }

    impl AcceptedStatementsSink for RecordingSink {
        fn submit(&self, statements: Vec<Statement>) {
            self.batches.lock().push(statements);
        }
    }

    fn store(adapter: Arc<InstrumentedAdapter>) -> StatementStore {
        StatementStore::new(adapter, StoreConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_write_enriches_missing_fields() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let mut statement = make_statement(0);
        statement.id = None;
        let authority = json!({"mbox": "mailto:client@example.com"});

        let ids = store(adapter.clone())
            .write(vec![statement], &WriteContext::new().with_authority(authority.clone()))
            .await
            .unwrap();
        let stored = adapter.inner().get(&ids[0]).unwrap();
        assert!(stored.timestamp.is_some());
        assert!(stored.stored.is_some());
        assert_eq!(stored.authority, Some(authority));
    }

    #[tokio::test]
    async fn test_write_keeps_client_timestamp_and_authority() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let timestamp = "2023-05-01T10:00:00Z".parse().unwrap();
        let mut statement = make_statement(0).with_timestamp(timestamp);
        statement.authority = Some(json!({"mbox": "mailto:original@example.com"}));

        let context = WriteContext::new().with_authority(json!({"mbox": "mailto:other@example.com"}));
        let ids = store(adapter.clone()).write(vec![statement.clone()], &context).await.unwrap();
        let stored = adapter.inner().get(&ids[0]).unwrap();
        assert_eq!(stored.timestamp, Some(timestamp));
        assert_eq!(stored.authority, statement.authority);
    }

    #[tokio::test]
    async fn test_sink_receives_only_inserted_statements() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let sink = Arc::new(RecordingSink::default());
        let store = store(adapter).with_sink(sink.clone());
        let batch = make_statements(2);

        store.write(batch.clone(), &WriteContext::new()).await.unwrap();
        store.write(batch.clone(), &WriteContext::new()).await.unwrap();
        store.write(vec![batch[0].clone(), make_statement(7)], &WriteContext::new()).await.unwrap();

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 2, "no-op write forwards nothing");
        assert_eq!(ids_of(&batches[0]), ids_of(&batch));
        assert_eq!(batches[1].len(), 1);
    }

    #[tokio::test]
    async fn test_ignore_errors_reports_lost_chunks() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let batch = make_statements(4);
        let ids = ids_of(&batch);
        adapter.fail_inserts_containing(ids[1]);
        let options = WriteOptions::builder().chunk_size(2).ignore_errors(true).build().unwrap();
        let context = WriteContext::new().with_options(options);

        let err = store(adapter.clone()).write(batch.clone(), &context).await.unwrap_err();
        let StoreError::PartialWrite { inserted, requested, .. } = err else {
            panic!("expected PartialWrite, got {err:?}");
        };
        assert_eq!((inserted, requested), (2, 4));

        let outcome = store(adapter.clone()).write_outcome(batch, &context).await.unwrap();
        assert!(!outcome.is_complete());
        assert_eq!(outcome.accepted, Vec::<StatementId>::new());
        assert_eq!(outcome.already_stored, vec![ids[2], ids[3]]);
        assert_eq!(outcome.failed, vec![ids[0], ids[1]]);
        assert_eq!((outcome.inserted, outcome.requested), (0, 2));
    }

    #[tokio::test]
    async fn test_ignore_errors_with_nothing_inserted_returns_chunk_error() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let batch = make_statements(2);
        adapter.fail_inserts_containing(batch[0].id.unwrap());
        let options = WriteOptions::builder().chunk_size(2).ignore_errors(true).build().unwrap();

        let err = store(adapter)
            .write(batch, &WriteContext::new().with_options(options))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_sink_skips_failed_chunks() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let sink = Arc::new(RecordingSink::default());
        let batch = make_statements(4);
        adapter.fail_inserts_containing(batch[0].id.unwrap());
        let options = WriteOptions::builder().chunk_size(2).ignore_errors(true).build().unwrap();

        let outcome = store(adapter)
            .with_sink(sink.clone())
            .write_outcome(batch.clone(), &WriteContext::new().with_options(options))
            .await
            .unwrap();
        assert_eq!(outcome.accepted, ids_of(&batch[2..]));
        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(ids_of(&batches[0]), ids_of(&batch[2..]));
    }

    #[tokio::test]
    async fn test_write_json_validates_every_record() {
        let store = store(Arc::new(InstrumentedAdapter::new()));
        let err = store
            .write_json(
                json!([
                    {"actor": {"mbox": "mailto:a@example.com"}, "verb": {"id": "v"}, "object": {"id": "o"}},
                    {"actor": {"mbox": "mailto:b@example.com"}, "object": {"id": "o"}},
                ]),
                &WriteContext::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind().http_status(), 400);

        let ids = store
            .write_json(
                json!({"actor": {"mbox": "mailto:a@example.com"}, "verb": {"id": "v"}, "object": {"id": "o"}}),
                &WriteContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        assert!(store.write_json(json!("statement"), &WriteContext::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_put_checks_body_id() {
        let store = store(Arc::new(InstrumentedAdapter::new()));
        let statement = make_statement(0);
        let err = store
            .put(StatementId::new_v4(), statement.clone(), &WriteContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));

        let id = statement.id.unwrap();
        assert!(store.put(id, statement.clone(), &WriteContext::new()).await.unwrap());
        assert!(!store.put(id, statement, &WriteContext::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_clamps_limit() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let config = StoreConfig::builder().max_read_limit(3).build().unwrap();
        let store = StatementStore::new(adapter.clone(), config).unwrap();
        store.write(make_statements(5), &WriteContext::new()).await.unwrap();

        let page = store.read(&StatementQuery::default(), None, Some(50)).await.unwrap();
        assert_eq!(page.statements.len(), 3);
        let rest = store.read(&StatementQuery::default(), page.more.as_ref(), None).await.unwrap();
        assert_eq!(rest.statements.len(), 2);
        assert!(rest.more.is_none());
        assert_eq!(adapter.requested_page_sizes(), vec![3, 3]);
    }

    #[tokio::test]
    async fn test_status_maps_probe_error_to_unreachable() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let store = store(adapter.clone());
        assert!(store.status().await.is_healthy());

        adapter.set_unreachable(true);
        let health = store.status().await;
        assert!(health.is_unreachable());
        assert_eq!(health.metadata().backend, "instrumented");
    }

    #[tokio::test]
    async fn test_invalid_override_fails_before_any_call() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let options: WriteOptions = serde_json::from_value(json!({"chunk_size": 0})).unwrap();
        let err = store(adapter.clone())
            .write(make_statements(1), &WriteContext::new().with_options(options))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Parameter(_)));
        assert_eq!(adapter.lookup_calls(), 0);
        assert_eq!(adapter.insert_calls(), 0);
    }
}
