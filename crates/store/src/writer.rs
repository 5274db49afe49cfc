//! Chunked, bounded-concurrency statement writes.
//!
//! [`BatchedWriter`] splits a list of statements into chunks of
//! `chunk_size` and hands each chunk to
//! [`BackendAdapter::insert_page`]. Up to `concurrency` chunks are in flight
//! at once; the default of one writes sequentially.
//!
//! # Failure Policy
//!
//! Chunks are not transactional with respect to each other. By default the
//! writer is fail-fast: after the first chunk failure no further chunk is
//! started, in-flight chunks are awaited, and the call fails with
//! [`StoreError::PartialWrite`] reporting how many statements were committed.
//! With `ignore_errors` every chunk is attempted and failures are recorded in
//! the [`WriteReport`].
//!
//! With a [`ConflictReconciler`], a chunk rejected because a concurrent
//! writer stored one of its ids is re-checked: equivalent copies are
//! reported in [`WriteReport::already_stored`] and the rest of the chunk is
//! inserted again.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use lrs_store::{BatchedWriter, MemoryAdapter, Statement, StatementId, WriteOptions};
//! use serde_json::json;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let options = WriteOptions::builder().chunk_size(2).concurrency(2).build().unwrap();
//! let writer = BatchedWriter::new(Arc::new(MemoryAdapter::new()), options).unwrap();
//!
//! let statements: Vec<_> = (0..5)
//!     .map(|n| {
//!         Statement::new(json!({"mbox": format!("mailto:{n}@example.com")}), json!({"id": "v"}), json!({"id": "o"}))
//!             .with_id(StatementId::new_v4())
//!     })
//!     .collect();
//!
//! let report = writer.write(statements).await.unwrap();
//! assert_eq!(report.inserted, 5);
//! assert_eq!(report.chunks, 3);
//! # });
//! ```

use std::{
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use fail::fail_point;
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, warn};

use crate::{
    adapter::BackendAdapter,
    error::{ConfigError, StoreError, StoreResult},
    identity::ConflictReconciler,
    statement::{Statement, StatementId},
};

/// Default number of statements per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default number of chunks in flight.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Reconcile-and-retry rounds for one chunk before its conflict is final.
const MAX_RECONCILE_ROUNDS: usize = 3;

/// Options for a chunked write.
///
/// # Validation
///
/// - `chunk_size` must be `>= 1`
/// - `concurrency` must be `>= 1`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriteOptions {
    pub(crate) chunk_size: usize,
    pub(crate) concurrency: usize,
    pub(crate) ignore_errors: bool,
    #[serde(with = "humantime_serde")]
    pub(crate) chunk_timeout: Option<Duration>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            ignore_errors: false,
            chunk_timeout: None,
        }
    }
}

#[bon::bon]
impl WriteOptions {
    /// Creates validated write options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `chunk_size` or `concurrency` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CHUNK_SIZE)] chunk_size: usize,
        #[builder(default = DEFAULT_CONCURRENCY)] concurrency: usize,
        #[builder(default)] ignore_errors: bool,
        chunk_timeout: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let options = Self { chunk_size, concurrency, ignore_errors, chunk_timeout };
        options.validate()?;
        Ok(options)
    }

    /// Re-checks values that may have bypassed the builder (e.g. via serde).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] for a zero `chunk_size` or `concurrency`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_positive("chunk_size", self.chunk_size)?;
        ConfigError::require_positive("concurrency", self.concurrency)?;
        if self.chunk_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid {
                field: "chunk_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Statements per chunk.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Maximum chunks in flight.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Whether chunk failures are recorded instead of aborting the write.
    #[must_use]
    pub fn ignore_errors(&self) -> bool {
        self.ignore_errors
    }

    /// Timeout applied to each `insert_page` call.
    #[must_use]
    pub fn chunk_timeout(&self) -> Option<Duration> {
        self.chunk_timeout
    }
}

/// A chunk that failed to insert.
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    /// Zero-based chunk index.
    pub index: usize,
    /// Positions of the chunk's statements in the submitted list.
    pub range: Range<usize>,
    pub error: Arc<StoreError>,
}

/// Outcome of a chunked write.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    /// Number of statements submitted.
    pub requested: usize,
    /// Number of statements the adapter reported as inserted.
    pub inserted: usize,
    /// Ids a concurrent writer stored first with equivalent content, in
    /// chunk order. Only filled when a [`ConflictReconciler`] is set.
    pub already_stored: Vec<StatementId>,
    /// Number of chunks the input was split into.
    pub chunks: usize,
    /// Failed chunks ordered by index. Empty unless `ignore_errors` is set.
    pub failed_chunks: Vec<ChunkFailure>,
    pub duration: Duration,
}

impl WriteReport {
    /// Returns `true` if every chunk was inserted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty()
    }

    /// Returns `true` if the statement at `position` belongs to a failed chunk.
    #[must_use]
    pub fn is_failed(&self, position: usize) -> bool {
        self.failed_chunks.iter().any(|failure| failure.range.contains(&position))
    }
}

/// What one chunk task produced.
#[derive(Debug, Default)]
struct ChunkInsert {
    inserted: usize,
    already_stored: Vec<StatementId>,
}

type ChunkOutput = (usize, Range<usize>, StoreResult<ChunkInsert>);

/// Splits `statements` into owned chunks of at most `chunk_size`, keeping their positions.
fn split_into_chunks(
    statements: Vec<Statement>,
    chunk_size: usize,
) -> Vec<(Range<usize>, Vec<Statement>)> {
    let mut chunks = Vec::with_capacity(statements.len().div_ceil(chunk_size));
    let mut current = Vec::with_capacity(chunk_size.min(statements.len()));
    let mut start = 0;
    for (position, statement) in statements.into_iter().enumerate() {
        current.push(statement);
        if current.len() == chunk_size {
            chunks.push((start..position + 1, std::mem::take(&mut current)));
            start = position + 1;
        }
    }
    if !current.is_empty() {
        let end = start + current.len();
        chunks.push((start..end, current));
    }
    chunks
}

/// Writes statements through an adapter in bounded-concurrency chunks.
#[derive(Clone)]
pub struct BatchedWriter {
    adapter: Arc<dyn BackendAdapter>,
    options: WriteOptions,
    reconciler: Option<ConflictReconciler>,
}

impl BatchedWriter {
    /// Creates a writer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parameter`] if the options are invalid.
    pub fn new(adapter: Arc<dyn BackendAdapter>, options: WriteOptions) -> StoreResult<Self> {
        options.validate()?;
        Ok(Self { adapter, options, reconciler: None })
    }

    /// Re-checks chunks rejected with [`StoreError::Conflict`] instead of
    /// failing them outright.
    #[must_use]
    pub fn with_reconciler(mut self, reconciler: ConflictReconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// The options this writer was built with.
    #[must_use]
    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    /// Inserts `statements` chunk by chunk.
    ///
    /// Every statement must already carry an id.
    ///
    /// # Errors
    ///
    /// Without `ignore_errors`, the first chunk failure aborts the write. If
    /// nothing was committed the chunk's error is returned as-is, otherwise
    /// [`StoreError::PartialWrite`] carries the committed count.
    #[tracing::instrument(
        skip_all,
        fields(
            adapter = self.adapter.name(),
            requested = statements.len(),
            chunk_size = self.options.chunk_size,
            concurrency = self.options.concurrency,
        )
    )]
    pub async fn write(&self, statements: Vec<Statement>) -> StoreResult<WriteReport> {
        let start = Instant::now();
        let requested = statements.len();
        let chunks = split_into_chunks(statements, self.options.chunk_size);
        let total_chunks = chunks.len();

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        // Set by a failing chunk before it releases its permit, so the next
        // acquire observes it even if the task output is not joinable yet.
        let failed = Arc::new(AtomicBool::new(false));
        let mut in_flight: JoinSet<ChunkOutput> = JoinSet::new();
        let mut inserted = 0;
        let mut already_stored = Vec::new();
        let mut failures: Vec<(usize, Range<usize>, StoreError)> = Vec::new();

        for (index, (range, chunk)) in chunks.into_iter().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| StoreError::internal_with_source("chunk semaphore closed", e))?;

            while let Some(joined) = in_flight.try_join_next() {
                self.record(joined, &mut inserted, &mut already_stored, &mut failures);
            }
            if !self.options.ignore_errors
                && (failed.load(Ordering::Acquire) || !failures.is_empty())
            {
                debug!(index, "Not starting chunk after earlier failure");
                break;
            }

            debug!(index, size = chunk.len(), "Inserting chunk");
            let adapter = Arc::clone(&self.adapter);
            let reconciler = self.reconciler.clone();
            let timeout = self.options.chunk_timeout;
            let failed = Arc::clone(&failed);
            in_flight.spawn(async move {
                let result =
                    insert_chunk(adapter.as_ref(), reconciler.as_ref(), chunk, timeout).await;
                if result.is_err() {
                    failed.store(true, Ordering::Release);
                }
                drop(permit);
                (index, range, result)
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            self.record(joined, &mut inserted, &mut already_stored, &mut failures);
        }
        already_stored.sort_by_key(|(index, _)| *index);
        let already_stored: Vec<StatementId> =
            already_stored.into_iter().flat_map(|(_, ids)| ids).collect();

        failures.sort_by_key(|(index, ..)| *index);
        let duration = start.elapsed();

        if !self.options.ignore_errors && !failures.is_empty() {
            let (index, _, error) = failures.swap_remove(0);
            warn!(index, inserted, requested, error = %error, "Chunked write aborted");
            if inserted == 0 {
                return Err(error);
            }
            return Err(StoreError::PartialWrite { inserted, requested, source: Arc::new(error) });
        }

        let failed_chunks: Vec<ChunkFailure> = failures
            .into_iter()
            .map(|(index, range, error)| ChunkFailure { index, range, error: Arc::new(error) })
            .collect();
        if !failed_chunks.is_empty() {
            warn!(
                failed = failed_chunks.len(),
                inserted,
                requested,
                "Chunked write completed with ignored failures"
            );
        }
        debug!(
            inserted,
            chunks = total_chunks,
            duration_ms = duration.as_millis() as u64,
            "Chunked write completed"
        );

        Ok(WriteReport {
            requested,
            inserted,
            already_stored,
            chunks: total_chunks,
            failed_chunks,
            duration,
        })
    }

    fn record(
        &self,
        joined: Result<ChunkOutput, tokio::task::JoinError>,
        inserted: &mut usize,
        already_stored: &mut Vec<(usize, Vec<StatementId>)>,
        failures: &mut Vec<(usize, Range<usize>, StoreError)>,
    ) {
        match joined {
            Ok((index, _, Ok(chunk))) => {
                *inserted += chunk.inserted;
                if !chunk.already_stored.is_empty() {
                    already_stored.push((index, chunk.already_stored));
                }
            },
            Ok((index, range, Err(error))) => {
                warn!(index, error = %error, ignore = self.options.ignore_errors, "Chunk insert failed");
                failures.push((index, range, error));
            },
            Err(join_error) => {
                // The chunk's position is lost with a panicked task; report it last.
                warn!(error = %join_error, "Chunk task failed");
                failures.push((
                    usize::MAX,
                    0..0,
                    StoreError::internal_with_source("chunk task failed", join_error),
                ));
            },
        }
    }
}

async fn insert_chunk(
    adapter: &dyn BackendAdapter,
    reconciler: Option<&ConflictReconciler>,
    chunk: Vec<Statement>,
    timeout: Option<Duration>,
) -> StoreResult<ChunkInsert> {
    fail_point!("writer-before-insert-chunk", |_| {
        Err(StoreError::backend_unavailable("injected failure before chunk insert"))
    });
    let attempt = insert_reconciling(adapter, reconciler, chunk);
    match timeout {
        Some(after) => tokio::time::timeout(after, attempt)
            .await
            .unwrap_or_else(|_| Err(StoreError::timeout("insert_page", after))),
        None => attempt.await,
    }
}

/// Inserts `chunk`, re-checking it after a `Conflict` when a reconciler is set.
async fn insert_reconciling(
    adapter: &dyn BackendAdapter,
    reconciler: Option<&ConflictReconciler>,
    mut chunk: Vec<Statement>,
) -> StoreResult<ChunkInsert> {
    let mut already_stored = Vec::new();
    let mut rounds = 0;
    loop {
        let Some(reconciler) = reconciler else {
            let inserted = adapter.insert_page(chunk).await?;
            return Ok(ChunkInsert { inserted, already_stored });
        };
        let error = match adapter.insert_page(chunk.clone()).await {
            Ok(inserted) => return Ok(ChunkInsert { inserted, already_stored }),
            Err(error) => error,
        };
        if !matches!(error, StoreError::Conflict { .. }) || rounds == MAX_RECONCILE_ROUNDS {
            return Err(error);
        }
        rounds += 1;
        debug!(round = rounds, error = %error, "Chunk collided with a stored id; reconciling");

        let reconciliation = reconciler.reconcile(adapter, chunk).await?;
        already_stored.extend(reconciliation.already_stored);
        if reconciliation.remaining.is_empty() {
            return Ok(ChunkInsert { inserted: 0, already_stored });
        }
        chunk = reconciliation.remaining;
    }
}
