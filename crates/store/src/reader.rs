//! Lazy, cursor-following reads over a backend adapter.
//!
//! [`PaginatedReader`] turns [`BackendAdapter::fetch_page`] into a finite
//! sequence of pages (or statements). It stops at the first page without a
//! continuation cursor, or once `max_statements` have been yielded. Page
//! sizes are shrunk to the remaining allowance so the reader never asks the
//! adapter for statements it would have to discard.
//!
//! # Prefetch
//!
//! With `prefetch = 0` (the default) a page is fetched only when the
//! consumer asks for it. With `prefetch = N` a background task keeps up to
//! `N` fetched pages buffered ahead of the consumer in a bounded channel.
//! Pages are always yielded in cursor order. Dropping the reader stops the
//! background task.
//!
//! Any fetch error ends the sequence. Statements already yielded remain
//! valid and [`PaginatedReader::resume_cursor`] points past the last page
//! handed out, so a caller can restart from there.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::{
    adapter::BackendAdapter,
    error::{ConfigError, StoreError, StoreResult},
    query::{Cursor, Page, StatementQuery},
    statement::Statement,
};

/// Default number of statements requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Largest accepted prefetch depth.
pub const MAX_PREFETCH: usize = 8;

/// Options for a paginated read.
///
/// # Validation
///
/// - `page_size` must be `>= 1`
/// - `prefetch` must be `<= MAX_PREFETCH`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadOptions {
    pub(crate) page_size: usize,
    pub(crate) prefetch: usize,
    pub(crate) max_statements: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub(crate) page_timeout: Option<Duration>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE, prefetch: 0, max_statements: None, page_timeout: None }
    }
}

#[bon::bon]
impl ReadOptions {
    /// Creates validated read options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `page_size` is zero or `prefetch` exceeds
    /// [`MAX_PREFETCH`].
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_PAGE_SIZE)] page_size: usize,
        #[builder(default)] prefetch: usize,
        max_statements: Option<usize>,
        page_timeout: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let options = Self { page_size, prefetch, max_statements, page_timeout };
        options.validate()?;
        Ok(options)
    }

    /// Re-checks values that may have bypassed the builder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero `page_size` or an oversized `prefetch`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::require_positive("page_size", self.page_size)?;
        if self.prefetch > MAX_PREFETCH {
            return Err(ConfigError::AboveMaximum {
                field: "prefetch",
                max: MAX_PREFETCH.to_string(),
                value: self.prefetch.to_string(),
            });
        }
        Ok(())
    }

    /// Statements requested per page.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages buffered ahead of the consumer.
    #[must_use]
    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    /// Ceiling on the total number of statements yielded.
    #[must_use]
    pub fn max_statements(&self) -> Option<usize> {
        self.max_statements
    }

    /// Timeout applied to each `fetch_page` call.
    #[must_use]
    pub fn page_timeout(&self) -> Option<Duration> {
        self.page_timeout
    }
}

/// Owns the cursor walk; runs either inline or on the prefetch task.
struct PageFetcher {
    adapter: Arc<dyn BackendAdapter>,
    query: StatementQuery,
    cursor: Option<Cursor>,
    page_size: usize,
    remaining: Option<usize>,
    page_timeout: Option<Duration>,
    fetched: usize,
    exhausted: bool,
}

impl PageFetcher {
    async fn fetch_next(&mut self) -> Option<StoreResult<Page>> {
        if self.exhausted || self.remaining == Some(0) {
            return None;
        }
        let size = self.remaining.map_or(self.page_size, |left| left.min(self.page_size));
        let call = self.adapter.fetch_page(&self.query, self.cursor.as_ref(), size);
        let result = match self.page_timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .unwrap_or_else(|_| Err(StoreError::timeout("fetch_page", after))),
            None => call.await,
        };

        match result {
            Ok(mut page) => {
                self.fetched += 1;
                if let Some(left) = self.remaining.as_mut() {
                    page.statements.truncate(*left);
                    *left -= page.statements.len();
                }
                debug!(
                    page = self.fetched,
                    returned = page.statements.len(),
                    has_more = page.more.is_some(),
                    "Fetched page"
                );
                self.cursor.clone_from(&page.more);
                self.exhausted = page.more.is_none() || self.remaining == Some(0);
                Some(Ok(page))
            },
            Err(error) => {
                warn!(page = self.fetched + 1, error = %error, "Page fetch failed; ending read");
                self.exhausted = true;
                Some(Err(error))
            },
        }
    }
}

enum Source {
    Direct(PageFetcher),
    Idle { fetcher: PageFetcher, depth: usize },
    Prefetching { pages: mpsc::Receiver<StoreResult<Page>>, _stop: DropGuard },
    Finished,
}

/// Lazy, finite sequence of pages read through a [`BackendAdapter`].
pub struct PaginatedReader {
    source: Source,
    buffer: VecDeque<Statement>,
    resume: Option<Cursor>,
    pages_yielded: usize,
}

impl PaginatedReader {
    /// Creates a reader for `query`, starting at `start` (or the beginning).
    ///
    /// Nothing is fetched until the first call to [`next_page`](Self::next_page)
    /// or [`next`](Self::next).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parameter`] if the options are invalid.
    pub fn new(
        adapter: Arc<dyn BackendAdapter>,
        query: StatementQuery,
        start: Option<Cursor>,
        options: &ReadOptions,
    ) -> StoreResult<Self> {
        options.validate()?;
        let fetcher = PageFetcher {
            adapter,
            query,
            cursor: start.clone(),
            page_size: options.page_size,
            remaining: options.max_statements,
            page_timeout: options.page_timeout,
            fetched: 0,
            exhausted: false,
        };
        let source = match options.prefetch {
            0 => Source::Direct(fetcher),
            depth => Source::Idle { fetcher, depth },
        };
        Ok(Self { source, buffer: VecDeque::new(), resume: start, pages_yielded: 0 })
    }

    fn start_prefetch(&mut self) {
        let (mut fetcher, depth) = match std::mem::replace(&mut self.source, Source::Finished) {
            Source::Idle { fetcher, depth } => (fetcher, depth),
            other => {
                self.source = other;
                return;
            },
        };
        let (tx, rx) = mpsc::channel(depth);
        let stop = CancellationToken::new();
        let cancelled = stop.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = cancelled.cancelled() => break,
                    next = fetcher.fetch_next() => next,
                };
                let Some(item) = next else { break };
                let failed = item.is_err();
                let sent = tokio::select! {
                    () = cancelled.cancelled() => false,
                    sent = tx.send(item) => sent.is_ok(),
                };
                if !sent || failed {
                    break;
                }
            }
            debug!(pages = fetcher.fetched, "Prefetch task finished");
        });
        self.source = Source::Prefetching { pages: rx, _stop: stop.drop_guard() };
    }

    /// Returns the next page, or `None` once the sequence has ended.
    ///
    /// After an error is returned the sequence is over.
    pub async fn next_page(&mut self) -> Option<StoreResult<Page>> {
        if matches!(self.source, Source::Idle { .. }) {
            self.start_prefetch();
        }
        let item = match &mut self.source {
            Source::Direct(fetcher) => fetcher.fetch_next().await,
            Source::Prefetching { pages, .. } => pages.recv().await,
            Source::Idle { .. } | Source::Finished => None,
        };
        match &item {
            Some(Ok(page)) => {
                self.resume.clone_from(&page.more);
                self.pages_yielded += 1;
            },
            Some(Err(_)) | None => self.source = Source::Finished,
        }
        item
    }

    /// Returns the next statement, fetching pages as needed.
    pub async fn next(&mut self) -> Option<StoreResult<Statement>> {
        loop {
            if let Some(statement) = self.buffer.pop_front() {
                return Some(Ok(statement));
            }
            match self.next_page().await? {
                Ok(page) => self.buffer.extend(page.statements),
                Err(error) => return Some(Err(error)),
            }
        }
    }

    /// Cursor following the last page handed out.
    ///
    /// Statements of that page still buffered by [`next`](Self::next) are
    /// not covered by the cursor.
    #[must_use]
    pub fn resume_cursor(&self) -> Option<&Cursor> {
        self.resume.as_ref()
    }

    /// Number of pages handed out so far.
    #[must_use]
    pub fn pages_yielded(&self) -> usize {
        self.pages_yielded
    }

    /// Reads every remaining statement.
    ///
    /// # Errors
    ///
    /// Returns the first fetch error; statements read before it are dropped.
    pub async fn collect_all(mut self) -> StoreResult<Vec<Statement>> {
        let mut statements = Vec::new();
        while let Some(statement) = self.next().await {
            statements.push(statement?);
        }
        Ok(statements)
    }

    /// Converts the reader into a stream of statements.
    pub fn into_stream(self) -> impl Stream<Item = StoreResult<Statement>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|item| (item, reader))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::testutil::{InstrumentedAdapter, make_statements};

    async fn seeded(n: usize) -> Arc<InstrumentedAdapter> {
        let adapter = Arc::new(InstrumentedAdapter::new());
        adapter.inner().insert_page(make_statements(n)).await.unwrap();
        adapter
    }

    fn ascending() -> StatementQuery {
        StatementQuery { ascending: true, ..StatementQuery::default() }
    }

    #[test]
    fn test_options_validation() {
        assert!(ReadOptions::builder().page_size(0).build().is_err());
        let err = ReadOptions::builder().prefetch(MAX_PREFETCH + 1).build().unwrap_err();
        assert!(matches!(err, ConfigError::AboveMaximum { field: "prefetch", .. }));
        assert_eq!(ReadOptions::builder().build().unwrap(), ReadOptions::default());
    }

    #[tokio::test]
    async fn test_reads_all_pages_for_every_prefetch_depth() {
        let adapter = seeded(23).await;
        let expected = adapter.inner().fetch_page(&ascending(), None, 100).await.unwrap().statements;

        for prefetch in [0, 1, 2, MAX_PREFETCH] {
            let options = ReadOptions::builder().page_size(5).prefetch(prefetch).build().unwrap();
            let reader = PaginatedReader::new(adapter.clone(), ascending(), None, &options).unwrap();
            let got = reader.collect_all().await.unwrap();
            assert_eq!(got, expected, "prefetch={prefetch}");
        }
    }

    #[tokio::test]
    async fn test_max_statements_truncates_without_over_fetching() {
        let adapter = seeded(20).await;
        let options = ReadOptions::builder().page_size(4).max_statements(6).build().unwrap();
        let mut reader = PaginatedReader::new(adapter.clone(), ascending(), None, &options).unwrap();

        let first = reader.next_page().await.unwrap().unwrap();
        let second = reader.next_page().await.unwrap().unwrap();
        assert_eq!(first.statements.len(), 4);
        assert_eq!(second.statements.len(), 2);
        assert!(reader.next_page().await.is_none());
        assert_eq!(adapter.fetch_calls(), 2);
        assert_eq!(adapter.requested_page_sizes(), vec![4, 2]);
    }

    #[tokio::test]
    async fn test_fetch_error_aborts_sequence() {
        let adapter = seeded(10).await;
        adapter.fail_fetch_call(1);
        let options = ReadOptions::builder().page_size(3).build().unwrap();
        let mut reader = PaginatedReader::new(adapter.clone(), ascending(), None, &options).unwrap();

        assert!(reader.next_page().await.unwrap().is_ok());
        let resume = reader.resume_cursor().cloned();
        assert!(reader.next_page().await.unwrap().is_err());
        assert!(reader.next_page().await.is_none());

        let restarted = PaginatedReader::new(adapter.clone(), ascending(), resume, &options)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(restarted.len(), 7, "restart resumes after the last good page");
    }

    #[tokio::test]
    async fn test_prefetch_error_is_delivered_in_order() {
        let adapter = seeded(10).await;
        adapter.fail_fetch_call(2);
        let options = ReadOptions::builder().page_size(3).prefetch(2).build().unwrap();
        let mut reader = PaginatedReader::new(adapter.clone(), ascending(), None, &options).unwrap();

        assert!(reader.next_page().await.unwrap().is_ok());
        assert!(reader.next_page().await.unwrap().is_ok());
        assert!(reader.next_page().await.unwrap().is_err());
        assert!(reader.next_page().await.is_none());
    }

    #[tokio::test]
    async fn test_page_timeout_surfaces_as_timeout() {
        let adapter = seeded(3).await;
        adapter.set_fetch_delay(Duration::from_millis(200));
        let options = ReadOptions::builder()
            .page_size(2)
            .page_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let mut reader = PaginatedReader::new(adapter, ascending(), None, &options).unwrap();
        let err = reader.next_page().await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::Timeout { operation: "fetch_page", .. }));
    }

    #[tokio::test]
    async fn test_stream_yields_statements() {
        let adapter = seeded(7).await;
        let options = ReadOptions::builder().page_size(3).prefetch(1).build().unwrap();
        let reader = PaginatedReader::new(adapter, ascending(), None, &options).unwrap();
        let statements: Vec<_> = reader.into_stream().collect().await;
        assert_eq!(statements.len(), 7);
        assert!(statements.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_empty_store_yields_single_empty_page() {
        let adapter = Arc::new(InstrumentedAdapter::new());
        let mut reader =
            PaginatedReader::new(adapter, ascending(), None, &ReadOptions::default()).unwrap();
        let page = reader.next_page().await.unwrap().unwrap();
        assert!(page.statements.is_empty());
        assert!(reader.next_page().await.is_none());
    }
}
