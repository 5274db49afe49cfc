//! Backend adapter trait definition.
//!
//! This module defines the [`BackendAdapter`] trait, the single seam between
//! the statement store and a concrete persistence engine. The paginated
//! reader, the batched writer and the identity resolver are written once
//! against this trait; each engine only has to provide four primitives.
//!
//! # Implementing an Adapter
//!
//! 1. Implement [`BackendAdapter`] for a `Send + Sync` client type.
//! 2. Map engine-specific failures to [`StoreError`](crate::StoreError):
//!    connection problems to `BackendUnavailable`, id collisions to `Conflict`.
//! 3. Run the [`conformance`](crate::conformance) checks against it
//!    (requires the `testutil` feature).
//!
//! See [`MemoryAdapter`](crate::MemoryAdapter) for a reference implementation.

use async_trait::async_trait;

use crate::{
    error::StoreResult,
    health::Health,
    query::{Cursor, Page, StatementQuery},
    statement::{Statement, StatementId},
};

/// Persistence engine seen through the four statement primitives.
///
/// Adapters are shared read-only across concurrent operations
/// (`Arc<dyn BackendAdapter>`), so every method takes `&self`.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`fetch_page`](BackendAdapter::fetch_page) | One page of matching statements plus a continuation cursor |
/// | [`insert_page`](BackendAdapter::insert_page) | Persist one chunk of statements |
/// | [`lookup_by_ids`](BackendAdapter::lookup_by_ids) | Fetch stored statements by id, in one round trip |
/// | [`health_probe`](BackendAdapter::health_probe) | Report engine availability |
///
/// # Example
///
/// ```
/// use lrs_store::{BackendAdapter, MemoryAdapter, Statement, StatementId, StatementQuery};
/// use serde_json::json;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let adapter = MemoryAdapter::new();
/// let id = StatementId::new_v4();
/// let statement = Statement::new(json!({"mbox": "mailto:a@example.com"}), json!({"id": "v"}), json!({"id": "o"}))
///     .with_id(id);
///
/// assert_eq!(adapter.insert_page(vec![statement]).await.unwrap(), 1);
/// let page = adapter.fetch_page(&StatementQuery::default(), None, 10).await.unwrap();
/// assert_eq!(page.statements.len(), 1);
/// assert!(page.more.is_none());
/// # });
/// ```
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short identifier used in logs and health metadata (e.g. `memory`, `lrs`).
    fn name(&self) -> &str;

    /// Fetches one page of statements matching `query`.
    ///
    /// `cursor` is `None` for the first page, otherwise a cursor previously
    /// returned by this adapter. At most `page_size` statements are returned.
    /// `Page::more` is `None` if and only if no further page exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackendUnavailable`](crate::StoreError::BackendUnavailable)
    /// if the engine cannot be reached and
    /// [`StoreError::Serialization`](crate::StoreError::Serialization) for an
    /// unreadable cursor.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn fetch_page(
        &self,
        query: &StatementQuery,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> StoreResult<Page>;

    /// Persists one chunk of statements and returns how many were inserted.
    ///
    /// Every statement carries an id. The chunk is not required to be
    /// atomic with respect to other chunks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`](crate::StoreError::Conflict) if an id is
    /// already stored and
    /// [`StoreError::BackendUnavailable`](crate::StoreError::BackendUnavailable)
    /// if the engine cannot be reached.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn insert_page(&self, statements: Vec<Statement>) -> StoreResult<usize>;

    /// Returns the stored statements whose id is in `ids`, in any order.
    ///
    /// Voided statements are included: identity rules apply to every
    /// accepted statement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackendUnavailable`](crate::StoreError::BackendUnavailable)
    /// if the engine cannot be reached.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn lookup_by_ids(&self, ids: &[StatementId]) -> StoreResult<Vec<Statement>>;

    /// Probes engine availability.
    ///
    /// # Errors
    ///
    /// Adapters should prefer returning [`Health::Unreachable`] over an error;
    /// the store converts any error into `Unreachable` regardless.
    #[must_use = "health probes may fail and errors must be handled"]
    async fn health_probe(&self) -> StoreResult<Health>;
}
