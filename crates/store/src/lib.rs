//! Backend-agnostic xAPI statement store.
//!
//! This crate provides the [`BackendAdapter`] trait and the engine-independent
//! machinery built on it: identity and conflict resolution, cursor-following
//! reads with optional prefetch, chunked writes with bounded concurrency, and
//! the [`StatementStore`] façade the statements resource talks to.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Statements resource                        │
//! │             (POST / PUT / GET, heartbeat)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   StatementStore                            │
//! │    write · write_json · put · read · reader · status        │
//! ├───────────────────┬───────────────────┬─────────────────────┤
//! │ IdentityResolver  │  BatchedWriter    │  PaginatedReader    │
//! │ (ids, conflicts)  │ (chunks, bounded  │ (cursors, prefetch) │
//! │                   │  concurrency)     │                     │
//! ├───────────────────┴───────────────────┴─────────────────────┤
//! │                  BackendAdapter trait                       │
//! │   fetch_page · insert_page · lookup_by_ids · health_probe   │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryAdapter│   LrsAdapter (in `lrs-store-http`)           │
//! │  (reference) │   (remote LRS over HTTP)                     │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Accepted statements are handed to an [`AcceptedStatementsSink`]; the
//! forwarder in `lrs-store-http` implements it.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use lrs_store::{MemoryAdapter, StatementQuery, StatementStore, StoreConfig, WriteContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = StatementStore::new(Arc::new(MemoryAdapter::new()), StoreConfig::default())?;
//!
//!     let raw = json!({
//!         "actor": {"mbox": "mailto:learner@example.com"},
//!         "verb": {"id": "http://adlnet.gov/expapi/verbs/completed"},
//!         "object": {"id": "http://example.com/course/42"},
//!     });
//!     let ids = store.write_json(raw.clone(), &WriteContext::new()).await?;
//!     assert_eq!(ids.len(), 1);
//!
//!     let page = store.read(&StatementQuery::default(), None, Some(10)).await?;
//!     assert_eq!(page.statements.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return [`StoreResult<T>`]. [`StoreError::kind`] classifies
//! an error and [`ErrorKind::http_status`] maps it to the status code the
//! statements resource answers with.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (statement fixtures, an instrumented adapter,
//!   assertion macros) and the `conformance` adapter checks. Enable this in `[dev-dependencies]`
//!   for integration tests.
//! - **`failpoints`**: Compiles `fail` injection points into the writer and the memory adapter.

#![deny(unsafe_code)]

pub mod adapter;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod health;
pub mod history;
pub mod identity;
pub mod memory;
pub mod query;
pub mod reader;
pub mod service;
pub mod statement;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod writer;

// Re-export primary types at crate root for convenience
pub use adapter::BackendAdapter;
pub use config::StoreConfig;
pub use error::{BoxError, ConfigError, ErrorKind, StoreError, StoreResult};
pub use health::{Health, HealthMetadata};
pub use history::{FetchHistory, FileFetchHistory, InMemoryFetchHistory};
pub use identity::{ConflictReconciler, Decision, IdentityResolver, Reconciliation, Resolution};
pub use memory::MemoryAdapter;
pub use query::{AgentFilter, Cursor, Page, ResultFormat, StatementQuery};
pub use reader::{PaginatedReader, ReadOptions};
pub use service::{
    AcceptedStatementsSink, StatementPage, StatementStore, WriteContext, WriteOutcome,
};
pub use statement::{
    EquivalencePolicy, LaxValidator, Statement, StatementField, StatementId, StatementValidator,
};
pub use writer::{BatchedWriter, ChunkFailure, WriteOptions, WriteReport};
