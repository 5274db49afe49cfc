//! "Already fetched" bookkeeping composed into adapters.
//!
//! Adapters that pull statements from a remote engine can be given an
//! `Arc<dyn FetchHistory>` to skip statements a previous run already
//! retrieved. The history is an injected collaborator rather than a property
//! of the adapter so that the same adapter can run with or without it.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{StoreError, StoreResult},
    statement::StatementId,
};

/// Remembers which statement ids have already been fetched.
#[async_trait]
pub trait FetchHistory: Send + Sync {
    /// Returns `true` if `id` was recorded by an earlier fetch.
    fn has_been_fetched(&self, id: &StatementId) -> bool;

    /// Records that every id in `ids` has been fetched.
    ///
    /// Either all of `ids` are recorded or, on error, none of them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Internal`] if the history cannot be persisted.
    async fn record_fetched_all(&self, ids: &[StatementId]) -> StoreResult<()>;

    /// Records that `id` has been fetched.
    ///
    /// # Errors
    ///
    /// As [`record_fetched_all`](Self::record_fetched_all).
    async fn record_fetched(&self, id: StatementId) -> StoreResult<()> {
        self.record_fetched_all(&[id]).await
    }
}

/// Process-local fetch history.
#[derive(Debug, Default)]
pub struct InMemoryFetchHistory {
    seen: Mutex<HashSet<StatementId>>,
}

impl InMemoryFetchHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[async_trait]
impl FetchHistory for InMemoryFetchHistory {
    fn has_been_fetched(&self, id: &StatementId) -> bool {
        self.seen.lock().contains(id)
    }

    async fn record_fetched_all(&self, ids: &[StatementId]) -> StoreResult<()> {
        self.seen.lock().extend(ids.iter().copied());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryEntry {
    id: StatementId,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FileState {
    entries: Vec<HistoryEntry>,
    seen: HashSet<StatementId>,
}

/// Fetch history persisted as a JSON array in a file.
///
/// The file is read once when the history is opened and rewritten on a
/// blocking thread by every [`record_fetched_all`](FetchHistory::record_fetched_all)
/// that adds new ids. It is created on the first write; a missing file means
/// an empty history. The in-memory view only changes once the file write
/// succeeded.
#[derive(Debug)]
pub struct FileFetchHistory {
    path: PathBuf,
    state: Mutex<FileState>,
    // Serializes rewrites so a slower write never overwrites a newer list.
    persist: tokio::sync::Mutex<()>,
}

impl FileFetchHistory {
    /// Opens the history stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the file exists but is not a
    /// valid history, or [`StoreError::Internal`] if it cannot be read.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries: Vec<HistoryEntry> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::serialization_with_source(
                    format!("invalid fetch history in {}", path.display()),
                    e,
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(StoreError::internal_with_source(
                    format!("failed to read fetch history {}", path.display()),
                    e,
                ));
            },
        };
        let seen = entries.iter().map(|entry| entry.id).collect();
        debug!(path = %path.display(), entries = entries.len(), "Opened fetch history");
        Ok(Self {
            path,
            state: Mutex::new(FileState { entries, seen }),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of recorded ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

#[async_trait]
impl FetchHistory for FileFetchHistory {
    fn has_been_fetched(&self, id: &StatementId) -> bool {
        self.state.lock().seen.contains(id)
    }

    async fn record_fetched_all(&self, ids: &[StatementId]) -> StoreResult<()> {
        let _persisting = self.persist.lock().await;
        let (fresh, encoded) = {
            let state = self.state.lock();
            let now = Utc::now();
            let mut batch = HashSet::with_capacity(ids.len());
            let fresh: Vec<HistoryEntry> = ids
                .iter()
                .filter(|id| !state.seen.contains(*id) && batch.insert(**id))
                .map(|id| HistoryEntry { id: *id, fetched_at: now })
                .collect();
            if fresh.is_empty() {
                return Ok(());
            }
            let combined: Vec<&HistoryEntry> = state.entries.iter().chain(&fresh).collect();
            let encoded = serde_json::to_vec_pretty(&combined).map_err(|e| {
                StoreError::serialization_with_source("failed to encode fetch history", e)
            })?;
            (fresh, encoded)
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || fs::write(path, encoded))
            .await
            .map_err(|e| StoreError::internal_with_source("fetch history write task failed", e))?
            .map_err(|e| {
                StoreError::internal_with_source(
                    format!("failed to write fetch history {}", self.path.display()),
                    e,
                )
            })?;

        let recorded = fresh.len();
        let mut state = self.state.lock();
        for entry in fresh {
            state.seen.insert(entry.id);
            state.entries.push(entry);
        }
        debug!(recorded, total = state.entries.len(), "Persisted fetch history");
        Ok(())
    }
}
