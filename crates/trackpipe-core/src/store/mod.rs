//! Storage abstraction for trackpipe.
//!
//! The [`Store`] trait defines the operations the batch loader and the query
//! dispatcher need from a relational backend. Implementations:
//!
//! - `SqliteStore` in the `trackpipe` crate (production, `sqlx`);
//! - [`memory::InMemoryStore`] here, for tests, with fault injection.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Batch, LoadCheckpoint, QueryResult};
use crate::query::ValidatedQuery;

/// Where a committed batch leaves its source's load progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitProgress {
    pub batch_size: u64,
    /// Rows committed for the source including this batch.
    pub rows_committed: u64,
    /// This is the last batch of the source.
    pub completed: bool,
}

/// Abstract storage backend for trackpipe.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_schema`](Store::ensure_schema) | Create tables if absent (idempotent) |
/// | [`checkpoint`](Store::checkpoint) | Read a source's load progress |
/// | [`clear_checkpoint`](Store::clear_checkpoint) | Forget a source's load progress |
/// | [`commit_batch`](Store::commit_batch) | Upsert a batch and advance the checkpoint atomically |
/// | [`row_count`](Store::row_count) | Number of stored tracks |
/// | [`execute_query`](Store::execute_query) | Run a validated analytical query |
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the schema if it does not exist. Safe to call repeatedly.
    async fn ensure_schema(&self) -> Result<()>;

    async fn checkpoint(&self, source_key: &str) -> Result<Option<LoadCheckpoint>>;

    async fn clear_checkpoint(&self, source_key: &str) -> Result<()>;

    /// Upsert every row of `batch` (keyed by track id) and record that the
    /// source's next batch is `batch.index + 1`, in one transaction.
    ///
    /// On error nothing from the batch is visible and the checkpoint is
    /// unchanged.
    async fn commit_batch(
        &self,
        source_key: &str,
        batch: &Batch,
        progress: CommitProgress,
    ) -> Result<()>;

    async fn row_count(&self) -> Result<u64>;

    async fn execute_query(&self, query: &ValidatedQuery) -> Result<QueryResult>;
}
