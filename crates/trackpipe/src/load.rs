//! Batch loader: transformed records → store, in whole-batch transactions.
//!
//! A load runs as a small state machine:
//!
//! ```text
//! Idle → EnsuringSchema → Loading(i) → Committing(i) → Loading(i+1) | Completed
//!                                                    ↘ Failed(i)
//! ```
//!
//! Records are grouped by input position into batches of `batch_size`, so
//! batch `i` always holds the same records for the same input. Each batch is
//! coerced into typed rows, then committed through [`Store::commit_batch`],
//! which upserts the rows and advances the source's checkpoint in the same
//! transaction. After any failure the store holds exactly the batches below
//! the reported `next_batch`.
//!
//! # Failure handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Row does not coerce | Row skipped and counted; batch continues |
//! | Commit fails | Retried with exponential backoff; then `Failed(i)` |
//! | Parse or I/O error | Partial batch discarded; `Failed(i)` |
//!
//! # Resumption
//!
//! A later run of the same source starts at the checkpoint's `next_batch`.
//! Earlier batches are read (to find the boundary) but not written, and are
//! counted as `batches_resumed`. `--full` clears the checkpoint first;
//! `--resume-from N` starts at batch `N` regardless of it.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use trackpipe_core::error::RowCoercionError;
use trackpipe_core::features::{parse_percent, parse_score};
use trackpipe_core::models::{Batch, ContentLabel, RawRecord, TrackRow};
use trackpipe_core::sink::{CANONICAL_COLUMNS, DERIVED_COLUMNS};
use trackpipe_core::source::RecordSource;
use trackpipe_core::store::{CommitProgress, Store};
use trackpipe_core::transform::OUTPUT_DELIMITER;

use crate::config::{Config, LoadConfig};
use crate::db;
use crate::object_store::{ObjectRef, ObjectStore};
use crate::sqlite_store::SqliteStore;

/// Retry schedule for failed batch commits.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base × 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Skipped-row samples kept in the result.
    pub skip_samples: usize,
    /// Ignore and clear the source's checkpoint.
    pub full: bool,
    /// Start at this batch index instead of the checkpoint's.
    pub resume_from: Option<u64>,
}

impl LoadOptions {
    pub fn from_config(config: &LoadConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.retry_base_ms),
                max_delay: Duration::from_millis(config.retry_max_ms),
            },
            skip_samples: config.skip_samples,
            full: false,
            resume_from: None,
        }
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::from_config(&LoadConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Completed,
    Failed,
}

/// A row left out of the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub line: u64,
    pub reason: String,
}

/// Outcome of one load invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub source_key: String,
    pub status: LoadStatus,
    pub rows_read: u64,
    pub rows_committed: u64,
    pub rows_skipped: u64,
    /// Skipped rows per reason.
    pub skip_reasons: BTreeMap<String, u64>,
    /// The first skipped rows, up to the configured sample size.
    pub skip_samples: Vec<SkippedRow>,
    pub batches_attempted: u64,
    pub batches_failed: u64,
    pub batches_resumed: u64,
    /// Commit retries across all batches.
    pub retries: u64,
    /// First batch this run wrote (or would have written).
    pub start_batch: u64,
    /// First batch not known to be committed: where the next run resumes.
    pub next_batch: u64,
    /// Cause of a failed load.
    pub error: Option<String>,
}

impl LoadResult {
    fn new(source_key: &str) -> Self {
        Self {
            source_key: source_key.to_string(),
            status: LoadStatus::Completed,
            rows_read: 0,
            rows_committed: 0,
            rows_skipped: 0,
            skip_reasons: BTreeMap::new(),
            skip_samples: Vec::new(),
            batches_attempted: 0,
            batches_failed: 0,
            batches_resumed: 0,
            retries: 0,
            start_batch: 0,
            next_batch: 0,
            error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == LoadStatus::Completed
    }
}

/// A load that could not start.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(
        "checkpoint for '{source_key}' was recorded with batch size {recorded}, not {requested}; \
         rerun with --full or with batch size {recorded}"
    )]
    BatchSizeMismatch {
        source_key: String,
        recorded: u64,
        requested: u64,
    },

    #[error("invalid load options: {0}")]
    InvalidOptions(String),

    #[error("failed to prepare store: {0:#}")]
    Store(anyhow::Error),
}

/// Where a [`BatchLoader`] is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Idle,
    EnsuringSchema,
    Loading(u64),
    Committing(u64),
    Completed,
    Failed(u64),
}

/// Drives one load of one source into a [`Store`].
pub struct BatchLoader<'a, S: Store + ?Sized> {
    store: &'a S,
    options: LoadOptions,
    state: LoaderState,
}

impl<'a, S: Store + ?Sized> BatchLoader<'a, S> {
    pub fn new(store: &'a S, options: LoadOptions) -> Self {
        Self {
            store,
            options,
            state: LoaderState::Idle,
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    fn transition(&mut self, next: LoaderState) {
        debug!(from = ?self.state, to = ?next, "loader state");
        self.state = next;
    }

    /// Load every record of `reader` under `source_key`.
    ///
    /// Returns `Err` only when the load cannot start. Batch and stream
    /// failures produce a [`LoadResult`] with status `Failed`.
    pub async fn load<R: BufRead>(
        &mut self,
        source_key: &str,
        reader: R,
    ) -> Result<LoadResult, LoadError> {
        let batch_size = self.options.batch_size;
        if batch_size == 0 {
            return Err(LoadError::InvalidOptions("batch_size must be > 0".to_string()));
        }

        self.transition(LoaderState::EnsuringSchema);
        self.store.ensure_schema().await.map_err(LoadError::Store)?;

        let (start_batch, mut committed_total) = self.resume_point(source_key).await?;
        let mut result = LoadResult::new(source_key);
        result.start_batch = start_batch;
        result.next_batch = start_batch;
        info!(source = source_key, start_batch, batch_size, "load started");

        let mut records = match RecordSource::with_delimiter(reader, OUTPUT_DELIMITER) {
            Ok(source) => source.peekable(),
            Err(e) => return Ok(self.fail(result, start_batch, e.to_string())),
        };

        let mut index: u64 = 0;
        loop {
            self.transition(LoaderState::Loading(index));
            let writing = index >= start_batch;
            let mut rows = Vec::with_capacity(if writing { batch_size } else { 0 });
            let mut taken = 0;

            while taken < batch_size {
                match records.next() {
                    None => break,
                    Some(Err(e)) => {
                        let failed_at = index.max(start_batch);
                        return Ok(self.fail(result, failed_at, e.to_string()));
                    }
                    Some(Ok(raw)) => {
                        taken += 1;
                        result.rows_read += 1;
                        if !writing {
                            continue;
                        }
                        match coerce(&raw) {
                            Ok(row) => rows.push(row),
                            Err(e) => self.skip(&mut result, e),
                        }
                    }
                }
            }

            if taken == 0 {
                break;
            }
            let last = records.peek().is_none();

            if !writing {
                result.batches_resumed += 1;
                index += 1;
                if last {
                    break;
                }
                continue;
            }

            self.transition(LoaderState::Committing(index));
            let batch = Batch { index, rows };
            let progress = CommitProgress {
                batch_size: batch_size as u64,
                rows_committed: committed_total + batch.rows.len() as u64,
                completed: last,
            };
            result.batches_attempted += 1;
            if let Err(e) = self.commit_with_retry(source_key, &batch, progress, &mut result).await {
                result.batches_failed += 1;
                return Ok(self.fail(result, index, format!("{e:#}")));
            }

            committed_total = progress.rows_committed;
            result.rows_committed += batch.rows.len() as u64;
            index += 1;
            result.next_batch = index;
            debug!(batch = batch.index, rows = batch.rows.len(), "batch committed");
            if last {
                break;
            }
        }

        result.next_batch = result.next_batch.max(index);
        self.transition(LoaderState::Completed);
        info!(
            source = source_key,
            rows_read = result.rows_read,
            rows_committed = result.rows_committed,
            rows_skipped = result.rows_skipped,
            batches = result.batches_attempted,
            resumed = result.batches_resumed,
            "load completed"
        );
        Ok(result)
    }

    /// First batch to write and the rows already committed before it.
    async fn resume_point(&self, source_key: &str) -> Result<(u64, u64), LoadError> {
        if self.options.full {
            self.store
                .clear_checkpoint(source_key)
                .await
                .map_err(LoadError::Store)?;
            return Ok((self.options.resume_from.unwrap_or(0), 0));
        }

        let checkpoint = self
            .store
            .checkpoint(source_key)
            .await
            .map_err(LoadError::Store)?;
        if let Some(from) = self.options.resume_from {
            // Batches from `from` on are rewritten and counted again.
            let committed = checkpoint
                .filter(|cp| from >= cp.next_batch)
                .map_or(0, |cp| cp.rows_committed);
            return Ok((from, committed));
        }
        match checkpoint {
            Some(cp) if cp.batch_size != self.options.batch_size as u64 => {
                Err(LoadError::BatchSizeMismatch {
                    source_key: source_key.to_string(),
                    recorded: cp.batch_size,
                    requested: self.options.batch_size as u64,
                })
            }
            Some(cp) => Ok((cp.next_batch, cp.rows_committed)),
            None => Ok((0, 0)),
        }
    }

    async fn commit_with_retry(
        &self,
        source_key: &str,
        batch: &Batch,
        progress: CommitProgress,
        result: &mut LoadResult,
    ) -> anyhow::Result<()> {
        let retry = self.options.retry;
        let mut attempt = 0;
        loop {
            match self.store.commit_batch(source_key, batch, progress).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retry.max_retries => {
                    attempt += 1;
                    result.retries += 1;
                    let delay = retry.delay(attempt);
                    warn!(
                        batch = batch.index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{e:#}"),
                        "batch commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "batch {} failed after {} attempts",
                        batch.index,
                        attempt + 1
                    )))
                }
            }
        }
    }

    fn skip(&self, result: &mut LoadResult, error: RowCoercionError) {
        warn!(line = error.line, "{}", error);
        result.rows_skipped += 1;
        *result
            .skip_reasons
            .entry(format!("{}: {}", error.column, error.reason))
            .or_insert(0) += 1;
        if result.skip_samples.len() < self.options.skip_samples {
            result.skip_samples.push(SkippedRow {
                line: error.line,
                reason: error.to_string(),
            });
        }
    }

    fn fail(&mut self, mut result: LoadResult, index: u64, error: String) -> LoadResult {
        self.transition(LoaderState::Failed(index));
        warn!(source = %result.source_key, batch = index, error = %error, "load failed");
        result.status = LoadStatus::Failed;
        result.next_batch = index;
        result.error = Some(error);
        result
    }
}

/// Coerce one transformed record into a typed store row.
pub fn coerce(raw: &RawRecord) -> Result<TrackRow, RowCoercionError> {
    let text = |column: &str| raw.get(column).unwrap_or("").trim();
    let reject = |column: &'static str, reason: &'static str| RowCoercionError {
        line: raw.line,
        column,
        value: raw.get(column).unwrap_or("").to_string(),
        reason,
    };

    let track_id = text("track_id");
    if track_id.is_empty() {
        return Err(reject("track_id", "missing track id"));
    }

    let duration_seconds = text("duration_seconds")
        .parse::<i64>()
        .ok()
        .filter(|s| *s >= 0)
        .ok_or_else(|| reject("duration_seconds", "not a non-negative integer"))?;
    let popularity = parse_score(text("popularity"))
        .ok_or_else(|| reject("popularity", "not a finite number"))?;
    let danceability = parse_percent(text("danceability"))
        .ok_or_else(|| reject("danceability", "not a finite number"))?;
    let energy =
        parse_percent(text("energy")).ok_or_else(|| reject("energy", "not a finite number"))?;
    let content_label = ContentLabel::parse(text("content_label"))
        .ok_or_else(|| reject("content_label", "not Explicit or Clean"))?;

    let extra: serde_json::Map<String, Value> = raw
        .iter()
        .filter(|(label, _)| {
            !CANONICAL_COLUMNS.contains(label) && !DERIVED_COLUMNS.contains(label)
        })
        .map(|(label, value)| (label.to_string(), Value::String(value.to_string())))
        .collect();

    Ok(TrackRow {
        track_id: track_id.to_string(),
        title: text("title").to_string(),
        artists: text("artists").to_string(),
        album: text("album").to_string(),
        genre: text("genre").to_string(),
        duration_seconds,
        popularity,
        popularity_tier: text("popularity_tier").to_string(),
        danceability,
        danceability_label: text("danceability_label").to_string(),
        energy,
        energy_label: text("energy_label").to_string(),
        content_label,
        extra_json: Value::Object(extra).to_string(),
    })
}

/// Download `object` and load it into the configured SQLite store.
pub async fn run_load(
    config: &Config,
    objects: Arc<dyn ObjectStore>,
    object: ObjectRef,
    options: LoadOptions,
) -> anyhow::Result<LoadResult> {
    info!(%object, "downloading transformed object");
    let download = object.clone();
    let file = tokio::task::spawn_blocking(move || -> anyhow::Result<std::fs::File> {
        let mut file = tempfile::tempfile()?;
        objects.download(&download, &mut file)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    })
    .await
    .context("download task panicked")??;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let mut loader = BatchLoader::new(&store, options);
    let result = loader.load(&object.to_string(), BufReader::new(file)).await?;
    store.pool().close().await;
    Ok(result)
}
