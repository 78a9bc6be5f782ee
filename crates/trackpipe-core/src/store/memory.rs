//! In-memory [`Store`] implementation for tests.
//!
//! Rows live in a `BTreeMap` keyed by track id behind `std::sync::RwLock`.
//! Queries are evaluated directly over the stored rows with the same column
//! names and ordering as the SQLite templates.
//!
//! Commits can be made to fail on purpose with [`InMemoryStore::fail_batch`]
//! so loader retry and partial-failure paths can be exercised without a
//! database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::{Batch, LoadCheckpoint, QueryResult, QueryRow, TrackRow};
use crate::query::{Category, GroupKey, Metric, ValidatedQuery};

use super::{CommitProgress, Store};

/// How often a given batch index should fail to commit.
#[derive(Debug, Clone, Copy)]
enum Fault {
    Times(u32),
    Always,
}

/// In-memory store for tests.
pub struct InMemoryStore {
    tracks: RwLock<BTreeMap<String, TrackRow>>,
    checkpoints: RwLock<HashMap<String, LoadCheckpoint>>,
    faults: RwLock<HashMap<u64, Fault>>,
    commit_attempts: AtomicU64,
    queries_issued: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tracks: RwLock::new(BTreeMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashMap::new()),
            commit_attempts: AtomicU64::new(0),
            queries_issued: AtomicU64::new(0),
        }
    }

    /// Make commits of batch `index` fail: `times` attempts, or forever when
    /// `None`.
    pub fn fail_batch(&self, index: u64, times: Option<u32>) {
        let fault = times.map_or(Fault::Always, Fault::Times);
        self.faults.write().unwrap().insert(index, fault);
    }

    pub fn clear_faults(&self) {
        self.faults.write().unwrap().clear();
    }

    /// Number of `commit_batch` calls, failed ones included.
    pub fn commit_attempts(&self) -> u64 {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    /// Number of `execute_query` calls.
    pub fn queries_issued(&self) -> u64 {
        self.queries_issued.load(Ordering::SeqCst)
    }

    pub fn track(&self, track_id: &str) -> Option<TrackRow> {
        self.tracks.read().unwrap().get(track_id).cloned()
    }

    fn should_fail(&self, index: u64) -> bool {
        let mut faults = self.faults.write().unwrap();
        match faults.get_mut(&index) {
            Some(Fault::Always) => true,
            Some(Fault::Times(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn checkpoint(&self, source_key: &str) -> Result<Option<LoadCheckpoint>> {
        Ok(self.checkpoints.read().unwrap().get(source_key).cloned())
    }

    async fn clear_checkpoint(&self, source_key: &str) -> Result<()> {
        self.checkpoints.write().unwrap().remove(source_key);
        Ok(())
    }

    async fn commit_batch(
        &self,
        source_key: &str,
        batch: &Batch,
        progress: CommitProgress,
    ) -> Result<()> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(batch.index) {
            bail!("injected failure committing batch {}", batch.index);
        }

        let mut tracks = self.tracks.write().unwrap();
        for row in &batch.rows {
            tracks.insert(row.track_id.clone(), row.clone());
        }
        self.checkpoints.write().unwrap().insert(
            source_key.to_string(),
            LoadCheckpoint {
                source_key: source_key.to_string(),
                batch_size: progress.batch_size,
                next_batch: batch.index + 1,
                rows_committed: progress.rows_committed,
                completed: progress.completed,
                updated_at: chrono::Utc::now().timestamp(),
            },
        );
        Ok(())
    }

    async fn row_count(&self) -> Result<u64> {
        Ok(self.tracks.read().unwrap().len() as u64)
    }

    async fn execute_query(&self, query: &ValidatedQuery) -> Result<QueryResult> {
        self.queries_issued.fetch_add(1, Ordering::SeqCst);
        let tracks = self.tracks.read().unwrap();
        let rows: Vec<&TrackRow> = tracks.values().collect();

        let result = match *query {
            ValidatedQuery::TopArtists {
                metric,
                group_by,
                limit,
            } => {
                let mut groups = group(&rows, |r| group_key(r, group_by));
                let mut out: Vec<(String, usize, f64)> = groups
                    .drain()
                    .map(|(key, members)| {
                        let avg = mean(members.iter().map(|r| metric_value(r, metric)));
                        (key, members.len(), avg)
                    })
                    .collect();
                out.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
                out.truncate(limit as usize);
                let avg_column = format!("avg_{}", metric.column());
                out.into_iter()
                    .map(|(key, count, avg)| {
                        row(&[
                            ("group_key", json!(key)),
                            ("track_count", json!(count)),
                            (avg_column.as_str(), json!(avg)),
                        ])
                    })
                    .collect()
            }
            ValidatedQuery::AvgMetricsByCategory { category } => {
                let mut groups = group(&rows, |r| category_value(r, category));
                let mut out: Vec<(String, Vec<&TrackRow>)> = groups.drain().collect();
                out.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
                out.into_iter()
                    .map(|(key, members)| {
                        row(&[
                            ("category", json!(key)),
                            ("track_count", json!(members.len())),
                            (
                                "avg_duration_seconds",
                                json!(mean(members.iter().map(|r| r.duration_seconds as f64))),
                            ),
                            ("avg_popularity", json!(mean(members.iter().map(|r| r.popularity)))),
                            (
                                "avg_danceability",
                                json!(mean(members.iter().map(|r| r.danceability))),
                            ),
                            ("avg_energy", json!(mean(members.iter().map(|r| r.energy)))),
                        ])
                    })
                    .collect()
            }
            ValidatedQuery::SongsFiltered {
                min_popularity,
                min_danceability,
                min_energy,
                limit,
            } => {
                let mut out: Vec<&TrackRow> = rows
                    .iter()
                    .copied()
                    .filter(|r| {
                        r.popularity >= min_popularity
                            && r.danceability >= min_danceability
                            && r.energy >= min_energy
                    })
                    .collect();
                out.sort_by(|a, b| {
                    b.popularity
                        .total_cmp(&a.popularity)
                        .then_with(|| a.track_id.cmp(&b.track_id))
                });
                out.truncate(limit as usize);
                out.into_iter()
                    .map(|r| {
                        row(&[
                            ("track_id", json!(r.track_id)),
                            ("title", json!(r.title)),
                            ("artists", json!(r.artists)),
                            ("popularity", json!(r.popularity)),
                            ("danceability", json!(r.danceability)),
                            ("energy", json!(r.energy)),
                            ("content_label", json!(r.content_label.as_str())),
                        ])
                    })
                    .collect()
            }
            ValidatedQuery::ExplicitVsCleanStats => {
                let mut groups = group(&rows, |r| r.content_label.as_str().to_string());
                let mut out: Vec<(String, Vec<&TrackRow>)> = groups.drain().collect();
                out.sort_by(|a, b| a.0.cmp(&b.0));
                out.into_iter()
                    .map(|(label, members)| {
                        let max = members
                            .iter()
                            .map(|r| r.popularity)
                            .fold(f64::NEG_INFINITY, f64::max);
                        row(&[
                            ("content_label", json!(label)),
                            ("track_count", json!(members.len())),
                            ("avg_popularity", json!(mean(members.iter().map(|r| r.popularity)))),
                            ("max_popularity", json!(max)),
                        ])
                    })
                    .collect()
            }
        };

        Ok(QueryResult { rows: result })
    }
}

fn group<'a>(
    rows: &[&'a TrackRow],
    key: impl Fn(&TrackRow) -> String,
) -> HashMap<String, Vec<&'a TrackRow>> {
    let mut groups: HashMap<String, Vec<&TrackRow>> = HashMap::new();
    for &r in rows {
        groups.entry(key(r)).or_default().push(r);
    }
    groups
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0u64), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn row(columns: &[(&str, Value)]) -> QueryRow {
    columns
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn metric_value(r: &TrackRow, metric: Metric) -> f64 {
    match metric {
        Metric::Popularity => r.popularity,
        Metric::Danceability => r.danceability,
        Metric::Energy => r.energy,
        Metric::DurationSeconds => r.duration_seconds as f64,
    }
}

fn group_key(r: &TrackRow, key: GroupKey) -> String {
    match key {
        GroupKey::Artists => r.artists.clone(),
        GroupKey::Album => r.album.clone(),
        GroupKey::Genre => r.genre.clone(),
    }
}

fn category_value(r: &TrackRow, category: Category) -> String {
    match category {
        Category::PopularityTier => r.popularity_tier.clone(),
        Category::DanceabilityLabel => r.danceability_label.clone(),
        Category::EnergyLabel => r.energy_label.clone(),
        Category::ContentLabel => r.content_label.as_str().to_string(),
        Category::Genre => r.genre.clone(),
    }
}
