//! SQLite-backed [`Store`] implementation.
//!
//! Each batch is written with one multi-row `INSERT … ON CONFLICT(track_id)
//! DO UPDATE` plus the checkpoint upsert, inside one transaction. The
//! transaction is a scoped `sqlx::Transaction`: any early return drops it
//! uncommitted, which rolls the batch back.
//!
//! Analytical queries are fixed templates. Column names are spliced in only
//! from the closed enums of [`trackpipe_core::query`]; values are bound.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, QueryBuilder, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};

use trackpipe_core::models::{Batch, LoadCheckpoint, QueryResult, QueryRow};
use trackpipe_core::query::ValidatedQuery;
use trackpipe_core::store::{CommitProgress, Store};

use crate::migrate;

const UPSERT_TRACKS: &str = "INSERT INTO tracks (track_id, title, artists, album, genre, \
     duration_seconds, popularity, popularity_tier, danceability, danceability_label, \
     energy, energy_label, content_label, extra_json, source_key, loaded_at) ";

const ON_CONFLICT_TRACKS: &str = " ON CONFLICT(track_id) DO UPDATE SET
    title = excluded.title,
    artists = excluded.artists,
    album = excluded.album,
    genre = excluded.genre,
    duration_seconds = excluded.duration_seconds,
    popularity = excluded.popularity,
    popularity_tier = excluded.popularity_tier,
    danceability = excluded.danceability,
    danceability_label = excluded.danceability_label,
    energy = excluded.energy,
    energy_label = excluded.energy_label,
    content_label = excluded.content_label,
    extra_json = excluded.extra_json,
    source_key = excluded.source_key,
    loaded_at = excluded.loaded_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// All load checkpoints, most recently updated first.
    pub async fn checkpoints(&self) -> Result<Vec<LoadCheckpoint>> {
        let rows = sqlx::query(
            "SELECT source_key, batch_size, next_batch, rows_committed, completed, updated_at
             FROM load_checkpoints ORDER BY updated_at DESC, source_key",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<LoadCheckpoint> {
    Ok(LoadCheckpoint {
        source_key: row.try_get("source_key")?,
        batch_size: row.try_get::<i64, _>("batch_size")? as u64,
        next_batch: row.try_get::<i64, _>("next_batch")? as u64,
        rows_committed: row.try_get::<i64, _>("rows_committed")? as u64,
        completed: row.try_get::<i64, _>("completed")? != 0,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Convert a result row to JSON, keeping column order.
fn row_to_json(row: &SqliteRow) -> Result<QueryRow> {
    let mut out = QueryRow::new();
    for column in row.columns() {
        let i = column.ordinal();
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => json!(row.try_get::<i64, _>(i)?),
                "REAL" => json!(row.try_get::<f64, _>(i)?),
                _ => json!(row.try_get::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Build the statement for a validated query.
fn build_query(query: &ValidatedQuery) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new("");
    match *query {
        ValidatedQuery::TopArtists {
            metric,
            group_by,
            limit,
        } => {
            let metric = metric.column();
            let group = group_by.column();
            qb.push(format!(
                "SELECT {group} AS group_key, COUNT(*) AS track_count, AVG({metric}) AS avg_{metric}
                 FROM tracks GROUP BY {group}
                 ORDER BY avg_{metric} DESC, group_key ASC LIMIT "
            ));
            qb.push_bind(i64::from(limit));
        }
        ValidatedQuery::AvgMetricsByCategory { category } => {
            let category = category.column();
            qb.push(format!(
                "SELECT {category} AS category, COUNT(*) AS track_count,
                        AVG(duration_seconds) AS avg_duration_seconds,
                        AVG(popularity) AS avg_popularity,
                        AVG(danceability) AS avg_danceability,
                        AVG(energy) AS avg_energy
                 FROM tracks GROUP BY {category}
                 ORDER BY track_count DESC, category ASC"
            ));
        }
        ValidatedQuery::SongsFiltered {
            min_popularity,
            min_danceability,
            min_energy,
            limit,
        } => {
            qb.push(
                "SELECT track_id, title, artists, popularity, danceability, energy, content_label
                 FROM tracks WHERE popularity >= ",
            );
            qb.push_bind(min_popularity);
            qb.push(" AND danceability >= ");
            qb.push_bind(min_danceability);
            qb.push(" AND energy >= ");
            qb.push_bind(min_energy);
            qb.push(" ORDER BY popularity DESC, track_id ASC LIMIT ");
            qb.push_bind(i64::from(limit));
        }
        ValidatedQuery::ExplicitVsCleanStats => {
            qb.push(
                "SELECT content_label, COUNT(*) AS track_count,
                        AVG(popularity) AS avg_popularity, MAX(popularity) AS max_popularity
                 FROM tracks GROUP BY content_label ORDER BY content_label",
            );
        }
    }
    qb
}

#[async_trait]
impl Store for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        migrate::ensure_schema(&self.pool).await
    }

    async fn checkpoint(&self, source_key: &str) -> Result<Option<LoadCheckpoint>> {
        let row = sqlx::query(
            "SELECT source_key, batch_size, next_batch, rows_committed, completed, updated_at
             FROM load_checkpoints WHERE source_key = ?",
        )
        .bind(source_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn clear_checkpoint(&self, source_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM load_checkpoints WHERE source_key = ?")
            .bind(source_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn commit_batch(
        &self,
        source_key: &str,
        batch: &Batch,
        progress: CommitProgress,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        if !batch.rows.is_empty() {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(UPSERT_TRACKS);
            qb.push_values(&batch.rows, |mut b, row| {
                b.push_bind(&row.track_id)
                    .push_bind(&row.title)
                    .push_bind(&row.artists)
                    .push_bind(&row.album)
                    .push_bind(&row.genre)
                    .push_bind(row.duration_seconds)
                    .push_bind(row.popularity)
                    .push_bind(&row.popularity_tier)
                    .push_bind(row.danceability)
                    .push_bind(&row.danceability_label)
                    .push_bind(row.energy)
                    .push_bind(&row.energy_label)
                    .push_bind(row.content_label.as_str())
                    .push_bind(&row.extra_json)
                    .push_bind(source_key)
                    .push_bind(now);
            });
            qb.push(ON_CONFLICT_TRACKS);
            qb.build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to upsert batch {}", batch.index))?;
        }

        sqlx::query(
            r#"
            INSERT INTO load_checkpoints
                (source_key, batch_size, next_batch, rows_committed, completed, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_key) DO UPDATE SET
                batch_size = excluded.batch_size,
                next_batch = excluded.next_batch,
                rows_committed = excluded.rows_committed,
                completed = excluded.completed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source_key)
        .bind(progress.batch_size as i64)
        .bind((batch.index + 1) as i64)
        .bind(progress.rows_committed as i64)
        .bind(progress.completed)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to record checkpoint for batch {}", batch.index))?;

        tx.commit().await?;
        Ok(())
    }

    async fn row_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn execute_query(&self, query: &ValidatedQuery) -> Result<QueryResult> {
        let rows = build_query(query)
            .build()
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Query {} failed", query.action().name()))?;
        let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
        Ok(QueryResult { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use tempfile::TempDir;
    use trackpipe_core::models::{ContentLabel, TrackRow};
    use trackpipe_core::query::{Category, GroupKey, Metric};

    async fn open(dir: &TempDir) -> SqliteStore {
        let mut config = Config::default();
        config.store.path = dir.path().join("test.sqlite");
        let store = SqliteStore::new(db::connect(&config).await.unwrap());
        store.ensure_schema().await.unwrap();
        store
    }

    fn track(id: &str, artists: &str, popularity: f64, label: ContentLabel) -> TrackRow {
        TrackRow {
            track_id: id.to_string(),
            title: format!("title {id}"),
            artists: artists.to_string(),
            album: "album".to_string(),
            genre: "pop".to_string(),
            duration_seconds: 180,
            popularity,
            popularity_tier: if popularity >= 70.0 { "High" } else { "Low" }.to_string(),
            danceability: 50.0,
            danceability_label: "Danceable".to_string(),
            energy: 60.0,
            energy_label: "Medium".to_string(),
            content_label: label,
            extra_json: r#"{"tempo":"120"}"#.to_string(),
        }
    }

    fn progress(rows_committed: u64, completed: bool) -> CommitProgress {
        CommitProgress {
            batch_size: 3,
            rows_committed,
            completed,
        }
    }

    async fn seed(store: &SqliteStore) {
        let batch = Batch {
            index: 0,
            rows: vec![
                track("a", "X", 80.0, ContentLabel::Explicit),
                track("b", "X", 60.0, ContentLabel::Clean),
                track("c", "Y", 90.0, ContentLabel::Clean),
            ],
        };
        store.commit_batch("raw/songs.csv", &batch, progress(3, true)).await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.ensure_schema().await.unwrap();
        assert_eq!(store.row_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_upserts_and_records_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        seed(&store).await;
        seed(&store).await;
        assert_eq!(store.row_count().await.unwrap(), 3);

        let cp = store.checkpoint("raw/songs.csv").await.unwrap().unwrap();
        assert_eq!(cp.next_batch, 1);
        assert_eq!(cp.rows_committed, 3);
        assert_eq!(cp.batch_size, 3);
        assert!(cp.completed);
        assert_eq!(store.checkpoints().await.unwrap().len(), 1);

        store.clear_checkpoint("raw/songs.csv").await.unwrap();
        assert!(store.checkpoint("raw/songs.csv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_rows_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        sqlx::query(
            "CREATE TRIGGER reject_boom BEFORE INSERT ON tracks
             WHEN NEW.track_id = 'boom'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let batch = Batch {
            index: 0,
            rows: vec![
                track("ok", "X", 10.0, ContentLabel::Clean),
                track("boom", "X", 10.0, ContentLabel::Clean),
            ],
        };
        let err = store
            .commit_batch("src", &batch, progress(2, false))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("batch 0"));
        assert_eq!(store.row_count().await.unwrap(), 0);
        assert!(store.checkpoint("src").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_templates_match_columns() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        seed(&store).await;

        let top = store
            .execute_query(&ValidatedQuery::TopArtists {
                metric: Metric::Popularity,
                group_by: GroupKey::Artists,
                limit: 1,
            })
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        let keys: Vec<&String> = top.rows[0].keys().collect();
        assert_eq!(keys, ["group_key", "track_count", "avg_popularity"]);
        assert_eq!(top.rows[0]["group_key"], json!("Y"));
        assert_eq!(top.rows[0]["avg_popularity"], json!(90.0));

        let by_tier = store
            .execute_query(&ValidatedQuery::AvgMetricsByCategory {
                category: Category::PopularityTier,
            })
            .await
            .unwrap();
        assert_eq!(by_tier.rows[0]["category"], json!("High"));
        assert_eq!(by_tier.rows[0]["track_count"], json!(2));

        let filtered = store
            .execute_query(&ValidatedQuery::SongsFiltered {
                min_popularity: 70.0,
                min_danceability: 0.0,
                min_energy: 0.0,
                limit: 50,
            })
            .await
            .unwrap();
        let ids: Vec<&Value> = filtered.rows.iter().map(|r| &r["track_id"]).collect();
        assert_eq!(ids, [&json!("c"), &json!("a")]);

        let stats = store
            .execute_query(&ValidatedQuery::ExplicitVsCleanStats)
            .await
            .unwrap();
        assert_eq!(stats.rows[0]["content_label"], json!("Clean"));
        assert_eq!(stats.rows[0]["max_popularity"], json!(90.0));
        assert_eq!(stats.rows[1]["track_count"], json!(1));
    }
}
