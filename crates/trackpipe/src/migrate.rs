//! Schema creation.
//!
//! Every statement is create-if-absent, so running migrations against an
//! existing database is a no-op. They run in their own transaction, before
//! any batch of a load.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tracks (
        track_id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        artists TEXT NOT NULL,
        album TEXT NOT NULL,
        genre TEXT NOT NULL,
        duration_seconds INTEGER NOT NULL,
        popularity REAL NOT NULL,
        popularity_tier TEXT NOT NULL,
        danceability REAL NOT NULL,
        danceability_label TEXT NOT NULL,
        energy REAL NOT NULL,
        energy_label TEXT NOT NULL,
        content_label TEXT NOT NULL,
        extra_json TEXT NOT NULL DEFAULT '{}',
        source_key TEXT NOT NULL,
        loaded_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tracks_popularity ON tracks(popularity)",
    "CREATE INDEX IF NOT EXISTS idx_tracks_popularity_tier ON tracks(popularity_tier)",
    "CREATE INDEX IF NOT EXISTS idx_tracks_content_label ON tracks(content_label)",
    "CREATE INDEX IF NOT EXISTS idx_tracks_genre ON tracks(genre)",
    r#"
    CREATE TABLE IF NOT EXISTS load_checkpoints (
        source_key TEXT PRIMARY KEY,
        batch_size INTEGER NOT NULL,
        next_batch INTEGER NOT NULL,
        rows_committed INTEGER NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL
    )
    "#,
];

/// Create all tables and indexes on an open pool.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Open the configured database and create the schema (`trackpipe init`).
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
