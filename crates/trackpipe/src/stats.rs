//! Store statistics and load progress overview.
//!
//! Used by `trackpipe stats` to show what has been loaded: track counts per
//! popularity tier and content label, and where every source's load stands.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;

    let total_tracks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.store.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("trackpipe — Store Stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.store.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Tracks:      {}", total_tracks);

    print_breakdown(&pool, "Popularity tier", "popularity_tier").await?;
    print_breakdown(&pool, "Content label", "content_label").await?;

    let store = SqliteStore::new(pool);
    let checkpoints = store.checkpoints().await?;
    if !checkpoints.is_empty() {
        println!();
        println!("  Loads:");
        println!(
            "  {:<40} {:>10} {:>10} {:>6}   {}",
            "SOURCE", "NEXT BATCH", "ROWS", "DONE", "UPDATED"
        );
        println!("  {}", "-".repeat(86));
        for cp in &checkpoints {
            println!(
                "  {:<40} {:>10} {:>10} {:>6}   {}",
                cp.source_key,
                cp.next_batch,
                cp.rows_committed,
                if cp.completed { "yes" } else { "no" },
                format_ts(cp.updated_at)
            );
        }
    }

    println!();

    store.pool().close().await;
    Ok(())
}

/// Print row counts grouped by one label column.
async fn print_breakdown(pool: &SqlitePool, title: &str, column: &'static str) -> Result<()> {
    let rows = sqlx::query(&format!(
        "SELECT {column} AS label, COUNT(*) AS n FROM tracks GROUP BY {column} ORDER BY n DESC, label ASC"
    ))
    .fetch_all(pool)
    .await?;
    if rows.is_empty() {
        return Ok(());
    }

    println!();
    println!("  By {}:", title.to_lowercase());
    for row in &rows {
        let label: String = row.get("label");
        let n: i64 = row.get("n");
        println!("    {:<24} {:>8}", label, n);
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts(0), "1970-01-01 00:00:00");
    }
}
