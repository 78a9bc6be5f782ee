//! Query dispatcher.
//!
//! Requests are validated against the fixed action set and allow-lists in
//! [`trackpipe_core::query`] before a store is touched; only a
//! [`ValidatedQuery`](trackpipe_core::query::ValidatedQuery) ever reaches
//! [`Store::execute_query`].

use thiserror::Error;
use tracing::{debug, warn};

use trackpipe_core::query::{InvalidRequest, QueryLimits, QueryRequest, QueryResponse};
use trackpipe_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Invalid(#[from] InvalidRequest),

    #[error("query failed: {0:#}")]
    Store(anyhow::Error),
}

/// Validate `request` and run it against `store`.
pub async fn dispatch<S: Store + ?Sized>(
    store: &S,
    request: &QueryRequest,
    limits: &QueryLimits,
) -> Result<QueryResponse, DispatchError> {
    let query = request.validate(limits).inspect_err(|e| {
        warn!(error = %e, "query rejected");
    })?;
    debug!(?query, "dispatching query");

    let result = store
        .execute_query(&query)
        .await
        .map_err(DispatchError::Store)?;
    debug!(action = query.action().name(), rows = result.len(), "query executed");
    Ok(QueryResponse::new(query.action(), result))
}

/// Run a query against the configured SQLite store.
pub async fn run_query(
    config: &Config,
    request: &QueryRequest,
) -> Result<QueryResponse, DispatchError> {
    let limits = QueryLimits {
        max_limit: config.query.max_limit,
    };
    // Reject before opening the database.
    request.validate(&limits)?;

    let pool = db::connect(config).await.map_err(DispatchError::Store)?;
    let store = SqliteStore::new(pool);
    store.ensure_schema().await.map_err(DispatchError::Store)?;
    let response = dispatch(&store, request, &limits).await;
    store.pool().close().await;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trackpipe_core::models::{Batch, ContentLabel, TrackRow};
    use trackpipe_core::store::memory::InMemoryStore;
    use trackpipe_core::store::CommitProgress;

    fn request(value: serde_json::Value) -> QueryRequest {
        QueryRequest::from_event(value).unwrap()
    }

    fn track(id: &str, artist: &str, popularity: f64) -> TrackRow {
        TrackRow {
            track_id: id.to_string(),
            title: id.to_uppercase(),
            artists: artist.to_string(),
            album: String::new(),
            genre: "pop".to_string(),
            duration_seconds: 200,
            popularity,
            popularity_tier: "Low".to_string(),
            danceability: 50.0,
            danceability_label: "Danceable".to_string(),
            energy: 50.0,
            energy_label: "Medium".to_string(),
            content_label: ContentLabel::Clean,
            extra_json: "{}".to_string(),
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        let batch = Batch {
            index: 0,
            rows: vec![track("a", "X", 90.0), track("b", "Y", 40.0), track("c", "X", 70.0)],
        };
        store
            .commit_batch(
                "seed",
                &batch,
                CommitProgress {
                    batch_size: 3,
                    rows_committed: 3,
                    completed: true,
                },
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_rejected_requests_issue_no_queries() {
        let store = seeded().await;
        let limits = QueryLimits::default();

        for bad in [
            json!({"action": "drop_table"}),
            json!({"action": "top_artists", "metric": "1=1"}),
            json!({"action": "songs_filtered", "limit": 0}),
            json!({"action": "avg_metrics_by_category", "category": "title"}),
        ] {
            let err = dispatch(&store, &request(bad), &limits).await.unwrap_err();
            assert!(matches!(err, DispatchError::Invalid(_)));
        }
        assert_eq!(store.queries_issued(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_top_artists() {
        let store = seeded().await;
        let response = dispatch(
            &store,
            &request(json!({"action": "top_artists", "limit": 1})),
            &QueryLimits::default(),
        )
        .await
        .unwrap();

        assert_eq!(store.queries_issued(), 1);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["version"], 1);
        assert_eq!(body["action"], "top_artists");
        assert_eq!(body["query_result"].as_array().unwrap().len(), 1);
        assert_eq!(body["query_result"][0]["group_key"], "X");
        assert_eq!(body["query_result"][0]["track_count"], 2);
    }
}
