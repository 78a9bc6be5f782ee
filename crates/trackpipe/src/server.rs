//! HTTP invocation gateway.
//!
//! Exposes the three pipeline phases as JSON endpoints, so an external
//! trigger (an object-created hook, a scheduler, an API gateway) can drive
//! them. Request bodies are the same events the CLI accepts.
//!
//! # Endpoints
//!
//! | Method | Path | Body | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/transform` | `{bucket?, key}` or S3 notification | Transform a raw object |
//! | `POST` | `/load` | `{bucket?, key, full?, resume_from?}` | Load a transformed object |
//! | `POST` | `/query` | `{action, …}` | Run an analytical query |
//! | `GET`  | `/health` | | Health check (returns version) |
//!
//! Any body may also be wrapped as `{"body": "<json string>"}`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "limit: 0 is outside 1..=100" } }
//! ```
//!
//! Error codes: `bad_request` (400), `load_failed` (500, with the load
//! result under `"result"`), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use trackpipe_core::query::{QueryRequest, QueryResponse};

use crate::config::Config;
use crate::event::{object_from_event, unwrap_body};
use crate::load::{run_load, LoadError, LoadOptions, LoadResult};
use crate::object_store::{self, ObjectStore};
use crate::query::{run_query, DispatchError};
use crate::transform::{run_transform, TransformReport};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    objects: Arc<dyn ObjectStore>,
}

/// Starts the gateway on `[server].bind` and serves until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let objects: Arc<dyn ObjectStore> = Arc::from(object_store::from_config(&config.objects)?);
    let app = router(Arc::new(config.clone()), objects);

    info!(%bind_addr, "gateway listening");
    println!("trackpipe gateway listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(config: Arc<Config>, objects: Arc<dyn ObjectStore>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/transform", post(handle_transform))
        .route("/load", post(handle_load))
        .route("/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { config, objects })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<LoadResult>,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`).
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    result: Option<LoadResult>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
            result: self.result,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
        result: None,
    }
}

fn internal(err: anyhow::Error) -> AppError {
    error!(error = %format!("{err:#}"), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{err:#}"),
        result: None,
    }
}

fn load_failed(result: LoadResult) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "load_failed",
        message: result
            .error
            .clone()
            .unwrap_or_else(|| "load failed".to_string()),
        result: Some(result),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /transform ============

async fn handle_transform(
    State(state): State<AppState>,
    Json(event): Json<Value>,
) -> Result<Json<TransformReport>, AppError> {
    let input = object_from_event(&event, &state.config.objects.raw_bucket)
        .map_err(|e| bad_request(e.to_string()))?;
    let report = run_transform(&state.config, state.objects.clone(), input)
        .await
        .map_err(internal)?;
    Ok(Json(report))
}

// ============ POST /load ============

/// Optional load flags carried next to the object location.
#[derive(Deserialize, Default)]
struct LoadFlags {
    #[serde(default)]
    full: bool,
    #[serde(default)]
    resume_from: Option<u64>,
}

async fn handle_load(
    State(state): State<AppState>,
    Json(event): Json<Value>,
) -> Result<Json<LoadResult>, AppError> {
    let event = unwrap_body(event).map_err(|e| bad_request(e.to_string()))?;
    let object = object_from_event(&event, &state.config.objects.transformed_bucket)
        .map_err(|e| bad_request(e.to_string()))?;
    let flags = LoadFlags::deserialize(&event).map_err(|e| bad_request(e.to_string()))?;

    let options = LoadOptions {
        full: flags.full,
        resume_from: flags.resume_from,
        ..LoadOptions::from_config(&state.config.load)
    };
    let result = run_load(&state.config, state.objects.clone(), object, options)
        .await
        .map_err(|e| {
            let rejected = matches!(
                e.downcast_ref::<LoadError>(),
                Some(LoadError::BatchSizeMismatch { .. } | LoadError::InvalidOptions(_))
            );
            if rejected {
                bad_request(e.to_string())
            } else {
                internal(e)
            }
        })?;

    if result.is_completed() {
        Ok(Json(result))
    } else {
        Err(load_failed(result))
    }
}

// ============ POST /query ============

async fn handle_query(
    State(state): State<AppState>,
    Json(event): Json<Value>,
) -> Result<Json<QueryResponse>, AppError> {
    let request = QueryRequest::from_event(event).map_err(|e| bad_request(e.to_string()))?;
    let response = run_query(&state.config, &request)
        .await
        .map_err(|e| match e {
            DispatchError::Invalid(e) => bad_request(e.to_string()),
            DispatchError::Store(e) => internal(e),
        })?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::LocalObjectStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app(tmp: &tempfile::TempDir) -> Router {
        let mut config = Config::default();
        config.store.path = tmp.path().join("db/trackpipe.sqlite");
        config.objects.root = tmp.path().join("objects");
        config.load.batch_size = 2;
        let objects: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(tmp.path().join("objects")));
        router(Arc::new(config), objects)
    }

    async fn post(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::post(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = tempfile::TempDir::new().unwrap();
        let response = test_app(&tmp)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_query_is_bad_request() {
        let tmp = tempfile::TempDir::new().unwrap();
        let app = test_app(&tmp);
        let (status, body) = post(&app, "/query", serde_json::json!({"action": "drop_table"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
        // Rejected before the database is opened.
        assert!(!tmp.path().join("db").exists());
    }

    #[tokio::test]
    async fn test_missing_key_is_bad_request() {
        let tmp = tempfile::TempDir::new().unwrap();
        let app = test_app(&tmp);
        let (status, body) = post(&app, "/transform", serde_json::json!({"bucket": "raw"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_transform_load_query() {
        let tmp = tempfile::TempDir::new().unwrap();
        let raw = tmp.path().join("objects/raw");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::write(
            raw.join("hits.csv"),
            "id,name,artist,Popularity,Danceability,Energy,Explicit,duration_ms\n\
             a,One,X,90,0.8,0.7,1,200000\n\
             b,Two,Y,30,0.2,0.3,0,180000\n\
             c,Three,X,70,0.5,0.5,0,240000\n",
        )
        .unwrap();
        let app = test_app(&tmp);

        let (status, body) = post(&app, "/transform", serde_json::json!({"key": "hits.csv"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"], 3);
        assert_eq!(body["output_key"], "hits_transformed.csv");

        let event = serde_json::json!({"key": "hits_transformed.csv"});
        let wrapped = serde_json::json!({"body": event.to_string()});
        let (status, body) = post(&app, "/load", wrapped).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["rows_committed"], 3);
        assert_eq!(body["batches_attempted"], 2);

        let (status, body) = post(
            &app,
            "/query",
            serde_json::json!({"action": "explicit_vs_clean_stats"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 1);
        let rows = body["query_result"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
    }
}
