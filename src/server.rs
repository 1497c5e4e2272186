//! HTTP API server.
//!
//! JSON over HTTP with bearer-token auth. `GET /healthz` is the only
//! unauthenticated route; everything else requires the configured token
//! (no token configured → auth disabled).
//!
//! # Routes
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `GET`  | `/healthz` | Liveness + version, unauthenticated |
//! | `POST` | `/ingest` | Ingest items (text or URLs) |
//! | `POST` | `/query` | Run a retrieval query |
//! | `POST` | `/query/download-first` | Raw bytes of the top match |
//! | `POST` | `/query/fulltext-first` | Concatenated text of the top match |
//! | `GET`  | `/collections` | Per-collection document/chunk counts |
//! | `GET`  | `/enrichment/status/:base_id` | Per-document enrichment state |
//! | `GET`  | `/enrichment/stats` | Queue + chunk status counts |
//! | `POST` | `/enrichment/enqueue` | Enqueue enrichment tasks |
//! | `POST` | `/enrichment/clear` | Delete queued tasks |
//! | `POST` | `/internal/tasks/claim` | Worker claim (204 when empty) |
//! | `POST` | `/internal/tasks/:id/result` | Worker submit result |
//! | `POST` | `/internal/tasks/:id/fail` | Worker report failure |
//! | `POST` | `/internal/tasks/recover-stale` | Release expired leases |
//! | `GET`  | `/graph/entity/:name` | Entity + neighbours |
//!
//! # Error contract
//!
//! Every error is `{"error": "<message>"}` with the status attached by
//! [`crate::error::Error::status`]. Internal errors are logged in full and
//! surfaced as an opaque message — no stack traces cross the wire.

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::blob::BlobStore;
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::Error;
use crate::ingest::{self, IngestRequest};
use crate::query::{self, QueryRequest};
use crate::{graph, queue};

/// Shared application state: configuration and collaborators, injected
/// once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub embedder: Arc<dyn Embedder>,
    pub blob: Option<Arc<BlobStore>>,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding, config.vector_dim)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let blob = config.blob.clone().map(|c| Arc::new(BlobStore::new(c)));
        Ok(Self {
            config: Arc::new(config),
            pool,
            embedder,
            blob,
        })
    }
}

/// Start the server and run until the process is terminated.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind = state.config.bind;
    let app = build_router(state);

    info!(%bind, "raged listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Assemble the router. Split out so tests can drive it in-process.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = DefaultBodyLimit::max(state.config.body_limit_bytes);

    let authed = Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/query", post(handle_query))
        .route("/query/download-first", post(handle_download_first))
        .route("/query/fulltext-first", post(handle_fulltext_first))
        .route("/collections", get(handle_collections))
        .route("/enrichment/status/:base_id", get(handle_enrichment_status))
        .route("/enrichment/stats", get(handle_enrichment_stats))
        .route("/enrichment/enqueue", post(handle_enrichment_enqueue))
        .route("/enrichment/clear", post(handle_enrichment_clear))
        .route("/internal/tasks/claim", post(handle_task_claim))
        .route("/internal/tasks/:id/result", post(handle_task_result))
        .route("/internal/tasks/:id/fail", post(handle_task_fail))
        .route("/internal/tasks/recover-stale", post(handle_recover_stale))
        .route("/graph/entity/:name", get(handle_graph_entity))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(handle_healthz))
        .merge(authed)
        .layer(body_limit)
        .layer(cors)
        .with_state(state)
}

// ============ Error plumbing ============

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Backend details stay in the logs.
            Error::Database(e) => {
                error!(error = %e, "database error");
                "internal error".to_string()
            }
            Error::Other(e) => {
                error!(error = %e, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// JSON extractor whose rejection follows the API error shape.
struct AppJson<T>(T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                Err(Error::PayloadTooLarge)
            }
            Err(rejection) => Err(Error::BadRequest(rejection.body_text())),
        }
    }
}

// ============ Auth ============

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_token.as_deref() else {
        return next.run(request).await;
    };

    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if supplied == Some(expected) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response()
    }
}

// ============ Handlers ============

async fn handle_healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}

async fn handle_ingest(
    State(state): State<AppState>,
    AppJson(request): AppJson<IngestRequest>,
) -> Result<Json<ingest::IngestOutcome>, Error> {
    if request.items.is_empty() {
        return Err(Error::BadRequest("'items' must not be empty".into()));
    }
    let outcome = ingest::run_ingest(
        &state.pool,
        &state.config,
        &state.embedder,
        &state.blob,
        request,
    )
    .await?;
    Ok(Json(outcome))
}

async fn handle_query(
    State(state): State<AppState>,
    AppJson(request): AppJson<QueryRequest>,
) -> Result<Json<query::QueryResponse>, Error> {
    let response = query::run_query(&state.pool, &state.embedder, &request).await?;
    Ok(Json(response))
}

async fn handle_download_first(
    State(state): State<AppState>,
    AppJson(request): AppJson<QueryRequest>,
) -> Result<Response, Error> {
    let (mime_type, bytes) =
        query::download_first(&state.pool, &state.embedder, &state.blob, &request).await?;
    Ok(([(header::CONTENT_TYPE, mime_type)], bytes).into_response())
}

async fn handle_fulltext_first(
    State(state): State<AppState>,
    AppJson(request): AppJson<QueryRequest>,
) -> Result<Json<query::FulltextDocument>, Error> {
    let doc = query::fulltext_first(&state.pool, &state.embedder, &request).await?;
    Ok(Json(doc))
}

async fn handle_collections(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, Error> {
    let collections = query::collection_stats(&state.pool).await?;
    Ok(Json(json!({ "ok": true, "collections": collections })))
}

async fn handle_enrichment_status(
    State(state): State<AppState>,
    Path(base_id): Path<String>,
) -> Result<Json<queue::DocumentEnrichment>, Error> {
    let status = queue::document_status(&state.pool, &base_id).await?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct StatsParams {
    collection: Option<String>,
    q: Option<String>,
}

async fn handle_enrichment_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Result<Json<queue::QueueStats>, Error> {
    let stats = queue::stats(
        &state.pool,
        params.collection.as_deref(),
        params.q.as_deref(),
    )
    .await?;
    Ok(Json(stats))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    base_id: Option<String>,
}

async fn handle_enrichment_enqueue(
    State(state): State<AppState>,
    AppJson(request): AppJson<EnqueueRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    let collection = request.collection.as_deref().unwrap_or("default");

    let document_ids: Vec<uuid::Uuid> = match &request.base_id {
        Some(base_id) => {
            let row =
                sqlx::query("SELECT id FROM documents WHERE collection = $1 AND base_id = $2")
                    .bind(collection)
                    .bind(base_id)
                    .fetch_optional(&state.pool)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("document '{}' not found", base_id))
                    })?;
            vec![row.get("id")]
        }
        None => sqlx::query("SELECT id FROM documents WHERE collection = $1 ORDER BY ingested_at")
            .bind(collection)
            .fetch_all(&state.pool)
            .await?
            .into_iter()
            .map(|r| r.get("id"))
            .collect(),
    };

    let mut enqueued = 0u64;
    for id in document_ids {
        enqueued += queue::enqueue_for_document(&state.pool, id).await?;
    }
    Ok(Json(json!({ "ok": true, "enqueued": enqueued })))
}

#[derive(Deserialize)]
struct ClearRequest {
    collection: String,
    #[serde(default)]
    q: Option<String>,
}

async fn handle_enrichment_clear(
    State(state): State<AppState>,
    AppJson(request): AppJson<ClearRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    let deleted = queue::clear(&state.pool, &request.collection, request.q.as_deref()).await?;
    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest {
    worker_id: String,
    #[serde(default)]
    lease_seconds: Option<i64>,
}

async fn handle_task_claim(
    State(state): State<AppState>,
    AppJson(request): AppJson<ClaimRequest>,
) -> Result<Response, Error> {
    match queue::claim(&state.pool, &request.worker_id, request.lease_seconds).await? {
        Some(task) => Ok(Json(task).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn handle_task_result(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    AppJson(result): AppJson<queue::TaskResult>,
) -> Result<Json<serde_json::Value>, Error> {
    queue::submit_result(&state.pool, id, result).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct FailRequest {
    #[serde(default)]
    message: Option<String>,
}

async fn handle_task_fail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    AppJson(request): AppJson<FailRequest>,
) -> Result<Json<queue::FailOutcome>, Error> {
    let message = request.message.as_deref().unwrap_or("worker reported failure");
    let outcome = queue::fail(&state.pool, id, message).await?;
    Ok(Json(outcome))
}

async fn handle_recover_stale(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, Error> {
    let recovered = queue::recover_stale(&state.pool).await?;
    Ok(Json(json!({ "ok": true, "recovered": recovered })))
}

#[derive(Deserialize)]
struct GraphParams {
    depth: Option<u32>,
}

async fn handle_graph_entity(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<GraphParams>,
) -> Result<Json<graph::GraphExpansion>, Error> {
    let depth = params.depth.unwrap_or(graph::DEFAULT_DEPTH);
    let expansion = graph::expand(&state.pool, &name, depth).await?;
    Ok(Json(expansion))
}
