//! JSON HTTP API over the [`Retriever`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/query` | Ranked passages for `{ "query", "role", "top_k"? }` |
//! | `POST` | `/answer` | Cached or generated answer for `{ "query", "role" }` |
//! | `POST` | `/refresh/{role}` | Force a sync of one role (`?force=true` refetches everything) |
//! | `POST` | `/rebuild/{role}` | Rebuild one role's index from its local mirror |
//! | `DELETE` | `/cache` | Clear the response cache (`?role=` for one role) |
//! | `GET`  | `/cache/stats` | Response cache statistics |
//! | `GET`  | `/scopes/{role}/stats` | Document and index statistics for one role |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "Your question is too short ..." } }
//! ```
//!
//! | Condition | Status | Code |
//! |-----------|--------|------|
//! | query rejected by validation | 400 | `validation_error` |
//! | unknown role | 400 | `bad_request` |
//! | store unavailable and no index to fall back on | 503 | `store_unavailable` |
//! | anything else | 500 | error-specific code |
//!
//! A query served from the last good index while the store is unreachable
//! succeeds with `"status": { "state": "degraded", ... }`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front-ends
//! can call the API directly.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use policy_retrieval_core::models::{Citation, RoleScope};

use crate::answer::{Answer, AnswerGenerator, ExtractiveGenerator};
use crate::cache::CacheStats;
use crate::config::Config;
use crate::error::RetrievalError;
use crate::query::QueryResponse;
use crate::scope::{ScopeStats, SyncMode, SyncResult};
use crate::service::{RebuildResult, Retriever};

#[derive(Clone)]
struct AppState {
    retriever: Arc<Retriever>,
    generator: Arc<dyn AnswerGenerator>,
}

/// Build the API router.
pub fn router(retriever: Arc<Retriever>, generator: Arc<dyn AnswerGenerator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/query", post(handle_query))
        .route("/answer", post(handle_answer))
        .route("/refresh/{role}", post(handle_refresh))
        .route("/rebuild/{role}", post(handle_rebuild))
        .route("/cache", delete(handle_clear_cache))
        .route("/cache/stats", get(handle_cache_stats))
        .route("/scopes/{role}/stats", get(handle_scope_stats))
        .layer(cors)
        .with_state(AppState {
            retriever,
            generator,
        })
}

/// Open the retriever from `config` and serve until Ctrl-C.
///
/// Starts the background sync task when `[sync].interval_secs` is set and
/// persists the response cache on shutdown.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let retriever = Arc::new(Retriever::from_config(config.clone()).await?);

    let background = config
        .sync
        .interval_secs
        .map(|secs| retriever.spawn_background_sync(Duration::from_secs(secs.max(1))));

    let app = router(Arc::clone(&retriever), Arc::new(ExtractiveGenerator::default()));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    if let Some(task) = background {
        task.abort();
    }
    retriever.close().await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        let status = match &err {
            RetrievalError::Validation(_) => StatusCode::BAD_REQUEST,
            RetrievalError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn parse_role(raw: &str) -> Result<RoleScope, AppError> {
    raw.parse::<RoleScope>().map_err(bad_request)
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

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    role: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct QueryBody {
    #[serde(flatten)]
    response: QueryResponse,
    citations: Vec<Citation>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryBody>, AppError> {
    let role = parse_role(&req.role)?;
    let response = state.retriever.query(&req.query, role, req.top_k).await?;
    let citations = response.citations();
    Ok(Json(QueryBody {
        response,
        citations,
    }))
}

// ============ POST /answer ============

#[derive(Deserialize)]
struct AnswerRequest {
    query: String,
    role: String,
}

async fn handle_answer(
    State(state): State<AppState>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<Answer>, AppError> {
    let role = parse_role(&req.role)?;
    let answer = state
        .retriever
        .answer(&req.query, role, state.generator.as_ref())
        .await?;
    Ok(Json(answer))
}

// ============ POST /refresh/{role} ============

#[derive(Deserialize)]
struct RefreshParams {
    #[serde(default)]
    force: bool,
}

async fn handle_refresh(
    State(state): State<AppState>,
    Path(role): Path<String>,
    Query(params): Query<RefreshParams>,
) -> Result<Json<SyncResult>, AppError> {
    let role = parse_role(&role)?;
    let mode = if params.force {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    };
    let result = state.retriever.refresh_with(role, mode).await?;
    if params.force {
        persist_cache(&state).await;
    }
    Ok(Json(result))
}

// ============ POST /rebuild/{role} ============

async fn handle_rebuild(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Result<Json<RebuildResult>, AppError> {
    let role = parse_role(&role)?;
    let result = state.retriever.rebuild(role).await?;
    persist_cache(&state).await;
    Ok(Json(result))
}

async fn persist_cache(state: &AppState) {
    if let Err(e) = state.retriever.persist_cache().await {
        tracing::warn!(error = %e, "failed to persist response cache");
    }
}

// ============ DELETE /cache ============

#[derive(Deserialize)]
struct ClearParams {
    #[serde(default)]
    role: Option<String>,
}

#[derive(Serialize)]
struct ClearResponse {
    removed: usize,
}

async fn handle_clear_cache(
    State(state): State<AppState>,
    Query(params): Query<ClearParams>,
) -> Result<Json<ClearResponse>, AppError> {
    let role = params.role.as_deref().map(parse_role).transpose()?;
    let removed = state.retriever.clear_response_cache(role);
    persist_cache(&state).await;
    Ok(Json(ClearResponse { removed }))
}

// ============ GET /cache/stats ============

async fn handle_cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.retriever.cache_stats())
}

// ============ GET /scopes/{role}/stats ============

async fn handle_scope_stats(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Result<Json<ScopeStats>, AppError> {
    let role = parse_role(&role)?;
    Ok(Json(state.retriever.stats(role)?))
}
