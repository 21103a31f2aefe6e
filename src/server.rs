//! HTTP request layer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/chat/index` | Ingest base64-encoded uploads into a session |
//! | `POST` | `/chat/query` | Query a session's persisted index |
//!
//! `POST /chat/index`:
//!
//! ```json
//! { "session_id": "optional", "files": [{ "name": "a.pdf", "content_base64": "..." }],
//!   "chunk_size": 1000, "chunk_overlap": 200, "k": 5 }
//! ```
//!
//! `chunk_size`, `chunk_overlap` and `k` are optional and default to the
//! configured `[chunking]` and `[retrieval]` values.
//!
//! `POST /chat/query`:
//!
//! ```json
//! { "session_id": "session_20250101_120000_1a2b3c4d", "question": "...", "k": 3 }
//! ```
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "session_not_found", "message": "no index found at ..." } }
//! ```
//!
//! | Error | Status | Code |
//! |-------|--------|------|
//! | unknown session | 404 | `session_not_found` |
//! | no ingestible content, bad session id, bad chunking, bad base64, empty question | 400 | `bad_request` |
//! | stage timeout | 408 | `timeout` |
//! | anything else | 500 | `internal` |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front ends can
//! call the API directly.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::context::PortalContext;
use crate::error::Error;
use crate::ingest::IngestOptions;
use crate::models::{ScoredChunk, UploadedFile};
use crate::{ingest, query};

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(ctx: PortalContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config().server.bind.clone();
    let app = router(Arc::new(ctx));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "document portal listening");
    println!("Document portal listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// The portal's routes with CORS and the configured body limit applied.
pub fn router(ctx: Arc<PortalContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = ctx.config().server.max_body_mb * 1024 * 1024;

    Router::new()
        .route("/health", get(handle_health))
        .route("/chat/index", post(handle_index))
        .route("/chat/query", post(handle_query))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(ctx)
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

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match (&err, err.root_cause()) {
            (Error::Timeout { .. }, _) => AppError {
                status: StatusCode::REQUEST_TIMEOUT,
                code: "timeout",
                message,
            },
            (_, Error::IndexNotFound(_)) => AppError {
                status: StatusCode::NOT_FOUND,
                code: "session_not_found",
                message,
            },
            _ if err.is_user_error() => bad_request(message),
            _ => {
                tracing::error!(error = %message, "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message,
                }
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "document-portal",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /chat/index ============

#[derive(Debug, Deserialize)]
struct IndexRequest {
    #[serde(default)]
    session_id: Option<String>,
    files: Vec<UploadPayload>,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    chunk_overlap: Option<usize>,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct UploadPayload {
    name: String,
    content_base64: String,
}

#[derive(Debug, Serialize)]
struct IndexResponse {
    session_id: String,
    files_ingested: usize,
    chunks: usize,
    k: usize,
    skipped: Vec<SkippedPayload>,
}

#[derive(Debug, Serialize)]
struct SkippedPayload {
    name: String,
    reason: String,
}

fn decode_uploads(files: Vec<UploadPayload>) -> Result<Vec<UploadedFile>, AppError> {
    files
        .into_iter()
        .map(|f| {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(f.content_base64.trim())
                .map_err(|e| bad_request(format!("file '{}' is not valid base64: {}", f.name, e)))?;
            Ok(UploadedFile::new(f.name, bytes))
        })
        .collect()
}

async fn handle_index(
    State(ctx): State<Arc<PortalContext>>,
    Json(req): Json<IndexRequest>,
) -> Result<Json<IndexResponse>, AppError> {
    if req.k == Some(0) {
        return Err(bad_request("k must be >= 1"));
    }
    let options = IngestOptions {
        chunk_size: req.chunk_size,
        chunk_overlap: req.chunk_overlap,
        k: req.k,
    };
    let files = decode_uploads(req.files)?;
    let outcome = ingest::ingest_with(&ctx, req.session_id.as_deref(), files, options).await?;

    Ok(Json(IndexResponse {
        k: outcome.retriever.k(),
        session_id: outcome.session_id,
        files_ingested: outcome.stats.files_ingested,
        chunks: outcome.stats.chunks,
        skipped: outcome
            .skipped
            .into_iter()
            .map(|s| SkippedPayload {
                reason: s.error.to_string(),
                name: s.name,
            })
            .collect(),
    }))
}

// ============ POST /chat/query ============

#[derive(Debug, Deserialize)]
struct QueryRequest {
    session_id: String,
    question: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    session_id: String,
    results: Vec<QueryResultItem>,
}

#[derive(Debug, Serialize)]
struct QueryResultItem {
    score: f32,
    source: String,
    position: u32,
    chunk_index: i64,
    text: String,
}

impl From<ScoredChunk> for QueryResultItem {
    fn from(r: ScoredChunk) -> Self {
        Self {
            score: r.score,
            source: r.chunk.source,
            position: r.chunk.position,
            chunk_index: r.chunk.chunk_index,
            text: r.chunk.text,
        }
    }
}

async fn handle_query(
    State(ctx): State<Arc<PortalContext>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    if req.k == Some(0) {
        return Err(bad_request("k must be >= 1"));
    }
    let results = query::query(&ctx, &req.session_id, &req.question, req.k).await?;

    Ok(Json(QueryResponse {
        session_id: req.session_id,
        results: results.into_iter().map(QueryResultItem::from).collect(),
    }))
}
