//! HTTP+JSON API for clients, plus the worker poll and log upload routes.

pub mod auth;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::AllowList;
use crate::jobs::{Job, JobPatch, JobSpec};
use crate::logs::FileLogStore;
use crate::store::JobStore;

pub use error::ApiError;

#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn JobStore>,
    pub logs: FileLogStore,
    pub tokens: AllowList,
    /// Cancels live tails when the server shuts down
    pub shutdown: CancellationToken,
}

pub fn router(state: HttpState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let bounded = Router::new()
        .route("/experiments", get(list_jobs_handler).post(submit_job_handler))
        .route("/experiments/:id", get(get_job_handler).put(update_job_handler))
        .route("/workers/poll", get(poll_job_handler))
        .route("/logs/:id", get(read_logs_handler))
        .layer(TimeoutLayer::new(request_timeout));

    let streaming = Router::new()
        .route("/logs/:id/tail", get(tail_logs_handler))
        .route("/logs/:id/upload", post(upload_logs_handler));

    bounded
        .merge(streaming)
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            auth::require_token,
        ))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_http(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Starting HTTP server");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest(format!("Invalid job id: {id}")))
}

async fn existing_job(state: &HttpState, id: Uuid) -> Result<Job, ApiError> {
    state
        .store
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {id} not found")))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn submit_job_handler(
    State(state): State<HttpState>,
    Json(spec): Json<JobSpec>,
) -> Result<Json<Job>, ApiError> {
    if spec.docker.image.trim().is_empty() {
        return Err(ApiError::BadRequest("docker.image is required".to_string()));
    }

    let job = state.store.insert(spec).await?;
    tracing::info!(job_id = %job.id, image = %job.docker.image, "Job submitted");
    Ok(Json(job))
}

async fn list_jobs_handler(State(state): State<HttpState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.store.list_all().await?))
}

async fn get_job_handler(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(existing_job(&state, id).await?))
}

async fn update_job_handler(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    let job = state.store.update(id, patch).await?;
    tracing::info!(job_id = %job.id, status = %job.status, "Job updated");
    Ok(Json(job))
}

async fn poll_job_handler(State(state): State<HttpState>) -> Result<Response, ApiError> {
    match state.store.fetch_job().await? {
        Some(job) => {
            tracing::info!(job_id = %job.id, "Job claimed");
            Ok(Json(job).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn read_logs_handler(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    existing_job(&state, id).await?;

    let data = state.logs.read_all(id).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        data,
    )
        .into_response())
}

async fn tail_logs_handler(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    existing_job(&state, id).await?;

    let lines = state
        .logs
        .follow(id, state.shutdown.child_token())
        .map(|line| {
            line.map(|mut line| {
                line.push('\n');
                Bytes::from(line)
            })
        });

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn upload_logs_handler(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    body: Body,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    existing_job(&state, id).await?;

    let mut appender = state.logs.appender(id).await?;
    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("Upload interrupted: {e}")))?;
        appender.append(&chunk).await?;
    }

    Ok(Json(json!({ "bytes_written": appender.bytes_written() })))
}
