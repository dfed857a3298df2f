//! HTTP adapter over the engine.
//!
//! Thin translation layer: JSON in, JSON or Server-Sent Events out. The SSE
//! stream is the gateway stream with each event mapped to
//! `id: <seq>`, `event: <kind>`, `data: <payload>`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::Engine;
use crate::domain::{Event, FileRef, RunInputs, RunRecord};
use crate::error::EngineError;

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub inputs: RunInputs,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// First sequence number wanted
    pub from: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub name: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InvalidInput(_) | EngineError::ToolNotStarted { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::RunNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the router for an engine
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(trigger_run))
        .route("/run/:run_id", get(get_run))
        .route("/runs", get(list_runs))
        .route("/stream/:run_id", get(stream_run))
        .route("/logs/:run_id", get(run_logs))
        .route("/upload", post(upload))
        .route("/uploads", get(list_uploads))
        .with_state(engine)
}

/// Serve until Ctrl-C, then shut the engine down gracefully
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(engine.clone());

    info!("Run engine listening on http://{}", addr);

    let shutdown_engine = engine.clone();
    axum::Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {}", addr))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Shutdown requested");
            shutdown_engine.shutdown().await;
        })
        .await
        .context("HTTP server failed")?;

    info!("Server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn trigger_run(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<TriggerRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let run_id = engine.create_run(request.inputs).await?;
    Ok((StatusCode::CREATED, Json(json!({ "run_id": run_id }))))
}

async fn get_run(
    State(engine): State<Arc<Engine>>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunRecord>, EngineError> {
    Ok(Json(engine.get_run(run_id).await?))
}

async fn list_runs(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<RunRecord>>, EngineError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(engine.list_runs(limit).await?))
}

async fn stream_run(
    State(engine): State<Arc<Engine>>,
    Path(run_id): Path<Uuid>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let from_seq = params
        .from
        .or_else(|| resume_after(&headers))
        .unwrap_or(0);

    let events = engine.open_stream(run_id, from_seq).await?;

    let stream = events.into_stream().map(|item| {
        let event = match item {
            Ok(event) => to_sse(&event),
            Err(EngineError::SubscriberLagged { next_seq, .. }) => SseEvent::default()
                .event("reconnect")
                .data(json!({ "from": next_seq }).to_string()),
            Err(e) => SseEvent::default()
                .event("stream_error")
                .data(json!({ "error": e.to_string() }).to_string()),
        };
        Ok::<_, Infallible>(event)
    });

    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response())
}

async fn run_logs(
    State(engine): State<Arc<Engine>>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, EngineError> {
    let events = engine.read_log(run_id).await?;

    let mut body = String::new();
    for event in &events {
        body.push_str(&serde_json::to_string(event)?);
        body.push('\n');
    }

    Ok(([(header::CONTENT_TYPE, "application/jsonl")], body).into_response())
}

async fn upload(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, EngineError> {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let file = engine.save_upload(&params.name, mime, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "file_id": file.id,
            "path": file.path,
            "file": file,
        })),
    ))
}

async fn list_uploads(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<FileRef>>, EngineError> {
    Ok(Json(engine.list_uploads().await?))
}

fn to_sse(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.seq.to_string())
        .event(event.kind.name())
        .data(event.kind.payload().to_string())
}

/// `Last-Event-ID: N` means the client already has event N
fn resume_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .and_then(|seq| seq.checked_add(1))
}
