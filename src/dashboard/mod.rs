use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::coordinator::{Coordinator, SubmitRequest};
use crate::error::TaskmillError;
use crate::worker::WorkerPool;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
    pub pool: Arc<WorkerPool>,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
}

#[derive(Debug, Serialize)]
struct CancelJobResponse {
    job_id: Uuid,
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    queue_depth: usize,
    queue_capacity: usize,
    in_flight: usize,
    workers: usize,
    busy_workers: usize,
    job_types: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Maps engine errors onto HTTP status codes.
pub struct ApiError(TaskmillError);

impl From<TaskmillError> for ApiError {
    fn from(e: TaskmillError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            TaskmillError::UnknownJobType(_) | TaskmillError::InvalidPayload { .. } => {
                StatusCode::BAD_REQUEST
            }
            TaskmillError::JobNotFound(_) => StatusCode::NOT_FOUND,
            TaskmillError::AlreadyTerminal(_) | TaskmillError::DuplicateId(_) => {
                StatusCode::CONFLICT
            }
            TaskmillError::QueueRejected(_)
            | TaskmillError::QueueFull(_)
            | TaskmillError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "API request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/{id}", get(job_status_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/api/jobs/{id}/progress", get(job_progress_handler))
        .route("/api/owners/{owner_id}/jobs", get(owner_jobs_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind `addr` and serve the HTTP API until `shutdown` fires.
///
/// Fails immediately if the address cannot be bound.
pub async fn run_dashboard(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_dashboard(listener, state, shutdown).await
}

/// Serve the HTTP API on an already bound listener until `shutdown` fires.
pub async fn serve_dashboard(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    tracing::info!(addr = ?listener.local_addr().ok(), "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let queue = state.coordinator.queue();
    Json(HealthResponse {
        status: "ok",
        queue_depth: queue.len(),
        queue_capacity: queue.capacity(),
        in_flight: queue.in_flight(),
        workers: state.pool.size(),
        busy_workers: state.pool.busy(),
        job_types: state
            .coordinator
            .registry()
            .job_types()
            .into_iter()
            .map(String::from)
            .collect(),
    })
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.coordinator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.coordinator.status(id).await?))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.coordinator.cancel(id).await?;
    Ok(Json(CancelJobResponse {
        job_id: id,
        cancelled: true,
    }))
}

async fn job_progress_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let events = state
        .coordinator
        .subscribe(id)
        .await?
        .map(|snapshot| Event::default().event("progress").json_data(snapshot));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn owner_jobs_handler(
    State(state): State<ApiState>,
    Path(owner_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.coordinator.list_by_owner(&owner_id).await?))
}
