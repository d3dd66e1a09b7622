use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::collector::CollectorSnapshot;
use crate::coordinator::Coordinator;
use crate::dispatcher::DispatchSnapshot;
use crate::error::DispatchError;
use crate::jobs::AgentResult;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Agent ids or glob patterns
    pub targets: Vec<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub results: BTreeMap<String, AgentResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
struct StatsResponse {
    in_flight: usize,
    dispatch: DispatchSnapshot,
    collector: CollectorSnapshot,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/run", post(run_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/agents", get(list_agents_handler))
        .route("/api/stats", get(stats_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

fn error_status(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::TargetSetEmpty | DispatchError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
        DispatchError::RegistryFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn run_handler(
    State(state): State<ApiState>,
    Json(request): Json<RunRequest>,
) -> impl IntoResponse {
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.coordinator.default_timeout());

    match state
        .coordinator
        .run_matching(&request.command, request.arguments, &request.targets, timeout)
        .await
    {
        Ok(results) => (StatusCode::OK, Json(RunResponse { results })).into_response(),
        Err(e) => {
            tracing::debug!(command = %request.command, error = %e, "Run request rejected");
            (
                error_status(&e),
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct JobResponse {
    id: Uuid,
    command: String,
    targets: usize,
    replied: usize,
    outstanding: Vec<String>,
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .coordinator
        .in_flight()
        .await
        .into_iter()
        .map(|job| JobResponse {
            id: job.id,
            command: job.command,
            targets: job.targets,
            replied: job.replied,
            outstanding: job.outstanding,
        })
        .collect();

    Json(jobs)
}

async fn list_agents_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.coordinator.agents().await)
}

async fn stats_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(StatsResponse {
        in_flight: state.coordinator.registry().len().await,
        dispatch: state.coordinator.dispatch_stats(),
        collector: state.coordinator.collector_stats(),
    })
}
