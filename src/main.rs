mod config;
mod http;
mod llm;
mod lock;
mod metrics;
mod models;
mod pipeline;
mod projection;
mod queue;
mod retry;
mod runner;
mod security;
mod sheets;
mod snapshot;
mod stages;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::RunnerConfig;
use eyre::WrapErr;
use lock::FileLock;
use models::{ApiError, IntakeError, RunEnvelope, Submission, SubmissionRequest};
use pipeline::Pipeline;
use projection::LlmProjector;
use queue::{FailedQueueItem, QueueError, QueueItem, WorkQueue};
use retry::RetryPolicy;
use runner::{Orchestrator, RunnerBusy, RunnerStatus, SubmitOutcome};
use security::{AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use sheets::{DisabledSheets, SheetWriter, SheetsClient};
use snapshot::FileSnapshotStore;
use stages::remote::RemoteStages;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "research.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = RunnerConfig::from_env();
    let auth_state = AuthState::from_env();
    let state = AppState {
        orchestrator: build_orchestrator(&config),
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/api/submissions", post(create_submission))
        .route("/api/runs", post(run_now))
        .route("/api/status", get(runner_status))
        .route("/api/queue", get(list_queue).delete(clear_queue))
        .route("/api/queue/failed", get(list_failed))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(4000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "research.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .await
        .wrap_err("http server stopped")?;
    Ok(())
}

fn build_orchestrator(config: &RunnerConfig) -> Orchestrator {
    let lock = FileLock::new(
        config.queue.lock_file.clone(),
        config.lock_timeout,
        config.lock_retry_interval,
    );
    info!(
        target = "research.api",
        queue = %config.queue.queue_file.display(),
        lock = %lock.path().display(),
        "using file queue"
    );
    let queue = WorkQueue::new(&config.queue, Arc::new(lock));

    let projector = LlmProjector::new(llm::LlmClient::new(llm::LlmConfig::from_env()));
    let pipeline = Pipeline::new(
        Arc::new(RemoteStages::from_env()),
        Arc::new(projector),
        config.stages.clone(),
        RetryPolicy::new(config.max_stage_attempts),
    );

    let sheets: Arc<dyn SheetWriter> = match SheetsClient::from_env() {
        Some(client) => Arc::new(client),
        None => {
            warn!(target = "research.api", "spreadsheet credentials missing; sheet writes disabled");
            Arc::new(DisabledSheets)
        }
    };

    Orchestrator::new(
        pipeline,
        queue,
        Arc::new(FileSnapshotStore::new(config.snapshot_path.clone())),
        sheets,
    )
}

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

/// Liveness probe. No auth.
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Serialize)]
struct SubmissionResponse {
    ok: bool,
    message: String,
    queued: bool,
    payload: Submission,
}

/// Accept a batch of brands → countries → products.
///
/// - Method: `POST`
/// - Path: `/api/submissions`
/// - Auth: `Authorization: Bearer <key>` or `X-API-Key: <key>`
///
/// Starts a background run when the runner is idle; otherwise the batch is
/// queued and picked up after the current run.
async fn create_submission(
    State(state): State<AppState>,
    Json(request): Json<SubmissionRequest>,
) -> Result<(StatusCode, Json<SubmissionResponse>), AppError> {
    metrics::inc_requests("/api/submissions");
    let submission = request.into_submission()?;
    info!(
        target = "research.api",
        brands = submission.brands.len(),
        products = submission.product_count(),
        "submission accepted"
    );

    let (status, message, queued) = match state.orchestrator.submit(submission.clone()).await {
        SubmitOutcome::Started => (
            StatusCode::OK,
            "Scraper started successfully in the background".to_string(),
            false,
        ),
        SubmitOutcome::Queued { queue_length } => (
            StatusCode::ACCEPTED,
            format!("Scraper is busy; submission queued at position {queue_length}"),
            true,
        ),
        SubmitOutcome::QueueBusy => return Err(AppError::QueueBusy),
    };

    Ok((
        status,
        Json(SubmissionResponse {
            ok: true,
            message,
            queued,
            payload: submission,
        }),
    ))
}

/// Runs a submission in the foreground and answers with the full result
/// tree. Refused with 409 while another run holds the runner.
async fn run_now(
    State(state): State<AppState>,
    Json(request): Json<SubmissionRequest>,
) -> Result<(StatusCode, Json<RunEnvelope>), AppError> {
    metrics::inc_requests("/api/runs");
    let submission = request.into_submission()?;
    let envelope = state
        .orchestrator
        .run(submission, true)
        .await
        .map_err(|RunnerBusy| AppError::Busy)?;
    // Drain in the background so the response does not wait on queued work.
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.drain().await;
    });
    let status = if envelope.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(envelope)))
}

async fn runner_status(State(state): State<AppState>) -> Json<RunnerStatus> {
    metrics::inc_requests("/api/status");
    Json(state.orchestrator.status().await)
}

/// Pending submissions as currently on disk.
async fn list_queue(State(state): State<AppState>) -> Json<Vec<QueueItem>> {
    metrics::inc_requests("/api/queue");
    Json(state.orchestrator.pending().await)
}

async fn list_failed(State(state): State<AppState>) -> Json<Vec<FailedQueueItem>> {
    metrics::inc_requests("/api/queue/failed");
    Json(state.orchestrator.failed().await)
}

async fn clear_queue(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    metrics::inc_requests("/api/queue");
    state.orchestrator.clear_queue().await?;
    info!(target = "research.api", "queue cleared");
    Ok(Json(json!({ "ok": true })))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4 * 1024 * 1024)
}

#[derive(Debug)]
enum AppError {
    Intake(IntakeError),
    Busy,
    QueueBusy,
    Queue(QueueError),
}

impl From<IntakeError> for AppError {
    fn from(value: IntakeError) -> Self {
        Self::Intake(value)
    }
}

impl From<QueueError> for AppError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::Intake(err) => (StatusCode::BAD_REQUEST, err.to_string(), None),
            AppError::Busy => (
                StatusCode::CONFLICT,
                "runner busy".to_string(),
                Some("A run is already in progress; submit it to the queue instead".to_string()),
            ),
            AppError::QueueBusy => (
                StatusCode::SERVICE_UNAVAILABLE,
                "queue busy".to_string(),
                Some("Could not lock the work queue; retry shortly".to_string()),
            ),
            AppError::Queue(err) => {
                error!(target = "research.api", error = %err, "queue operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "queue_error".to_string(),
                    Some(err.to_string()),
                )
            }
        };
        (status, Json(ApiError { error, detail })).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
