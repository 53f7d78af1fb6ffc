//! HTTP service surface.
//!
//! A thin axum binding of the task manager operations; streaming endpoints
//! are Server-Sent-Events adapters over the per-task event bus. No event
//! logic lives here.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::domain::errors::CoreError;
use crate::domain::models::{RunRequest, SandboxSpec, Task};
use crate::services::event_bus::EventSubscription;
use crate::services::metrics::Metrics;
use crate::services::task_manager::TaskManager;

#[derive(Clone)]
struct AppState {
    manager: TaskManager,
}

/// Build the router for the public surface.
pub fn router(manager: TaskManager) -> Router {
    let state = AppState { manager };
    Router::new()
        .route("/api/agent/info", get(get_agent_info))
        .route("/api/tasks", post(run_instruction_async).get(list_tasks))
        .route("/api/tasks/stream", post(run_instruction_streaming))
        .route("/api/tasks/:task_id", get(query_task_status))
        .route("/api/tasks/:task_id/cancel", post(cancel_task))
        .route("/api/tasks/:task_id/events", get(subscribe_task_events))
        .route("/api/sandboxes", post(create_sandbox))
        .route("/api/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any))
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(manager: TaskManager, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(manager);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http surface listening");
    axum::serve(listener, app).await
}

/// Translate domain error kinds to transport status codes.
fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::AlreadyExists(_) | CoreError::AlreadyTerminal(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ApiError(CoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = Json(serde_json::json!({"error": self.0.to_string()}));
        (status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

/// Status record exposed over the wire.
#[derive(Debug, Serialize)]
struct TaskStatusResponse {
    task_id: Uuid,
    status: String,
    instruction: String,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    sandbox_id: Option<String>,
    mode: String,
    max_steps: u32,
    platform: String,
    stats: crate::domain::models::TaskStats,
    final_message: Option<String>,
    plan: crate::domain::models::Plan,
}

impl From<Task> for TaskStatusResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status.as_str().to_string(),
            instruction: task.instruction,
            created_at: task.created_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            ended_at: task.ended_at.map(|t| t.to_rfc3339()),
            sandbox_id: task.sandbox_id,
            mode: task.mode.as_str().to_string(),
            max_steps: task.max_steps,
            platform: task.platform.as_str().to_string(),
            stats: task.stats,
            final_message: task.final_message,
            plan: task.plan,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
struct ListResponse {
    tasks: Vec<TaskStatusResponse>,
    total: usize,
    limit: usize,
    offset: usize,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: Uuid,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    success: bool,
    message: String,
}

async fn get_agent_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.manager.metrics().record_request("GetAgentInfo");
    Json(serde_json::to_value(state.manager.agent_info()).unwrap_or_default())
}

async fn run_instruction_async(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let metrics = state.manager.metrics();
    metrics.record_request("RunAgentInstructionAsync");
    let task_id = state.manager.submit(request).await.map_err(|e| {
        metrics.record_error("RunAgentInstructionAsync", status_for(&e).as_str());
        ApiError(e)
    })?;
    Ok(Json(SubmitResponse {
        task_id,
        status: "pending",
    }))
}

async fn run_instruction_streaming(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let metrics = state.manager.metrics();
    metrics.record_request("RunAgentInstruction");
    let (_task_id, subscription) = state.manager.run_streaming(request).await.map_err(|e| {
        metrics.record_error("RunAgentInstruction", status_for(&e).as_str());
        ApiError(e)
    })?;
    Ok(sse_stream(subscription, metrics, "RunAgentInstruction"))
}

async fn subscribe_task_events(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let metrics = state.manager.metrics();
    metrics.record_request("GetAgentTaskStream");
    let subscription = state.manager.subscribe(task_id).await.map_err(|e| {
        metrics.record_error("GetAgentTaskStream", status_for(&e).as_str());
        ApiError(e)
    })?;
    Ok(sse_stream(subscription, metrics, "GetAgentTaskStream"))
}

/// Adapt one bus subscription into an SSE stream. The open-stream gauge
/// drops with the stream, client disconnects included.
fn sse_stream(
    subscription: EventSubscription,
    metrics: Arc<Metrics>,
    method: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    struct StreamGuard {
        metrics: Arc<Metrics>,
        method: &'static str,
    }
    impl Drop for StreamGuard {
        fn drop(&mut self) {
            self.metrics.stream_closed(self.method);
        }
    }

    metrics.stream_opened(method);
    let guard = StreamGuard { metrics, method };

    let stream = futures::stream::unfold(
        (subscription, guard),
        |(mut subscription, guard)| async move {
            let event = subscription.next().await?;
            let payload =
                serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            let sse_event = Event::default().event(event.stage.as_str()).data(payload);
            Some((Ok(sse_event), (subscription, guard)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn query_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let metrics = state.manager.metrics();
    metrics.record_request("QueryTaskStatus");
    let task = state.manager.query(task_id).await.map_err(|e| {
        metrics.record_error("QueryTaskStatus", status_for(&e).as_str());
        ApiError(e)
    })?;
    Ok(Json(task.into()))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    let metrics = state.manager.metrics();
    metrics.record_request("CancelTask");
    let cancelled = state.manager.cancel(task_id).await.map_err(|e| {
        metrics.record_error("CancelTask", status_for(&e).as_str());
        ApiError(e)
    })?;
    Ok(Json(CancelResponse {
        success: cancelled,
        message: if cancelled {
            "cancellation requested".to_string()
        } else {
            "task already terminal".to_string()
        },
    }))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let metrics = state.manager.metrics();
    metrics.record_request("ListTasks");
    let (tasks, total) = state.manager.list(params.limit, params.offset).await?;
    Ok(Json(ListResponse {
        tasks: tasks.into_iter().map(Into::into).collect(),
        total,
        limit: params.limit,
        offset: params.offset,
    }))
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(spec): Json<SandboxSpec>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let metrics = state.manager.metrics();
    metrics.record_request("CreateSandbox");
    let handle = state.manager.create_sandbox(spec).await.map_err(|e| {
        metrics.record_error("CreateSandbox", status_for(&e).as_str());
        ApiError(e)
    })?;
    Ok(Json(serde_json::to_value(handle).unwrap_or_default()))
}

async fn get_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.manager.metrics().snapshot())
}
