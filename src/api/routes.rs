//! REST endpoints for the worker API.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, QueueError};
use crate::pipeline::Pipeline;
use crate::task::service::{NewTask, TaskService};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    pub pipeline: Arc<dyn Pipeline>,
    /// Shared-secret bearer token. `None` disables auth.
    pub api_token: Option<SecretString>,
    started_at: std::time::Instant,
}

/// Build the Axum router for the worker API.
pub fn worker_routes(
    service: Arc<TaskService>,
    pipeline: Arc<dyn Pipeline>,
    api_token: Option<SecretString>,
) -> Router {
    let state = AppState {
        service,
        pipeline,
        api_token,
        started_at: std::time::Instant::now(),
    };

    let protected = Router::new()
        .route("/worker/health", get(health))
        .route("/worker/task", post(create_task))
        .route("/worker/task/{id}", get(get_task))
        .route("/worker/task/{id}/input", post(task_input))
        .route("/worker/tasks/cleanup", post(cleanup_tasks))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(index))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Reject requests without the expected bearer token. A missing token
/// configuration disables the check (local development).
async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_token else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected.expose_secret());

    if authorized {
        next.run(request).await
    } else {
        warn!("rejected request with missing or bad bearer token");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response()
    }
}

/// Map a service error to an HTTP response.
fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Lock(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::TaskNotFound { .. } => StatusCode::NOT_FOUND,
        Error::Queue(QueueError::TaskNotActive { .. }) => StatusCode::BAD_REQUEST,
        Error::Queue(_) => StatusCode::CONFLICT,
        Error::Pipeline(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "request failed");
    }
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

async fn index() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "site-assist"
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.service.health().await {
        Ok(counts) => Json(serde_json::json!({
            "status": "ok",
            "store_connection": true,
            "active_sessions": counts.active_sessions,
            "active_tasks": counts.active_tasks,
            "queue_length": counts.queue_length,
            "total_tasks": counts.total_tasks,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }))
        .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "store_connection": false,
                "error": err.to_string(),
            })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    instruction: String,
    chat_id: String,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    webhook_url: Option<String>,
}

fn default_source() -> String {
    "telegram".to_string()
}

#[derive(Deserialize)]
struct CreateTaskQuery {
    #[serde(default)]
    dry_run: Option<bool>,
}

async fn create_task(
    State(state): State<AppState>,
    Query(query): Query<CreateTaskQuery>,
    Json(mut req): Json<CreateTaskRequest>,
) -> Response {
    // `?dry_run=true` overrides the body flag.
    if let Some(dry_run) = query.dry_run {
        req.dry_run = dry_run;
    }
    let chat_id = req.chat_id.clone();
    let dry_run = req.dry_run;
    let result = state
        .service
        .create_task(NewTask {
            chat_id: req.chat_id,
            source: req.source,
            user_input: req.instruction,
            dry_run: req.dry_run,
            webhook_url: req.webhook_url,
        })
        .await;

    match result {
        Ok(created) => Json(serde_json::json!({
            "task_id": created.task_id,
            "status": created.status,
            "position_in_queue": created.position_in_queue,
            "chat_id": chat_id,
            "dry_run": dry_run,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.service.get_task_view(id).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct TaskInputRequest {
    #[serde(default)]
    approval: Option<bool>,
    #[serde(default)]
    answer: Option<String>,
}

async fn task_input(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TaskInputRequest>,
) -> Response {
    let input = match (req.approval, req.answer) {
        (Some(true), _) => "approved".to_string(),
        (Some(false), _) => "rejected".to_string(),
        (None, Some(answer)) => answer,
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "approval or answer required"})),
            )
                .into_response();
        }
    };

    // Hold the execution slot for the whole synchronous run so the
    // background sweep cannot dispatch the task a second time.
    let Some(_slot) = state.service.try_begin_execution(id) else {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": format!("Task {id} is already being processed")})),
        )
            .into_response();
    };

    if let Err(err) = state.service.accept_input(id).await {
        return error_response(err);
    }

    info!(task_id = %id, "user input accepted");
    match state.pipeline.process(id, &input).await {
        Ok(outcome) => {
            if let Err(err) = state.service.record_outcome(id, &outcome).await {
                return error_response(err);
            }
            Json(serde_json::json!({
                "task_id": id,
                "response": outcome.response,
                "awaiting_input": outcome.awaiting_input,
                "input_type": outcome.input_type,
            }))
            .into_response()
        }
        Err(err) => {
            if let Err(record_err) = state
                .service
                .fail_task(id, &format!("pipeline error: {err}"))
                .await
            {
                warn!(task_id = %id, error = %record_err, "failed to record pipeline error");
            }
            error_response(err.into())
        }
    }
}

#[derive(Deserialize)]
struct CleanupRequest {
    task_ids: Vec<Uuid>,
    #[serde(default)]
    reason: Option<String>,
}

async fn cleanup_tasks(
    State(state): State<AppState>,
    Json(req): Json<CleanupRequest>,
) -> Response {
    let reason = req.reason.unwrap_or_else(|| "manual cleanup".to_string());
    match state.service.cleanup_tasks(&req.task_ids, &reason).await {
        Ok(report) => Json(serde_json::json!({
            "updated": report.updated,
            "skipped_terminal": report.skipped_terminal,
            "not_found": report.not_found,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}
