//! Task creation and lookup — POST /tasks, GET /tasks/{id}.
//!
//! Request:  `{"name": "...", "payload": {}, "priority": 5, "run_at": "2026-01-01T00:00:00Z", "max_retries": 3}`
//! Response: the full task record.
//! Error:    `{"detail": "..."}`
//!
//! Only task data is exposed; scheduler internals never leak into responses.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use taskq_core::TaskId;
use taskq_scheduler::{DeadLetter, NewTask, SchedulerError, Task};
use tracing::{error, warn};

use crate::app::AppState;

type ApiError = (StatusCode, Json<Value>);

fn detail(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(json!({ "detail": msg.into() })))
}

fn not_found() -> ApiError {
    detail(StatusCode::NOT_FOUND, "Task not found")
}

/// Store failures are logged in full and reported generically.
fn internal(e: SchedulerError) -> ApiError {
    error!(error = %e, "task store error");
    detail(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// POST /tasks
///
/// Creates a task in PENDING. 422 on malformed JSON or out-of-range fields.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> Result<Json<Task>, ApiError> {
    let Json(new) = body.map_err(|e| {
        warn!(error = %e, "rejected task body");
        detail(StatusCode::UNPROCESSABLE_ENTITY, e.body_text())
    })?;

    match state.tasks.create(new, Utc::now()) {
        Ok(task) => Ok(Json(task)),
        Err(SchedulerError::InvalidTask(msg)) => {
            Err(detail(StatusCode::UNPROCESSABLE_ENTITY, msg))
        }
        Err(e) => Err(internal(e)),
    }
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    state
        .tasks
        .get(&TaskId(id))
        .map_err(internal)?
        .map(Json)
        .ok_or_else(not_found)
}

/// GET /tasks/{id}/dead-letters
///
/// Empty array for a task that is alive; 404 for an unknown id.
pub async fn get_dead_letters(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let id = TaskId(id);
    if state.tasks.get(&id).map_err(internal)?.is_none() {
        return Err(not_found());
    }
    state.tasks.dead_letters_for(&id).map(Json).map_err(internal)
}
