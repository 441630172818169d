//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use crate::engine::SubmitOptions;
use crate::error::EngineError;
use crate::model::{ExecutionStatus, TestType};
use crate::scheduler::{NewTask, TaskUpdate};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/tests", post(submit_test))
        .route("/tests/active", get(list_active))
        .route("/tests/results", get(list_results))
        .route("/tests/clear-completed", post(clear_completed))
        .route("/tests/{id}", get(get_test))
        .route("/tests/{id}/cancel", post(cancel_test))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/dry-run", get(dry_run))
        .route("/tasks/{id}", get(get_task).put(update_task).delete(delete_task))
        .route("/tasks/{id}/pause", post(pause_task))
        .route("/tasks/{id}/resume", post(resume_task))
        .route("/tasks/{id}/run-now", post(run_now))
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": { "message": message } })))
}

fn engine_error(e: EngineError) -> (StatusCode, Json<Value>) {
    let status = match e {
        EngineError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::UnknownExecution(_) => StatusCode::NOT_FOUND,
    };
    error_response(status, e.to_string())
}

fn task_error(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    let status = if e.to_string().contains("not found") {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    error_response(status, format!("{:#}", e))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.engine.stats();
    envelope(json!(stats))
}

#[derive(Deserialize)]
struct SubmitRequest {
    test_type: TestType,
    config: Value,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    tags: Vec<String>,
}

async fn submit_test(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let options = SubmitOptions {
        priority: req.priority,
        tags: req.tags,
        start_timeout: None,
    };
    let id = state
        .engine
        .submit(req.test_type, req.config, options)
        .map_err(engine_error)?;
    Ok((
        StatusCode::ACCEPTED,
        envelope(json!({ "execution_id": id })),
    ))
}

async fn get_test(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let exec = state
        .engine
        .get_status(id)
        .ok_or_else(|| engine_error(EngineError::UnknownExecution(id)))?;

    let mut data = json!(exec);
    if exec.status == ExecutionStatus::Pending {
        if let Some(position) = state.engine.queue_position(id) {
            data["queue_position"] = json!(position);
        }
    }
    Ok(envelope(data))
}

async fn cancel_test(State(state): State<AppState>, Path(id): Path<Uuid>) -> Json<Value> {
    let cancelled = state.engine.cancel(id);
    envelope(json!({ "cancelled": cancelled }))
}

async fn list_active(State(state): State<AppState>) -> Json<Value> {
    let active = state.engine.list_active();
    envelope(json!({ "executions": active, "total": active.len() }))
}

async fn list_results(State(state): State<AppState>) -> Json<Value> {
    let results = state.engine.list_results();
    envelope(json!({ "executions": results, "total": results.len() }))
}

async fn clear_completed(State(state): State<AppState>) -> Json<Value> {
    let removed = state.engine.clear_completed();
    envelope(json!({ "removed": removed }))
}

async fn list_tasks(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let tasks = state.scheduler.list_tasks().await.map_err(task_error)?;
    Ok(envelope(json!({ "tasks": tasks, "total": tasks.len() })))
}

async fn create_task(
    State(state): State<AppState>,
    Json(new): Json<NewTask>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let task = state.scheduler.create_task(new).await.map_err(task_error)?;
    Ok((StatusCode::CREATED, envelope(json!(task))))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state
        .scheduler
        .get_task(id)
        .await
        .map_err(task_error)?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, format!("task {} not found", id)))?;
    Ok(envelope(json!(task)))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state
        .scheduler
        .update_task(id, update)
        .await
        .map_err(task_error)?;
    Ok(envelope(json!(task)))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.scheduler.delete_task(id).await.map_err(task_error)?;
    Ok(envelope(json!({ "deleted": true })))
}

async fn pause_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state.scheduler.pause_task(id).await.map_err(task_error)?;
    Ok(envelope(json!(task)))
}

async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state.scheduler.resume_task(id).await.map_err(task_error)?;
    Ok(envelope(json!(task)))
}

async fn run_now(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let execution_id = state.scheduler.execute_now(id).await.map_err(task_error)?;
    Ok((
        StatusCode::ACCEPTED,
        envelope(json!({ "execution_id": execution_id })),
    ))
}

#[derive(Deserialize)]
struct DryRunQuery {
    #[serde(default = "default_hours")]
    hours: u64,
}

fn default_hours() -> u64 {
    24
}

async fn dry_run(
    State(state): State<AppState>,
    Query(query): Query<DryRunQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let preview = state
        .scheduler
        .preview_next_runs(query.hours)
        .await
        .map_err(task_error)?;
    let upcoming: Vec<Value> = preview
        .into_iter()
        .map(|(at, name, test_type)| {
            json!({ "at": at.to_rfc3339(), "task": name, "test_type": test_type })
        })
        .collect();
    Ok(envelope(json!({ "upcoming": upcoming })))
}
