//! Route table and handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine::{Engine, EngineError, TaskReport};
use crate::task::{Task, TaskId};
use crate::util::{nanos_from_usd, truncate_chars, NANOS_PER_USD};

/// Start the HTTP server and block until it exits.
pub async fn serve(config: &Config, engine: Arc<Engine>) -> anyhow::Result<()> {
    let app = router(engine);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/task", post(create_task))
        .route("/api/task/:id", get(get_task))
        .route("/api/task/:id/approve", post(approve_task))
        .route("/api/task/:id/reject", post(reject_task))
        .route("/api/tasks", get(list_tasks))
        .route("/api/status", get(get_status))
        .route("/api/cost", get(get_cost))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err {
            EngineError::TaskNotFound(_) | EngineError::CheckpointNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::CorruptCheckpoint(_) | EngineError::Repo(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError(status, err.to_string())
    }
}

fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, format!("invalid task id '{}'", raw)))
}

fn usd(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_USD as f64
}

/// Task record as rendered over the API (money in USD).
#[derive(Debug, Serialize)]
struct TaskView {
    id: String,
    parent_id: Option<String>,
    depth: u8,
    status: String,
    role: String,
    description: String,
    model: Option<String>,
    step_count: u32,
    max_steps: u32,
    budget_usd: f64,
    cost_usd: f64,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id.to_string(),
            parent_id: task.parent_id.map(|p| p.to_string()),
            depth: task.depth,
            status: task.status.as_str().to_string(),
            role: task.role.as_str().to_string(),
            description: task.description,
            model: task.model,
            step_count: task.step_count,
            max_steps: task.max_steps,
            budget_usd: usd(task.budget_nanos),
            cost_usd: usd(task.cost_nanos),
            result: task.result,
            error: task.error,
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    description: String,
    /// Optional explicit budget in USD; wins over a `$N` prefix
    budget_usd: Option<f64>,
}

async fn create_task(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<TaskReport>, ApiError> {
    if request.description.trim().is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "description must not be empty".to_string(),
        ));
    }
    let budget = request.budget_usd.map(nanos_from_usd);
    let report = engine.submit(&request.description, budget).await?;
    Ok(Json(report))
}

async fn get_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let id = parse_id(&id)?;
    let task = engine
        .task(&id)
        .await?
        .ok_or(ApiError(StatusCode::NOT_FOUND, format!("task {} not found", id)))?;
    Ok(Json(task.into()))
}

async fn approve_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<TaskReport>, ApiError> {
    let id = parse_id(&id)?;
    let report = engine.resume(&id).await?;
    Ok(Json(report))
}

async fn reject_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    engine.reject(&id).await?;
    Ok(Json(json!({ "task_id": id.to_string(), "status": "rejected" })))
}

async fn list_tasks(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let tasks = engine.active_tasks().await?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

async fn get_status(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = engine.status_summary().await?;
    Ok(Json(json!({
        "queued": summary.queued,
        "in_progress": summary.in_progress,
        "daily_usd": usd(summary.daily_cost_nanos),
        "monthly_usd": usd(summary.monthly_cost_nanos),
    })))
}

async fn get_cost(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = engine.status_summary().await?;
    let active = engine.active_tasks().await?;

    let budgets: Vec<serde_json::Value> = active
        .iter()
        .filter(|t| t.parent_id.is_none())
        .map(|t| {
            json!({
                "task_id": t.id.to_string(),
                "description": truncate_chars(&t.description, 50),
                "cost_usd": usd(t.cost_nanos),
                "budget_usd": usd(t.budget_nanos),
            })
        })
        .collect();

    Ok(Json(json!({
        "daily_usd": usd(summary.daily_cost_nanos),
        "monthly_usd": usd(summary.monthly_cost_nanos),
        "active_budgets": budgets,
    })))
}
