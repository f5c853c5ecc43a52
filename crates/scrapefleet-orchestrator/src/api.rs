//! HTTP admin API for the orchestrator.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use scrapefleet_proto::TaskId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::registry::{WorkerRegistry, WorkerSnapshot};
use crate::tasks::{TaskPayload, TaskSnapshot, TaskStore};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<WorkerRegistry>,
    pub store: Arc<TaskStore>,
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Worker management
        .route("/workers", get(list_workers))
        .route("/workers/{id}", get(get_worker))
        .route("/workers/{id}/token", post(issue_worker_token))
        // Tasks
        .route("/tasks", get(list_tasks))
        .route("/tasks", post(submit_task))
        .route("/tasks/{id}", get(get_task))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        workers: state.registry.len(),
        tasks: state.store.len(),
    })
}

/// List all workers.
async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerResponse>> {
    let workers = state.registry.list_all();
    Json(workers.into_iter().map(WorkerResponse::from).collect())
}

/// Get a specific worker.
async fn get_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkerResponse>, StatusCode> {
    state
        .registry
        .get(&id)
        .map(|w| Json(WorkerResponse::from(w)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Issue or rotate a worker's token.
///
/// Creates the worker identity if it does not exist yet; otherwise the
/// previous token is invalidated, severing any live session the worker
/// has. This response is the only place a token ever appears.
async fn issue_worker_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<TokenResponse>) {
    let (status, token) = match state.registry.regenerate_token(&id) {
        Ok(token) => (StatusCode::OK, token),
        Err(_) => (StatusCode::CREATED, state.registry.issue_token(&id)),
    };

    (
        status,
        Json(TokenResponse {
            worker_id: id,
            token,
        }),
    )
}

/// List all tasks.
async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskResponse>> {
    let tasks = state.store.list_all();
    Json(tasks.into_iter().map(TaskResponse::from).collect())
}

/// Get a specific task.
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, StatusCode> {
    let task_id = TaskId::from_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    state
        .store
        .get(task_id)
        .map(|t| Json(TaskResponse::from(t)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Submit a new scrape task.
async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), StatusCode> {
    if request.target_url.is_empty() || request.bot_id.is_empty() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let task_id = state.store.enqueue(TaskPayload {
        target_url: request.target_url,
        bot_id: request.bot_id,
        params: request.params,
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitTaskResponse {
            task_id: task_id.to_string(),
        }),
    ))
}

// Request/response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    workers: usize,
    tasks: usize,
}

#[derive(Serialize)]
struct TokenResponse {
    worker_id: String,
    token: String,
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    target_url: String,
    bot_id: String,
    #[serde(default)]
    params: Vec<(String, String)>,
}

#[derive(Serialize)]
struct SubmitTaskResponse {
    task_id: String,
}

#[derive(Serialize)]
pub struct WorkerResponse {
    pub id: String,
    pub status: &'static str,
    pub current_task: Option<String>,
    pub last_heartbeat_secs_ago: u64,
    pub first_seen_secs_ago: u64,
}

impl From<WorkerSnapshot> for WorkerResponse {
    fn from(w: WorkerSnapshot) -> Self {
        Self {
            id: w.id,
            status: w.status,
            current_task: w.current_task.map(|t| t.to_string()),
            last_heartbeat_secs_ago: w.heartbeat_age.as_secs(),
            first_seen_secs_ago: w.first_seen.elapsed().as_secs(),
        }
    }
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub bot_id: String,
    pub target_url: String,
    pub status: &'static str,
    pub attempts: u32,
    pub last_error: Option<TaskErrorResponse>,
    pub assigned_worker: Option<String>,
    pub result_id: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Serialize)]
pub struct TaskErrorResponse {
    pub kind: &'static str,
    pub message: String,
}

impl From<TaskSnapshot> for TaskResponse {
    fn from(t: TaskSnapshot) -> Self {
        Self {
            id: t.id.to_string(),
            bot_id: t.bot_id,
            target_url: t.target_url,
            status: t.status,
            attempts: t.attempts,
            last_error: t.last_error.map(|(kind, message)| TaskErrorResponse {
                kind: kind.as_str(),
                message,
            }),
            assigned_worker: t.assigned_worker,
            result_id: t.result_id,
            completed_at: t.completed_at.map(|at| at.to_rfc3339()),
        }
    }
}
