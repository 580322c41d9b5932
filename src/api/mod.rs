//! REST routes over the task queue and store.

pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use secrecy::SecretString;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::error::TaskError;
use crate::queue::TaskQueue;
use crate::store::TaskStore;
use crate::tasks::{Parameters, TaskSpec, TaskStatus};

/// Page size when the caller does not ask for one.
const DEFAULT_LIST_LIMIT: u32 = 50;

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<TaskQueue>,
    pub store: Arc<dyn TaskStore>,
    pub api_key: Arc<SecretString>,
}

/// Build the router. Everything except `/health` requires `X-API-Key`.
pub fn task_routes(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/queue", get(queue_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Task errors mapped onto HTTP status codes.
pub struct ApiError(TaskError);

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TaskError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
            TaskError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TaskError::QueueFull { .. } | TaskError::QueueClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TaskError::Database(e) => {
                error!("Database error while serving request: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
            _ => self.0.to_string(),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Submission body. Also accepts the field names of the earlier API.
#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(alias = "url")]
    target: String,
    #[serde(alias = "task_description")]
    instructions: String,
    #[serde(default, alias = "form_data")]
    parameters: Parameters,
    #[serde(default, alias = "callback_url")]
    callback_endpoint: Option<String>,
    /// Seconds.
    #[serde(default)]
    timeout: Option<u64>,
}

impl From<CreateTaskRequest> for TaskSpec {
    fn from(req: CreateTaskRequest) -> Self {
        Self {
            target: req.target,
            instructions: req.instructions,
            parameters: req.parameters,
            callback_endpoint: req.callback_endpoint,
            timeout: req.timeout.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let database_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            error!("Health check: database unreachable: {e}");
            false
        }
    };
    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "api": "healthy",
            "database": if database_ok { "healthy" } else { "unhealthy" },
            "queue_size": state.queue.queue_depth(),
        })),
    )
}

async fn create_task(
    State(state): State<ApiState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state.queue.submit(body.into()).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Ok(invalid_id());
    };
    match state.store.get(id).await? {
        Some(task) => Ok(Json(task).into_response()),
        None => Err(TaskError::NotFound { id }.into()),
    }
}

async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<TaskStatus>()
                .map_err(|reason| TaskError::validation("status", reason))?,
        ),
    };
    let page = state
        .store
        .list(
            status,
            query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(page).into_response())
}

async fn delete_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Ok(invalid_id());
    };
    if state.store.delete(id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(TaskError::NotFound { id }.into())
    }
}

async fn queue_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "queue_length": state.queue.queue_depth(),
        "max_queue_size": state.queue.max_queue_size(),
        "current_task": state.queue.current_task().await,
        "running": state.queue.is_running().await,
    }))
}

fn invalid_id() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": "Invalid task ID"})),
    )
        .into_response()
}
