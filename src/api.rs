//! REST surface
//!
//! Versioned under `/api/v1`, JSON everywhere. Handlers are thin: look up,
//! delegate, map errors onto the status-code table. The WebSocket attach
//! claims the terminal's single-writer slot *before* upgrading so a second
//! attach is rejected with 409 instead of a dead socket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use cks_model::{Scenario, VmTarget};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::admin::{BootstrapError, PoolBootstrapper};
use crate::pool::{ClusterPool, PoolError};
use crate::scenario::ScenarioCatalog;
use crate::session::{Session, SessionError, SessionManager, TaskStatus};
use crate::terminal::{TerminalError, TerminalMux};

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub terminals: TerminalMux,
    pub pool: ClusterPool,
    pub catalog: Arc<ScenarioCatalog>,
    pub bootstrap: PoolBootstrapper,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/sessions", post(create_session).get(list_sessions))
        .route("/api/v1/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/v1/sessions/{id}/extend", put(extend_session))
        .route("/api/v1/sessions/{id}/tasks", get(list_tasks))
        .route(
            "/api/v1/sessions/{id}/tasks/{task_id}/validate",
            post(validate_task),
        )
        .route("/api/v1/sessions/{id}/terminals", post(create_terminal))
        .route("/api/v1/terminals/{id}/attach", get(attach_terminal))
        .route("/api/v1/terminals/{id}/resize", post(resize_terminal))
        .route("/api/v1/terminals/{id}", delete(close_terminal))
        .route("/api/v1/scenarios", get(list_scenarios))
        .route("/api/v1/scenarios/categories", get(scenario_categories))
        .route("/api/v1/scenarios/{id}", get(get_scenario))
        .route("/api/v1/admin/bootstrap-pool", post(bootstrap_pool))
        .route("/api/v1/admin/pool-status", get(pool_status))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    warn!("unhandled path: {}", req.uri());
    ApiError::new(StatusCode::NOT_FOUND, "not found")
}

// --- error mapping ---

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let status = match &e {
            SessionError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            SessionError::NotFound(_)
            | SessionError::UnknownScenario(_)
            | SessionError::UnknownTask(..) => StatusCode::NOT_FOUND,
            SessionError::NotRunning(_) => StatusCode::PRECONDITION_FAILED,
            SessionError::StageFailed { .. } | SessionError::Vm(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<TerminalError> for ApiError {
    fn from(e: TerminalError) -> Self {
        let status = match &e {
            TerminalError::NotFound(_) => StatusCode::NOT_FOUND,
            TerminalError::Busy(_) => StatusCode::CONFLICT,
            TerminalError::Pty(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        let status = match &e {
            PoolError::NoCapacity => StatusCode::TOO_MANY_REQUESTS,
            PoolError::UnknownCluster(_) | PoolError::NotAssigned(_) => StatusCode::NOT_FOUND,
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<BootstrapError> for ApiError {
    fn from(e: BootstrapError) -> Self {
        ApiError::new(StatusCode::CONFLICT, e.to_string())
    }
}

// --- sessions ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    #[serde(default)]
    scenario_id: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .create_session(&req.scenario_id)
        .await
        .map_err(|e| match e {
            // an unknown scenario in the create body is a bad request, not a
            // missing resource
            SessionError::UnknownScenario(id) => ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("scenario '{id}' not found"),
            ),
            other => other.into(),
        })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"sessionId": session.id, "status": session.status})),
    ))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.sessions.list_sessions().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.sessions.observe(&id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.delete_session(&id).await?;
    Ok(Json(json!({"status": "deleting"})))
}

#[derive(Deserialize)]
struct ExtendRequest {
    minutes: Option<u64>,
}

async fn extend_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> Result<Json<Session>, ApiError> {
    let minutes = req.minutes.unwrap_or(30);
    let session = state
        .sessions
        .extend_session(&id, Duration::from_secs(60 * minutes))
        .await?;
    Ok(Json(session))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TaskStatus>>, ApiError> {
    Ok(Json(state.sessions.session_tasks(&id).await?))
}

async fn validate_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.sessions.validate_task(&id, &task_id).await?;
    Ok(Json(result))
}

// --- terminals ---

#[derive(Deserialize)]
struct CreateTerminalRequest {
    target: String,
}

async fn create_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateTerminalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = VmTarget::parse(&req.target).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "target must be 'control-plane' or 'worker-node'",
        )
    })?;

    let (namespace, vm_name) = state.sessions.authorize_terminal(&id, target).await?;
    let terminal_id = state.terminals.create(&id, target, &namespace, &vm_name).await;
    state.sessions.record_terminal(&id, &terminal_id, target).await;

    Ok((StatusCode::CREATED, Json(json!({"terminalId": terminal_id}))))
}

async fn attach_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    // claim the slot before upgrading; conflicts surface as plain HTTP 409
    let permit = match state.terminals.begin_attach(&id).await {
        Ok(permit) => permit,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let mux = state.terminals.clone();
    // origin checks are permissive: the API gateway in front is trusted
    ws.on_upgrade(move |socket| async move { mux.serve(permit, socket).await })
}

#[derive(Deserialize)]
struct ResizeRequest {
    rows: u16,
    cols: u16,
}

async fn resize_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.rows == 0 || req.cols == 0 {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "rows and cols must both be positive",
        ));
    }
    state.terminals.resize(&id, req.rows, req.cols).await?;
    Ok(Json(json!({"status": "ok"})))
}

async fn close_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = state.terminals.get(&id).await.map(|r| r.session_id.clone());
    state.terminals.close(&id).await?;
    if let Some(session_id) = session_id {
        state.sessions.forget_terminal(&session_id, &id).await;
    }
    Ok(Json(json!({"status": "closed"})))
}

// --- scenario catalog read-through ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioSummary {
    id: String,
    name: String,
    description: String,
    category: String,
    task_count: usize,
}

impl From<&Scenario> for ScenarioSummary {
    fn from(s: &Scenario) -> Self {
        ScenarioSummary {
            id: s.id.clone(),
            name: s.name.clone(),
            description: s.description.clone(),
            category: s.category.clone(),
            task_count: s.tasks.len(),
        }
    }
}

async fn list_scenarios(State(state): State<AppState>) -> Json<Vec<ScenarioSummary>> {
    Json(state.catalog.list().map(ScenarioSummary::from).collect())
}

async fn get_scenario(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Scenario>, ApiError> {
    state
        .catalog
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("scenario '{id}' not found")))
}

async fn scenario_categories(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.catalog.categories())
}

// --- admin ---

async fn bootstrap_pool(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.bootstrap.start()?;
    Ok(Json(json!({"status": "bootstrap started"})))
}

async fn pool_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.status().await)
}
