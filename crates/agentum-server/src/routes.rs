//! REST endpoints for sessions, tasks, and tokens.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentum_core::fs_layout::validate_session_id;
use agentum_core::lifecycle::ResumePlan;
use agentum_core::session::Session;
use agentum_core::{EventRecord, RunOverrides, SessionStatus};

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Request / response models
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
pub struct TokenRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub user_id: String,
    pub expires_in: i64,
}

/// Per-request agent overrides.
#[derive(Deserialize, Default, Clone)]
pub struct AgentConfigOverrides {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl From<AgentConfigOverrides> for RunOverrides {
    fn from(c: AgentConfigOverrides) -> Self {
        RunOverrides {
            model: c.model,
            max_turns: c.max_turns,
            timeout_seconds: c.timeout_seconds,
        }
    }
}

#[derive(Deserialize)]
pub struct RunTaskRequest {
    pub task: String,
    #[serde(default)]
    pub config: AgentConfigOverrides,
}

#[derive(Deserialize, Default)]
pub struct StartTaskRequest {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub config: AgentConfigOverrides,
}

#[derive(Serialize)]
pub struct TaskStartedResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub message: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub status: SessionStatus,
    pub task: String,
    pub model: Option<String>,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub num_turns: u32,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub cancel_requested: bool,
}

impl From<Session> for SessionResponse {
    fn from(s: Session) -> Self {
        Self {
            id: s.id,
            status: s.status,
            task: s.task,
            model: s.model,
            working_dir: s.working_dir,
            created_at: s.created_at,
            updated_at: s.updated_at,
            completed_at: s.completed_at,
            num_turns: s.num_turns,
            duration_ms: s.duration_ms,
            total_cost_usd: s.total_cost_usd,
            cancel_requested: s.cancel_requested,
        }
    }
}

#[derive(Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionResponse>,
    pub total: u64,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub message: String,
}

#[derive(Serialize)]
pub struct ResultMetrics {
    pub num_turns: u32,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub model: Option<String>,
}

#[derive(Serialize)]
pub struct ResultResponse {
    pub session_id: String,
    pub status: String,
    pub output: String,
    pub error: String,
    pub comments: String,
    pub result_files: Vec<String>,
    pub metrics: ResultMetrics,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub after: u64,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub events: Vec<EventRecord>,
}

#[derive(Deserialize)]
pub struct FileQuery {
    pub path: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/auth/token — issue a token for an existing or fresh
/// anonymous identity. The only unauthenticated endpoint.
pub async fn issue_token(
    State(state): State<SharedState>,
    body: Option<Json<TokenRequest>>,
) -> Result<Json<TokenResponse>, ApiError> {
    let requested = body.and_then(|Json(b)| b.user_id);
    let user = state
        .ctx
        .store
        .get_or_create_user(requested.as_deref())
        .await?;
    let (token, expires_in) = state
        .ctx
        .auth
        .issue(&user.id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(TokenResponse {
        token,
        user_id: user.id,
        expires_in,
    }))
}

/// GET /api/v1/sessions
pub async fn list_sessions(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let (sessions, total) = state
        .ctx
        .store
        .list_sessions(&user.user_id, query.limit.min(200), query.offset)
        .await?;
    Ok(Json(SessionListResponse {
        sessions: sessions.into_iter().map(SessionResponse::from).collect(),
        total,
    }))
}

/// POST /api/v1/sessions/run — create a session and start the task in one
/// call.
pub async fn run_task(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(request): Json<RunTaskRequest>,
) -> Result<(StatusCode, Json<TaskStartedResponse>), ApiError> {
    let session = state
        .ctx
        .lifecycle
        .create(&user.user_id, &request.task, request.config.model.as_deref())
        .await?;

    state
        .runner
        .start(&session, request.task, None, request.config.into())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(TaskStartedResponse {
            session_id: session.id,
            status: SessionStatus::Running,
            message: "task execution started".to_string(),
        }),
    ))
}

/// GET /api/v1/sessions/{id}
pub async fn get_session(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = owned_session(&state, &session_id, &user).await?;
    Ok(Json(session.into()))
}

/// POST /api/v1/sessions/{id}/task — continue or resume an existing session.
pub async fn start_task(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
    body: Option<Json<StartTaskRequest>>,
) -> Result<Json<TaskStartedResponse>, ApiError> {
    validate_session_id(&session_id).map_err(|_| ApiError::BadRequest("invalid session id".to_string()))?;
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let plan = state
        .ctx
        .lifecycle
        .resume(&session_id, &user.user_id, request.task.as_deref().unwrap_or(""))
        .await?;
    let ResumePlan {
        session,
        task,
        resume_id,
    } = plan;

    state
        .runner
        .start(&session, task, resume_id, request.config.into())
        .await?;

    Ok(Json(TaskStartedResponse {
        session_id,
        status: SessionStatus::Running,
        message: "task execution started".to_string(),
    }))
}

/// POST /api/v1/sessions/{id}/cancel
pub async fn cancel_task(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    validate_session_id(&session_id).map_err(|_| ApiError::BadRequest("invalid session id".to_string()))?;

    let signalled = state.runner.cancel(&session_id, &user.user_id).await?;
    let session = owned_session(&state, &session_id, &user).await?;
    Ok(Json(CancelResponse {
        session_id,
        status: session.status,
        message: if signalled {
            "cancellation requested".to_string()
        } else {
            "cancellation recorded; no run in progress".to_string()
        },
    }))
}

/// GET /api/v1/sessions/{id}/result — parsed output.yaml plus metrics.
pub async fn get_result(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<Json<ResultResponse>, ApiError> {
    let session = owned_session(&state, &session_id, &user).await?;
    let output = state.ctx.fs.parse_output(&session.id)?;

    Ok(Json(ResultResponse {
        session_id: session.id.clone(),
        status: output.status,
        output: output.output,
        error: output.error,
        comments: output.comments,
        result_files: output.result_files,
        metrics: ResultMetrics {
            num_turns: session.num_turns,
            duration_ms: session.duration_ms,
            total_cost_usd: session.total_cost_usd,
            model: session.model,
        },
    }))
}

/// GET /api/v1/sessions/{id}/events/history — batch replay of the persisted
/// event subset.
pub async fn events_history(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let session = owned_session(&state, &session_id, &user).await?;
    let events = state.ctx.store.list_events(&session.id, query.after).await?;
    Ok(Json(HistoryResponse { events }))
}

/// GET /api/v1/sessions/{id}/files?path=... — byte stream of a
/// workspace-relative file. Absolute and `..` paths are rejected.
pub async fn get_file(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let session = owned_session(&state, &session_id, &user).await?;
    let path = state.ctx.fs.resolve_workspace_file(&session.id, &query.path)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

/// GET /api/v1/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Fetch a session enforcing id format and ownership. Unknown and foreign
/// sessions are indistinguishable (both 404).
pub(crate) async fn owned_session(
    state: &SharedState,
    session_id: &str,
    user: &CurrentUser,
) -> Result<Session, ApiError> {
    validate_session_id(session_id)
        .map_err(|_| ApiError::BadRequest("invalid session id".to_string()))?;
    state
        .ctx
        .store
        .get_session(session_id, &user.user_id)
        .await?
        .ok_or(ApiError::NotFound)
}
