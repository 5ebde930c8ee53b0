//! HTTP error mapping.
//!
//! Core errors translate to the documented status codes. Cross-user access
//! deliberately maps to 404 rather than 403 so callers cannot enumerate
//! other users' session ids.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use agentum_core::fs_layout::FsError;
use agentum_core::lifecycle::LifecycleError;
use agentum_core::runner::RunnerError;
use agentum_core::store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Gone(String),

    #[error("too many concurrent sessions")]
    Capacity,

    #[error("internal error")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Capacity => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if let ApiError::Internal(detail) = &self {
            log::error!("internal error: {detail}");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::Validation(msg) => ApiError::BadRequest(msg),
            LifecycleError::NotFound => ApiError::NotFound,
            LifecycleError::Transition { .. } => ApiError::Conflict(e.to_string()),
            LifecycleError::NotResumable(msg) => ApiError::Gone(msg),
            LifecycleError::Create(msg) => ApiError::Internal(msg),
            LifecycleError::Store(e) => ApiError::Internal(e.to_string()),
            LifecycleError::Fs(e) => e.into(),
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::Capacity => ApiError::Capacity,
            RunnerError::AlreadyRunning => ApiError::Conflict(e.to_string()),
            RunnerError::Lifecycle(e) => e.into(),
            RunnerError::Hub(e) => ApiError::Internal(e.to_string()),
            RunnerError::Store(e) => ApiError::Internal(e.to_string()),
            RunnerError::Fs(e) => e.into(),
        }
    }
}

impl From<FsError> for ApiError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::InvalidSessionId(_) => ApiError::BadRequest(e.to_string()),
            FsError::PathEscape(_) => ApiError::BadRequest(e.to_string()),
            FsError::NotFound(_) => ApiError::NotFound,
            FsError::Io { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}
