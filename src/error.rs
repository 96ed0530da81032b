use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Typed error taxonomy for the control plane (see design doc §7).
#[derive(Debug, thiserror::Error)]
pub enum NexusError {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NexusError {
    pub fn status(&self) -> StatusCode {
        match self {
            NexusError::Validation(_) => StatusCode::BAD_REQUEST,
            NexusError::NotFound(_) => StatusCode::NOT_FOUND,
            NexusError::Conflict(_) => StatusCode::CONFLICT,
            NexusError::Unauthenticated => StatusCode::UNAUTHORIZED,
            NexusError::LaunchFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NexusError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
}

impl IntoResponse for NexusError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        let kind = match &self {
            NexusError::Validation(_) => "INVALID_ARGUMENT",
            NexusError::NotFound(_) => "NOT_FOUND",
            NexusError::Conflict(_) => "CONFLICT",
            NexusError::Unauthenticated => "UNAUTHENTICATED",
            NexusError::LaunchFailed(_) => "LAUNCH_FAILED",
            NexusError::Internal(_) => "INTERNAL",
        };
        let body = ErrorBody {
            error: kind.to_string(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for NexusError {
    fn from(e: rusqlite::Error) -> Self {
        NexusError::Internal(format!("sqlite: {e}"))
    }
}

impl From<r2d2::Error> for NexusError {
    fn from(e: r2d2::Error) -> Self {
        NexusError::Internal(format!("db pool: {e}"))
    }
}

impl From<std::io::Error> for NexusError {
    fn from(e: std::io::Error) -> Self {
        NexusError::Internal(format!("io: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, NexusError>;
