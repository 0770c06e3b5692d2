//! Error type shared by the engine and the HTTP layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::backend::BackendError;
use crate::compose::ComposeError;
use crate::expiry::IndexError;
use crate::store::StoreError;

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// Missing or malformed request data.
    #[error("{0}")]
    InvalidInput(String),

    /// A well-formed request refused by policy (duplicate instance, capacity, ...).
    #[error("{0}")]
    Rejected(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("compose error: {0}")]
    Compose(#[from] ComposeError),

    /// Broken internal bookkeeping. Fails the request, never the process.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("task queue is closed")]
    QueueClosed,
}

impl RunnerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::Compose(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Rejected(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Backend(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<IndexError> for RunnerError {
    fn from(err: IndexError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "Error")]
    error: String,
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
