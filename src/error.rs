//! Error types for the container backend and the sandbox lifecycle.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures reported by a container backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("No such container: {0}")]
    ContainerNotFound(String),

    #[error("Image {image} is not available: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Exec was detached unexpectedly")]
    ExecDetached,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the sandbox manager to request handlers.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The id is not present in the registry.
    #[error("Container not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SandboxError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for SandboxError {
    fn from(rejection: JsonRejection) -> Self {
        SandboxError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}
