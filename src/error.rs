use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("No available host with sufficient resources")]
    NoAvailableHost,

    #[error("{0}")]
    InsufficientResources(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Orchestration API error ({status}): {body}")]
    OrchestrationApi { status: u16, body: String },

    #[error("Orchestration transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "INSTANCE_NOT_FOUND",
            Self::NoAvailableHost => "NO_AVAILABLE_HOST",
            Self::InsufficientResources(_) => "INSUFFICIENT_RESOURCES",
            Self::Precondition(_) => "PRECONDITION_FAILED",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::OrchestrationApi { .. } => "ORCHESTRATION_ERROR",
            Self::Http(_) => "ORCHESTRATION_UNREACHABLE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoAvailableHost => StatusCode::SERVICE_UNAVAILABLE,
            Self::InsufficientResources(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Precondition(_) => StatusCode::CONFLICT,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::OrchestrationApi { .. } => StatusCode::BAD_GATEWAY,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let detail = match &self {
            Self::OrchestrationApi { body, .. } => Some(body.clone()),
            Self::Http(e) => Some(e.to_string()),
            Self::Storage(msg) => Some(msg.clone()),
            Self::Internal(msg) => Some(msg.clone()),
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                detail,
            },
        };

        (self.status_code(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
