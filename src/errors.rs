use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Errors returned by the token management API.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthorized",
                "invalid or missing credentials".to_string(),
            ),
            AppError::Forbidden(reason) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "forbidden",
                reason.clone(),
            ),
            AppError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                reason.clone(),
            ),
            AppError::NotFound(reason) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                reason.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

// ── OpenAI-compatible gateway errors ─────────────────────────

/// Error taxonomy of the chat completions gateway. The wire name is what
/// callers see in `error.type` and what lands in `api_call_audits.error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAIErrorKind {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    RateLimit,
    InsufficientQuota,
    Internal,
}

impl OpenAIErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenAIErrorKind::InvalidRequest => "invalid_request_error",
            OpenAIErrorKind::Unauthorized => "unauthorized",
            OpenAIErrorKind::Forbidden => "forbidden",
            OpenAIErrorKind::RateLimit => "rate_limit_error",
            OpenAIErrorKind::InsufficientQuota => "insufficient_quota",
            OpenAIErrorKind::Internal => "internal_error",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "invalid_request_error" => Some(OpenAIErrorKind::InvalidRequest),
            "unauthorized" => Some(OpenAIErrorKind::Unauthorized),
            "forbidden" => Some(OpenAIErrorKind::Forbidden),
            "rate_limit_error" => Some(OpenAIErrorKind::RateLimit),
            "insufficient_quota" => Some(OpenAIErrorKind::InsufficientQuota),
            "internal_error" => Some(OpenAIErrorKind::Internal),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            OpenAIErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            OpenAIErrorKind::Forbidden => StatusCode::FORBIDDEN,
            OpenAIErrorKind::RateLimit | OpenAIErrorKind::InsufficientQuota => {
                StatusCode::TOO_MANY_REQUESTS
            }
            OpenAIErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            OpenAIErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for OpenAIErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status code for an error type name; unknown names are client errors.
pub fn openai_error_status_code(error_type: &str) -> StatusCode {
    OpenAIErrorKind::from_wire(error_type)
        .map(|k| k.status_code())
        .unwrap_or(StatusCode::BAD_REQUEST)
}

#[derive(Debug, Clone)]
pub struct OpenAIError {
    pub kind: OpenAIErrorKind,
    pub message: String,
}

impl OpenAIError {
    pub fn new(kind: OpenAIErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAIErrorBody<'a> {
    error: OpenAIErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct OpenAIErrorDetail<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    error_type: &'a str,
}

impl IntoResponse for OpenAIError {
    fn into_response(self) -> Response {
        let body = OpenAIErrorBody {
            error: OpenAIErrorDetail {
                message: &self.message,
                error_type: self.kind.as_str(),
            },
        };
        (self.kind.status_code(), Json(body)).into_response()
    }
}
