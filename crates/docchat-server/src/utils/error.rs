use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::document::ProcessError;
use crate::services::{ChatError, ExportError, ServiceError};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::PayloadTooLarge(msg) => {
                tracing::warn!("Payload too large: {}", msg);
                (StatusCode::PAYLOAD_TOO_LARGE, "PayloadTooLarge", msg)
            }
            ApiError::UnsupportedMediaType(msg) => {
                tracing::warn!("Unsupported media type: {}", msg);
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UnsupportedMediaType", msg)
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::error!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", msg)
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<ProcessError> for ApiError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::UnsupportedFormat { .. } => ApiError::UnsupportedMediaType(err.to_string()),
            ProcessError::SizeExceeded { .. } | ProcessError::BatchTooLarge { .. } => {
                ApiError::PayloadTooLarge(err.to_string())
            }
            ProcessError::Timeout(_) | ProcessError::Busy(_) => ApiError::ServiceUnavailable(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) | StoreError::MessageNotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::InvalidRecord(_) => ApiError::BadRequest(err.to_string()),
            StoreError::Persistence(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::ServiceUnavailable(err.to_string())
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Store(e) => e.into(),
            ChatError::UnknownModel(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::UnknownFormat(_) => ApiError::BadRequest(err.to_string()),
            ExportError::Cancelled => ApiError::ServiceUnavailable(err.to_string()),
            ExportError::Csv(_) | ExportError::Json(_) => ApiError::Internal(err.to_string()),
        }
    }
}
