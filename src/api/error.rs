use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

use super::models::ErrorResponse;
use crate::queue::QueueError;
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request invalid: {0}")]
    InvalidRequest(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("unsupported media format: {0}")]
    UnsupportedFormat(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UpstreamFetch(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "INVALID_REQUEST",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::UpstreamFetch(_) => "UPSTREAM_FETCH_FAILED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(json!(body))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::NotFound(id) => ApiError::NotFound(format!("session {id}")),
            SessionError::Terminal(id, status) => {
                ApiError::Conflict(format!("session {id} is {status:?}"))
            }
            SessionError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::JobNotFound(id) => ApiError::NotFound(format!("job {id}")),
            QueueError::JobProcessing(id) => {
                ApiError::Conflict(format!("job {id} is processing"))
            }
            QueueError::JobFinished(id) => ApiError::Conflict(format!("job {id} finished")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(value: crate::store::StoreError) -> Self {
        ApiError::Internal(value.to_string())
    }
}

impl From<crate::storage::StorageError> for ApiError {
    fn from(value: crate::storage::StorageError) -> Self {
        ApiError::Internal(value.to_string())
    }
}
