use crate::services::{file_lifecycle::LifecycleError, record_store::RecordError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 409 Conflict
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<RecordError> for AppError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::BucketNotFound(_) | RecordError::FileNotFound(_) => {
                AppError::not_found(err.to_string())
            }
            RecordError::SlugTaken(_) | RecordError::IntegrityViolation(_) => {
                AppError::conflict(err.to_string())
            }
            RecordError::Sqlx(ref inner) => {
                tracing::error!(error = %inner, "database error");
                AppError::internal("database error")
            }
        }
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::BucketNotFound(_) | LifecycleError::FileNotFound(_) => {
                AppError::not_found(err.to_string())
            }
            LifecycleError::IntegrityViolation(_) => AppError::conflict(err.to_string()),
            LifecycleError::StorageWriteFailed(ref inner)
            | LifecycleError::StorageReadFailed(ref inner) => {
                tracing::error!(error = %inner, "{}", err);
                AppError::internal(err.to_string())
            }
            LifecycleError::Record(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_store::BlobError;

    #[test]
    fn maps_domain_errors_to_status_codes() {
        let cases: Vec<(AppError, StatusCode)> = vec![
            (RecordError::SlugTaken("v1-0".into()).into(), StatusCode::CONFLICT),
            (RecordError::BucketNotFound(1).into(), StatusCode::NOT_FOUND),
            (LifecycleError::FileNotFound(2).into(), StatusCode::NOT_FOUND),
            (
                LifecycleError::IntegrityViolation("gone".into()).into(),
                StatusCode::CONFLICT,
            ),
            (
                LifecycleError::StorageWriteFailed(BlobError::InvalidLocator("x".into())).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                LifecycleError::Record(RecordError::SlugTaken("a".into())).into(),
                StatusCode::CONFLICT,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.status, expected, "{}", err.message);
        }
    }
}
