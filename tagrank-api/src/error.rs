//! Error types for tagrank-api
//!
//! Every failure leaves the handler as
//! `{ "error": { "code", "message", "details" } }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tagrank_common::ValidationError;
use thiserror::Error;
use tracing::error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), e.g. a migration batch is already running
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Engine error, mapped by variant
    #[error(transparent)]
    Engine(#[from] tagrank_common::Error),
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, String, Value) {
        use tagrank_common::Error as E;

        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, Value::Null),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, Value::Null),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg, Value::Null),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg, Value::Null),
            ApiError::Engine(err) => {
                let message = err.to_string();
                match err {
                    E::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", message, Value::Null),
                    E::InvalidInput(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message, Value::Null),
                    E::Validation(ValidationError::CapacityExceeded {
                        work_id,
                        tag_id,
                        tag_name,
                        cap,
                        blocking_tags,
                    }) => (
                        StatusCode::CONFLICT,
                        "CAPACITY_EXCEEDED",
                        message,
                        json!({
                            "work_id": work_id,
                            "tag_id": tag_id,
                            "tag_name": tag_name,
                            "cap": cap,
                            "blocking_tags": blocking_tags,
                        }),
                    ),
                    E::Validation(ValidationError::ManualUnassign { tag_id }) => (
                        StatusCode::BAD_REQUEST,
                        "MANUAL_UNASSIGN",
                        message,
                        json!({ "tag_id": tag_id }),
                    ),
                    E::Validation(ValidationError::NotAttached { work_id, tag_id }) => (
                        StatusCode::NOT_FOUND,
                        "TAG_NOT_ATTACHED",
                        message,
                        json!({ "work_id": work_id, "tag_id": tag_id }),
                    ),
                    E::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", message, Value::Null),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message, Value::Null),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();

        if status.is_server_error() {
            error!(code, "{}", message);
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
                "details": details,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_capacity_exceeded_is_conflict_with_blocking_tags() {
        let err = ApiError::from(tagrank_common::Error::from(ValidationError::CapacityExceeded {
            work_id: Uuid::nil(),
            tag_id: 9,
            tag_name: "E/F".to_string(),
            cap: 3,
            blocking_tags: vec!["A/B".to_string(), "C/D".to_string(), "G/H".to_string()],
        }));

        let (status, code, message, details) = err.parts();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "CAPACITY_EXCEEDED");
        assert!(message.contains("A/B, C/D, G/H"));
        assert_eq!(details["blocking_tags"][2], "G/H");
    }

    #[test]
    fn test_engine_errors_map_to_status() {
        let cases = [
            (tagrank_common::Error::NotFound("Work".to_string()), StatusCode::NOT_FOUND),
            (tagrank_common::Error::InvalidInput("limit".to_string()), StatusCode::BAD_REQUEST),
            (tagrank_common::Error::Internal("boom".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).parts().0, expected);
        }
    }
}
