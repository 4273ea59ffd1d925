use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use boreal_core::intake::ValidationError;
use boreal_core::queue::QueueError;
use boreal_core::repository::StoreError;
use boreal_order::OrderError;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => {
                tracing::error!("internal server error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        match err {
            // Hide foreign orders instead of confirming they exist.
            OrderError::NotFound(id) | OrderError::NotOwner(id) => {
                AppError::NotFound(format!("order not found: {}", id))
            }
            OrderError::WrongState { .. } => AppError::Conflict(err.to_string()),
            OrderError::Store(inner) => inner.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            AppError::Unavailable("storage temporarily unavailable".to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full(_) => {
                AppError::Unavailable("order intake is at capacity, try again shortly".to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}
