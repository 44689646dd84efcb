//! HTTP error mapping for the boundary handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use blackbelt_core::EngineError;

/// Boundary error: an engine error kind plus the HTTP status it maps to.
/// Failure bodies always carry `{ success: false, errors: [...] }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    code: &'static str,
    errors: Vec<String>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let (status, code) = match &error {
            EngineError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            EngineError::UnknownTool(_) => (StatusCode::NOT_FOUND, "unknown_tool"),
            EngineError::UnknownEntity(_) => (StatusCode::NOT_FOUND, "unknown_entity"),
            EngineError::InsufficientData(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_data")
            }
            EngineError::BadTransition(_) => (StatusCode::CONFLICT, "bad_transition"),
            EngineError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            EngineError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            code,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            success: false,
            code: self.code,
            errors: vec![self.message],
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_kinds_map_to_statuses() {
        let cases = [
            (EngineError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::UnknownTool("x".into()), StatusCode::NOT_FOUND),
            (EngineError::UnknownEntity("x".into()), StatusCode::NOT_FOUND),
            (
                EngineError::InsufficientData("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (EngineError::BadTransition("x".into()), StatusCode::CONFLICT),
            (
                EngineError::StoreUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EngineError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status, status);
        }
    }
}
