//! Unified server error type.
//!
//! Every handler returns `Result<T, GatewayError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted to a
//! JSON-body HTTP response with the status code named in §7's error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lemonade_core::CoreError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("{0}")]
    BadRequest(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Core(e) => match e {
                CoreError::Validation(_) => StatusCode::BAD_REQUEST,
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::UnsupportedOperation(_) => StatusCode::BAD_REQUEST,
                CoreError::UnsupportedRecipe => StatusCode::UNPROCESSABLE_ENTITY,
                CoreError::Conflict(_) => StatusCode::CONFLICT,
                CoreError::InUse(_) => StatusCode::INTERNAL_SERVER_ERROR,
                CoreError::BackendLoadFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                CoreError::BackendError { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                CoreError::Network(_) => StatusCode::BAD_GATEWAY,
                CoreError::Auth => StatusCode::UNAUTHORIZED,
                CoreError::Offline => StatusCode::SERVICE_UNAVAILABLE,
                CoreError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
                CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "validation",
            GatewayError::Core(e) => e.kind(),
        }
    }

    /// The wire `error.type` string, distinct from [`Self::kind`]'s internal
    /// taxonomy: OpenAI-compatible clients key off a small fixed vocabulary here, so
    /// every "the request as shaped can't be served" case — bad input, an
    /// unsupported op for this model — reports the single `invalid_request_error`
    /// type regardless of which internal kind produced it (§8 S5).
    fn wire_type(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Core(e) => match e {
                CoreError::Validation(_) | CoreError::UnsupportedOperation(_) => "invalid_request_error",
                CoreError::NotFound(_) => "not_found_error",
                _ => self.kind(),
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let wire_type = self.wire_type();
        (
            status,
            Json(json!({
                "error": {
                    "message": message,
                    "type": wire_type,
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_recipe_maps_to_422() {
        let err = GatewayError::Core(CoreError::UnsupportedRecipe);
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn backend_error_passes_through_status() {
        let err = GatewayError::Core(CoreError::BackendError { status: 503, message: "down".into() });
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = GatewayError::Core(CoreError::NotFound("m".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
