// =============================================================================
// Error taxonomy at component boundaries
// =============================================================================
//
// Components use anyhow internally; anything that crosses a component
// boundary (Control API responses, command acks) is converted into one of
// these kinds. The Control API maps kinds onto HTTP statuses.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl HubError {
    /// Machine-readable kind tag used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound(_) => "NotFound",
            Self::Duplicate(_) => "Duplicate",
            Self::DependencyUnavailable(_) => "DependencyUnavailable",
            Self::Transient(_) => "Transient",
            Self::Permanent(_) => "Permanent",
            Self::InvariantViolation(_) => "InvariantViolation",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Duplicate(_) => StatusCode::CONFLICT,
            Self::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Permanent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Validation(m)
            | Self::NotFound(m)
            | Self::Duplicate(m)
            | Self::DependencyUnavailable(m)
            | Self::Transient(m)
            | Self::Permanent(m)
            | Self::InvariantViolation(m) => m.clone(),
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
