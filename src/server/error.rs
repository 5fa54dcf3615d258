//! Handler failure boundary.
//!
//! Every protected handler funnels failures through [`ApiError`], which
//! renders a JSON body of shape `{error, details?}` with the taxonomy's
//! status code. Validator messages map through the token-substring
//! convention: token-related problems are 403, the rest 400.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::errors::FdeError;

pub type ApiResult<T> = Result<T, ApiError>;

/// A JSON error response with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn with_details(
        status: StatusCode,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            status,
            body: json!({ "error": message.into(), "details": details }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Map a validator message: token problems are 403, the rest 400.
    pub fn from_validation(message: String) -> Self {
        let status = if message.contains("token") {
            StatusCode::FORBIDDEN
        } else {
            StatusCode::BAD_REQUEST
        };
        Self::new(status, message)
    }
}

impl From<FdeError> for ApiError {
    fn from(err: FdeError) -> Self {
        match &err {
            FdeError::Validation(msg) | FdeError::Upload(msg) => Self::bad_request(msg.clone()),
            FdeError::Integrity(msg) => Self::bad_request(msg.clone()),
            FdeError::Auth(msg) => Self::new(StatusCode::FORBIDDEN, msg.clone()),
            FdeError::Conflict(msg) => Self::conflict(msg.clone()),
            FdeError::Config(msg) => Self::bad_request(msg.clone()),
            _ => {
                tracing::error!(error = %err, "request failed");
                Self::internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_status_mapping() {
        assert_eq!(
            ApiError::from_validation("missing authorization token".to_string()).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from_validation("invalid token".to_string()).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from_validation("unknown environment 'qa'".to_string()).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from_validation("no deploy secret configured for environment".to_string())
                .status,
            StatusCode::BAD_REQUEST
        );
    }
}
