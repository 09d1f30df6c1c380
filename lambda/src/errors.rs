//! HTTP error handling for the task lists API
//!
//! Every failure leaving a handler is an [`ApiError`]. It carries an
//! [`ErrorCode`] that decides the status code, the log level and whether the
//! message is safe to show to the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

/// Error codes returned in the `error.code` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid input data (400)
    BadRequest,
    /// Missing or invalid token (401)
    Unauthorized,
    /// List or task does not exist (404)
    NotFound,
    /// Data store operation failed (500)
    DatabaseError,
    /// Anything else (500)
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status code
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::DatabaseError | Self::InternalError => 500,
        }
    }

    /// Server-side failures keep their details out of the response
    pub fn should_log_details(&self) -> bool {
        matches!(self, Self::DatabaseError | Self::InternalError)
    }

    /// Returns a user-safe error message
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest => "Invalid request data",
            Self::Unauthorized => "Authentication required",
            Self::NotFound => "Resource not found",
            Self::DatabaseError | Self::InternalError => "An internal server error occurred",
        }
    }
}

/// Errors produced while serving a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Data store error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Error code of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// HTTP status of this error
    pub fn status(&self) -> u16 {
        self.code().http_status()
    }

    /// `{ "error": { "code", "message" } }`, logging the error on the way out
    pub fn to_body(&self) -> Value {
        let code = self.code();
        let message = if code.should_log_details() {
            error!(error_code = %code.as_str(), details = %self, "Request failed");
            code.user_message().to_string()
        } else {
            match code {
                ErrorCode::Unauthorized => warn!(error_code = %code.as_str(), "{}", self),
                _ => info!(error_code = %code.as_str(), "{}", self),
            }
            self.to_string()
        };

        json!({ "error": { "code": code.as_str(), "message": message } })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_body())).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("Malformed JSON body: {err}"))
    }
}

impl From<infra::InfraError> for ApiError {
    fn from(err: infra::InfraError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = ApiError::NotFound("List l1 not found".to_string()).to_body();
        assert_eq!(
            body,
            json!({ "error": { "code": "NOT_FOUND", "message": "List l1 not found" } })
        );
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let error = ApiError::Database("ProvisionedThroughputExceeded on table x".to_string());
        let body = error.to_body();
        assert_eq!(body["error"]["code"], "DATABASE_ERROR");
        assert_eq!(body["error"]["message"], "An internal server error occurred");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::BadRequest(String::new()).status(), 400);
        assert_eq!(ApiError::Unauthorized(String::new()).status(), 401);
        assert_eq!(ApiError::NotFound(String::new()).status(), 404);
        assert_eq!(ApiError::Internal(String::new()).status(), 500);
    }

    #[test]
    fn test_json_errors_are_bad_requests() {
        let err: ApiError = serde_json::from_str::<Value>("{").unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }
}
