//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::Error;

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Failure of an API call
#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    BadRequest(String),
    Unauthorized(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            ApiError::Core(e) => {
                let (status, code) = match e {
                    Error::MirrorNotFound(_) => (StatusCode::NOT_FOUND, "MIRROR_NOT_FOUND"),
                    Error::UnknownInstance(_) => (StatusCode::NOT_FOUND, "UNKNOWN_INSTANCE"),
                    Error::DuplicateMirror { .. } => (StatusCode::CONFLICT, "DUPLICATE_MIRROR"),
                    Error::RoundInProgress(_) => (StatusCode::CONFLICT, "ROUND_IN_PROGRESS"),
                    Error::Config(_) | Error::ConfigParse(_) => {
                        (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
                    }
                    Error::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
                    Error::SignatureRejected(_) => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE"),
                    Error::Network(_) | Error::ConnectionTimeout(_) | Error::HttpStatus { .. } => {
                        (StatusCode::BAD_GATEWAY, "MIRROR_UNREACHABLE")
                    }
                    Error::KeyFile { .. } | Error::Database(_) | Error::Io(_) | Error::Internal(_) => {
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "INTERNAL",
                            "Internal server error".to_string(),
                        );
                    }
                };
                (status, code, e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = self.parts();
        if status.is_server_error() {
            tracing::error!("API request failed: {:?}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}
