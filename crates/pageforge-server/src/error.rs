//! HTTP error responses

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pageforge_core::{client_error, Error};
use serde_json::json;
use tracing::error;

/// Error returned from a handler, rendered as `{ error, details }`
#[derive(Debug)]
pub enum AppError {
    /// Body could not be parsed
    MalformedBody(String),
    NotFound(String),
    Generation(Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Generation(err) => status_for(err),
        }
    }
}

/// HTTP status for a generation error
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidRequest(_) | Error::Authentication(_) => StatusCode::BAD_REQUEST,
        err if err.is_deadline() => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Generation(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::MalformedBody(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, details) = match self {
            AppError::MalformedBody(details) => ("Invalid request".to_string(), Some(details)),
            AppError::NotFound(details) => ("Not found".to_string(), Some(details)),
            AppError::Generation(err) => {
                if status.is_server_error() {
                    error!(kind = err.kind(), error = %err, "Request failed");
                }
                client_error(&err)
            }
        };

        (status, Json(json!({ "error": message, "details": details }))).into_response()
    }
}
