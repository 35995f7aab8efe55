use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::error::CommanderError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error body returned by every route: `{"error": {"message", "status"}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<CommanderError> for ApiError {
    fn from(err: CommanderError) -> Self {
        match err {
            CommanderError::Validation(msg) => Self::bad_request(msg),
            CommanderError::NotFound(msg) => Self::not_found(msg),
            e @ (CommanderError::UnknownSession(_) | CommanderError::SessionEmpty(_)) => {
                Self::unprocessable(e.to_string())
            }
            e => {
                tracing::error!(error = %e, "commander operation failed");
                Self::internal(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::queue::QueueError;

    #[test]
    fn test_commander_error_status_codes() {
        let cases = [
            (CommanderError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (CommanderError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (CommanderError::UnknownSession(1), StatusCode::UNPROCESSABLE_ENTITY),
            (CommanderError::SessionEmpty(1), StatusCode::UNPROCESSABLE_ENTITY),
            (
                CommanderError::Queue(QueueError::Closed),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }
}
