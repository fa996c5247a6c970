//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    Internal(paperscope_core::Error),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
}

impl From<paperscope_core::Error> for ApiError {
    fn from(err: paperscope_core::Error) -> Self {
        use paperscope_core::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::PermanentInput(msg) | Error::Config(msg) => ApiError::BadRequest(msg),
            Error::AlreadyRunning(msg) => ApiError::Conflict(msg),
            Error::Cancelled(msg) | Error::ProviderUnavailable(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Internal(err) => {
                error!(subsystem = "api", error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperscope_core::Error;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::NotFound("job".into()), StatusCode::NOT_FOUND),
            (Error::Config("bad".into()), StatusCode::BAD_REQUEST),
            (Error::AlreadyRunning("busy".into()), StatusCode::CONFLICT),
            (Error::Cancelled("stopping".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::ProviderUnavailable("ollama".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
