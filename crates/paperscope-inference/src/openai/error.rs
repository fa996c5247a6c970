//! OpenAI-specific error handling.

use std::time::Duration;

use paperscope_core::Error;

/// OpenAI-specific error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAIErrorCode {
    /// Invalid authentication credentials.
    AuthenticationError,
    /// Rate limit exceeded.
    RateLimitExceeded,
    /// Account out of quota; retrying will not help.
    QuotaExceeded,
    /// Model not found or not available.
    ModelNotFound,
    /// Request too large.
    ContextLengthExceeded,
    /// Server error.
    ServerError,
    /// Unknown error.
    Unknown,
}

impl OpenAIErrorCode {
    /// Determine error code from HTTP status and error type/code.
    pub fn from_response(status: u16, error_type: &str) -> Self {
        match (status, error_type) {
            (401, _) => Self::AuthenticationError,
            (429, "insufficient_quota") => Self::QuotaExceeded,
            (429, _) => Self::RateLimitExceeded,
            (404, _) | (_, "model_not_found") => Self::ModelNotFound,
            (400, _) if error_type.contains("context_length") => Self::ContextLengthExceeded,
            (500..=599, _) => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimitExceeded | Self::ServerError)
    }
}

/// Convert an OpenAI error into the pipeline taxonomy.
pub fn to_pipeline_error(
    code: OpenAIErrorCode,
    message: &str,
    retry_after: Option<Duration>,
) -> Error {
    match code {
        OpenAIErrorCode::RateLimitExceeded => Error::RateLimited {
            message: format!("openai rate limit: {message}"),
            retry_after,
        },
        OpenAIErrorCode::ServerError => Error::TransientIo(format!("openai server error: {message}")),
        OpenAIErrorCode::AuthenticationError
        | OpenAIErrorCode::QuotaExceeded
        | OpenAIErrorCode::ModelNotFound => {
            Error::ProviderUnavailable(format!("openai: {message}"))
        }
        OpenAIErrorCode::ContextLengthExceeded => {
            Error::PermanentInput(format!("openai context too long: {message}"))
        }
        OpenAIErrorCode::Unknown => Error::PermanentInput(format!("openai: {message}")),
    }
}
