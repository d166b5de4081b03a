//! Errors raised by the Anthropic Messages API client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header when present.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-2xx response, with the body as the message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The reply did not have the shape the caller asked for.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}
