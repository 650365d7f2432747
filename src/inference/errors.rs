//! Inference error types.
//!
//! These carry enough context to build a log entry; logging itself is left
//! to the caller.

use thiserror::Error;

/// Errors from a single model completion.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// The response body was not a chat completion.
    #[error("response parse error: {reason}")]
    ResponseParse {
        reason: String,
    },

    /// A tool call in the response had no name or unparseable arguments.
    #[error("tool call parse error: {reason}")]
    ToolCallParse {
        raw_response: String,
        reason: String,
    },

    /// Client settings are unusable (missing API key, bad URL).
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl InferenceError {
    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}
