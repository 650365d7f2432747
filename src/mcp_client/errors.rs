//! MCP client error types.

use thiserror::Error;

/// Errors that can occur while launching, talking to, or supervising an MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server executable could not be found or failed to start.
    #[error("failed to launch server '{name}': {reason}")]
    Launch {
        name: String,
        reason: String,
    },

    /// The capability handshake failed (bad response, early exit, timeout).
    #[error("server '{name}' handshake failed: {reason}")]
    Handshake {
        name: String,
        reason: String,
    },

    /// A single RPC exceeded its deadline.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// I/O failure on the duplex channel (broken pipe, stdout closed).
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// Malformed or unexpected response payload.
    #[error("protocol error from server '{server}': {reason}")]
    Protocol {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No connected server exposes a tool with this name.
    #[error("unknown tool: '{name}'{}", format_suggestions(.suggestions))]
    ToolNotFound {
        name: String,
        suggestions: Vec<String>,
    },

    /// Tool call arguments failed the structural schema check.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// The named server has no live client.
    #[error("server '{name}' is not connected")]
    NotConnected {
        name: String,
    },

    /// Every connection attempt for a server failed.
    #[error("server '{name}' failed after {attempts} connection attempts: {last_error}")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },
}

impl McpError {
    /// Whether this error means the channel itself is unhealthy.
    ///
    /// Timeouts and transport resets mark a client soft-disconnected.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, McpError::Timeout { .. } | McpError::Transport { .. })
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {})", suggestions.join(", "))
    }
}
