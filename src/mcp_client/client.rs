//! Protocol client: typed MCP requests over one transport session.
//!
//! Performs the capability handshake, then exposes tool discovery, tool
//! invocation, and resource access. Every RPC is raced against a fixed
//! per-call timeout; retrying is the supervisor's job, never the client's.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use super::errors::McpError;
use super::transport::{extract_result, TransportSession};
use super::types::{
    CallToolResult, InitializeResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
    ResourceContents, ResourceDescriptor, ServerInfo, ToolCallOutcome, ToolDescriptor,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-call timeout for list/call/read requests.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for the initialize handshake.
///
/// Servers launched through `npx` may install packages on first start.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on `tools/list` / `resources/list` pages.
const MAX_LIST_PAGES: usize = 32;

/// Timeouts applied by a `ProtocolClient`.
#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub handshake: Duration,
    pub call: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            call: DEFAULT_CALL_TIMEOUT,
        }
    }
}

// ─── ProtocolClient ──────────────────────────────────────────────────────────

/// An MCP client bound to one server session.
pub struct ProtocolClient {
    server_name: String,
    session: TransportSession,
    timeouts: ClientTimeouts,
    server_info: Option<ServerInfo>,
    capabilities: serde_json::Value,
    /// Cleared by timeouts and transport resets (soft disconnect); set again
    /// by a successful liveness check.
    healthy: AtomicBool,
    /// Tool names from the most recent `list_tools`.
    known_tools: StdMutex<Option<HashSet<String>>>,
}

impl ProtocolClient {
    /// Perform the handshake over `session`.
    ///
    /// On any failure the session is closed before the error is returned,
    /// so no subprocess outlives a failed connect.
    pub async fn connect(
        session: TransportSession,
        timeouts: ClientTimeouts,
    ) -> Result<Self, McpError> {
        let server_name = session.server_name().to_string();

        let handshake = tokio::time::timeout(timeouts.handshake, handshake(&session)).await;
        let init = match handshake {
            Ok(Ok(init)) => init,
            Ok(Err(e)) => {
                let reason = format!("{e}{}", stderr_suffix(&session.stderr_excerpt()));
                let _ = session.close().await;
                return Err(McpError::Handshake {
                    name: server_name,
                    reason,
                });
            }
            Err(_) => {
                let reason = format!(
                    "initialization timed out after {}ms{}",
                    timeouts.handshake.as_millis(),
                    stderr_suffix(&session.stderr_excerpt())
                );
                let _ = session.close().await;
                return Err(McpError::Handshake {
                    name: server_name,
                    reason,
                });
            }
        };

        tracing::info!(
            server = %server_name,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            server_version = init
                .server_info
                .as_ref()
                .and_then(|i| i.version.as_deref())
                .unwrap_or("unknown"),
            "handshake complete"
        );

        Ok(Self {
            server_name,
            session,
            timeouts,
            server_info: init.server_info,
            capabilities: init.capabilities,
            healthy: AtomicBool::new(true),
            known_tools: StdMutex::new(None),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Whether the server advertised a capability (e.g. `"tools"`).
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).is_some()
    }

    /// `false` once a call has timed out or hit a transport reset.
    pub fn is_connected(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }

    // ─── Typed Calls ─────────────────────────────────────────────────────

    /// List every tool the server exposes, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let value = self.rpc("tools/list", params).await?;
            let page: ListToolsResult = self.parse(value, "tools/list")?;
            tools.extend(
                page.tools
                    .into_iter()
                    .map(|def| ToolDescriptor::from_definition(&self.server_name, def)),
            );
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        if let Ok(mut known) = self.known_tools.lock() {
            *known = Some(tools.iter().map(|t| t.qualified_name.clone()).collect());
        }
        Ok(tools)
    }

    /// Invoke a tool.
    ///
    /// A JSON-RPC error answer is returned as an error-flagged outcome, not
    /// as `Err`: the server is healthy, the tool just failed.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallOutcome, McpError> {
        if !self.knows_tool(name) {
            return Err(McpError::ToolNotFound {
                name: name.to_string(),
                suggestions: Vec::new(),
            });
        }

        let start = Instant::now();
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self.rpc("tools/call", Some(params)).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                let call: CallToolResult = self.parse(value, "tools/call")?;
                Ok(ToolCallOutcome {
                    tool_name: name.to_string(),
                    server: self.server_name.clone(),
                    content: flatten_content(&call.content),
                    is_error: call.is_error,
                    execution_time_ms: elapsed,
                })
            }
            Err(McpError::Server { code, message, .. }) => Ok(ToolCallOutcome {
                tool_name: name.to_string(),
                server: self.server_name.clone(),
                content: format!("[{code}] {message}"),
                is_error: true,
                execution_time_ms: elapsed,
            }),
            Err(e) => Err(e),
        }
    }

    /// List the resources the server exposes.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let value = self.rpc("resources/list", params).await?;
            let page: ListResourcesResult = self.parse(value, "resources/list")?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(resources)
    }

    /// Read one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        let value = self
            .rpc("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await?;
        let read: ReadResourceResult = self.parse(value, "resources/read")?;
        Ok(read.contents)
    }

    /// Close protocol state, then the transport. Idempotent.
    pub async fn disconnect(&self) -> Result<(), McpError> {
        self.healthy.store(false, Ordering::SeqCst);
        self.session.close().await
    }

    // ─── Internals ───────────────────────────────────────────────────────

    /// One request raced against the call timeout.
    async fn rpc(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let outcome = tokio::time::timeout(self.timeouts.call, self.session.request(method, params))
            .await
            .map_err(|_| McpError::Timeout {
                server: self.server_name.clone(),
                method: method.to_string(),
                timeout_ms: self.timeouts.call.as_millis() as u64,
            })
            .and_then(|resp| resp)
            .and_then(extract_result);

        if let Err(e) = &outcome {
            if e.is_connection_loss() && self.healthy.swap(false, Ordering::SeqCst) {
                tracing::warn!(
                    server = %self.server_name,
                    method,
                    error = %e,
                    "client soft-disconnected"
                );
            }
        }
        outcome
    }

    fn parse<T: serde::de::DeserializeOwned>(
        &self,
        value: serde_json::Value,
        method: &str,
    ) -> Result<T, McpError> {
        serde_json::from_value(value).map_err(|e| McpError::Protocol {
            server: self.server_name.clone(),
            reason: format!("malformed '{method}' response: {e}"),
        })
    }

    fn knows_tool(&self, name: &str) -> bool {
        match self.known_tools.lock() {
            Ok(known) => known.as_ref().map_or(true, |set| set.contains(name)),
            Err(_) => true,
        }
    }
}

/// `initialize` request followed by the `initialized` notification.
async fn handshake(session: &TransportSession) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = session.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::Protocol {
            server: session.server_name().to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    session.notify("notifications/initialized", None).await?;
    Ok(init)
}

/// Join text parts; render anything else as compact JSON.
fn flatten_content(parts: &[serde_json::Value]) -> String {
    parts
        .iter()
        .map(|part| match (part.get("type").and_then(|t| t.as_str()), part.get("text")) {
            (Some("text"), Some(serde_json::Value::String(text))) => text.clone(),
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
