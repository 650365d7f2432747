//! In-memory MCP servers for tests.
//!
//! `FakeServer` speaks newline-delimited JSON-RPC over a pair of
//! `tokio::io::duplex` pipes. Special tool names drive failure paths:
//! `hang` never answers, `explode` answers with a JSON-RPC error, `die`
//! drops the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::client::{ClientTimeouts, ProtocolClient};
use super::errors::McpError;
use super::lifecycle::Connector;
use super::transport::TransportSession;
use super::types::ServerSpec;

#[derive(Clone)]
pub struct FakeServer {
    name: String,
    tools: Vec<String>,
    page_size: usize,
    resources: Vec<(String, String)>,
    failing_handshake: bool,
    malformed_lists: bool,
    /// `tools/list` requests left to ignore, shared across clones.
    silent_lists: Arc<AtomicU32>,
    closed: Arc<Notify>,
}

impl FakeServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            page_size: usize::MAX,
            resources: Vec::new(),
            failing_handshake: false,
            malformed_lists: false,
            silent_lists: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(Notify::new()),
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_resource(mut self, uri: &str, text: &str) -> Self {
        self.resources.push((uri.to_string(), text.to_string()));
        self
    }

    pub fn failing_handshake(mut self) -> Self {
        self.failing_handshake = true;
        self
    }

    pub fn malformed_lists(mut self) -> Self {
        self.malformed_lists = true;
        self
    }

    /// Leave the first `count` `tools/list` requests unanswered.
    pub fn ignoring_first_lists(self, count: u32) -> Self {
        self.silent_lists.store(count, Ordering::SeqCst);
        self
    }

    /// Notified once the fake sees EOF on its input.
    pub fn closed_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.closed)
    }

    fn tools_page(&self, params: &Value) -> Value {
        if self.malformed_lists {
            return json!({ "tools": "not-a-list" });
        }
        let start = params["cursor"]
            .as_str()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let end = start.saturating_add(self.page_size).min(self.tools.len());
        let tools: Vec<Value> = self.tools[start..end]
            .iter()
            .map(|name| {
                let schema = if name == "read_file" {
                    json!({
                        "type": "object",
                        "properties": {"path": {"type": "string"}},
                        "required": ["path"],
                    })
                } else {
                    json!({"type": "object", "properties": {}})
                };
                json!({
                    "name": name,
                    "description": format!("{name} from {}", self.name),
                    "inputSchema": schema,
                })
            })
            .collect();
        if end < self.tools.len() {
            json!({ "tools": tools, "nextCursor": end.to_string() })
        } else {
            json!({ "tools": tools })
        }
    }

    /// `None` means "do not answer".
    fn answer(&self, method: &str, params: &Value) -> Option<Result<Value, (i32, String)>> {
        let reply = match method {
            "initialize" if self.failing_handshake => Err((-32603, "boom".to_string())),
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}, "resources": {}},
                "serverInfo": {"name": self.name, "version": "0.0.1"},
            })),
            "tools/list" => {
                let silenced = self
                    .silent_lists
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if silenced {
                    return None;
                }
                Ok(self.tools_page(params))
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                match name {
                    "hang" => return None,
                    "explode" => Err((-32001, "tool exploded".to_string())),
                    "fail" => Ok(json!({
                        "content": [{"type": "text", "text": "no such file"}],
                        "isError": true,
                    })),
                    _ => Ok(json!({
                        "content": [{
                            "type": "text",
                            "text": format!("{name} on {}: {}", self.name, params["arguments"]),
                        }],
                    })),
                }
            }
            "resources/list" => {
                let resources: Vec<Value> = self
                    .resources
                    .iter()
                    .map(|(uri, _)| json!({"uri": uri, "name": uri, "mimeType": "text/plain"}))
                    .collect();
                Ok(json!({ "resources": resources }))
            }
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                match self.resources.iter().find(|(u, _)| u == uri) {
                    Some((u, text)) => Ok(json!({"contents": [{"uri": u, "text": text}]})),
                    None => Err((-32002, format!("resource not found: {uri}"))),
                }
            }
            other => Err((-32601, format!("method not found: {other}"))),
        };
        Some(reply)
    }
}

/// Start `server` on a background task and return a session connected to it.
pub fn fake_session(server: FakeServer) -> TransportSession {
    let (client_write, server_read) = duplex(64 * 1024);
    let (mut server_write, client_read) = duplex(64 * 1024);
    let session = TransportSession::from_streams(&server.name, client_read, client_write);

    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => break,
            };
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let Some(id) = msg.get("id").cloned() else {
                continue; // notification
            };
            let method = msg["method"].as_str().unwrap_or_default();
            if method == "tools/call" && msg["params"]["name"] == "die" {
                return;
            }
            let reply = match server.answer(method, &msg["params"]) {
                Some(Ok(result)) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Some(Err((code, message))) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": code, "message": message},
                }),
                None => continue,
            };
            let mut out = reply.to_string();
            out.push('\n');
            if server_write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
        server.closed.notify_one();
    });

    session
}

// ─── FakeConnector ───────────────────────────────────────────────────────────

struct Plan {
    server: FakeServer,
    failures_before_success: u32,
    delay: Duration,
}

/// A `Connector` handing out fake sessions, recording every attempt.
#[derive(Clone, Default)]
pub struct FakeConnector {
    plans: Arc<StdMutex<HashMap<String, Plan>>>,
    attempts: Arc<StdMutex<HashMap<String, Vec<Instant>>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `server` under its spec name after `delay`.
    pub fn serve(self, name: &str, server: FakeServer, delay: Duration) -> Self {
        self.plan(name, server, 0, delay)
    }

    /// Fail the first `failures` attempts, then serve.
    pub fn flaky(self, name: &str, server: FakeServer, failures: u32) -> Self {
        self.plan(name, server, failures, Duration::ZERO)
    }

    fn plan(self, name: &str, server: FakeServer, failures: u32, delay: Duration) -> Self {
        if let Ok(mut plans) = self.plans.lock() {
            plans.insert(
                name.to_string(),
                Plan {
                    server,
                    failures_before_success: failures,
                    delay,
                },
            );
        }
        self
    }

    pub fn attempts(&self, name: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .map(|a| a.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, spec: &ServerSpec) -> Result<ProtocolClient, McpError> {
        let attempt = {
            let mut attempts = self.attempts.lock().map_err(|_| McpError::Launch {
                name: spec.name.clone(),
                reason: "poisoned".into(),
            })?;
            let entry = attempts.entry(spec.name.clone()).or_default();
            entry.push(Instant::now());
            entry.len() as u32
        };

        let planned = self.plans.lock().ok().and_then(|plans| {
            plans
                .get(&spec.name)
                .map(|p| (p.server.clone(), p.failures_before_success, p.delay))
        });
        let Some((server, failures, delay)) = planned else {
            return Err(McpError::Launch {
                name: spec.name.clone(),
                reason: format!("{}: No such file or directory", spec.command),
            });
        };

        tokio::time::sleep(delay).await;
        if attempt <= failures {
            return Err(McpError::Launch {
                name: spec.name.clone(),
                reason: format!("attempt {attempt} refused"),
            });
        }
        let timeouts = ClientTimeouts {
            handshake: Duration::from_secs(5),
            call: Duration::from_millis(200),
        };
        ProtocolClient::connect(fake_session(server), timeouts).await
    }
}
