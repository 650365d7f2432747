//! Subprocess-backed JSON-RPC transport.
//!
//! A `TransportSession` owns one MCP server child process and its stdio:
//! - Writing JSON-RPC requests and notifications to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//! - Draining stderr into the log, keeping a short tail for diagnostics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerSpec};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Grace period after closing stdin before the process is force-killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of stderr lines retained for error messages.
const STDERR_TAIL_LINES: usize = 40;

/// Upper bound on the stderr excerpt attached to errors.
const STDERR_EXCERPT_CHARS: usize = 2000;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── TransportSession ────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// One server process plus its duplex byte channel.
///
/// All I/O handles sit behind `Option`s so `close` can release them
/// exactly once; every later call sees a closed session.
pub struct TransportSession {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BoxedReader>>,
    process: Mutex<Option<Child>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
}

impl TransportSession {
    /// Spawn the server described by `spec` and wire its stdio.
    pub async fn open(spec: &ServerSpec) -> Result<Self, McpError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        cmd.envs(&spec.env);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::Launch {
            name: spec.name.clone(),
            reason: format!("{}: {e}", spec.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::Launch {
            name: spec.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::Launch {
            name: spec.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        let session = Self::from_streams(&spec.name, stdout, stdin);
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(&spec.name, stderr, Arc::clone(&session.stderr_tail));
        }
        *session.process.lock().await = Some(child);

        tracing::info!(
            server = %spec.name,
            command = %spec.command,
            args = ?spec.args,
            "server process spawned"
        );

        Ok(session)
    }

    /// Build a session over arbitrary streams, with no process attached.
    pub fn from_streams<R, W>(server_name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(BufReader::new(reader))),
            process: Mutex::new(None),
            stderr_tail: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether `close` has run.
    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// The reader lock is held for the whole exchange so request/response
    /// pairs never interleave. Lines that are not a response with our id
    /// (server log output, answers to abandoned requests, undecodable
    /// bytes) are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req).map_err(|e| self.transport_err(format!(
            "failed to serialize request: {e}"
        )))?;

        let mut reader_guard = self.reader.lock().await;
        self.write_line(line).await?;

        let reader = reader_guard
            .as_mut()
            .ok_or_else(|| self.transport_err("session closed".into()))?;

        let mut line_buf = Vec::new();
        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_until(b'\n', &mut line_buf)
                .await
                .map_err(|e| self.transport_err(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_err(
                    "server stdout closed (process may have exited)".into(),
                ));
            }

            let Ok(text) = std::str::from_utf8(&line_buf) else {
                tracing::trace!(
                    server = %self.server_name,
                    bytes = line_buf.len(),
                    "skipping non-UTF-8 line"
                );
                continue;
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = resp.id,
                        "skipping response for another request"
                    );
                }
                Err(_) => {
                    tracing::trace!(server = %self.server_name, line = trimmed, "non-response line");
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let note = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&note).map_err(|e| self.transport_err(format!(
            "failed to serialize notification: {e}"
        )))?;
        self.write_line(line).await
    }

    async fn write_line(&self, mut line: String) -> Result<(), McpError> {
        line.push('\n');
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_err("session closed".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_err(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_err(format!("failed to flush stdin: {e}")))
    }

    /// Recent stderr output, for attaching to launch/handshake errors.
    pub fn stderr_excerpt(&self) -> String {
        let tail = match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => return String::new(),
        };
        if tail.len() > STDERR_EXCERPT_CHARS {
            let mut cut = tail.len() - STDERR_EXCERPT_CHARS;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            format!("...(truncated){}", &tail[cut..])
        } else {
            tail
        }
    }

    /// Terminate the process and release all I/O handles.
    ///
    /// Closing stdin asks the server to exit; if it has not exited within
    /// `SHUTDOWN_TIMEOUT` it is killed. Safe to call any number of times.
    pub async fn close(&self) -> Result<(), McpError> {
        drop(self.writer.lock().await.take());

        let child = self.process.lock().await.take();
        let result = match child {
            Some(mut child) => match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_name, %status, "server exited");
                    Ok(())
                }
                _ => {
                    tracing::warn!(server = %self.server_name, "server did not exit, killing");
                    child
                        .kill()
                        .await
                        .map_err(|e| self.transport_err(format!("failed to kill process: {e}")))
                }
            },
            None => Ok(()),
        };

        drop(self.reader.lock().await.take());
        result
    }

    fn transport_err(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason,
        }
    }
}

/// Forward stderr lines to the log and keep the most recent ones.
fn spawn_stderr_drain(
    server_name: &str,
    stderr: ChildStderr,
    tail: Arc<StdMutex<VecDeque<String>>>,
) {
    let server = server_name.to_string();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            tracing::debug!(server = %server, stderr = %line, "server stderr");
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::Server {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncReadExt};

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::Server { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected Server error, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::Server { .. }
        ));
    }

    #[tokio::test]
    async fn test_request_skips_noise_and_foreign_ids() {
        let (client_side, server_side) = duplex(4096);
        let (client_read, client_write) = split(client_side);
        let (mut server_read, mut server_write) = split(server_side);
        let session = TransportSession::from_streams("fake", client_read, client_write);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server_read.read(&mut buf).await.unwrap();
            let req: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
            let id = req["id"].as_u64().unwrap();
            let noise = format!(
                "starting up...\n{{\"jsonrpc\":\"2.0\",\"id\":{},\"result\":{{}}}}\n\
                 {{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"ok\":true}}}}\n",
                id + 1000
            );
            server_write.write_all(noise.as_bytes()).await.unwrap();
        });

        let resp = session.request("ping", None).await.unwrap();
        assert_eq!(extract_result(resp).unwrap()["ok"], true);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_skips_non_utf8_lines() {
        let (client_side, server_side) = duplex(4096);
        let (client_read, client_write) = split(client_side);
        let (mut server_read, mut server_write) = split(server_side);
        let session = TransportSession::from_streams("fake", client_read, client_write);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server_read.read(&mut buf).await.unwrap();
            let req: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
            let id = req["id"].as_u64().unwrap();
            let mut out = b"indexing caf\xe9.rs\n".to_vec();
            out.extend_from_slice(
                format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"ok\":true}}}}\n")
                    .as_bytes(),
            );
            server_write.write_all(&out).await.unwrap();
        });

        let resp = session.request("ping", None).await.unwrap();
        assert_eq!(extract_result(resp).unwrap()["ok"], true);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_after_peer_hangup_is_transport_error() {
        let (client_side, server_side) = duplex(4096);
        let (client_read, client_write) = split(client_side);
        let session = TransportSession::from_streams("fake", client_read, client_write);
        drop(server_side);

        let err = session.request("ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
        assert!(err.is_connection_loss());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_without_process() {
        let (client_side, _server_side) = duplex(64);
        let (r, w) = split(client_side);
        let session = TransportSession::from_streams("fake", r, w);
        assert!(session.is_open().await);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(!session.is_open().await);

        let err = session.notify("x", None).await.unwrap_err();
        assert!(err.to_string().contains("session closed"));
    }

    #[tokio::test]
    async fn test_open_missing_executable_is_launch_error() {
        let spec = ServerSpec::new("ghost", "/definitely/not/a/real/binary-xyz", &[]);
        match TransportSession::open(&spec).await {
            Err(McpError::Launch { name, .. }) => assert_eq!(name, "ghost"),
            Err(other) => panic!("expected Launch error, got {other:?}"),
            Ok(_) => panic!("expected Launch error, got a session"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_and_close_real_process() {
        // `cat` echoes the request back; it parses as a response with our id.
        let spec = ServerSpec::new("echo", "cat", &[]);
        let session = TransportSession::open(&spec).await.unwrap();

        let resp = session.request("tools/list", None).await.unwrap();
        assert!(resp.result.is_none() && resp.error.is_none());

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(!session.is_open().await);
    }
}
