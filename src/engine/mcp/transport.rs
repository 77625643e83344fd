// Botgate Engine — MCP Stdio Transport
//
// Spawns a tool-server subprocess and speaks JSON-RPC over its stdio,
// one JSON object per line (MCP stdio framing). A writer task owns stdin,
// a reader task owns stdout and routes responses to pending oneshot
// channels by request id; stderr is drained into the debug log.

use super::types::{JsonRpcRequest, JsonRpcResponse};
use crate::atoms::error::{GatewayError, GatewayResult};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

/// A running stdio transport — owns the child process and message routing.
#[derive(Debug)]
pub struct StdioTransport {
    /// Server name, for error context only.
    server: String,
    /// Sender to write JSON lines to the child's stdin.
    writer_tx: mpsc::Sender<Vec<u8>>,
    /// Pending requests awaiting responses, keyed by JSON-RPC id.
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    /// Handle to the child process (for shutdown / liveness checks).
    child: Arc<Mutex<Option<Child>>>,
}

impl StdioTransport {
    /// Spawn the subprocess and set up the bidirectional JSON-RPC plumbing.
    pub async fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> GatewayResult<Self> {
        info!("[mcp] Spawning '{}': {} {}", server, command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::tool(server, format!("spawn `{}` failed: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::tool(server, "failed to open stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::tool(server, "failed to open stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::tool(server, "failed to open stderr"))?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // ── Writer task: one JSON object per line to stdin ─────────────
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
        {
            let server = server.to_string();
            let mut stdin = stdin;
            tokio::spawn(async move {
                while let Some(mut line) = writer_rx.recv().await {
                    line.push(b'\n');
                    if let Err(e) = stdin.write_all(&line).await {
                        error!("[mcp] '{}' stdin write error: {}", server, e);
                        break;
                    }
                    if let Err(e) = stdin.flush().await {
                        error!("[mcp] '{}' stdin flush error: {}", server, e);
                        break;
                    }
                }
                debug!("[mcp] '{}' writer task exiting", server);
            });
        }

        // ── Reader task: line-delimited responses from stdout ──────────
        {
            let server = server.to_string();
            let pending = Arc::clone(&pending);
            let mut reader = BufReader::new(stdout).lines();
            tokio::spawn(async move {
                loop {
                    match reader.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim().to_string();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<JsonRpcResponse>(&line) {
                                Ok(resp) => {
                                    if let Some(id) = resp.id {
                                        let mut map = pending.lock().await;
                                        if let Some(tx) = map.remove(&id) {
                                            let _ = tx.send(resp);
                                        } else {
                                            debug!(
                                                "[mcp] '{}' response for unknown id={}, ignoring",
                                                server, id
                                            );
                                        }
                                    } else {
                                        // Server-initiated notification — log and discard.
                                        debug!(
                                            "[mcp] '{}' notification: {}",
                                            server,
                                            &line[..line.len().min(200)]
                                        );
                                    }
                                }
                                Err(e) => {
                                    warn!("[mcp] '{}' unparseable line: {}", server, e);
                                }
                            }
                        }
                        Ok(None) => {
                            info!("[mcp] '{}' stdout closed (server exited)", server);
                            break;
                        }
                        Err(e) => {
                            error!("[mcp] '{}' read error: {}", server, e);
                            break;
                        }
                    }
                }
            });
        }

        // ── Stderr drain ───────────────────────────────────────────────
        {
            let server = server.to_string();
            let mut reader = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = reader.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        debug!("[mcp:{}:stderr] {}", server, trimmed);
                    }
                }
            });
        }

        Ok(StdioTransport {
            server: server.to_string(),
            writer_tx,
            pending,
            child: Arc::new(Mutex::new(Some(child))),
        })
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout: std::time::Duration,
    ) -> GatewayResult<JsonRpcResponse> {
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            map.insert(id, tx);
        }

        let body = serde_json::to_vec(&request)?;
        if self.writer_tx.send(body).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(GatewayError::tool(&self.server, "transport writer closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(GatewayError::tool(&self.server, "response channel dropped")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::tool(
                    &self.server,
                    format!("request timed out after {:?} (id={})", timeout, id),
                ))
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> GatewayResult<()> {
        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or(serde_json::json!({})),
        });
        let body = serde_json::to_vec(&notif)?;
        self.writer_tx
            .send(body)
            .await
            .map_err(|_| GatewayError::tool(&self.server, "transport writer closed"))
    }

    /// Kill the child process. Idempotent; errors are reported, not raised.
    pub async fn shutdown(&self) {
        let mut guard = self.child.lock().await;
        if let Some(ref mut child) = *guard {
            info!("[mcp] Killing '{}' subprocess", self.server);
            if let Err(e) = child.kill().await {
                warn!("[mcp] '{}' kill failed: {}", self.server, e);
            }
        }
        *guard = None;
    }

    /// Whether the child process is still running.
    pub async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// `cat` echoes our request lines back verbatim, so a request written to
    /// stdin comes back as a parseable "response" with the same id.
    #[tokio::test]
    async fn round_trips_over_a_real_subprocess() {
        let transport = StdioTransport::spawn("echo-test", "cat", &[], &HashMap::new())
            .await
            .unwrap();

        // A JsonRpcRequest without params parses as a response with the same
        // id (result/error both absent).
        let req = JsonRpcRequest::new(7, "tools/list", None);
        let resp = transport
            .send_request(req, std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.id, Some(7));

        assert!(transport.is_alive().await);
        transport.shutdown().await;
        // Kill is asynchronous at the OS level; poll briefly.
        for _ in 0..50 {
            if !transport.is_alive().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("subprocess still alive after shutdown");
    }

    #[tokio::test]
    async fn spawn_failure_is_a_tool_error() {
        let err = StdioTransport::spawn(
            "missing",
            "/nonexistent/definitely-not-a-binary",
            &[],
            &HashMap::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Tool { .. }));
    }

    #[tokio::test]
    async fn request_times_out_when_server_is_silent() {
        // `sleep` never writes to stdout, so the request must time out.
        let transport = StdioTransport::spawn(
            "silent",
            "sleep",
            &["30".to_string()],
            &HashMap::new(),
        )
        .await
        .unwrap();

        let req = JsonRpcRequest::new(1, "initialize", None);
        let err = transport
            .send_request(req, std::time::Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        transport.shutdown().await;
    }
}
