// Botgate Engine — MCP Tool-Server Client
//
// One connected tool server: spawn via the stdio transport, run the
// initialize handshake, cache the tool list, dispatch tools/call.

use super::transport::StdioTransport;
use super::types::*;
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::ToolServerConfig;
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default timeout for handshake requests.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Tool calls can be slow — give them longer.
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// A connected tool-server client.
pub struct ToolServerClient {
    /// The profile entry this client was spawned from.
    pub config: ToolServerConfig,
    transport: StdioTransport,
    /// Monotonically increasing request id.
    next_id: AtomicU64,
    /// Tools from the handshake `tools/list`.
    pub tools: Vec<McpToolDef>,
}

impl ToolServerClient {
    /// Spawn the configured subprocess, perform the initialize handshake,
    /// and fetch the tool list.
    pub async fn connect(config: ToolServerConfig) -> GatewayResult<Self> {
        let transport =
            StdioTransport::spawn(&config.name, &config.command, &config.args, &config.env)
                .await?;

        let mut client = ToolServerClient {
            config,
            transport,
            next_id: AtomicU64::new(1),
            tools: vec![],
        };

        client.initialize().await?;
        client.fetch_tools().await?;

        Ok(client)
    }

    async fn initialize(&mut self) -> GatewayResult<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: McpClientCapabilities::default(),
            client_info: McpClientInfo {
                name: "botgate".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let req = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::to_value(&params)?),
        );
        let resp = self.transport.send_request(req, HANDSHAKE_TIMEOUT).await?;

        if let Some(err) = resp.error {
            return Err(GatewayError::tool(
                &self.config.name,
                format!("initialize failed: {} (code={})", err.message, err.code),
            ));
        }
        if let Some(result) = resp.result {
            let init: InitializeResult = serde_json::from_value(result)?;
            info!(
                "[mcp] Server '{}' initialized (protocol={})",
                self.config.name, init.protocol_version
            );
        }

        // `initialized` notification is required by the protocol.
        self.transport
            .send_notification("notifications/initialized", None)
            .await
    }

    async fn fetch_tools(&mut self) -> GatewayResult<()> {
        let req = JsonRpcRequest::new(self.next_id(), "tools/list", None);
        let resp = self.transport.send_request(req, HANDSHAKE_TIMEOUT).await?;

        if let Some(err) = resp.error {
            // A server without tool support is usable, just empty.
            if err.code == METHOD_NOT_FOUND {
                info!("[mcp] Server '{}' does not expose tools", self.config.name);
                self.tools = vec![];
                return Ok(());
            }
            return Err(GatewayError::tool(
                &self.config.name,
                format!("tools/list failed: {} (code={})", err.message, err.code),
            ));
        }

        self.tools = match resp.result {
            Some(result) => {
                let list: ToolsListResult = serde_json::from_value(result)?;
                info!(
                    "[mcp] Server '{}' exposes {} tools",
                    self.config.name,
                    list.tools.len()
                );
                list.tools
            }
            None => vec![],
        };
        Ok(())
    }

    /// Call a tool on this server by its original (unprefixed) name.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> GatewayResult<String> {
        let params = ToolCallParams { name: tool_name.into(), arguments };
        let req = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            Some(serde_json::to_value(&params)?),
        );
        let resp = self.transport.send_request(req, TOOL_CALL_TIMEOUT).await?;

        if let Some(err) = resp.error {
            return Err(GatewayError::tool(
                &self.config.name,
                format!("tools/call '{}' failed: {} (code={})", tool_name, err.message, err.code),
            ));
        }

        let result_val = resp.result.ok_or_else(|| {
            GatewayError::tool(&self.config.name, format!("tools/call '{}': empty result", tool_name))
        })?;
        let tool_result: ToolCallResult = serde_json::from_value(result_val)?;

        let text = extract_text_content(&tool_result.content);
        if tool_result.is_error {
            return Err(GatewayError::tool(&self.config.name, text));
        }
        Ok(text)
    }

    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    pub async fn shutdown(&self) {
        info!("[mcp] Shutting down server '{}'", self.config.name);
        self.transport.shutdown().await;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
