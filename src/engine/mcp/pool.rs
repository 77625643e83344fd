// Botgate Engine — Tool Client Pool
//
// One pool per active session (WhatsApp connection or public web-chat).
// open() spawns every enabled tool server from the bot profile and
// aggregates their tools under server-prefixed names; a failing server is
// logged and omitted, never fatal. The pool is exclusively owned by its
// session — closing the session closes the pool.

use super::client::ToolServerClient;
use super::types::McpToolDef;
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{BotProfile, ToolDefinition};
use log::{error, info, warn};

/// Aggregated tool catalog handed to the LLM adapter.
pub type ToolSet = Vec<ToolDefinition>;

pub struct ToolClientPool {
    clients: Vec<ToolServerClient>,
    catalog: ToolSet,
}

impl ToolClientPool {
    /// Spawn the enabled tool servers of `profile` and build the catalog.
    /// Disabled servers are skipped; a failed spawn/handshake drops that
    /// server from the set with a logged error and the open continues.
    pub async fn open(profile: &BotProfile) -> Self {
        let mut clients = Vec::new();

        for server in &profile.tool_servers {
            if !server.enabled {
                info!(
                    "[mcp] Skipping disabled tool server '{}' (profile '{}')",
                    server.name, profile.name
                );
                continue;
            }
            match ToolServerClient::connect(server.clone()).await {
                Ok(client) => clients.push(client),
                Err(e) => {
                    error!(
                        "[mcp] Tool server '{}' failed to open (profile '{}'): {}",
                        server.name, profile.name, e
                    );
                }
            }
        }

        let catalog = build_catalog(&clients);
        info!(
            "[mcp] Pool for profile '{}': {} servers, {} tools",
            profile.name,
            clients.len(),
            catalog.len()
        );
        ToolClientPool { clients, catalog }
    }

    /// The aggregated, server-prefixed tool catalog.
    pub fn tool_set(&self) -> ToolSet {
        self.catalog.clone()
    }

    pub fn server_count(&self) -> usize {
        self.clients.len()
    }

    pub fn tool_count(&self) -> usize {
        self.catalog.len()
    }

    /// Invoke a tool by its qualified `{server}_{tool}` name.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> GatewayResult<String> {
        let server_names: Vec<&str> =
            self.clients.iter().map(|c| c.config.name.as_str()).collect();
        let (idx, tool_name) = split_qualified(&server_names, qualified_name).ok_or_else(|| {
            GatewayError::tool("pool", format!("unknown tool '{}'", qualified_name))
        })?;

        let client = &self.clients[idx];
        if !client.is_alive().await {
            return Err(GatewayError::tool(
                &client.config.name,
                format!("server exited; cannot invoke '{}'", tool_name),
            ));
        }
        client.call_tool(tool_name, arguments).await
    }

    /// Close every subprocess. Per-server failures are logged and do not
    /// abort the rest; close is idempotent.
    pub async fn close(&self) {
        for client in &self.clients {
            if !client.is_alive().await {
                warn!("[mcp] Server '{}' already exited", client.config.name);
            }
            client.shutdown().await;
        }
    }
}

/// Qualified tool name: `{server}_{tool}`, consistent across the catalog
/// and invoke. Server names are unique within a profile, so the prefix
/// keeps same-named tools from different servers distinct.
fn qualify(server: &str, tool: &str) -> String {
    format!("{}_{}", server, tool)
}

fn build_catalog(clients: &[ToolServerClient]) -> ToolSet {
    let mut defs = Vec::new();
    for client in clients {
        for tool in &client.tools {
            defs.push(to_definition(&client.config.name, tool));
        }
    }
    defs
}

fn to_definition(server: &str, tool: &McpToolDef) -> ToolDefinition {
    let description = format!(
        "{} [server: {}]",
        tool.description.as_deref().unwrap_or("(no description)"),
        server
    );
    ToolDefinition {
        name: qualify(server, &tool.name),
        description,
        parameters: tool.input_schema.clone(),
    }
}

/// Resolve `{server}_{tool}` back to (client index, original tool name).
/// Server names may contain underscores, so match longest server name first.
fn split_qualified<'a>(server_names: &[&str], qualified: &'a str) -> Option<(usize, &'a str)> {
    let mut indexed: Vec<(usize, &str)> =
        server_names.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    for (idx, name) in indexed {
        if let Some(rest) = qualified.strip_prefix(name) {
            if let Some(tool) = rest.strip_prefix('_') {
                return Some((idx, tool));
            }
        }
    }
    None
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{CommunicationStyle, ToolServerConfig};
    use chrono::Utc;

    fn profile_with_servers(servers: Vec<ToolServerConfig>) -> BotProfile {
        BotProfile {
            id: "p1".into(),
            user_id: "u1".into(),
            name: "Support".into(),
            identity: "bot".into(),
            description: None,
            communication_style: CommunicationStyle::Friendly,
            primary_language: None,
            secondary_language: None,
            language_rules: vec![],
            knowledge_base: vec![],
            tags: vec![],
            initial_interactions: vec![],
            interaction_guidelines: vec![],
            example_responses: vec![],
            edge_cases: vec![],
            tool_config: None,
            privacy_guidelines: None,
            tool_servers: servers,
            is_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn server(name: &str, command: &str, enabled: bool) -> ToolServerConfig {
        ToolServerConfig {
            name: name.into(),
            command: command.into(),
            args: vec![],
            env: Default::default(),
            enabled,
        }
    }

    #[test]
    fn qualified_names_route_longest_server_first() {
        let names = ["files", "files_remote"];
        assert_eq!(split_qualified(&names, "files_read"), Some((0, "read")));
        assert_eq!(split_qualified(&names, "files_remote_read"), Some((1, "read")));
        assert_eq!(split_qualified(&names, "unknown_read"), None);
    }

    #[test]
    fn definitions_carry_prefix_and_server_tag() {
        let tool = McpToolDef {
            name: "read_file".into(),
            description: Some("Read a file from disk".into()),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let def = to_definition("files", &tool);
        assert_eq!(def.name, "files_read_file");
        assert!(def.description.contains("Read a file"));
        assert!(def.description.contains("[server: files]"));

        let bare = McpToolDef {
            name: "ping".into(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        };
        assert!(to_definition("t", &bare).description.contains("(no description)"));
    }

    #[tokio::test]
    async fn empty_profile_opens_an_empty_pool() {
        let pool = ToolClientPool::open(&profile_with_servers(vec![])).await;
        assert_eq!(pool.server_count(), 0);
        assert!(pool.tool_set().is_empty());
        pool.close().await;
    }

    /// `cat` echoes the handshake requests back, which parses as a response
    /// with no error and no result — a tool-less but healthy server.
    #[tokio::test]
    async fn one_failing_server_does_not_abort_the_open() {
        let pool = ToolClientPool::open(&profile_with_servers(vec![
            server("echo", "cat", true),
            server("broken", "/nonexistent/not-a-binary", true),
            server("skipped", "cat", false),
        ]))
        .await;

        assert_eq!(pool.server_count(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn invoke_unknown_tool_is_a_tool_error() {
        let pool = ToolClientPool::open(&profile_with_servers(vec![])).await;
        let err = pool.invoke("ghost_tool", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::Tool { .. }));
    }
}
