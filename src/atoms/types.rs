// ── Botgate Atoms: Pure Data Types ─────────────────────────────────────────
// Plain struct/enum definitions shared by every component: the message and
// tool shapes the LLM adapter consumes, and the persisted document model
// (users, bot profiles, chats, usage records, WhatsApp connections).
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Messaging primitives ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to plain text (text parts joined, non-text parts described).
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::Image { url, .. } => format!("[image: {}]", url),
                    ContentPart::File { url, .. } => format!("[file: {}]", url),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.trim().is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

/// One element of a multi-modal message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    File {
        url: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A callable tool advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's input.
    pub parameters: serde_json::Value,
}

/// Token counts reported by the LLM vendor for one or more model calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// In-flight message shape the LLM adapter consumes — history entries are
/// normalized into this before every model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Message {
            role,
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
        }
    }
}

// ── Persisted chat model ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatSource {
    Whatsapp,
    Webapp,
}

impl ChatSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatSource::Whatsapp => "whatsapp",
            ChatSource::Webapp => "webapp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
    Pending,
}

/// An uploaded file referenced by a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// One persisted message in a chat's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Invariants every appended message must satisfy: non-empty content or
    /// at least one attachment; role=tool requires a tool_call_id.
    pub fn validate(&self) -> Result<(), String> {
        if self.content.is_empty() && self.attachments.is_empty() {
            return Err("message has neither content nor attachments".into());
        }
        if self.role == Role::Tool && self.tool_call_id.is_none() {
            return Err("tool message requires tool_call_id".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    pub last_active: DateTime<Utc>,
    pub is_archived: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One conversation thread. (session_id, source) is globally unique;
/// messages are stored separately and append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub session_id: String,
    pub system_prompt_id: String,
    /// Denormalized snapshot of the profile name at chat creation.
    pub system_prompt_name: String,
    pub source: ChatSource,
    pub user_id: String,
    pub metadata: ChatMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Users ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounters {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Billing identity. Mutated only by the token ledger and admin privilege
/// changes; never deleted by core logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    /// Unique, stored lower-cased.
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub privilege: Privilege,
    pub lifetime: TokenCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_token_quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_token_usage_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.privilege == Privilege::Admin
    }
}

/// Per-month usage bucket, keyed "YYYY-MM".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyUsage {
    pub month: String,
    #[serde(flatten)]
    pub counters: TokenCounters,
}

// ── Bot profiles ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommunicationStyle {
    Formal,
    Friendly,
    Humorous,
    Professional,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeItem {
    /// Max 200 chars.
    pub topic: String,
    /// Max 2000 chars.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExampleResponse {
    pub scenario: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeCase {
    pub case: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolConfig {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub purposes: Vec<String>,
}

/// One external tool server spawned for sessions bound to this profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolServerConfig {
    /// Unique within the profile.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables passed to the subprocess (credentials, etc.).
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A named prompt/tool bundle owned by one user. (owner, name) is unique;
/// name and owner are immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotProfile {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub communication_style: CommunicationStyle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_language: Option<String>,
    #[serde(default)]
    pub language_rules: Vec<String>,
    #[serde(default)]
    pub knowledge_base: Vec<KnowledgeItem>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub initial_interactions: Vec<String>,
    #[serde(default)]
    pub interaction_guidelines: Vec<String>,
    #[serde(default)]
    pub example_responses: Vec<ExampleResponse>,
    #[serde(default)]
    pub edge_cases: Vec<EdgeCase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy_guidelines: Option<String>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotProfile {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("profile name is required".into());
        }
        if self.identity.trim().is_empty() {
            return Err("identity text is required".into());
        }
        for item in &self.knowledge_base {
            if item.topic.chars().count() > 200 {
                return Err(format!("knowledge topic exceeds 200 chars: {}", item.topic));
            }
            if item.content.chars().count() > 2000 {
                return Err("knowledge content exceeds 2000 chars".into());
            }
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.tool_servers {
            if !seen.insert(server.name.as_str()) {
                return Err(format!("duplicate tool server name: {}", server.name));
            }
        }
        Ok(())
    }
}

// ── WhatsApp connections ───────────────────────────────────────────────────

/// Persisted lifecycle status of a WhatsApp connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Initializing,
    InitializingStartup,
    QrPendingScan,
    Authenticated,
    Connected,
    AuthFailed,
    Reconnecting,
    DisconnectedPermanent,
    ClosedManually,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Initializing => "initializing",
            ConnectionStatus::InitializingStartup => "initializing_startup",
            ConnectionStatus::QrPendingScan => "qr_pending_scan",
            ConnectionStatus::Authenticated => "authenticated",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::AuthFailed => "auth_failed",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::DisconnectedPermanent => "disconnected_permanent",
            ConnectionStatus::ClosedManually => "closed_manually",
        }
    }
}

/// Persisted intent to run a WhatsApp session. Never deleted — a manual
/// close sets autoReconnect=false and status=closed_manually.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConnection {
    /// Globally unique, trimmed, 3–100 chars.
    pub connection_name: String,
    pub system_prompt_name: String,
    pub system_prompt_id: String,
    pub user_id: String,
    pub auto_reconnect: bool,
    pub last_known_status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempted_reconnect_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn validate_connection_name(name: &str) -> Result<String, String> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if !(3..=100).contains(&len) {
        return Err("connection name must be 3–100 characters".into());
    }
    Ok(trimmed.to_string())
}

// ── Token usage records ────────────────────────────────────────────────────

/// Immutable per-turn usage log entry. Insert-only; the source of truth for
/// usage reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageRecord {
    pub id: String,
    pub user_id: String,
    pub system_prompt_id: String,
    pub system_prompt_name: String,
    pub chat_id: String,
    pub source: ChatSource,
    pub model_name: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_part_serde_shapes() {
        let part = ContentPart::Image {
            url: "https://cdn.example/a.png".into(),
            mime_type: "image/png".into(),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"image\""));
        assert!(json.contains("\"mimeType\":\"image/png\""));

        let back: ContentPart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn message_content_untagged() {
        let text: MessageContent = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(text.as_text(), "hello");

        let parts: MessageContent =
            serde_json::from_str(r#"[{"type":"text","text":"hi"}]"#).unwrap();
        assert_eq!(parts.as_text(), "hi");
    }

    #[test]
    fn chat_message_requires_content_or_attachment() {
        let mut msg = ChatMessage {
            id: "m1".into(),
            role: Role::User,
            content: MessageContent::Text("".into()),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            status: MessageStatus::Delivered,
            attachments: vec![],
            timestamp: Utc::now(),
        };
        assert!(msg.validate().is_err());

        msg.attachments.push(Attachment {
            url: "https://cdn.example/f.png".into(),
            original_name: "f.png".into(),
            mime_type: "image/png".into(),
            size: 10,
            uploaded_at: Utc::now(),
        });
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn tool_message_requires_call_id() {
        let msg = ChatMessage {
            id: "m2".into(),
            role: Role::Tool,
            content: MessageContent::Text("result".into()),
            tool_calls: None,
            tool_call_id: None,
            tool_name: Some("files_read".into()),
            status: MessageStatus::Sent,
            attachments: vec![],
            timestamp: Utc::now(),
        };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn connection_name_bounds() {
        assert!(validate_connection_name("ab").is_err());
        assert!(validate_connection_name(&"x".repeat(101)).is_err());
        assert_eq!(validate_connection_name("  shop-bot  ").unwrap(), "shop-bot");
    }

    #[test]
    fn tool_server_config_defaults() {
        let json = r#"{"name":"files","command":"npx"}"#;
        let cfg: ToolServerConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.enabled);
        assert!(cfg.args.is_empty());
        assert!(cfg.env.is_empty());
    }

    #[test]
    fn profile_validation_limits() {
        let mut profile = BotProfile {
            id: "p1".into(),
            user_id: "u1".into(),
            name: "Support".into(),
            identity: "A helpful support bot".into(),
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
            tool_servers: vec![],
            is_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(profile.validate().is_ok());

        profile.knowledge_base.push(KnowledgeItem {
            topic: "t".repeat(201),
            content: "c".into(),
        });
        assert!(profile.validate().is_err());
    }

    #[test]
    fn connection_status_round_trip() {
        let s = ConnectionStatus::QrPendingScan;
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"qr_pending_scan\"");
        assert_eq!(s.as_str(), "qr_pending_scan");
    }

    #[test]
    fn usage_totals() {
        let u = TokenUsage { prompt_tokens: 5, completion_tokens: 3 };
        assert_eq!(u.total(), 8);
    }
}
