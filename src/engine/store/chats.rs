// Chat threads and their append-only message history.
// (session_id, source) is globally unique; upsert_chat is the atomic
// find-or-insert every pipeline turn goes through.

use super::{json_col, ts_from_sql, ts_to_sql, Store};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    Chat, ChatMessage, ChatMetadata, ChatSource, MessageContent, MessageStatus, Role,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

fn source_from_sql(raw: &str) -> ChatSource {
    if raw == "whatsapp" {
        ChatSource::Whatsapp
    } else {
        ChatSource::Webapp
    }
}

fn role_to_sql(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn role_from_sql(raw: &str) -> Role {
    match raw {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn status_to_sql(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
        MessageStatus::Pending => "pending",
    }
}

fn status_from_sql(raw: &str) -> MessageStatus {
    match raw {
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        "failed" => MessageStatus::Failed,
        "pending" => MessageStatus::Pending,
        _ => MessageStatus::Sent,
    }
}

fn row_to_chat(row: &Row) -> rusqlite::Result<Chat> {
    let source: String = row.get("source")?;
    Ok(Chat {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        source: source_from_sql(&source),
        system_prompt_id: row.get("system_prompt_id")?,
        system_prompt_name: row.get("system_prompt_name")?,
        user_id: row.get("user_id")?,
        metadata: ChatMetadata {
            user_name: row.get("user_name")?,
            connection_name: row.get("connection_name")?,
            last_active: ts_from_sql(&row.get::<_, String>("last_active")?),
            is_archived: row.get::<_, i64>("is_archived")? != 0,
            tags: json_col(&row.get::<_, String>("tags")?),
            notes: row.get("notes")?,
        },
        created_at: ts_from_sql(&row.get::<_, String>("created_at")?),
        updated_at: ts_from_sql(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<ChatMessage> {
    let role: String = row.get("role")?;
    let status: String = row.get("status")?;
    let content_raw: String = row.get("content")?;
    let tool_calls_raw: Option<String> = row.get("tool_calls")?;
    Ok(ChatMessage {
        id: row.get("id")?,
        role: role_from_sql(&role),
        // Content is stored as the JSON form of MessageContent; corrupt rows
        // fall back to the raw text rather than vanishing.
        content: serde_json::from_str(&content_raw)
            .unwrap_or(MessageContent::Text(content_raw)),
        tool_calls: tool_calls_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        tool_call_id: row.get("tool_call_id")?,
        tool_name: row.get("tool_name")?,
        status: status_from_sql(&status),
        attachments: json_col(&row.get::<_, String>("attachments")?),
        timestamp: ts_from_sql(&row.get::<_, String>("created_at")?),
    })
}

/// Filter + insert-defaults for the atomic find-or-insert.
#[derive(Debug, Clone)]
pub struct UpsertChat {
    pub session_id: String,
    pub source: ChatSource,
    pub user_id: String,
    pub system_prompt_id: String,
    pub system_prompt_name: String,
    pub connection_name: Option<String>,
    pub user_name: Option<String>,
}

/// Partial metadata update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ChatMetadataPatch {
    pub user_name: Option<String>,
    pub last_active: Option<DateTime<Utc>>,
    pub is_archived: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
}

impl Store {
    /// Find-or-insert a chat by (session_id, source), returning the current
    /// document. Runs under one lock so concurrent turns for the same
    /// session cannot create duplicates.
    pub fn upsert_chat(&self, upsert: UpsertChat) -> GatewayResult<Chat> {
        let conn = self.conn.lock();
        let now = ts_to_sql(Utc::now());
        let id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT OR IGNORE INTO chats (
                id, session_id, source, system_prompt_id, system_prompt_name,
                user_id, user_name, connection_name, last_active, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?9)",
            params![
                id,
                upsert.session_id,
                upsert.source.as_str(),
                upsert.system_prompt_id,
                upsert.system_prompt_name,
                upsert.user_id,
                upsert.user_name,
                upsert.connection_name,
                now,
            ],
        )?;

        conn.query_row(
            "SELECT * FROM chats WHERE session_id = ?1 AND source = ?2",
            params![upsert.session_id, upsert.source.as_str()],
            row_to_chat,
        )
        .map_err(Into::into)
    }

    pub fn find_chat_by_id(&self, id: &str) -> GatewayResult<Option<Chat>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM chats WHERE id = ?1", params![id], row_to_chat)
            .optional()
            .map_err(Into::into)
    }

    pub fn find_chat_by_session(
        &self,
        session_id: &str,
        source: ChatSource,
    ) -> GatewayResult<Option<Chat>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM chats WHERE session_id = ?1 AND source = ?2",
            params![session_id, source.as_str()],
            row_to_chat,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_chats_for_user(&self, user_id: &str) -> GatewayResult<Vec<Chat>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM chats WHERE user_id = ?1 ORDER BY updated_at DESC")?;
        let chats = stmt
            .query_map(params![user_id], row_to_chat)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chats)
    }

    pub fn list_all_chats(&self) -> GatewayResult<Vec<Chat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM chats ORDER BY updated_at DESC")?;
        let chats = stmt.query_map([], row_to_chat)?.collect::<Result<Vec<_>, _>>()?;
        Ok(chats)
    }

    /// Append messages to a chat's history. Each message is validated first;
    /// the chat's updated_at advances with the append.
    pub fn append_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> GatewayResult<()> {
        for msg in messages {
            msg.validate().map_err(GatewayError::InvalidArgument)?;
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for msg in messages {
            tx.execute(
                "INSERT INTO chat_messages (
                    id, chat_id, role, content, tool_calls, tool_call_id,
                    tool_name, status, attachments, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    msg.id,
                    chat_id,
                    role_to_sql(msg.role),
                    serde_json::to_string(&msg.content)?,
                    msg.tool_calls.as_ref().map(serde_json::to_string).transpose()?,
                    msg.tool_call_id,
                    msg.tool_name,
                    status_to_sql(msg.status),
                    serde_json::to_string(&msg.attachments)?,
                    ts_to_sql(msg.timestamp),
                ],
            )?;
        }
        let updated = tx.execute(
            "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
            params![ts_to_sql(Utc::now()), chat_id],
        )?;
        if updated == 0 {
            return Err(GatewayError::not_found(format!("chat {}", chat_id)));
        }
        tx.commit()?;
        Ok(())
    }

    /// Last `limit` messages in chronological order. Insertion order (rowid)
    /// breaks timestamp ties so turns never reorder.
    pub fn get_messages(&self, chat_id: &str, limit: usize) -> GatewayResult<Vec<ChatMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT *, rowid AS seq FROM chat_messages
                WHERE chat_id = ?1 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )?;
        let messages = stmt
            .query_map(params![chat_id, limit as i64], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn set_chat_metadata(
        &self,
        chat_id: &str,
        patch: ChatMetadataPatch,
    ) -> GatewayResult<()> {
        let conn = self.conn.lock();
        let now = ts_to_sql(Utc::now());
        let updated = conn.execute(
            "UPDATE chats SET
                user_name = COALESCE(?1, user_name),
                last_active = COALESCE(?2, last_active),
                is_archived = COALESCE(?3, is_archived),
                tags = COALESCE(?4, tags),
                notes = COALESCE(?5, notes),
                updated_at = ?6
             WHERE id = ?7",
            params![
                patch.user_name,
                patch.last_active.map(ts_to_sql),
                patch.is_archived.map(|v| v as i64),
                patch.tags.as_ref().map(serde_json::to_string).transpose()?,
                patch.notes,
                now,
                chat_id,
            ],
        )?;
        if updated == 0 {
            return Err(GatewayError::not_found(format!("chat {}", chat_id)));
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
