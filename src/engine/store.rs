// Botgate Engine — Document Store
// Users, bot profiles, chats, token-usage records, and WhatsApp connections
// in SQLite via rusqlite. The store is the only component that touches the
// database; everything above it works in terms of the atoms types.
//
// Layout:
//   store.rs          — Store handle, open/migrate, shared row helpers
//   store/users.rs    — users + atomic token-counter increments
//   store/profiles.rs — bot profile CRUD with immutability rules
//   store/chats.rs    — chat upsert + append-only message history
//   store/usage.rs    — immutable usage records + profile counters
//   store/connections.rs — persisted WhatsApp reconnect intent

mod chats;
mod connections;
mod profiles;
mod users;
mod usage;

pub use chats::{ChatMetadataPatch, UpsertChat};
pub use connections::{ConnectionFilter, ConnectionPatch};
pub use profiles::{NewProfile, ProfileUpdate};

use crate::atoms::error::GatewayResult;
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

/// Thread-safe database wrapper. One connection guarded by a mutex — every
/// multi-statement operation holds the lock for its whole duration, which is
/// what makes find-or-insert and the counter increments atomic.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the gateway database and run migrations.
    pub fn open(path: &Path) -> GatewayResult<Self> {
        info!("[store] Opening gateway store at {:?}", path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        // WAL for concurrent readers while a writer holds the lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .ok();
        run_migrations(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> GatewayResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        run_migrations(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }
}

// ── Schema ─────────────────────────────────────────────────────────────────
// Adding a table or column: append an idempotent CREATE TABLE IF NOT EXISTS
// or ALTER TABLE … ADD COLUMN at the end — never modify existing SQL, to
// keep upgrade paths clean.

fn run_migrations(conn: &Connection) -> GatewayResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT,
            password_hash TEXT NOT NULL,
            privilege TEXT NOT NULL DEFAULT 'user',
            lifetime_prompt_tokens INTEGER NOT NULL DEFAULT 0,
            lifetime_completion_tokens INTEGER NOT NULL DEFAULT 0,
            lifetime_total_tokens INTEGER NOT NULL DEFAULT 0,
            monthly_token_quota INTEGER,
            last_token_usage_update TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS monthly_usage (
            user_id TEXT NOT NULL,
            month TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, month)
        );

        CREATE TABLE IF NOT EXISTS bot_profiles (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            identity TEXT NOT NULL,
            description TEXT,
            communication_style TEXT NOT NULL DEFAULT 'Friendly',
            primary_language TEXT,
            secondary_language TEXT,
            language_rules TEXT NOT NULL DEFAULT '[]',
            knowledge_base TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]',
            initial_interactions TEXT NOT NULL DEFAULT '[]',
            interaction_guidelines TEXT NOT NULL DEFAULT '[]',
            example_responses TEXT NOT NULL DEFAULT '[]',
            edge_cases TEXT NOT NULL DEFAULT '[]',
            tool_config TEXT,
            privacy_guidelines TEXT,
            tool_servers TEXT NOT NULL DEFAULT '[]',
            is_enabled INTEGER NOT NULL DEFAULT 1,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (user_id, name)
        );

        CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            source TEXT NOT NULL,
            system_prompt_id TEXT NOT NULL,
            system_prompt_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            user_name TEXT,
            connection_name TEXT,
            last_active TEXT NOT NULL,
            is_archived INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '[]',
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (session_id, source)
        );

        CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id);

        CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            tool_calls TEXT,
            tool_call_id TEXT,
            tool_name TEXT,
            status TEXT NOT NULL DEFAULT 'sent',
            attachments TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
            ON chat_messages(chat_id, created_at);

        CREATE TABLE IF NOT EXISTS token_usage_records (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            system_prompt_id TEXT NOT NULL,
            system_prompt_name TEXT NOT NULL,
            chat_id TEXT NOT NULL,
            source TEXT NOT NULL,
            model_name TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_usage_user
            ON token_usage_records(user_id, created_at);

        CREATE TABLE IF NOT EXISTS whatsapp_connections (
            connection_name TEXT PRIMARY KEY,
            system_prompt_name TEXT NOT NULL,
            system_prompt_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            auto_reconnect INTEGER NOT NULL DEFAULT 1,
            last_known_status TEXT NOT NULL DEFAULT 'initializing',
            last_connected_at TEXT,
            last_attempted_reconnect_at TEXT,
            phone_number TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_wa_connections_reconnect
            ON whatsapp_connections(auto_reconnect);
        ",
    )?;

    Ok(())
}

// ── Shared row helpers ─────────────────────────────────────────────────────

/// RFC 3339 rendering used for every persisted timestamp.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a persisted timestamp; malformed values collapse to the epoch so a
/// single bad row never poisons a whole query.
pub(crate) fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn opt_ts_from_sql(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| ts_from_sql(&s))
}

/// Decode a JSON column, falling back to the type's default on corruption.
pub(crate) fn json_col<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

// ── Tests ──────────────────────────────────────────────────────────────────
