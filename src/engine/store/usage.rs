// Immutable token-usage records plus the profile-side counter increments.
// Records are insert-only — they are the reconciliation source of truth
// for the denormalized counters on users and profiles.

use super::{ts_from_sql, ts_to_sql, Store};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{ChatSource, TokenCounters, TokenUsageRecord};
use rusqlite::{params, Row};

fn row_to_record(row: &Row) -> rusqlite::Result<TokenUsageRecord> {
    let source: String = row.get("source")?;
    Ok(TokenUsageRecord {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        system_prompt_id: row.get("system_prompt_id")?,
        system_prompt_name: row.get("system_prompt_name")?,
        chat_id: row.get("chat_id")?,
        source: if source == "whatsapp" { ChatSource::Whatsapp } else { ChatSource::Webapp },
        model_name: row.get("model_name")?,
        prompt_tokens: row.get::<_, i64>("prompt_tokens")? as u64,
        completion_tokens: row.get::<_, i64>("completion_tokens")? as u64,
        total_tokens: row.get::<_, i64>("total_tokens")? as u64,
        session_id: row.get("session_id")?,
        timestamp: ts_from_sql(&row.get::<_, String>("created_at")?),
    })
}

impl Store {
    pub fn insert_usage_record(&self, record: &TokenUsageRecord) -> GatewayResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO token_usage_records (
                id, user_id, system_prompt_id, system_prompt_name, chat_id,
                source, model_name, prompt_tokens, completion_tokens,
                total_tokens, session_id, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.user_id,
                record.system_prompt_id,
                record.system_prompt_name,
                record.chat_id,
                record.source.as_str(),
                record.model_name,
                record.prompt_tokens as i64,
                record.completion_tokens as i64,
                record.total_tokens as i64,
                record.session_id,
                ts_to_sql(record.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn list_usage_for_user(&self, user_id: &str) -> GatewayResult<Vec<TokenUsageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM token_usage_records WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let records = stmt
            .query_map(params![user_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Same contract as increment_user_tokens: single atomic field-increment
    /// statement, NotFound when the profile does not exist.
    pub fn increment_profile_tokens(
        &self,
        profile_id: &str,
        prompt: u64,
        completion: u64,
    ) -> GatewayResult<()> {
        let total = prompt + completion;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE bot_profiles SET
                prompt_tokens = prompt_tokens + ?1,
                completion_tokens = completion_tokens + ?2,
                total_tokens = total_tokens + ?3
             WHERE id = ?4",
            params![prompt as i64, completion as i64, total as i64, profile_id],
        )?;
        if updated == 0 {
            return Err(GatewayError::not_found(format!("profile {}", profile_id)));
        }
        Ok(())
    }

    /// Denormalized counters for one profile (used by owner-facing stats).
    pub fn profile_token_counters(&self, profile_id: &str) -> GatewayResult<TokenCounters> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT prompt_tokens, completion_tokens, total_tokens
             FROM bot_profiles WHERE id = ?1",
            params![profile_id],
            |row| {
                Ok(TokenCounters {
                    prompt_tokens: row.get::<_, i64>(0)? as u64,
                    completion_tokens: row.get::<_, i64>(1)? as u64,
                    total_tokens: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                GatewayError::not_found(format!("profile {}", profile_id))
            }
            other => other.into(),
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
