// User accounts and the atomic token-counter increments the ledger applies.

use super::{opt_ts_from_sql, ts_from_sql, ts_to_sql, Store};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{MonthlyUsage, Privilege, TokenCounters, User};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    let privilege: String = row.get("privilege")?;
    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        name: row.get("name")?,
        password_hash: row.get("password_hash")?,
        privilege: if privilege == "admin" { Privilege::Admin } else { Privilege::User },
        lifetime: TokenCounters {
            prompt_tokens: row.get::<_, i64>("lifetime_prompt_tokens")? as u64,
            completion_tokens: row.get::<_, i64>("lifetime_completion_tokens")? as u64,
            total_tokens: row.get::<_, i64>("lifetime_total_tokens")? as u64,
        },
        monthly_token_quota: row.get::<_, Option<i64>>("monthly_token_quota")?.map(|v| v as u64),
        last_token_usage_update: opt_ts_from_sql(row.get("last_token_usage_update")?),
        created_at: ts_from_sql(&row.get::<_, String>("created_at")?),
    })
}

impl Store {
    /// Register a new user. Email is trimmed and lower-cased; a duplicate
    /// yields Conflict.
    pub fn register_user(
        &self,
        email: &str,
        password_hash: &str,
        name: Option<&str>,
    ) -> GatewayResult<User> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(GatewayError::invalid("invalid email address"));
        }

        let conn = self.conn.lock();
        let id = uuid::Uuid::new_v4().to_string();
        let now = ts_to_sql(Utc::now());

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (id, email, name, password_hash, privilege, created_at)
             VALUES (?1, ?2, ?3, ?4, 'user', ?5)",
            params![id, email, name, password_hash, now],
        )?;
        if inserted == 0 {
            return Err(GatewayError::conflict(format!("email already registered: {}", email)));
        }

        conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], row_to_user)
            .map_err(Into::into)
    }

    pub fn find_user_by_email(&self, email: &str) -> GatewayResult<Option<User>> {
        let email = email.trim().to_lowercase();
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM users WHERE email = ?1", params![email], row_to_user)
            .optional()
            .map_err(Into::into)
    }

    pub fn find_user_by_id(&self, id: &str) -> GatewayResult<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], row_to_user)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_users(&self) -> GatewayResult<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM users ORDER BY created_at")?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn set_user_privilege(&self, id: &str, privilege: Privilege) -> GatewayResult<()> {
        let value = match privilege {
            Privilege::Admin => "admin",
            Privilege::User => "user",
        };
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET privilege = ?1 WHERE id = ?2",
            params![value, id],
        )?;
        if updated == 0 {
            return Err(GatewayError::not_found(format!("user {}", id)));
        }
        Ok(())
    }

    /// Apply one turn's token usage to a user: lifetime counters and the
    /// current month's bucket, in a single transaction of field increments.
    /// Fails with NotFound when the user does not exist — never upserts.
    pub fn increment_user_tokens(
        &self,
        user_id: &str,
        prompt: u64,
        completion: u64,
    ) -> GatewayResult<()> {
        let total = prompt + completion;
        let month = Utc::now().format("%Y-%m").to_string();
        let now = ts_to_sql(Utc::now());

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE users SET
                lifetime_prompt_tokens = lifetime_prompt_tokens + ?1,
                lifetime_completion_tokens = lifetime_completion_tokens + ?2,
                lifetime_total_tokens = lifetime_total_tokens + ?3,
                last_token_usage_update = ?4
             WHERE id = ?5",
            params![prompt as i64, completion as i64, total as i64, now, user_id],
        )?;
        if updated == 0 {
            return Err(GatewayError::not_found(format!("user {}", user_id)));
        }

        tx.execute(
            "INSERT INTO monthly_usage (user_id, month, prompt_tokens, completion_tokens, total_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id, month) DO UPDATE SET
                prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                completion_tokens = completion_tokens + excluded.completion_tokens,
                total_tokens = total_tokens + excluded.total_tokens",
            params![user_id, month, prompt as i64, completion as i64, total as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Monthly buckets for a user, newest first.
    pub fn user_monthly_usage(&self, user_id: &str) -> GatewayResult<Vec<MonthlyUsage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT month, prompt_tokens, completion_tokens, total_tokens
             FROM monthly_usage WHERE user_id = ?1 ORDER BY month DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(MonthlyUsage {
                    month: row.get(0)?,
                    counters: TokenCounters {
                        prompt_tokens: row.get::<_, i64>(1)? as u64,
                        completion_tokens: row.get::<_, i64>(2)? as u64,
                        total_tokens: row.get::<_, i64>(3)? as u64,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
