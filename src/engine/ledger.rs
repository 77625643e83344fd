// Botgate Engine — Token Ledger
// Per-turn usage accounting: one immutable TokenUsageRecord insert, then
// atomic counter increments on the billing user and the bot profile, in
// that order. No wrapping transaction — on partial failure the record (and
// any applied increments) remain, and the insert-only records are the
// reconciliation source of truth.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{ChatSource, TokenUsage, TokenUsageRecord};
use crate::engine::store::Store;
use chrono::Utc;
use log::info;
use std::sync::Arc;

/// Everything one ledger write needs to know about the turn.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: String,
    pub profile_id: String,
    pub profile_name: String,
    pub chat_id: String,
    pub session_id: String,
    pub source: ChatSource,
    pub model_name: String,
    pub usage: TokenUsage,
}

pub struct TokenLedger {
    store: Arc<Store>,
}

impl TokenLedger {
    pub fn new(store: Arc<Store>) -> Self {
        TokenLedger { store }
    }

    /// Record one turn's usage. Completes before the assistant reply is
    /// sent back to the caller.
    pub fn record_turn(&self, entry: LedgerEntry) -> GatewayResult<TokenUsageRecord> {
        // TokenUsage counts are unsigned by construction; what still needs
        // guarding is the total-overflow edge on corrupt vendor values.
        let total = entry
            .usage
            .prompt_tokens
            .checked_add(entry.usage.completion_tokens)
            .ok_or_else(|| GatewayError::invalid("token counts overflow"))?;

        let record = TokenUsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: entry.user_id.clone(),
            system_prompt_id: entry.profile_id.clone(),
            system_prompt_name: entry.profile_name.clone(),
            chat_id: entry.chat_id.clone(),
            source: entry.source,
            model_name: entry.model_name.clone(),
            prompt_tokens: entry.usage.prompt_tokens,
            completion_tokens: entry.usage.completion_tokens,
            total_tokens: total,
            session_id: entry.session_id.clone(),
            timestamp: Utc::now(),
        };

        // Record first, then user, then profile.
        self.store.insert_usage_record(&record)?;
        self.store.increment_user_tokens(
            &entry.user_id,
            entry.usage.prompt_tokens,
            entry.usage.completion_tokens,
        )?;
        self.store.increment_profile_tokens(
            &entry.profile_id,
            entry.usage.prompt_tokens,
            entry.usage.completion_tokens,
        )?;

        info!(
            "[ledger] Recorded {} tokens ({}+{}) user={} profile={}",
            total,
            entry.usage.prompt_tokens,
            entry.usage.completion_tokens,
            entry.user_id,
            entry.profile_name,
        );
        Ok(record)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
