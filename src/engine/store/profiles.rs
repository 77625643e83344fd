// Bot profile CRUD. (owner, name) is unique; id, owner, and name are
// immutable after creation — update_profile rejects rename attempts.

use super::{json_col, ts_from_sql, ts_to_sql, Store};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    BotProfile, CommunicationStyle, EdgeCase, ExampleResponse, KnowledgeItem, ToolConfig,
    ToolServerConfig,
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

fn style_to_sql(style: CommunicationStyle) -> &'static str {
    match style {
        CommunicationStyle::Formal => "Formal",
        CommunicationStyle::Friendly => "Friendly",
        CommunicationStyle::Humorous => "Humorous",
        CommunicationStyle::Professional => "Professional",
        CommunicationStyle::Custom => "Custom",
    }
}

fn style_from_sql(raw: &str) -> CommunicationStyle {
    match raw {
        "Formal" => CommunicationStyle::Formal,
        "Humorous" => CommunicationStyle::Humorous,
        "Professional" => CommunicationStyle::Professional,
        "Custom" => CommunicationStyle::Custom,
        _ => CommunicationStyle::Friendly,
    }
}

fn row_to_profile(row: &Row) -> rusqlite::Result<BotProfile> {
    let style: String = row.get("communication_style")?;
    let tool_config: Option<String> = row.get("tool_config")?;
    Ok(BotProfile {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        identity: row.get("identity")?,
        description: row.get("description")?,
        communication_style: style_from_sql(&style),
        primary_language: row.get("primary_language")?,
        secondary_language: row.get("secondary_language")?,
        language_rules: json_col(&row.get::<_, String>("language_rules")?),
        knowledge_base: json_col(&row.get::<_, String>("knowledge_base")?),
        tags: json_col(&row.get::<_, String>("tags")?),
        initial_interactions: json_col(&row.get::<_, String>("initial_interactions")?),
        interaction_guidelines: json_col(&row.get::<_, String>("interaction_guidelines")?),
        example_responses: json_col(&row.get::<_, String>("example_responses")?),
        edge_cases: json_col(&row.get::<_, String>("edge_cases")?),
        tool_config: tool_config.and_then(|raw| serde_json::from_str(&raw).ok()),
        privacy_guidelines: row.get("privacy_guidelines")?,
        tool_servers: json_col(&row.get::<_, String>("tool_servers")?),
        is_enabled: row.get::<_, i64>("is_enabled")? != 0,
        created_at: ts_from_sql(&row.get::<_, String>("created_at")?),
        updated_at: ts_from_sql(&row.get::<_, String>("updated_at")?),
    })
}

/// Creation payload — everything a profile carries except id and timestamps.
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub user_id: String,
    pub name: String,
    pub identity: String,
    pub description: Option<String>,
    pub communication_style: CommunicationStyle,
    pub primary_language: Option<String>,
    pub secondary_language: Option<String>,
    pub language_rules: Vec<String>,
    pub knowledge_base: Vec<KnowledgeItem>,
    pub tags: Vec<String>,
    pub initial_interactions: Vec<String>,
    pub interaction_guidelines: Vec<String>,
    pub example_responses: Vec<ExampleResponse>,
    pub edge_cases: Vec<EdgeCase>,
    pub tool_config: Option<ToolConfig>,
    pub privacy_guidelines: Option<String>,
    pub tool_servers: Vec<ToolServerConfig>,
    pub is_enabled: bool,
}

impl NewProfile {
    pub fn new(user_id: &str, name: &str, identity: &str) -> Self {
        NewProfile {
            user_id: user_id.into(),
            name: name.into(),
            identity: identity.into(),
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
        }
    }
}

/// Mutable-field patch. `name` is accepted only so a rename attempt can be
/// rejected explicitly rather than silently ignored.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub identity: Option<String>,
    pub description: Option<Option<String>>,
    pub communication_style: Option<CommunicationStyle>,
    pub primary_language: Option<Option<String>>,
    pub secondary_language: Option<Option<String>>,
    pub language_rules: Option<Vec<String>>,
    pub knowledge_base: Option<Vec<KnowledgeItem>>,
    pub tags: Option<Vec<String>>,
    pub initial_interactions: Option<Vec<String>>,
    pub interaction_guidelines: Option<Vec<String>>,
    pub example_responses: Option<Vec<ExampleResponse>>,
    pub edge_cases: Option<Vec<EdgeCase>>,
    pub tool_config: Option<Option<ToolConfig>>,
    pub privacy_guidelines: Option<Option<String>>,
    pub tool_servers: Option<Vec<ToolServerConfig>>,
    pub is_enabled: Option<bool>,
}

impl Store {
    pub fn create_profile(&self, new: NewProfile) -> GatewayResult<BotProfile> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let profile = BotProfile {
            id,
            user_id: new.user_id,
            name: new.name.trim().to_string(),
            identity: new.identity,
            description: new.description,
            communication_style: new.communication_style,
            primary_language: new.primary_language,
            secondary_language: new.secondary_language,
            language_rules: new.language_rules,
            knowledge_base: new.knowledge_base,
            tags: new.tags,
            initial_interactions: new.initial_interactions,
            interaction_guidelines: new.interaction_guidelines,
            example_responses: new.example_responses,
            edge_cases: new.edge_cases,
            tool_config: new.tool_config,
            privacy_guidelines: new.privacy_guidelines,
            tool_servers: new.tool_servers,
            is_enabled: new.is_enabled,
            created_at: now,
            updated_at: now,
        };
        profile.validate().map_err(GatewayError::InvalidArgument)?;

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO bot_profiles (
                id, user_id, name, identity, description, communication_style,
                primary_language, secondary_language, language_rules,
                knowledge_base, tags, initial_interactions,
                interaction_guidelines, example_responses, edge_cases,
                tool_config, privacy_guidelines, tool_servers, is_enabled,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                       ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                profile.id,
                profile.user_id,
                profile.name,
                profile.identity,
                profile.description,
                style_to_sql(profile.communication_style),
                profile.primary_language,
                profile.secondary_language,
                serde_json::to_string(&profile.language_rules)?,
                serde_json::to_string(&profile.knowledge_base)?,
                serde_json::to_string(&profile.tags)?,
                serde_json::to_string(&profile.initial_interactions)?,
                serde_json::to_string(&profile.interaction_guidelines)?,
                serde_json::to_string(&profile.example_responses)?,
                serde_json::to_string(&profile.edge_cases)?,
                profile.tool_config.as_ref().map(serde_json::to_string).transpose()?,
                profile.privacy_guidelines,
                serde_json::to_string(&profile.tool_servers)?,
                profile.is_enabled as i64,
                ts_to_sql(profile.created_at),
                ts_to_sql(profile.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Err(GatewayError::conflict(format!(
                "profile '{}' already exists for this user",
                profile.name
            )));
        }
        Ok(profile)
    }

    pub fn find_profile(&self, user_id: &str, name: &str) -> GatewayResult<Option<BotProfile>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM bot_profiles WHERE user_id = ?1 AND name = ?2",
            params![user_id, name.trim()],
            row_to_profile,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn find_profile_by_id(&self, id: &str) -> GatewayResult<Option<BotProfile>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM bot_profiles WHERE id = ?1",
            params![id],
            row_to_profile,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Find a profile by name alone — used when resolving a WhatsApp session
    /// request that names a profile the caller owns.
    pub fn list_profiles(&self, user_id: &str) -> GatewayResult<Vec<BotProfile>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM bot_profiles WHERE user_id = ?1 ORDER BY name")?;
        let profiles = stmt
            .query_map(params![user_id], row_to_profile)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    pub fn update_profile(&self, id: &str, patch: ProfileUpdate) -> GatewayResult<BotProfile> {
        let mut profile = self
            .find_profile_by_id(id)?
            .ok_or_else(|| GatewayError::not_found(format!("profile {}", id)))?;

        if let Some(name) = &patch.name {
            if name.trim() != profile.name {
                return Err(GatewayError::invalid("profile name is immutable"));
            }
        }

        if let Some(v) = patch.identity {
            profile.identity = v;
        }
        if let Some(v) = patch.description {
            profile.description = v;
        }
        if let Some(v) = patch.communication_style {
            profile.communication_style = v;
        }
        if let Some(v) = patch.primary_language {
            profile.primary_language = v;
        }
        if let Some(v) = patch.secondary_language {
            profile.secondary_language = v;
        }
        if let Some(v) = patch.language_rules {
            profile.language_rules = v;
        }
        if let Some(v) = patch.knowledge_base {
            profile.knowledge_base = v;
        }
        if let Some(v) = patch.tags {
            profile.tags = v;
        }
        if let Some(v) = patch.initial_interactions {
            profile.initial_interactions = v;
        }
        if let Some(v) = patch.interaction_guidelines {
            profile.interaction_guidelines = v;
        }
        if let Some(v) = patch.example_responses {
            profile.example_responses = v;
        }
        if let Some(v) = patch.edge_cases {
            profile.edge_cases = v;
        }
        if let Some(v) = patch.tool_config {
            profile.tool_config = v;
        }
        if let Some(v) = patch.privacy_guidelines {
            profile.privacy_guidelines = v;
        }
        if let Some(v) = patch.tool_servers {
            profile.tool_servers = v;
        }
        if let Some(v) = patch.is_enabled {
            profile.is_enabled = v;
        }
        profile.updated_at = Utc::now();
        profile.validate().map_err(GatewayError::InvalidArgument)?;

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bot_profiles SET
                identity = ?1, description = ?2, communication_style = ?3,
                primary_language = ?4, secondary_language = ?5,
                language_rules = ?6, knowledge_base = ?7, tags = ?8,
                initial_interactions = ?9, interaction_guidelines = ?10,
                example_responses = ?11, edge_cases = ?12, tool_config = ?13,
                privacy_guidelines = ?14, tool_servers = ?15, is_enabled = ?16,
                updated_at = ?17
             WHERE id = ?18",
            params![
                profile.identity,
                profile.description,
                style_to_sql(profile.communication_style),
                profile.primary_language,
                profile.secondary_language,
                serde_json::to_string(&profile.language_rules)?,
                serde_json::to_string(&profile.knowledge_base)?,
                serde_json::to_string(&profile.tags)?,
                serde_json::to_string(&profile.initial_interactions)?,
                serde_json::to_string(&profile.interaction_guidelines)?,
                serde_json::to_string(&profile.example_responses)?,
                serde_json::to_string(&profile.edge_cases)?,
                profile.tool_config.as_ref().map(serde_json::to_string).transpose()?,
                profile.privacy_guidelines,
                serde_json::to_string(&profile.tool_servers)?,
                profile.is_enabled as i64,
                ts_to_sql(profile.updated_at),
                id,
            ],
        )?;
        Ok(profile)
    }

    /// Delete a profile; returns false when it did not exist. Cascading
    /// session close-out is the gateway's job — the store only removes the
    /// document.
    pub fn delete_profile(&self, id: &str) -> GatewayResult<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM bot_profiles WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
