// Botgate Engine — LLM Provider Client
// Direct HTTP calls to the generative-model API. The LlmClient trait is the
// vendor seam: the engine only sees messages in, ModelTurn out, with tool
// calls and reported usage. One concrete client ships (Google Gemini,
// generateContent); tests drive the engine through scripted fakes.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    ContentPart, Message, MessageContent, Role, TokenUsage, ToolCall, ToolDefinition,
};
use crate::engine::config::GatewayConfig;
use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Statuses that indicate a transient upstream condition rather than a
/// misconfigured request.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 529)
}

/// One model response: final text and/or requested tool calls, plus the
/// vendor-reported usage when available.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

/// Vendor-neutral interface to a generative model with tool calling and
/// multi-modal content parts.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> GatewayResult<ModelTurn>;
}

// ── Google Gemini ──────────────────────────────────────────────────────────

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    search_grounding: bool,
}

impl GeminiClient {
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_base_url(
            "https://generativelanguage.googleapis.com/v1beta",
            &config.llm_api_key,
            &config.llm_model,
            config.llm_search_grounding,
        )
    }

    /// Constructor with an explicit base URL, for tests against a local stub.
    pub fn with_base_url(base_url: &str, api_key: &str, model: &str, search_grounding: bool) -> Self {
        GeminiClient {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            search_grounding,
        }
    }

    /// Map engine messages to Gemini `contents`. Tool results become
    /// functionResponse parts; assistant tool calls are echoed back as
    /// functionCall parts. Consecutive same-role entries are merged because
    /// Gemini requires alternating user/model turns.
    fn format_contents(messages: &[Message]) -> Vec<Value> {
        let mut contents: Vec<Value> = Vec::new();

        for msg in messages {
            let entry = match msg.role {
                Role::System => {
                    // System text inside history is folded into a user part;
                    // the real system prompt travels as systemInstruction.
                    json!({
                        "role": "user",
                        "parts": [{"text": msg.content.as_text()}],
                    })
                }
                Role::Tool => {
                    let name = msg
                        .tool_name
                        .clone()
                        .or_else(|| msg.tool_call_id.clone())
                        .unwrap_or_default();
                    json!({
                        "role": "function",
                        "parts": [{
                            "functionResponse": {
                                "name": name,
                                "response": {"result": msg.content.as_text()},
                            }
                        }],
                    })
                }
                Role::Assistant => {
                    let mut parts: Vec<Value> = Vec::new();
                    let text = msg.content.as_text();
                    if !text.is_empty() {
                        parts.push(json!({"text": text}));
                    }
                    if let Some(tool_calls) = &msg.tool_calls {
                        for tc in tool_calls {
                            parts.push(json!({
                                "functionCall": {"name": tc.name, "args": tc.arguments},
                            }));
                        }
                    }
                    if parts.is_empty() {
                        parts.push(json!({"text": ""}));
                    }
                    json!({"role": "model", "parts": parts})
                }
                Role::User => {
                    let parts: Vec<Value> = match &msg.content {
                        MessageContent::Text(s) => vec![json!({"text": s})],
                        MessageContent::Parts(list) => list
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => json!({"text": text}),
                                ContentPart::Image { url, mime_type } => {
                                    // data: URLs carry the bytes inline;
                                    // anything else is passed by URI.
                                    if let Some((mime, b64)) = parse_data_url(url) {
                                        json!({"inlineData": {"mimeType": mime, "data": b64}})
                                    } else {
                                        json!({"fileData": {"fileUri": url, "mimeType": mime_type}})
                                    }
                                }
                                ContentPart::File { url, mime_type, .. } => {
                                    json!({"fileData": {"fileUri": url, "mimeType": mime_type}})
                                }
                            })
                            .collect(),
                    };
                    json!({"role": "user", "parts": parts})
                }
            };
            contents.push(entry);
        }

        merge_consecutive_roles(contents)
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<Value> {
        let mut entries = Vec::new();
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": sanitize_schema(&t.parameters),
                    })
                })
                .collect();
            entries.push(json!({"functionDeclarations": declarations}));
        }
        if self.search_grounding {
            entries.push(json!({"googleSearch": {}}));
        }
        entries
    }

    fn parse_response(body: &Value) -> ModelTurn {
        let mut turn = ModelTurn::default();
        let mut text = String::new();

        if let Some(parts) = body["candidates"][0]["content"]["parts"].as_array() {
            for part in parts {
                if let Some(t) = part["text"].as_str() {
                    text.push_str(t);
                }
                if let Some(fc) = part.get("functionCall") {
                    turn.tool_calls.push(ToolCall {
                        id: format!("call_{}", uuid::Uuid::new_v4()),
                        name: fc["name"].as_str().unwrap_or_default().to_string(),
                        arguments: fc.get("args").cloned().unwrap_or(json!({})),
                    });
                }
            }
        }
        if !text.is_empty() {
            turn.text = Some(text);
        }

        let meta = &body["usageMetadata"];
        let prompt = meta["promptTokenCount"].as_u64();
        let completion = meta["candidatesTokenCount"].as_u64();
        if prompt.is_some() || completion.is_some() {
            turn.usage = Some(TokenUsage {
                prompt_tokens: prompt.unwrap_or(0),
                completion_tokens: completion.unwrap_or(0),
            });
        }

        turn
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> GatewayResult<ModelTurn> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let mut body = json!({
            "systemInstruction": {"parts": [{"text": system_prompt}]},
            "contents": Self::format_contents(messages),
        });
        let tool_entries = self.format_tools(tools);
        if !tool_entries.is_empty() {
            body["tools"] = json!(tool_entries);
        }

        info!("[llm] Gemini request model={} messages={}", self.model, messages.len());

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            GatewayError::llm(format!("request failed: {}", e), true)
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let detail = &body_text[..body_text.len().min(300)];
            error!("[llm] Gemini error {}: {}", status, detail);
            return Err(GatewayError::llm(
                format!("API error {}: {}", status, detail),
                is_retryable_status(status),
            ));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::llm(format!("unparseable response: {}", e), false))?;

        let turn = Self::parse_response(&parsed);
        if turn.usage.is_none() {
            warn!("[llm] Gemini response carried no usage metadata");
        }
        Ok(turn)
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    rest.split_once(";base64,")
}

/// Merge consecutive same-role contents; Gemini rejects back-to-back user
/// or model turns. Function responses are never merged.
fn merge_consecutive_roles(contents: Vec<Value>) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::new();
    for entry in contents {
        let role = entry["role"].as_str().unwrap_or("").to_string();
        let can_merge = role != "function"
            && merged
                .last()
                .and_then(|e| e["role"].as_str())
                .map(|r| r == role)
                .unwrap_or(false);

        if can_merge {
            if let Some(last) = merged.last_mut() {
                if let (Some(existing), Some(new_parts)) =
                    (last["parts"].as_array().cloned(), entry["parts"].as_array())
                {
                    let mut combined = existing;
                    combined.extend(new_parts.iter().cloned());
                    last["parts"] = json!(combined);
                }
            }
        } else {
            merged.push(entry);
        }
    }
    merged
}

/// Strip JSON-Schema fields Gemini rejects: `additionalProperties`,
/// `$schema`, `$ref`, empty `required` arrays, and empty `properties` maps.
fn sanitize_schema(val: &Value) -> Value {
    match val {
        Value::Object(map) => {
            let mut clean = serde_json::Map::new();
            for (k, v) in map {
                if k == "additionalProperties" || k == "$schema" || k == "$ref" {
                    continue;
                }
                if k == "required" {
                    if let Value::Array(arr) = v {
                        if arr.is_empty() {
                            continue;
                        }
                    }
                }
                if k == "properties" {
                    if let Value::Object(props) = v {
                        if props.is_empty() {
                            continue;
                        }
                    }
                }
                clean.insert(k.clone(), sanitize_schema(v));
            }
            if clean.get("type").and_then(|v| v.as_str()) == Some("object")
                && !clean.contains_key("properties")
            {
                clean.remove("type");
            }
            Value::Object(clean)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
