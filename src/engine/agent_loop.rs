// Botgate Engine — LLM Adapter Tool Loop
// One turn: send the conversation to the model, execute any requested tool
// calls against the session's tool pool, feed results back, repeat until the
// model produces a final text response or the step cap is reached.

use crate::atoms::error::GatewayResult;
use crate::atoms::types::{Message, MessageContent, Role, TokenUsage, ToolCall};
use crate::engine::mcp::{ToolClientPool, ToolSet};
use crate::engine::providers::LlmClient;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

/// Fallback reply when the model never produced text.
pub const NO_TEXT_SENTINEL: &str = "No text response from AI.";

/// Tool dispatch seam between the adapter loop and the session's pool.
/// The pool implements it directly; tests substitute scripted fakes.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    fn tool_set(&self) -> ToolSet;
    async fn invoke(&self, name: &str, arguments: serde_json::Value) -> GatewayResult<String>;
}

#[async_trait]
impl ToolDispatch for ToolClientPool {
    fn tool_set(&self) -> ToolSet {
        ToolClientPool::tool_set(self)
    }

    async fn invoke(&self, name: &str, arguments: serde_json::Value) -> GatewayResult<String> {
        ToolClientPool::invoke(self, name, arguments).await
    }
}

/// Result of one complete adapter turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final model text (or the sentinel).
    pub text: String,
    /// Every tool call executed during the turn, in order.
    pub tool_calls: Vec<ToolCall>,
    /// Accumulated usage: prompt tokens of the final step (the full context
    /// is re-sent each step) plus completion tokens summed across steps.
    /// None when the vendor never reported usage.
    pub usage: Option<TokenUsage>,
}

/// Bounded tool-loop wrapper around an LlmClient. One instance per active
/// session; the underlying client is shared.
pub struct LlmAdapter {
    client: Arc<dyn LlmClient>,
    max_steps: u32,
}

impl LlmAdapter {
    pub fn new(client: Arc<dyn LlmClient>, max_steps: u32) -> Self {
        LlmAdapter { client, max_steps }
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    /// Run one turn. `history` already ends with the inbound user message.
    pub async fn run_turn(
        &self,
        system_prompt: &str,
        history: Vec<Message>,
        tools: &dyn ToolDispatch,
    ) -> GatewayResult<TurnOutcome> {
        let tool_set = tools.tool_set();
        let mut messages = history;
        let mut executed: Vec<ToolCall> = Vec::new();
        let mut last_text: Option<String> = None;

        let mut prompt_tokens: Option<u64> = None;
        let mut completion_tokens: u64 = 0;
        let mut saw_usage = false;

        for step in 1..=self.max_steps {
            let turn = self
                .client
                .generate(system_prompt, &messages, &tool_set)
                .await?;

            if let Some(usage) = turn.usage {
                saw_usage = true;
                // Prompt tokens reflect the whole context per step — keep the
                // last value. Completion tokens are incremental — sum them.
                prompt_tokens = Some(usage.prompt_tokens);
                completion_tokens += usage.completion_tokens;
            }
            if turn.text.is_some() {
                last_text = turn.text.clone();
            }

            if turn.tool_calls.is_empty() {
                return Ok(TurnOutcome {
                    text: turn.text.unwrap_or_else(|| NO_TEXT_SENTINEL.to_string()),
                    tool_calls: executed,
                    usage: build_usage(saw_usage, prompt_tokens, completion_tokens),
                });
            }

            info!(
                "[llm] Step {}/{}: {} tool call(s)",
                step,
                self.max_steps,
                turn.tool_calls.len()
            );

            // Thread the assistant's tool request into the history, then one
            // tool message per call with the result (or the error text — the
            // model sees failures and can route around them).
            messages.push(Message {
                role: Role::Assistant,
                content: MessageContent::Text(turn.text.unwrap_or_default()),
                tool_calls: Some(turn.tool_calls.clone()),
                tool_call_id: None,
                tool_name: None,
            });

            for tc in turn.tool_calls {
                let output = match tools.invoke(&tc.name, tc.arguments.clone()).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("[llm] Tool '{}' failed: {}", tc.name, e);
                        format!("Error: {}", e)
                    }
                };
                messages.push(Message {
                    role: Role::Tool,
                    content: MessageContent::Text(output),
                    tool_calls: None,
                    tool_call_id: Some(tc.id.clone()),
                    tool_name: Some(tc.name.clone()),
                });
                executed.push(tc);
            }
        }

        warn!("[llm] Tool-loop cap ({}) reached, returning last text", self.max_steps);
        Ok(TurnOutcome {
            text: last_text.unwrap_or_else(|| NO_TEXT_SENTINEL.to_string()),
            tool_calls: executed,
            usage: build_usage(saw_usage, prompt_tokens, completion_tokens),
        })
    }
}

fn build_usage(saw_usage: bool, prompt: Option<u64>, completion: u64) -> Option<TokenUsage> {
    if !saw_usage {
        return None;
    }
    Some(TokenUsage {
        prompt_tokens: prompt.unwrap_or(0),
        completion_tokens: completion,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
