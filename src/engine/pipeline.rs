// Botgate Engine — Message Pipeline
// One inbound message becomes one AI turn: canonicalize to content parts,
// find-or-insert the chat, append the user message, run the adapter's tool
// loop over the last N history entries, write the token ledger, append the
// assistant reply, bump chat activity, and hand the reply back to the
// channel. Turns on the same (session, source) are strictly serialized.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    Attachment, ChatMessage, ChatSource, ContentPart, Message, MessageContent, MessageStatus,
    Role, TokenUsage, ToolCall,
};
use crate::engine::agent_loop::{LlmAdapter, ToolDispatch};
use crate::engine::ledger::{LedgerEntry, TokenLedger};
use crate::engine::media::{check_media, fetch_media_bytes, InboundMedia, MediaStore};
use crate::engine::store::{ChatMetadataPatch, Store, UpsertChat};
use chrono::Utc;
use log::{error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Resolved session context for one turn — who is talking to which profile
/// over which channel, and the prompt/tooling already bound to the session.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_id: String,
    pub profile_id: String,
    pub profile_name: String,
    pub source: ChatSource,
    pub connection_name: Option<String>,
    pub session_id: String,
    pub system_prompt: String,
    pub user_name: Option<String>,
}

/// Raw inbound message before canonicalization. `media` is wire media that
/// still needs downloading and uploading; `attachments` are files already
/// hosted on the object store (the external upload endpoint's output).
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub text: Option<String>,
    pub media: Option<InboundMedia>,
    pub attachments: Vec<Attachment>,
}

/// What goes back to the channel.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

pub struct MessagePipeline {
    store: Arc<Store>,
    ledger: TokenLedger,
    media_store: Option<Arc<dyn MediaStore>>,
    http: reqwest::Client,
    max_upload_bytes: u64,
    history_window: usize,
    /// Per-chat serialization, keyed on (session_id, source).
    chat_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<Store>,
        media_store: Option<Arc<dyn MediaStore>>,
        max_upload_bytes: u64,
        history_window: usize,
    ) -> Self {
        MessagePipeline {
            ledger: TokenLedger::new(store.clone()),
            store,
            media_store,
            http: reqwest::Client::new(),
            max_upload_bytes,
            history_window,
            chat_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run one turn end to end. Any failure up to and including the model
    /// call propagates to the channel (which sends an explanatory reply);
    /// ledger and assistant-append failures are logged and the reply is
    /// still delivered.
    pub async fn process_turn(
        &self,
        ctx: &TurnContext,
        inbound: InboundMessage,
        adapter: &LlmAdapter,
        tools: &dyn ToolDispatch,
    ) -> GatewayResult<TurnReply> {
        let lock = self.chat_lock(&ctx.session_id, ctx.source).await;
        let _guard = lock.lock().await;

        // ── 1+2. Canonicalize inbound content ──────────────────────────
        let (parts, attachments) = self.canonicalize(&inbound).await?;
        if parts.is_empty() {
            return Err(GatewayError::invalid("message has no text and no attachments"));
        }

        // ── 3. Find-or-insert the chat ─────────────────────────────────
        let chat = self.store.upsert_chat(UpsertChat {
            session_id: ctx.session_id.clone(),
            source: ctx.source,
            user_id: ctx.user_id.clone(),
            system_prompt_id: ctx.profile_id.clone(),
            system_prompt_name: ctx.profile_name.clone(),
            connection_name: ctx.connection_name.clone(),
            user_name: ctx.user_name.clone(),
        })?;

        // ── 4. Append the user message ─────────────────────────────────
        self.store.append_messages(
            &chat.id,
            &[ChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                role: Role::User,
                content: MessageContent::Parts(parts),
                tool_calls: None,
                tool_call_id: None,
                tool_name: None,
                status: MessageStatus::Delivered,
                attachments,
                timestamp: Utc::now(),
            }],
        )?;

        // ── 5. Build the adapter input from recent history ─────────────
        let stored = self.store.get_messages(&chat.id, self.history_window)?;
        let history = normalize_history(&stored);

        // ── 6. Model call with bounded tool loop ───────────────────────
        let outcome = adapter.run_turn(&ctx.system_prompt, history, tools).await?;

        // ── 7. Token ledger (skip when the vendor reported nothing) ────
        match outcome.usage {
            Some(usage) => self.write_ledger(ctx, &chat.id, usage, adapter.model_name()),
            None => warn!(
                "[pipeline] No usage reported for session {} — skipping ledger",
                ctx.session_id
            ),
        }

        // ── 8. Append the assistant message ────────────────────────────
        let appended = self.store.append_messages(
            &chat.id,
            &[ChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                role: Role::Assistant,
                content: MessageContent::Text(outcome.text.clone()),
                tool_calls: if outcome.tool_calls.is_empty() {
                    None
                } else {
                    Some(outcome.tool_calls.clone())
                },
                tool_call_id: None,
                tool_name: None,
                status: MessageStatus::Sent,
                attachments: vec![],
                timestamp: Utc::now(),
            }],
        );
        if let Err(e) = appended {
            error!("[pipeline] Failed to persist assistant message: {}", e);
        }

        // ── 9. Advance chat activity ───────────────────────────────────
        if let Err(e) = self.store.set_chat_metadata(
            &chat.id,
            ChatMetadataPatch { last_active: Some(Utc::now()), ..Default::default() },
        ) {
            error!("[pipeline] Failed to update chat activity: {}", e);
        }

        // ── 10. Reply to the caller ────────────────────────────────────
        Ok(TurnReply { text: outcome.text, tool_calls: outcome.tool_calls })
    }

    /// Load the chat history for a session, for read-side surfaces.
    pub fn history(
        &self,
        session_id: &str,
        source: ChatSource,
    ) -> GatewayResult<Vec<ChatMessage>> {
        match self.store.find_chat_by_session(session_id, source)? {
            Some(chat) => self.store.get_messages(&chat.id, usize::MAX / 2),
            None => Ok(vec![]),
        }
    }

    async fn chat_lock(&self, session_id: &str, source: ChatSource) -> Arc<Mutex<()>> {
        let key = format!("{}:{}", source.as_str(), session_id);
        let mut locks = self.chat_locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Turn raw inbound content into parts + attachment metadata.
    /// Media: download, enforce image-only MIME and the size cap, upload to
    /// the object store, and reference the hosted URL.
    async fn canonicalize(
        &self,
        inbound: &InboundMessage,
    ) -> GatewayResult<(Vec<ContentPart>, Vec<Attachment>)> {
        let mut parts = Vec::new();
        let mut attachments = Vec::new();

        if let Some(media) = &inbound.media {
            let store = self.media_store.as_ref().ok_or_else(|| {
                GatewayError::invalid("media uploads are not configured on this gateway")
            })?;

            check_media(media, 0, self.max_upload_bytes)?;
            let bytes = fetch_media_bytes(&self.http, media).await?;
            check_media(media, bytes.len(), self.max_upload_bytes)?;

            let filename = media
                .filename
                .clone()
                .unwrap_or_else(|| format!("inbound-{}", uuid::Uuid::new_v4()));
            let attachment = store.upload(bytes, &media.mime_type, &filename).await?;

            parts.push(ContentPart::Image {
                url: attachment.url.clone(),
                mime_type: attachment.mime_type.clone(),
            });
            attachments.push(attachment);
        }

        for attachment in &inbound.attachments {
            let part = if attachment.mime_type.starts_with("image/") {
                ContentPart::Image {
                    url: attachment.url.clone(),
                    mime_type: attachment.mime_type.clone(),
                }
            } else {
                ContentPart::File {
                    url: attachment.url.clone(),
                    mime_type: attachment.mime_type.clone(),
                    filename: Some(attachment.original_name.clone()),
                }
            };
            parts.push(part);
            attachments.push(attachment.clone());
        }

        if let Some(text) = &inbound.text {
            if !text.trim().is_empty() {
                parts.push(ContentPart::Text { text: text.clone() });
            }
        }

        Ok((parts, attachments))
    }

    fn write_ledger(&self, ctx: &TurnContext, chat_id: &str, usage: TokenUsage, model: &str) {
        let result = self.ledger.record_turn(LedgerEntry {
            user_id: ctx.user_id.clone(),
            profile_id: ctx.profile_id.clone(),
            profile_name: ctx.profile_name.clone(),
            chat_id: chat_id.to_string(),
            session_id: ctx.session_id.clone(),
            source: ctx.source,
            model_name: model.to_string(),
            usage,
        });
        // Accounting failures never block the reply; the immutable records
        // carry enough to reconcile later.
        if let Err(e) = result {
            error!("[pipeline] Ledger write failed for chat {}: {}", chat_id, e);
        }
    }
}

/// Map stored history to the adapter's message shape. Strings become single
/// text parts implicitly; part lists are filtered to well-formed entries;
/// a message that ends up with nothing usable becomes a placeholder so the
/// adapter never sees malformed parts.
pub fn normalize_history(stored: &[ChatMessage]) -> Vec<Message> {
    stored
        .iter()
        .map(|msg| {
            let content = match &msg.content {
                MessageContent::Text(s) => MessageContent::Text(s.clone()),
                MessageContent::Parts(parts) => {
                    let valid: Vec<ContentPart> = parts
                        .iter()
                        .filter(|p| match p {
                            ContentPart::Text { text } => !text.trim().is_empty(),
                            ContentPart::Image { url, mime_type } => {
                                !url.is_empty() && !mime_type.is_empty()
                            }
                            ContentPart::File { url, mime_type, .. } => {
                                !url.is_empty() && !mime_type.is_empty()
                            }
                        })
                        .cloned()
                        .collect();
                    if valid.is_empty() {
                        MessageContent::Parts(vec![ContentPart::Text {
                            text: "[System: message content was unreadable and has been omitted]"
                                .into(),
                        }])
                    } else {
                        MessageContent::Parts(valid)
                    }
                }
            };
            Message {
                role: msg.role,
                content,
                tool_calls: msg.tool_calls.clone(),
                tool_call_id: msg.tool_call_id.clone(),
                tool_name: msg.tool_name.clone(),
            }
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ToolDefinition;
    use crate::engine::mcp::ToolSet;
    use crate::engine::providers::{LlmClient, ModelTurn};
    use crate::engine::store::NewProfile;
    use async_trait::async_trait;

    struct StubLlm {
        text: String,
        usage: Option<TokenUsage>,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        fn model_name(&self) -> &str {
            "stub-model"
        }

        async fn generate(
            &self,
            _system_prompt: &str,
            _messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> GatewayResult<ModelTurn> {
            Ok(ModelTurn {
                text: Some(self.text.clone()),
                tool_calls: vec![],
                usage: self.usage,
            })
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolDispatch for NoTools {
        fn tool_set(&self) -> ToolSet {
            vec![]
        }

        async fn invoke(
            &self,
            name: &str,
            _arguments: serde_json::Value,
        ) -> GatewayResult<String> {
            Err(GatewayError::tool(name, "no tools in this test"))
        }
    }

    struct FakeMediaStore;

    #[async_trait]
    impl MediaStore for FakeMediaStore {
        async fn upload(
            &self,
            bytes: Vec<u8>,
            mime_type: &str,
            filename: &str,
        ) -> GatewayResult<Attachment> {
            Ok(Attachment {
                url: format!("https://cdn.example/{}", filename),
                original_name: filename.to_string(),
                mime_type: mime_type.to_string(),
                size: bytes.len() as u64,
                uploaded_at: Utc::now(),
            })
        }
    }

    fn setup(media: bool) -> (MessagePipeline, Arc<Store>, TurnContext) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let user = store.register_user("a@b.c", "hash", Some("A")).unwrap();
        let profile = store
            .create_profile(NewProfile::new(&user.id, "Support", "bot"))
            .unwrap();

        let media_store: Option<Arc<dyn MediaStore>> =
            if media { Some(Arc::new(FakeMediaStore)) } else { None };
        let pipeline = MessagePipeline::new(store.clone(), media_store, 1024 * 1024, 20);

        let ctx = TurnContext {
            user_id: user.id,
            profile_id: profile.id,
            profile_name: "Support".into(),
            source: ChatSource::Webapp,
            connection_name: None,
            session_id: "sess-1".into(),
            system_prompt: "be helpful".into(),
            user_name: Some("A".into()),
        };
        (pipeline, store, ctx)
    }

    fn adapter(text: &str, usage: Option<TokenUsage>) -> LlmAdapter {
        LlmAdapter::new(Arc::new(StubLlm { text: text.into(), usage }), 10)
    }

    #[tokio::test]
    async fn full_turn_persists_messages_ledger_and_reply() {
        let (pipeline, store, ctx) = setup(false);
        let adapter = adapter("hello", Some(TokenUsage { prompt_tokens: 5, completion_tokens: 3 }));

        let reply = pipeline
            .process_turn(
                &ctx,
                InboundMessage { text: Some("hi".into()), media: None, attachments: vec![] },
                &adapter,
                &NoTools,
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "hello");

        let chat = store
            .find_chat_by_session("sess-1", ChatSource::Webapp)
            .unwrap()
            .unwrap();
        let messages = store.get_messages(&chat.id, 10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].status, MessageStatus::Delivered);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].status, MessageStatus::Sent);

        let records = store.list_usage_for_user(&ctx.user_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_tokens, 8);
        let user = store.find_user_by_id(&ctx.user_id).unwrap().unwrap();
        assert_eq!(user.lifetime.total_tokens, 8);
    }

    #[tokio::test]
    async fn empty_inbound_is_rejected_before_any_write() {
        let (pipeline, store, ctx) = setup(false);
        let err = pipeline
            .process_turn(
                &ctx,
                InboundMessage { text: Some("   ".into()), media: None, attachments: vec![] },
                &adapter("x", None),
                &NoTools,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
        assert!(store
            .find_chat_by_session("sess-1", ChatSource::Webapp)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn missing_usage_skips_ledger_but_replies() {
        let (pipeline, store, ctx) = setup(false);
        let reply = pipeline
            .process_turn(
                &ctx,
                InboundMessage { text: Some("hi".into()), media: None, attachments: vec![] },
                &adapter("ok", None),
                &NoTools,
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "ok");
        assert!(store.list_usage_for_user(&ctx.user_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_with_empty_body_is_processed() {
        let (pipeline, store, ctx) = setup(true);
        let inbound = InboundMessage {
            text: None,
            media: Some(InboundMedia {
                mime_type: "image/png".into(),
                filename: Some("photo.png".into()),
                payload: crate::engine::media::MediaPayload::Base64("aGVsbG8=".into()),
            }),
            attachments: vec![],
        };
        pipeline
            .process_turn(&ctx, inbound, &adapter("nice photo", None), &NoTools)
            .await
            .unwrap();

        let chat = store
            .find_chat_by_session("sess-1", ChatSource::Webapp)
            .unwrap()
            .unwrap();
        let messages = store.get_messages(&chat.id, 10).unwrap();
        assert_eq!(messages[0].attachments.len(), 1);
        match &messages[0].content {
            MessageContent::Parts(parts) => {
                assert!(matches!(parts[0], ContentPart::Image { .. }));
            }
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_image_media_is_rejected() {
        let (pipeline, _store, ctx) = setup(true);
        let inbound = InboundMessage {
            text: None,
            media: Some(InboundMedia {
                mime_type: "audio/ogg".into(),
                filename: None,
                payload: crate::engine::media::MediaPayload::Base64("aGVsbG8=".into()),
            }),
            attachments: vec![],
        };
        let err = pipeline
            .process_turn(&ctx, inbound, &adapter("x", None), &NoTools)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn repeated_turns_share_one_chat() {
        let (pipeline, store, ctx) = setup(false);
        for i in 0..3 {
            pipeline
                .process_turn(
                    &ctx,
                    InboundMessage { text: Some(format!("msg {}", i)), media: None, attachments: vec![] },
                    &adapter("r", None),
                    &NoTools,
                )
                .await
                .unwrap();
        }
        assert_eq!(store.list_all_chats().unwrap().len(), 1);
        let chat = store
            .find_chat_by_session("sess-1", ChatSource::Webapp)
            .unwrap()
            .unwrap();
        assert_eq!(store.get_messages(&chat.id, 100).unwrap().len(), 6);
    }

    #[tokio::test]
    async fn chat_lock_is_stable_per_session() {
        let (pipeline, _store, _ctx) = setup(false);
        let a = pipeline.chat_lock("s1", ChatSource::Webapp).await;
        let b = pipeline.chat_lock("s1", ChatSource::Webapp).await;
        let c = pipeline.chat_lock("s1", ChatSource::Whatsapp).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn normalization_filters_bad_parts_and_substitutes_placeholder() {
        let msg = |content| ChatMessage {
            id: "m".into(),
            role: Role::User,
            content,
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            status: MessageStatus::Sent,
            attachments: vec![],
            timestamp: Utc::now(),
        };

        let stored = vec![
            msg(MessageContent::Text("plain".into())),
            msg(MessageContent::Parts(vec![
                ContentPart::Text { text: "keep".into() },
                ContentPart::Image { url: "".into(), mime_type: "image/png".into() },
            ])),
            msg(MessageContent::Parts(vec![ContentPart::Text { text: "  ".into() }])),
        ];
        let normalized = normalize_history(&stored);

        assert_eq!(normalized[0].content.as_text(), "plain");
        match &normalized[1].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 1),
            other => panic!("expected parts, got {:?}", other),
        }
        assert!(normalized[2].content.as_text().contains("[System:"));
    }
}
