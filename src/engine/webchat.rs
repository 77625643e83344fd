// Botgate Engine — Public Web-Chat Sessions
//
// Web-chat sessions are lighter than WhatsApp connections: an in-memory
// binding of session id -> bot profile with its own tool pool and adapter,
// no persistence beyond the chat itself. start() mints a UUID session,
// message() funnels into the pipeline, end() tears the pool down. When an
// idle timeout is configured a sweeper task evicts stale sessions through
// the same close path.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{Attachment, ChatMessage, ChatSource};
use crate::engine::agent_loop::LlmAdapter;
use crate::engine::mcp::ToolClientPool;
use crate::engine::pipeline::{InboundMessage, MessagePipeline, TurnContext, TurnReply};
use crate::engine::prompt::render_system_prompt;
use crate::engine::providers::LlmClient;
use crate::engine::store::Store;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One live public chat session.
struct PublicSession {
    session_id: String,
    profile_id: String,
    profile_name: String,
    /// Billing owner — the profile owner for public chats.
    user_id: String,
    system_prompt: String,
    pool: Arc<ToolClientPool>,
    adapter: Arc<LlmAdapter>,
    last_active: PlMutex<DateTime<Utc>>,
}

/// Returned by start() so the caller can label the widget.
#[derive(Debug, Clone)]
pub struct StartedPublicChat {
    pub session_id: String,
    pub profile_name: String,
}

pub struct PublicChatSessionManager {
    store: Arc<Store>,
    pipeline: Arc<MessagePipeline>,
    llm: Arc<dyn LlmClient>,
    tool_loop_max_steps: u32,
    sessions: Arc<Mutex<HashMap<String, Arc<PublicSession>>>>,
}

impl PublicChatSessionManager {
    pub fn new(
        store: Arc<Store>,
        pipeline: Arc<MessagePipeline>,
        llm: Arc<dyn LlmClient>,
        tool_loop_max_steps: u32,
    ) -> Self {
        PublicChatSessionManager {
            store,
            pipeline,
            llm,
            tool_loop_max_steps,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve the profile, open its tool pool, and mint a session id.
    pub async fn start(&self, profile_id: &str) -> GatewayResult<StartedPublicChat> {
        let profile = self
            .store
            .find_profile_by_id(profile_id)?
            .ok_or_else(|| GatewayError::not_found(format!("bot profile {}", profile_id)))?;
        if !profile.is_enabled {
            return Err(GatewayError::conflict(format!(
                "bot profile {} is disabled",
                profile.name
            )));
        }

        let pool = Arc::new(ToolClientPool::open(&profile).await);
        let session = Arc::new(PublicSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            profile_id: profile.id.clone(),
            profile_name: profile.name.clone(),
            user_id: profile.user_id.clone(),
            system_prompt: render_system_prompt(&profile),
            pool,
            adapter: Arc::new(LlmAdapter::new(
                Arc::clone(&self.llm),
                self.tool_loop_max_steps,
            )),
            last_active: PlMutex::new(Utc::now()),
        });

        let started = StartedPublicChat {
            session_id: session.session_id.clone(),
            profile_name: session.profile_name.clone(),
        };
        self.sessions
            .lock()
            .await
            .insert(session.session_id.clone(), session);

        info!(
            "[webchat] Session {} started for profile '{}'",
            started.session_id, started.profile_name
        );
        Ok(started)
    }

    /// Run one turn for a session. `attachments` are files the caller
    /// already pushed through the upload endpoint.
    pub async fn message(
        &self,
        session_id: &str,
        text: Option<String>,
        attachments: Vec<Attachment>,
    ) -> GatewayResult<TurnReply> {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| GatewayError::not_found(format!("chat session {}", session_id)))?
        };
        *session.last_active.lock() = Utc::now();

        let ctx = TurnContext {
            user_id: session.user_id.clone(),
            profile_id: session.profile_id.clone(),
            profile_name: session.profile_name.clone(),
            source: ChatSource::Webapp,
            connection_name: None,
            session_id: session.session_id.clone(),
            system_prompt: session.system_prompt.clone(),
            user_name: None,
        };
        self.pipeline
            .process_turn(
                &ctx,
                InboundMessage { text, media: None, attachments },
                &session.adapter,
                &*session.pool,
            )
            .await
    }

    /// Persisted history for a session (empty when no turn ever completed).
    pub fn history(&self, session_id: &str) -> GatewayResult<Vec<ChatMessage>> {
        self.pipeline.history(session_id, ChatSource::Webapp)
    }

    /// Close a session and its tool pool. Idempotent — ending an unknown
    /// session succeeds.
    pub async fn end(&self, session_id: &str) -> GatewayResult<()> {
        let session = self.sessions.lock().await.remove(session_id);
        if let Some(session) = session {
            session.pool.close().await;
            info!("[webchat] Session {} ended", session_id);
        }
        Ok(())
    }

    /// Close sessions bound to a profile (profile deletion cascades here).
    pub async fn end_sessions_for_profile(&self, profile_id: &str) -> usize {
        let drained: Vec<Arc<PublicSession>> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.profile_id == profile_id)
                .map(|s| s.session_id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &drained {
            session.pool.close().await;
        }
        drained.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Spawn the idle sweeper. Sessions idle longer than `timeout` are
    /// closed through the same path as end().
    pub fn spawn_idle_sweeper(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(timeout.min(Duration::from_secs(60)));
            loop {
                tick.tick().await;
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::hours(24));
                let stale: Vec<Arc<PublicSession>> = {
                    let mut map = sessions.lock().await;
                    let ids: Vec<String> = map
                        .values()
                        .filter(|s| *s.last_active.lock() < cutoff)
                        .map(|s| s.session_id.clone())
                        .collect();
                    ids.iter().filter_map(|id| map.remove(id)).collect()
                };
                for session in &stale {
                    warn!("[webchat] Evicting idle session {}", session.session_id);
                    session.pool.close().await;
                }
            }
        })
    }

    /// Close everything on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<PublicSession>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.pool.close().await;
        }
        if !drained.is_empty() {
            info!("[webchat] Closed {} session(s) on shutdown", drained.len());
        }
    }
}

impl Drop for PublicChatSessionManager {
    fn drop(&mut self) {
        // Pools hold kill-on-drop children; nothing async left to do here,
        // but make leaks visible in debug logs.
        if let Ok(sessions) = self.sessions.try_lock() {
            if !sessions.is_empty() {
                error!("[webchat] Dropped with {} session(s) still open", sessions.len());
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Message, TokenUsage, ToolDefinition};
    use crate::engine::providers::ModelTurn;
    use crate::engine::store::NewProfile;
    use async_trait::async_trait;

    struct StubLlm;

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
                text: Some("hello".into()),
                tool_calls: vec![],
                usage: Some(TokenUsage { prompt_tokens: 5, completion_tokens: 3 }),
            })
        }
    }

    fn setup() -> (PublicChatSessionManager, Arc<Store>, String, String) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let user = store.register_user("a@b.c", "hash", None).unwrap();
        let profile = store
            .create_profile(NewProfile::new(&user.id, "Support", "bot"))
            .unwrap();
        let pipeline = Arc::new(MessagePipeline::new(store.clone(), None, 1024, 20));
        let manager =
            PublicChatSessionManager::new(store.clone(), pipeline, Arc::new(StubLlm), 10);
        (manager, store, user.id, profile.id)
    }

    #[tokio::test]
    async fn start_message_end_round_trip() {
        let (manager, store, user_id, profile_id) = setup();

        let started = manager.start(&profile_id).await.unwrap();
        assert_eq!(started.profile_name, "Support");
        assert_eq!(manager.session_count().await, 1);

        let reply = manager
            .message(&started.session_id, Some("hi".into()), vec![])
            .await
            .unwrap();
        assert_eq!(reply.text, "hello");

        // S3: the turn is metered against the profile owner.
        let user = store.find_user_by_id(&user_id).unwrap().unwrap();
        assert_eq!(user.lifetime.total_tokens, 8);
        let records = store.list_usage_for_user(&user_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_tokens, 8);
        assert_eq!(records[0].session_id, started.session_id);

        let history = manager.history(&started.session_id).unwrap();
        assert_eq!(history.len(), 2);

        manager.end(&started.session_id).await.unwrap();
        assert_eq!(manager.session_count().await, 0);
        let err = manager
            .message(&started.session_id, Some("again".into()), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_profile_cannot_start() {
        let (manager, _store, _user_id, _profile_id) = setup();
        let err = manager.start("ghost").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn disabled_profile_cannot_start() {
        let (manager, store, user_id, _profile_id) = setup();
        let mut disabled = NewProfile::new(&user_id, "Dark", "off");
        disabled.is_enabled = false;
        let profile = store.create_profile(disabled).unwrap();
        let err = manager.start(&profile.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let (manager, _store, _user_id, profile_id) = setup();
        let started = manager.start(&profile_id).await.unwrap();
        manager.end(&started.session_id).await.unwrap();
        manager.end(&started.session_id).await.unwrap();
        manager.end("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn sessions_are_isolated_per_start() {
        let (manager, _store, _user_id, profile_id) = setup();
        let a = manager.start(&profile_id).await.unwrap();
        let b = manager.start(&profile_id).await.unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(manager.session_count().await, 2);
    }

    #[tokio::test]
    async fn profile_deletion_cascade_closes_sessions() {
        let (manager, _store, _user_id, profile_id) = setup();
        manager.start(&profile_id).await.unwrap();
        manager.start(&profile_id).await.unwrap();
        let closed = manager.end_sessions_for_profile(&profile_id).await;
        assert_eq!(closed, 2);
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn history_of_untouched_session_is_empty() {
        let (manager, _store, _user_id, profile_id) = setup();
        let started = manager.start(&profile_id).await.unwrap();
        assert!(manager.history(&started.session_id).unwrap().is_empty());
    }
}
