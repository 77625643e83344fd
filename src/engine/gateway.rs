// Botgate Engine — Gateway Facade
// The narrow surface the external HTTP layer calls. Authorization lives
// here: any operation naming an existing resource requires the invoking
// user to own it, except admins, who may read any chat. Components never
// check ownership themselves.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{Attachment, Chat, ChatMessage, User, WhatsAppConnection};
use crate::engine::pipeline::TurnReply;
use crate::engine::store::Store;
use crate::engine::webchat::{PublicChatSessionManager, StartedPublicChat};
use crate::engine::whatsapp::WhatsAppSessionManager;
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// Response of startWhatsAppSession.
#[derive(Debug, Clone)]
pub struct StartedWhatsAppSession {
    pub connection_name: String,
    pub status: String,
}

pub struct GatewayFacade {
    store: Arc<Store>,
    whatsapp: WhatsAppSessionManager,
    public_chat: PublicChatSessionManager,
}

impl GatewayFacade {
    pub fn new(
        store: Arc<Store>,
        whatsapp: WhatsAppSessionManager,
        public_chat: PublicChatSessionManager,
    ) -> Self {
        GatewayFacade { store, whatsapp, public_chat }
    }

    // ── WhatsApp sessions ──────────────────────────────────────────────

    pub async fn start_whatsapp_session(
        &self,
        user: &User,
        connection_name: &str,
        profile_name: &str,
    ) -> GatewayResult<StartedWhatsAppSession> {
        self.whatsapp.start(connection_name, profile_name, &user.id).await?;
        let status = self.whatsapp.status(connection_name.trim()).await?;
        Ok(StartedWhatsAppSession {
            connection_name: connection_name.trim().to_string(),
            status,
        })
    }

    pub async fn get_qr(&self, user: &User, connection_name: &str) -> GatewayResult<Option<String>> {
        self.ensure_connection_owner(user, connection_name)?;
        self.whatsapp.qr(connection_name).await
    }

    pub async fn get_status(&self, user: &User, connection_name: &str) -> GatewayResult<String> {
        self.ensure_connection_owner(user, connection_name)?;
        self.whatsapp.status(connection_name).await
    }

    pub async fn send_whatsapp(
        &self,
        user: &User,
        connection_name: &str,
        to: &str,
        text: &str,
    ) -> GatewayResult<String> {
        self.ensure_connection_owner(user, connection_name)?;
        self.whatsapp.send_message(connection_name, to, text).await
    }

    pub async fn close_whatsapp(&self, user: &User, connection_name: &str) -> GatewayResult<()> {
        self.ensure_connection_owner(user, connection_name)?;
        self.whatsapp.close(connection_name).await
    }

    pub fn list_connections(&self, user: &User) -> GatewayResult<Vec<WhatsAppConnection>> {
        self.whatsapp.list_connections(&user.id)
    }

    // ── Public web chat (unauthenticated surface) ──────────────────────

    pub async fn start_public_chat(&self, profile_id: &str) -> GatewayResult<StartedPublicChat> {
        self.public_chat.start(profile_id).await
    }

    pub async fn send_public_message(
        &self,
        session_id: &str,
        text: Option<String>,
        attachments: Vec<Attachment>,
    ) -> GatewayResult<TurnReply> {
        self.public_chat.message(session_id, text, attachments).await
    }

    pub async fn end_public_chat(&self, session_id: &str) -> GatewayResult<()> {
        self.public_chat.end(session_id).await
    }

    pub fn get_public_history(&self, session_id: &str) -> GatewayResult<Vec<ChatMessage>> {
        self.public_chat.history(session_id)
    }

    // ── Chats (owner or admin) ─────────────────────────────────────────

    pub fn list_chats(&self, user: &User) -> GatewayResult<Vec<Chat>> {
        if user.is_admin() {
            self.store.list_all_chats()
        } else {
            self.store.list_chats_for_user(&user.id)
        }
    }

    pub fn get_chat(&self, user: &User, chat_id: &str) -> GatewayResult<Chat> {
        let chat = self
            .store
            .find_chat_by_id(chat_id)?
            .ok_or_else(|| GatewayError::not_found(format!("chat {}", chat_id)))?;
        if !user.is_admin() && chat.user_id != user.id {
            return Err(GatewayError::PermissionDenied(format!(
                "chat {} belongs to another user",
                chat_id
            )));
        }
        Ok(chat)
    }

    pub fn get_chat_messages(
        &self,
        user: &User,
        chat_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<ChatMessage>> {
        let chat = self.get_chat(user, chat_id)?;
        self.store.get_messages(&chat.id, limit)
    }

    // ── Profile lifecycle hooks ────────────────────────────────────────

    /// Delete a profile and cascade: close every session bound to it.
    pub async fn delete_profile(&self, user: &User, profile_id: &str) -> GatewayResult<()> {
        let profile = self
            .store
            .find_profile_by_id(profile_id)?
            .ok_or_else(|| GatewayError::not_found(format!("profile {}", profile_id)))?;
        if profile.user_id != user.id {
            return Err(GatewayError::PermissionDenied(format!(
                "profile {} belongs to another user",
                profile_id
            )));
        }

        let closed = self.public_chat.end_sessions_for_profile(profile_id).await;
        let connections = self.store.list_whatsapp_connections(Default::default())?;
        for conn in connections.iter().filter(|c| c.system_prompt_id == profile_id) {
            let _ = self.whatsapp.close(&conn.connection_name).await;
        }

        self.store.delete_profile(profile_id)?;
        info!(
            "[gateway] Deleted profile '{}' ({} public session(s) closed)",
            profile.name, closed
        );
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    pub async fn recover_whatsapp_sessions(&self) {
        self.whatsapp.recover_persisted_sessions().await;
    }

    pub fn spawn_public_idle_sweeper(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        self.public_chat.spawn_idle_sweeper(timeout)
    }

    /// Close all sessions in parallel within the grace period.
    pub async fn shutdown(&self, grace: Duration) {
        info!("[gateway] Shutting down sessions");
        tokio::join!(self.whatsapp.close_all(grace), self.public_chat.close_all());
    }

    fn ensure_connection_owner(&self, user: &User, connection_name: &str) -> GatewayResult<()> {
        let conn = self
            .store
            .find_whatsapp_connection(connection_name)?
            .ok_or_else(|| {
                GatewayError::not_found(format!("whatsapp connection {}", connection_name))
            })?;
        if conn.user_id != user.id {
            return Err(GatewayError::PermissionDenied(format!(
                "connection {} belongs to another user",
                connection_name
            )));
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Message, Privilege, TokenUsage, ToolDefinition};
    use crate::engine::pipeline::MessagePipeline;
    use crate::engine::providers::{LlmClient, ModelTurn};
    use crate::engine::store::NewProfile;
    use crate::engine::whatsapp::{ClientEvent, SessionPolicy, WhatsAppClient, WhatsAppClientFactory};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

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

    struct NullClient;

    #[async_trait]
    impl WhatsAppClient for NullClient {
        async fn initialize(&self) -> GatewayResult<()> {
            Ok(())
        }

        async fn send_text(&self, _to: &str, _text: &str) -> GatewayResult<String> {
            Ok("WIRE-ID".into())
        }

        async fn logout(&self) -> GatewayResult<()> {
            Ok(())
        }

        async fn destroy(&self) {}
    }

    struct NullFactory;

    #[async_trait]
    impl WhatsAppClientFactory for NullFactory {
        async fn create(
            &self,
            _connection_name: &str,
        ) -> GatewayResult<(Arc<dyn WhatsAppClient>, mpsc::Receiver<ClientEvent>)> {
            let (_tx, rx) = mpsc::channel(1);
            Ok((Arc::new(NullClient), rx))
        }
    }

    fn setup() -> (GatewayFacade, Arc<Store>, User, User, User) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let owner = store.register_user("owner@b.c", "hash", None).unwrap();
        let other = store.register_user("other@b.c", "hash", None).unwrap();
        let admin = store.register_user("admin@b.c", "hash", None).unwrap();
        store.set_user_privilege(&admin.id, Privilege::Admin).unwrap();
        let admin = store.find_user_by_id(&admin.id).unwrap().unwrap();

        store
            .create_profile(NewProfile::new(&owner.id, "Support", "bot"))
            .unwrap();

        let pipeline = Arc::new(MessagePipeline::new(store.clone(), None, 1024, 20));
        let llm: Arc<dyn LlmClient> = Arc::new(StubLlm);
        let policy = SessionPolicy {
            reconnect_base_delay: Duration::from_millis(1),
            max_reconnect_attempts: 5,
            tool_loop_max_steps: 10,
        };
        let whatsapp = WhatsAppSessionManager::new(
            store.clone(),
            pipeline.clone(),
            llm.clone(),
            Arc::new(NullFactory),
            policy,
        );
        let public_chat =
            PublicChatSessionManager::new(store.clone(), pipeline, llm, 10);
        (
            GatewayFacade::new(store.clone(), whatsapp, public_chat),
            store,
            owner,
            other,
            admin,
        )
    }

    #[tokio::test]
    async fn whatsapp_start_reports_status_and_enforces_ownership() {
        let (facade, _store, owner, other, _admin) = setup();

        let started = facade
            .start_whatsapp_session(&owner, "shop-bot", "Support")
            .await
            .unwrap();
        assert_eq!(started.connection_name, "shop-bot");
        assert_eq!(started.status, "initializing");

        // Duplicate start → Conflict (409).
        let err = facade
            .start_whatsapp_session(&owner, "shop-bot", "Support")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));

        // Non-owner may not even read the status.
        let err = facade.get_status(&other, "shop-bot").await.unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
        let err = facade.close_whatsapp(&other, "shop-bot").await.unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));

        facade.close_whatsapp(&owner, "shop-bot").await.unwrap();
    }

    #[tokio::test]
    async fn qr_of_unknown_connection_is_not_found() {
        let (facade, _store, owner, _other, _admin) = setup();
        let err = facade.get_qr(&owner, "never-started").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn chat_access_owner_admin_other() {
        let (facade, store, owner, other, admin) = setup();

        // Materialize a chat through the public surface (S6 shape).
        let profile = store.find_profile(&owner.id, "Support").unwrap().unwrap();
        let started = facade.start_public_chat(&profile.id).await.unwrap();
        facade
            .send_public_message(&started.session_id, Some("hi".into()), vec![])
            .await
            .unwrap();
        let chat_id = facade.list_chats(&owner).unwrap()[0].id.clone();

        // Owner and admin read it; the other user is denied.
        assert!(facade.get_chat(&owner, &chat_id).is_ok());
        assert!(facade.get_chat(&admin, &chat_id).is_ok());
        let err = facade.get_chat(&other, &chat_id).unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));

        // Listings: the other user never sees it, the admin sees all.
        assert!(facade.list_chats(&other).unwrap().is_empty());
        assert_eq!(facade.list_chats(&admin).unwrap().len(), 1);

        let err = facade.get_chat(&owner, "missing-chat").unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn public_chat_round_trip_through_the_facade() {
        let (facade, store, owner, _other, _admin) = setup();
        let profile = store.find_profile(&owner.id, "Support").unwrap().unwrap();

        let started = facade.start_public_chat(&profile.id).await.unwrap();
        let reply = facade
            .send_public_message(&started.session_id, Some("hi".into()), vec![])
            .await
            .unwrap();
        assert_eq!(reply.text, "hello");

        let history = facade.get_public_history(&started.session_id).unwrap();
        assert_eq!(history.len(), 2);

        facade.end_public_chat(&started.session_id).await.unwrap();
        facade.end_public_chat(&started.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn profile_deletion_cascades_to_sessions() {
        let (facade, store, owner, other, _admin) = setup();
        let profile = store.find_profile(&owner.id, "Support").unwrap().unwrap();
        facade.start_public_chat(&profile.id).await.unwrap();

        let err = facade.delete_profile(&other, &profile.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));

        facade.delete_profile(&owner, &profile.id).await.unwrap();
        assert!(store.find_profile_by_id(&profile.id).unwrap().is_none());
        // Starting a new chat against the deleted profile now fails.
        let err = facade.start_public_chat(&profile.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
