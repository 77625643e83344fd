// Botgate Engine — WhatsApp Session Manager
//
// One session per connection name: a driver task consuming client events
// (qr / authenticated / ready / disconnected / auth_failure), a tool pool
// and LLM adapter owned by the session, and linear-backoff reconnection
// with the intent persisted so a restart can pick every session back up.
//
// Status machine (initial = new):
//   start            -> initializing   (intent upserted, autoReconnect on)
//   qr(code)         -> qr_ready       (persist qr_pending_scan, auto off)
//   authenticated    -> authenticated  (persist, auto on)
//   ready            -> connected      (persist + lastConnectedAt)
//   auth_failure     -> auth_failed    (persist, auto off, resources freed)
//   disconnected     -> reconnecting   (retry with 5s × attempt backoff)
//   attempts > max   -> disconnected_permanent (persist, auto off)
//   explicit close   -> closing -> closed (persist closed_manually)

mod client;

pub use client::{
    BridgeClientFactory, ClientEvent, InboundWhatsAppMessage, WhatsAppClient,
    WhatsAppClientFactory,
};

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    validate_connection_name, ChatSource, ConnectionStatus, WhatsAppConnection,
};
use crate::engine::agent_loop::LlmAdapter;
use crate::engine::config::GatewayConfig;
use crate::engine::mcp::ToolClientPool;
use crate::engine::pipeline::{InboundMessage, MessagePipeline, TurnContext};
use crate::engine::prompt::render_system_prompt;
use crate::engine::providers::LlmClient;
use crate::engine::store::{ConnectionFilter, ConnectionPatch, Store};
use chrono::Utc;
use client::is_auth_error;
use futures::future::join_all;
use log::{error, info, warn};
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Channel framing appended to every WhatsApp session's system prompt.
const WHATSAPP_CONTEXT: &str = "You are chatting over WhatsApp. Keep replies concise and \
mobile-friendly; use WhatsApp formatting (*bold*, _italic_) sparingly and avoid very long \
messages.";

/// Reply sent when a turn fails before the model could answer.
const TURN_FAILURE_REPLY: &str = "Sorry, I could not process that message.";

// ── Policy ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub tool_loop_max_steps: u32,
}

impl SessionPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        SessionPolicy {
            reconnect_base_delay: config.reconnect_base_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
            tool_loop_max_steps: config.tool_loop_max_steps,
        }
    }
}

// ── Runtime status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    New,
    Initializing,
    QrReady,
    Authenticated,
    Connected,
    AuthFailed,
    Reconnecting,
    DisconnectedPermanent,
    Closing,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::New => "new",
            SessionStatus::Initializing => "initializing",
            SessionStatus::QrReady => "qr_ready",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Connected => "connected",
            SessionStatus::AuthFailed => "auth_failed",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::DisconnectedPermanent => "disconnected_permanent",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }
}

// ── Session record ─────────────────────────────────────────────────────────

struct Session {
    connection_name: String,
    profile_id: String,
    profile_name: String,
    user_id: String,
    system_prompt: String,
    client: Arc<dyn WhatsAppClient>,
    pool: Arc<ToolClientPool>,
    adapter: Arc<LlmAdapter>,
    status: PlMutex<SessionStatus>,
    qr: PlMutex<Option<String>>,
    reconnect_attempts: AtomicU32,
    is_reconnecting: AtomicBool,
    /// Client + pool torn down exactly once, whichever path gets there first.
    released: AtomicBool,
    driver: PlMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    async fn release_resources(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.client.destroy().await;
        self.pool.close().await;
    }
}

// ── Manager ────────────────────────────────────────────────────────────────

pub struct WhatsAppSessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    pipeline: Arc<MessagePipeline>,
    llm: Arc<dyn LlmClient>,
    factory: Arc<dyn WhatsAppClientFactory>,
    policy: SessionPolicy,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl WhatsAppSessionManager {
    pub fn new(
        store: Arc<Store>,
        pipeline: Arc<MessagePipeline>,
        llm: Arc<dyn LlmClient>,
        factory: Arc<dyn WhatsAppClientFactory>,
        policy: SessionPolicy,
    ) -> Self {
        WhatsAppSessionManager {
            inner: Arc::new(Inner {
                store,
                pipeline,
                llm,
                factory,
                policy,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a session for `connection_name` bound to the caller's profile.
    /// A second start while a session exists in memory (in any state short
    /// of closed) fails with Conflict until close() is invoked.
    pub async fn start(
        &self,
        connection_name: &str,
        profile_name: &str,
        user_id: &str,
    ) -> GatewayResult<()> {
        let name =
            validate_connection_name(connection_name).map_err(GatewayError::InvalidArgument)?;
        start_session(&self.inner, &name, profile_name, user_id, false, 0).await
    }

    /// Current pairing code, present only while the session is qr_ready.
    pub async fn qr(&self, connection_name: &str) -> GatewayResult<Option<String>> {
        let sessions = self.inner.sessions.lock().await;
        let session = sessions
            .get(connection_name)
            .ok_or_else(|| GatewayError::not_found(format!("session {}", connection_name)))?;
        if session.status() != SessionStatus::QrReady {
            return Ok(None);
        }
        let qr = session.qr.lock().clone();
        Ok(qr)
    }

    /// Runtime status when the session is in memory, else the persisted
    /// last-known status.
    pub async fn status(&self, connection_name: &str) -> GatewayResult<String> {
        if let Some(session) = self.inner.sessions.lock().await.get(connection_name) {
            return Ok(session.status().as_str().to_string());
        }
        match self.inner.store.find_whatsapp_connection(connection_name)? {
            Some(conn) => Ok(conn.last_known_status.as_str().to_string()),
            None => Err(GatewayError::not_found(format!(
                "whatsapp connection {}",
                connection_name
            ))),
        }
    }

    /// Send an outbound text on a connected session; returns the message id.
    pub async fn send_message(
        &self,
        connection_name: &str,
        to: &str,
        text: &str,
    ) -> GatewayResult<String> {
        let session = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .get(connection_name)
                .cloned()
                .ok_or_else(|| GatewayError::not_found(format!("session {}", connection_name)))?
        };
        if session.status() != SessionStatus::Connected {
            return Err(GatewayError::conflict(format!(
                "session {} is {}, not connected",
                connection_name,
                session.status().as_str()
            )));
        }
        session.client.send_text(to, text).await
    }

    /// Close a session: logout + destroy the client, close the tool pool,
    /// persist closed_manually with auto-reconnect off. Idempotent — a
    /// close of an unknown or already-closed session succeeds.
    pub async fn close(&self, connection_name: &str) -> GatewayResult<()> {
        close_session(&self.inner, connection_name, CloseMode::Manual, false).await
    }

    pub fn list_connections(&self, user_id: &str) -> GatewayResult<Vec<WhatsAppConnection>> {
        self.inner.store.list_whatsapp_connections(ConnectionFilter {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        })
    }

    /// Boot-time recovery: restart every persisted connection that still
    /// wants auto-reconnect and is not already in memory — once per boot.
    pub async fn recover_persisted_sessions(&self) {
        let connections = match self.inner.store.list_whatsapp_connections(ConnectionFilter {
            auto_reconnect: Some(true),
            ..Default::default()
        }) {
            Ok(list) => list,
            Err(e) => {
                error!("[whatsapp] Startup recovery listing failed: {}", e);
                return;
            }
        };

        info!("[whatsapp] Startup recovery: {} connection(s) to restore", connections.len());
        for conn in connections {
            if self.inner.sessions.lock().await.contains_key(&conn.connection_name) {
                continue;
            }
            let _ = self.inner.store.update_whatsapp_connection(
                &conn.connection_name,
                ConnectionPatch {
                    status: Some(ConnectionStatus::InitializingStartup),
                    last_attempted_reconnect_at: Some(Utc::now()),
                    ..Default::default()
                },
            );
            match start_session(
                &self.inner,
                &conn.connection_name,
                &conn.system_prompt_name,
                &conn.user_id,
                false,
                0,
            )
            .await
            {
                Ok(()) => info!("[whatsapp] Recovered '{}'", conn.connection_name),
                Err(e) if is_auth_error(&e) => {
                    warn!(
                        "[whatsapp] Recovery of '{}' hit an auth failure, disabling auto-reconnect: {}",
                        conn.connection_name, e
                    );
                    let _ = self.inner.store.update_whatsapp_connection(
                        &conn.connection_name,
                        ConnectionPatch {
                            auto_reconnect: Some(false),
                            ..Default::default()
                        },
                    );
                }
                Err(e) => {
                    // Transient failure — leave auto_reconnect set so the
                    // next boot tries again.
                    error!("[whatsapp] Recovery of '{}' failed: {}", conn.connection_name, e);
                }
            }
        }
    }

    /// Close every session in parallel, bounded by `grace`. Shutdown keeps
    /// the persisted auto-reconnect intent so the next boot restores the
    /// sessions; only an explicit close() marks a connection down for good.
    pub async fn close_all(&self, grace: Duration) {
        let names: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        let closes = names.iter().map(|name| {
            let inner = Arc::clone(&self.inner);
            let name = name.clone();
            async move {
                if let Err(e) = close_session(&inner, &name, CloseMode::Shutdown, false).await {
                    error!("[whatsapp] Shutdown close of '{}' failed: {}", name, e);
                }
            }
        });
        if tokio::time::timeout(grace, join_all(closes)).await.is_err() {
            warn!("[whatsapp] Shutdown grace period elapsed with sessions still closing");
        }
    }
}

// ── Start ──────────────────────────────────────────────────────────────────

async fn start_session(
    inner: &Arc<Inner>,
    name: &str,
    profile_name: &str,
    user_id: &str,
    is_retry: bool,
    attempts: u32,
) -> GatewayResult<()> {
    // Hold the map lock across setup so two concurrent starts of the same
    // name cannot both pass the occupancy check.
    let mut sessions = inner.sessions.lock().await;

    if let Some(existing) = sessions.get(name) {
        if is_retry {
            sessions.remove(name);
        } else {
            return Err(GatewayError::conflict(format!(
                "session {} already active (status {})",
                name,
                existing.status().as_str()
            )));
        }
    }

    let profile = inner
        .store
        .find_profile(user_id, profile_name)?
        .ok_or_else(|| GatewayError::not_found(format!("bot profile {}", profile_name)))?;
    if !profile.is_enabled {
        return Err(GatewayError::conflict(format!("bot profile {} is disabled", profile_name)));
    }

    // Persist the intent. A fresh start turns auto-reconnect on; a retry
    // keeps whatever the event path last persisted.
    let auto_reconnect = if is_retry {
        inner
            .store
            .find_whatsapp_connection(name)?
            .map(|c| c.auto_reconnect)
            .unwrap_or(true)
    } else {
        true
    };
    inner.store.upsert_whatsapp_connection(
        name,
        &profile.name,
        &profile.id,
        user_id,
        auto_reconnect,
        ConnectionStatus::Initializing,
    )?;

    // Scoped acquisition: anything opened before a failure is released
    // before the error propagates.
    let pool = Arc::new(ToolClientPool::open(&profile).await);
    let (client, events) = match inner.factory.create(name).await {
        Ok(pair) => pair,
        Err(e) => {
            pool.close().await;
            return Err(e);
        }
    };

    let adapter = Arc::new(LlmAdapter::new(
        Arc::clone(&inner.llm),
        inner.policy.tool_loop_max_steps,
    ));
    let system_prompt = format!("{}\n\n{}", render_system_prompt(&profile), WHATSAPP_CONTEXT);

    let session = Arc::new(Session {
        connection_name: name.to_string(),
        profile_id: profile.id.clone(),
        profile_name: profile.name.clone(),
        user_id: user_id.to_string(),
        system_prompt,
        client,
        pool,
        adapter,
        status: PlMutex::new(SessionStatus::Initializing),
        qr: PlMutex::new(None),
        reconnect_attempts: AtomicU32::new(attempts),
        is_reconnecting: AtomicBool::new(is_retry),
        released: AtomicBool::new(false),
        driver: PlMutex::new(None),
    });
    sessions.insert(name.to_string(), Arc::clone(&session));
    drop(sessions);

    let driver = tokio::spawn(run_driver(Arc::clone(inner), Arc::clone(&session), events));
    *session.driver.lock() = Some(driver);

    info!("[whatsapp] Session '{}' starting (profile '{}', retry={})", name, profile_name, is_retry);
    Ok(())
}

// ── Driver ─────────────────────────────────────────────────────────────────

async fn run_driver(
    inner: Arc<Inner>,
    session: Arc<Session>,
    mut events: mpsc::Receiver<ClientEvent>,
) {
    if let Err(e) = session.client.initialize().await {
        error!("[whatsapp] '{}' initialize failed: {}", session.connection_name, e);
        let event = if is_auth_error(&e) {
            ClientEvent::AuthFailure(e.to_string())
        } else {
            ClientEvent::Disconnected(e.to_string())
        };
        if !handle_event(&inner, &session, event).await {
            return;
        }
    }

    while let Some(event) = events.recv().await {
        if !handle_event(&inner, &session, event).await {
            break;
        }
    }
}

/// Apply one event to the session state machine. Returns false when the
/// driver should stop.
async fn handle_event(inner: &Arc<Inner>, session: &Arc<Session>, event: ClientEvent) -> bool {
    let status = session.status();
    if matches!(status, SessionStatus::Closing | SessionStatus::Closed) {
        return false;
    }

    match event {
        ClientEvent::Qr(code) => {
            info!("[whatsapp] '{}' produced a pairing code", session.connection_name);
            if session.is_reconnecting.load(Ordering::Relaxed) {
                warn!(
                    "[whatsapp] '{}' lost its pairing mid-reconnect; a human re-scan is required",
                    session.connection_name
                );
            }
            session.set_status(SessionStatus::QrReady);
            *session.qr.lock() = Some(code);
            // A pairing code means the stored auth is gone — reconnecting
            // without a human re-scan is pointless.
            persist(inner, session, ConnectionPatch {
                status: Some(ConnectionStatus::QrPendingScan),
                auto_reconnect: Some(false),
                ..Default::default()
            });
            true
        }
        ClientEvent::Authenticated => {
            info!("[whatsapp] '{}' authenticated", session.connection_name);
            session.set_status(SessionStatus::Authenticated);
            *session.qr.lock() = None;
            persist(inner, session, ConnectionPatch {
                status: Some(ConnectionStatus::Authenticated),
                auto_reconnect: Some(true),
                ..Default::default()
            });
            true
        }
        ClientEvent::Ready { phone_number } => {
            info!("[whatsapp] '{}' connected", session.connection_name);
            session.set_status(SessionStatus::Connected);
            *session.qr.lock() = None;
            session.reconnect_attempts.store(0, Ordering::Relaxed);
            session.is_reconnecting.store(false, Ordering::Relaxed);
            persist(inner, session, ConnectionPatch {
                status: Some(ConnectionStatus::Connected),
                last_connected_at: Some(Utc::now()),
                phone_number,
                ..Default::default()
            });
            true
        }
        ClientEvent::AuthFailure(reason) => {
            error!("[whatsapp] '{}' auth failure: {}", session.connection_name, reason);
            session.set_status(SessionStatus::AuthFailed);
            persist(inner, session, ConnectionPatch {
                status: Some(ConnectionStatus::AuthFailed),
                auto_reconnect: Some(false),
                ..Default::default()
            });
            let _ = close_session(inner, &session.connection_name, CloseMode::Failure, true).await;
            false
        }
        ClientEvent::Disconnected(reason) => {
            let attempts = session.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "[whatsapp] '{}' disconnected ({}), attempt {}/{}",
                session.connection_name, reason, attempts, inner.policy.max_reconnect_attempts
            );

            if attempts > inner.policy.max_reconnect_attempts {
                session.set_status(SessionStatus::DisconnectedPermanent);
                persist(inner, session, ConnectionPatch {
                    status: Some(ConnectionStatus::DisconnectedPermanent),
                    auto_reconnect: Some(false),
                    ..Default::default()
                });
                let _ =
                    close_session(inner, &session.connection_name, CloseMode::Failure, true).await;
                return false;
            }

            session.set_status(SessionStatus::Reconnecting);
            session.is_reconnecting.store(true, Ordering::Relaxed);
            persist(inner, session, ConnectionPatch {
                status: Some(ConnectionStatus::Reconnecting),
                ..Default::default()
            });
            schedule_reconnect(Arc::clone(inner), Arc::clone(session), attempts);
            // The retry replaces this session; this driver winds down.
            false
        }
        ClientEvent::Message(msg) => {
            if session.status() != SessionStatus::Connected {
                warn!(
                    "[whatsapp] '{}' dropping inbound message while {}",
                    session.connection_name,
                    session.status().as_str()
                );
                return true;
            }
            // Long work goes to a child task; the driver keeps consuming
            // events.
            let inner = Arc::clone(inner);
            let session = Arc::clone(session);
            tokio::spawn(async move {
                handle_inbound(&inner, &session, msg).await;
            });
            true
        }
    }
}

/// Linear backoff: delay = base × attempt. The retry destroys the old
/// client and rebuilds the session (tool pool and adapter included).
fn schedule_reconnect(inner: Arc<Inner>, session: Arc<Session>, attempts: u32) {
    tokio::spawn(async move {
        let delay = inner.policy.reconnect_base_delay * attempts;
        tokio::time::sleep(delay).await;

        // Closed (or replaced) while we slept — stand down.
        {
            let sessions = inner.sessions.lock().await;
            match sessions.get(&session.connection_name) {
                Some(current) if Arc::ptr_eq(current, &session) => {}
                _ => return,
            }
        }
        if session.status() != SessionStatus::Reconnecting {
            return;
        }

        let _ = inner.store.update_whatsapp_connection(
            &session.connection_name,
            ConnectionPatch {
                last_attempted_reconnect_at: Some(Utc::now()),
                ..Default::default()
            },
        );

        session.release_resources().await;
        if let Some(handle) = session.driver.lock().take() {
            handle.abort();
        }

        let result = start_session(
            &inner,
            &session.connection_name,
            &session.profile_name,
            &session.user_id,
            true,
            attempts,
        )
        .await;

        if let Err(e) = result {
            error!(
                "[whatsapp] Reconnect attempt {} for '{}' failed: {}",
                attempts, session.connection_name, e
            );
            inner.sessions.lock().await.remove(&session.connection_name);
            if is_auth_error(&e) {
                let _ = inner.store.update_whatsapp_connection(
                    &session.connection_name,
                    ConnectionPatch {
                        status: Some(ConnectionStatus::AuthFailed),
                        auto_reconnect: Some(false),
                        ..Default::default()
                    },
                );
            }
        }
    });
}

async fn handle_inbound(inner: &Arc<Inner>, session: &Arc<Session>, msg: InboundWhatsAppMessage) {
    let ctx = TurnContext {
        user_id: session.user_id.clone(),
        profile_id: session.profile_id.clone(),
        profile_name: session.profile_name.clone(),
        source: ChatSource::Whatsapp,
        connection_name: Some(session.connection_name.clone()),
        session_id: msg.from.clone(),
        system_prompt: session.system_prompt.clone(),
        user_name: msg.push_name.clone(),
    };
    let inbound = InboundMessage {
        text: msg.text.clone(),
        media: msg.media.clone(),
        attachments: vec![],
    };

    let result = inner
        .pipeline
        .process_turn(&ctx, inbound, &session.adapter, &*session.pool)
        .await;

    let reply = match result {
        Ok(reply) => reply.text,
        Err(e) => {
            error!(
                "[whatsapp] Turn failed for '{}' ({}): {}",
                session.connection_name, msg.from, e
            );
            match e {
                // Validation failures get the specific reason (e.g. an
                // unsupported media type); everything else stays generic.
                GatewayError::InvalidArgument(detail) => format!("{} ({})", TURN_FAILURE_REPLY, detail),
                _ => TURN_FAILURE_REPLY.to_string(),
            }
        }
    };
    if let Err(e) = session.client.send_text(&msg.from, &reply).await {
        error!("[whatsapp] Reply to {} failed: {}", msg.from, e);
    }
}

// ── Close ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseMode {
    /// User-requested: logout, remove the session, persist closed_manually.
    Manual,
    /// auth_failed / disconnected_permanent: free resources but keep the
    /// session (and its status) in memory so further starts conflict until
    /// an explicit close.
    Failure,
    /// Process shutdown: free resources and drop the session without
    /// touching the persisted record (no logout — the pairing stays valid).
    Shutdown,
}

async fn close_session(
    inner: &Arc<Inner>,
    name: &str,
    mode: CloseMode,
    from_driver: bool,
) -> GatewayResult<()> {
    let session = { inner.sessions.lock().await.get(name).cloned() };

    let Some(session) = session else {
        // Nothing in memory. A manual close of a persisted connection still
        // records the intent to stay down.
        if mode == CloseMode::Manual {
            if inner.store.find_whatsapp_connection(name)?.is_some() {
                inner.store.update_whatsapp_connection(name, ConnectionPatch {
                    status: Some(ConnectionStatus::ClosedManually),
                    auto_reconnect: Some(false),
                    ..Default::default()
                })?;
            }
        }
        return Ok(());
    };

    if mode != CloseMode::Failure {
        {
            let mut status = session.status.lock();
            if *status == SessionStatus::Closing || *status == SessionStatus::Closed {
                return Ok(());
            }
            *status = SessionStatus::Closing;
        }
        // Logout ends the pairing, so only an explicit close does it.
        if mode == CloseMode::Manual {
            if let Err(e) = session.client.logout().await {
                warn!("[whatsapp] Logout of '{}' failed: {}", name, e);
            }
        }
    }

    session.release_resources().await;
    if !from_driver {
        if let Some(handle) = session.driver.lock().take() {
            handle.abort();
        }
    }

    if mode != CloseMode::Failure {
        session.set_status(SessionStatus::Closed);
        inner.sessions.lock().await.remove(name);
    }
    if mode == CloseMode::Manual {
        inner.store.update_whatsapp_connection(name, ConnectionPatch {
            status: Some(ConnectionStatus::ClosedManually),
            auto_reconnect: Some(false),
            ..Default::default()
        })?;
    }

    info!("[whatsapp] Session '{}' closed ({:?})", name, mode);
    Ok(())
}

fn persist(inner: &Arc<Inner>, session: &Session, patch: ConnectionPatch) {
    if let Err(e) = inner
        .store
        .update_whatsapp_connection(&session.connection_name, patch)
    {
        error!("[whatsapp] Persisting state for '{}' failed: {}", session.connection_name, e);
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

    struct FakeClient {
        sent: PlMutex<Vec<(String, String)>>,
        destroyed: AtomicBool,
    }

    #[async_trait]
    impl WhatsAppClient for FakeClient {
        async fn initialize(&self) -> GatewayResult<()> {
            Ok(())
        }

        async fn send_text(&self, to: &str, text: &str) -> GatewayResult<String> {
            self.sent.lock().push((to.to_string(), text.to_string()));
            Ok("WIRE-ID".into())
        }

        async fn logout(&self) -> GatewayResult<()> {
            Ok(())
        }

        async fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        handles: PlMutex<Vec<(Arc<FakeClient>, mpsc::Sender<ClientEvent>)>>,
    }

    impl FakeFactory {
        fn latest(&self) -> (Arc<FakeClient>, mpsc::Sender<ClientEvent>) {
            self.handles.lock().last().cloned().expect("no client created yet")
        }

        fn created(&self) -> usize {
            self.handles.lock().len()
        }
    }

    #[async_trait]
    impl WhatsAppClientFactory for FakeFactory {
        async fn create(
            &self,
            _connection_name: &str,
        ) -> GatewayResult<(Arc<dyn WhatsAppClient>, mpsc::Receiver<ClientEvent>)> {
            let (tx, rx) = mpsc::channel(16);
            let client = Arc::new(FakeClient {
                sent: PlMutex::new(vec![]),
                destroyed: AtomicBool::new(false),
            });
            self.handles.lock().push((Arc::clone(&client), tx));
            Ok((client, rx))
        }
    }

    fn test_policy() -> SessionPolicy {
        SessionPolicy {
            reconnect_base_delay: Duration::from_millis(1),
            max_reconnect_attempts: 5,
            tool_loop_max_steps: 10,
        }
    }

    fn setup() -> (WhatsAppSessionManager, Arc<Store>, Arc<FakeFactory>, String) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let user = store.register_user("a@b.c", "hash", None).unwrap();
        store
            .create_profile(NewProfile::new(&user.id, "Support", "bot"))
            .unwrap();
        let pipeline = Arc::new(MessagePipeline::new(store.clone(), None, 1024, 20));
        let factory = Arc::new(FakeFactory::default());
        let manager = WhatsAppSessionManager::new(
            store.clone(),
            pipeline,
            Arc::new(StubLlm),
            factory.clone(),
            test_policy(),
        );
        (manager, store, factory, user.id)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_for_status(manager: &WhatsAppSessionManager, name: &str, expected: &str) {
        for _ in 0..500 {
            if manager.status(name).await.ok().as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "status never became {} (is {:?})",
            expected,
            manager.status(name).await
        );
    }

    #[tokio::test]
    async fn second_start_conflicts_while_active() {
        let (manager, _store, _factory, user_id) = setup();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();
        let err = manager.start("shop-bot", "Support", &user_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn connection_name_is_validated() {
        let (manager, _store, _factory, user_id) = setup();
        let err = manager.start("ab", "Support", &user_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unknown_profile_is_not_found() {
        let (manager, _store, _factory, user_id) = setup();
        let err = manager.start("shop-bot", "Ghost", &user_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn qr_event_pauses_auto_reconnect() {
        let (manager, store, factory, user_id) = setup();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();

        let (_client, tx) = factory.latest();
        tx.send(ClientEvent::Qr("data:image/png;base64,AAAA".into()))
            .await
            .unwrap();
        wait_for_status(&manager, "shop-bot", "qr_ready").await;

        let qr = manager.qr("shop-bot").await.unwrap();
        assert_eq!(qr.as_deref(), Some("data:image/png;base64,AAAA"));

        let conn = store.find_whatsapp_connection("shop-bot").unwrap().unwrap();
        assert_eq!(conn.last_known_status, ConnectionStatus::QrPendingScan);
        assert!(!conn.auto_reconnect);
    }

    #[tokio::test]
    async fn ready_event_marks_connected_and_clears_qr() {
        let (manager, store, factory, user_id) = setup();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();

        let (_client, tx) = factory.latest();
        tx.send(ClientEvent::Qr("data:image/png;base64,AAAA".into()))
            .await
            .unwrap();
        wait_for_status(&manager, "shop-bot", "qr_ready").await;
        tx.send(ClientEvent::Ready { phone_number: Some("15551234567".into()) })
            .await
            .unwrap();
        wait_for_status(&manager, "shop-bot", "connected").await;

        assert!(manager.qr("shop-bot").await.unwrap().is_none());
        let conn = store.find_whatsapp_connection("shop-bot").unwrap().unwrap();
        assert_eq!(conn.last_known_status, ConnectionStatus::Connected);
        assert!(conn.last_connected_at.is_some());
        assert_eq!(conn.phone_number.as_deref(), Some("15551234567"));
    }

    #[tokio::test]
    async fn auth_failure_frees_resources_and_blocks_restart() {
        let (manager, store, factory, user_id) = setup();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();

        let (client, tx) = factory.latest();
        tx.send(ClientEvent::AuthFailure("401".into())).await.unwrap();
        wait_for_status(&manager, "shop-bot", "auth_failed").await;
        wait_until(|| client.destroyed.load(Ordering::SeqCst)).await;

        let conn = store.find_whatsapp_connection("shop-bot").unwrap().unwrap();
        assert_eq!(conn.last_known_status, ConnectionStatus::AuthFailed);
        assert!(!conn.auto_reconnect);

        // Still occupying the slot until an explicit close.
        let err = manager.start("shop-bot", "Support", &user_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        manager.close("shop-bot").await.unwrap();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();
    }

    #[tokio::test]
    async fn disconnects_retry_then_go_permanent_at_the_cap() {
        let (manager, store, factory, user_id) = setup();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();

        let (_client, tx) = factory.latest();
        tx.send(ClientEvent::Ready { phone_number: None }).await.unwrap();
        wait_for_status(&manager, "shop-bot", "connected").await;

        // Each disconnect triggers a retry that builds a fresh client; the
        // 6th attempt crosses the cap of 5.
        for round in 1..=6u32 {
            let before = factory.created();
            let (_c, tx) = factory.latest();
            tx.send(ClientEvent::Disconnected(format!("drop {}", round)))
                .await
                .unwrap();
            if round <= 5 {
                wait_until(|| factory.created() > before).await;
            } else {
                wait_for_status(&manager, "shop-bot", "disconnected_permanent").await;
            }
        }

        let conn = store.find_whatsapp_connection("shop-bot").unwrap().unwrap();
        assert_eq!(conn.last_known_status, ConnectionStatus::DisconnectedPermanent);
        assert!(!conn.auto_reconnect);
        assert!(conn.last_attempted_reconnect_at.is_some());

        // 409 until close is invoked.
        let err = manager.start("shop-bot", "Support", &user_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        manager.close("shop-bot").await.unwrap();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_persists_manual_close() {
        let (manager, store, factory, user_id) = setup();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();
        let (client, _tx) = factory.latest();

        manager.close("shop-bot").await.unwrap();
        manager.close("shop-bot").await.unwrap();

        assert!(client.destroyed.load(Ordering::SeqCst));
        let conn = store.find_whatsapp_connection("shop-bot").unwrap().unwrap();
        assert_eq!(conn.last_known_status, ConnectionStatus::ClosedManually);
        assert!(!conn.auto_reconnect);
        // After a close the runtime session is gone; status falls back to
        // the persisted record.
        assert_eq!(manager.status("shop-bot").await.unwrap(), "closed_manually");
    }

    #[tokio::test]
    async fn inbound_message_runs_a_turn_and_replies() {
        let (manager, store, factory, user_id) = setup();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();
        let (client, tx) = factory.latest();
        tx.send(ClientEvent::Ready { phone_number: None }).await.unwrap();
        wait_for_status(&manager, "shop-bot", "connected").await;

        tx.send(ClientEvent::Message(InboundWhatsAppMessage {
            from: "15550001111@s.whatsapp.net".into(),
            push_name: Some("Alice".into()),
            text: Some("hi".into()),
            media: None,
        }))
        .await
        .unwrap();

        wait_until(|| !client.sent.lock().is_empty()).await;
        let sent = client.sent.lock().clone();
        assert_eq!(sent[0].0, "15550001111@s.whatsapp.net");
        assert_eq!(sent[0].1, "hello");

        let chat = store
            .find_chat_by_session("15550001111@s.whatsapp.net", ChatSource::Whatsapp)
            .unwrap()
            .unwrap();
        assert_eq!(chat.metadata.connection_name.as_deref(), Some("shop-bot"));
        assert_eq!(chat.metadata.user_name.as_deref(), Some("Alice"));
        assert_eq!(store.list_usage_for_user(&user_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_message_requires_connected() {
        let (manager, _store, factory, user_id) = setup();
        manager.start("shop-bot", "Support", &user_id).await.unwrap();

        let err = manager.send_message("shop-bot", "x@s.whatsapp.net", "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));

        let (_client, tx) = factory.latest();
        tx.send(ClientEvent::Ready { phone_number: None }).await.unwrap();
        wait_for_status(&manager, "shop-bot", "connected").await;
        let id = manager.send_message("shop-bot", "x@s.whatsapp.net", "hi").await.unwrap();
        assert_eq!(id, "WIRE-ID");
    }

    #[tokio::test]
    async fn startup_recovery_restores_flagged_connections_once() {
        let (manager, store, factory, user_id) = setup();
        store
            .upsert_whatsapp_connection(
                "restored-bot",
                "Support",
                "p1",
                &user_id,
                true,
                ConnectionStatus::Connected,
            )
            .unwrap();
        store
            .upsert_whatsapp_connection(
                "dormant-bot",
                "Support",
                "p1",
                &user_id,
                false,
                ConnectionStatus::ClosedManually,
            )
            .unwrap();

        manager.recover_persisted_sessions().await;

        assert_eq!(factory.created(), 1);
        assert_eq!(manager.status("restored-bot").await.unwrap(), "initializing");
        let conn = store.find_whatsapp_connection("restored-bot").unwrap().unwrap();
        assert!(conn.last_attempted_reconnect_at.is_some());
        // The dormant connection stays down.
        assert_eq!(manager.status("dormant-bot").await.unwrap(), "closed_manually");
    }
}
