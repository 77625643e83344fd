// Botgate Engine — WhatsApp Client Seam
//
// The gateway never speaks the WhatsApp wire protocol itself. Each session
// owns a client handle behind the WhatsAppClient trait and consumes its
// lifecycle events (qr / authenticated / ready / disconnected /
// auth_failure) plus inbound messages from an mpsc channel.
//
// The shipped implementation drives a local Baileys-based bridge
// (Evolution API style): one instance per connection created over REST,
// state polled, and webhooks received on a shared localhost listener that
// dispatches by instance name.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::media::{InboundMedia, MediaPayload};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// WhatsApp sends no hard limit, but very long messages truncate badly.
const MAX_OUTBOUND_CHARS: usize = 4000;

// ── Events ─────────────────────────────────────────────────────────────────

/// Lifecycle + traffic events a client emits to its session driver.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Pairing code as a `data:image/png;base64,…` URL awaiting human scan.
    Qr(String),
    Authenticated,
    Ready { phone_number: Option<String> },
    AuthFailure(String),
    Disconnected(String),
    Message(InboundWhatsAppMessage),
}

#[derive(Debug, Clone)]
pub struct InboundWhatsAppMessage {
    /// Remote JID the reply goes back to.
    pub from: String,
    pub push_name: Option<String>,
    pub text: Option<String>,
    pub media: Option<InboundMedia>,
}

// ── Client traits ──────────────────────────────────────────────────────────

#[async_trait]
pub trait WhatsAppClient: Send + Sync {
    /// Begin pairing/connection. Events flow on the receiver handed out by
    /// the factory.
    async fn initialize(&self) -> GatewayResult<()>;

    /// Send a text message; returns the wire message id.
    async fn send_text(&self, to: &str, text: &str) -> GatewayResult<String>;

    async fn logout(&self) -> GatewayResult<()>;

    /// Release all client resources. Idempotent.
    async fn destroy(&self);
}

/// Creates one client (plus its event stream) per connection name.
#[async_trait]
pub trait WhatsAppClientFactory: Send + Sync {
    async fn create(
        &self,
        connection_name: &str,
    ) -> GatewayResult<(Arc<dyn WhatsAppClient>, mpsc::Receiver<ClientEvent>)>;
}

// ── Bridge-backed implementation ───────────────────────────────────────────

pub struct BridgeClientFactory {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    webhook_port: u16,
    /// Directory the bridge persists pairing state under, one
    /// `session-<connection>` subdirectory per connection.
    auth_dir: std::path::PathBuf,
    /// instance name -> event sender, shared with the webhook listener.
    routes: Arc<tokio::sync::Mutex<HashMap<String, mpsc::Sender<ClientEvent>>>>,
    listener_started: AtomicBool,
    stop: Arc<AtomicBool>,
}

impl BridgeClientFactory {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        webhook_port: u16,
        auth_dir: &std::path::Path,
    ) -> Arc<Self> {
        Arc::new(BridgeClientFactory {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.unwrap_or_default().to_string(),
            webhook_port,
            auth_dir: auth_dir.to_path_buf(),
            routes: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            listener_started: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Stop the shared webhook listener on gateway shutdown.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    async fn ensure_listener(&self) -> GatewayResult<()> {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let addr = format!("127.0.0.1:{}", self.webhook_port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            self.listener_started.store(false, Ordering::SeqCst);
            GatewayError::channel("whatsapp", format!("webhook bind on {} failed: {}", addr, e))
        })?;
        info!("[whatsapp] Webhook listener started on {}", addr);

        let routes = Arc::clone(&self.routes);
        let stop = Arc::clone(&self.stop);
        tokio::spawn(async move {
            run_webhook_listener(listener, routes, stop).await;
        });
        Ok(())
    }
}

#[async_trait]
impl WhatsAppClientFactory for BridgeClientFactory {
    async fn create(
        &self,
        connection_name: &str,
    ) -> GatewayResult<(Arc<dyn WhatsAppClient>, mpsc::Receiver<ClientEvent>)> {
        self.ensure_listener().await?;

        // Pre-provision the volume the bridge keeps its pairing state in so
        // the session survives restarts.
        let session_dir = self.auth_dir.join(format!("session-{}", connection_name));
        if let Err(e) = std::fs::create_dir_all(&session_dir) {
            warn!("[whatsapp] Could not provision {:?}: {}", session_dir, e);
        }

        let (tx, rx) = mpsc::channel(64);
        self.routes
            .lock()
            .await
            .insert(connection_name.to_string(), tx.clone());

        let client = Arc::new(BridgeClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            instance: connection_name.to_string(),
            webhook_port: self.webhook_port,
            events: tx,
            routes: Arc::clone(&self.routes),
            destroyed: AtomicBool::new(false),
        });
        Ok((client, rx))
    }
}

pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    instance: String,
    webhook_port: u16,
    events: mpsc::Sender<ClientEvent>,
    routes: Arc<tokio::sync::Mutex<HashMap<String, mpsc::Sender<ClientEvent>>>>,
    destroyed: AtomicBool,
}

impl BridgeClient {
    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, path, self.instance)
    }

    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> GatewayResult<serde_json::Value> {
        let resp = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::channel("whatsapp", format!("bridge request: {}", e)))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_bridge_error(status.as_u16(), &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| GatewayError::channel("whatsapp", format!("bridge response: {}", e)))
    }
}

/// 401/403 from the bridge means the WhatsApp pairing is gone, not a
/// transient hiccup — callers treat this as an auth failure.
fn classify_bridge_error(status: u16, body: &str) -> GatewayError {
    let detail = &body[..body.len().min(200)];
    if status == 401 || status == 403 {
        GatewayError::channel("whatsapp", format!("auth rejected ({}): {}", status, detail))
    } else {
        GatewayError::channel("whatsapp", format!("bridge error {}: {}", status, detail))
    }
}

/// Whether a channel error came from the auth-rejection path.
pub fn is_auth_error(err: &GatewayError) -> bool {
    matches!(err, GatewayError::Channel { message, .. } if message.starts_with("auth rejected"))
}

#[async_trait]
impl WhatsAppClient for BridgeClient {
    async fn initialize(&self) -> GatewayResult<()> {
        let url = format!("{}/instance/create", self.base_url);
        let body = json!({
            "instanceName": self.instance,
            "integration": "WHATSAPP-BAILEYS",
            "qrcode": true,
            "webhook": {
                "url": format!("http://127.0.0.1:{}/webhook/whatsapp", self.webhook_port),
                "byEvents": true,
                "events": ["MESSAGES_UPSERT", "QRCODE_UPDATED", "CONNECTION_UPDATE"],
            },
        });

        let resp = match self.post_json(&url, body).await {
            Ok(resp) => resp,
            // An instance left over from a previous run: reconnect it.
            Err(GatewayError::Channel { message, .. })
                if message.contains("already") || message.contains("exists") =>
            {
                let url = self.url("instance/connect");
                let resp = self
                    .http
                    .get(&url)
                    .header("apikey", &self.api_key)
                    .send()
                    .await
                    .map_err(|e| GatewayError::channel("whatsapp", format!("bridge request: {}", e)))?;
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(classify_bridge_error(status.as_u16(), &text));
                }
                serde_json::from_str(&text).unwrap_or_default()
            }
            Err(e) => return Err(e),
        };

        // The create/connect response may already carry a pairing code.
        let qr = resp["qrcode"]["base64"]
            .as_str()
            .or_else(|| resp["base64"].as_str())
            .unwrap_or_default();
        if !qr.is_empty() {
            let _ = self.events.send(ClientEvent::Qr(as_data_url(qr))).await;
        }
        Ok(())
    }

    async fn send_text(&self, to: &str, text: &str) -> GatewayResult<String> {
        let url = self.url("message/sendText");
        let mut last_id = String::new();
        for chunk in split_message(text, MAX_OUTBOUND_CHARS) {
            let resp = self.post_json(&url, json!({"number": to, "text": chunk})).await?;
            if let Some(id) = resp["key"]["id"].as_str() {
                last_id = id.to_string();
            }
        }
        Ok(last_id)
    }

    async fn logout(&self) -> GatewayResult<()> {
        let url = self.url("instance/logout");
        let resp = self
            .http
            .delete(&url)
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::channel("whatsapp", format!("bridge request: {}", e)))?;
        if !resp.status().is_success() {
            warn!("[whatsapp] Logout of '{}' returned {}", self.instance, resp.status());
        }
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.routes.lock().await.remove(&self.instance);
        let url = self.url("instance/delete");
        match self.http.delete(&url).header("apikey", &self.api_key).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!("[whatsapp] Delete of '{}' returned {}", self.instance, resp.status())
            }
            Err(e) => warn!("[whatsapp] Delete of '{}' failed: {}", self.instance, e),
            _ => {}
        }
    }
}

// ── Webhook listener ───────────────────────────────────────────────────────

/// Minimal HTTP listener for bridge webhooks, bound to localhost. Replies
/// 200 immediately (the bridge expects a fast ack), then routes the payload
/// to the owning instance's event channel.
async fn run_webhook_listener(
    listener: TcpListener,
    routes: Arc<tokio::sync::Mutex<HashMap<String, mpsc::Sender<ClientEvent>>>>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let accepted = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            listener.accept(),
        )
        .await;

        let (mut stream, _peer) = match accepted {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("[whatsapp] Webhook accept error: {}", e);
                continue;
            }
            Err(_) => continue, // timeout — re-check the stop flag
        };

        let mut buf = vec![0u8; 65536];
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(_) => continue,
        };
        let request = String::from_utf8_lossy(&buf[..n]).to_string();
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK")
            .await;
        drop(stream);

        let body = match request.find("\r\n\r\n") {
            Some(idx) => &request[idx + 4..],
            None => continue,
        };
        let payload: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let instance = payload["instance"].as_str().unwrap_or_default().to_string();
        let sender = routes.lock().await.get(&instance).cloned();
        let Some(sender) = sender else {
            debug!("[whatsapp] Webhook for unknown instance '{}', ignoring", instance);
            continue;
        };

        for event in parse_webhook_events(&payload) {
            if sender.send(event).await.is_err() {
                break;
            }
        }
    }
    info!("[whatsapp] Webhook listener stopped");
}

/// Translate one webhook payload into client events.
pub(crate) fn parse_webhook_events(payload: &serde_json::Value) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    match payload["event"].as_str().unwrap_or_default() {
        "qrcode.updated" => {
            let qr = payload["data"]["qrcode"]["base64"]
                .as_str()
                .or_else(|| payload["data"]["qrcode"].as_str())
                .unwrap_or_default();
            if !qr.is_empty() {
                events.push(ClientEvent::Qr(as_data_url(qr)));
            }
        }
        "connection.update" => {
            let state = payload["data"]["state"].as_str().unwrap_or_default();
            match state {
                "open" | "connected" => {
                    let phone = payload["data"]["wuid"]
                        .as_str()
                        .map(|jid| jid.split('@').next().unwrap_or(jid).to_string());
                    events.push(ClientEvent::Ready { phone_number: phone });
                }
                "connecting" => events.push(ClientEvent::Authenticated),
                "close" => {
                    let code = payload["data"]["statusReason"].as_u64().unwrap_or(0);
                    if code == 401 || code == 403 {
                        events.push(ClientEvent::AuthFailure(format!(
                            "bridge closed the session (status {})",
                            code
                        )));
                    } else {
                        events.push(ClientEvent::Disconnected(format!(
                            "connection closed (status {})",
                            code
                        )));
                    }
                }
                _ => {}
            }
        }
        "messages.upsert" => {
            let data = &payload["data"];
            let entries = match data.as_array() {
                Some(arr) => arr.clone(),
                None => vec![data.clone()],
            };
            for entry in entries {
                if entry["key"]["fromMe"].as_bool().unwrap_or(false) {
                    continue;
                }
                let remote_jid = entry["key"]["remoteJid"].as_str().unwrap_or_default();
                if remote_jid.is_empty() {
                    continue;
                }
                let text = entry["message"]["conversation"]
                    .as_str()
                    .or_else(|| entry["message"]["extendedTextMessage"]["text"].as_str())
                    .map(|s| s.to_string());

                let media = entry["message"]["imageMessage"].as_object().map(|img| {
                    InboundMedia {
                        mime_type: img
                            .get("mimetype")
                            .and_then(|v| v.as_str())
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        filename: None,
                        payload: match img.get("url").and_then(|v| v.as_str()) {
                            Some(url) => MediaPayload::Url(url.to_string()),
                            None => MediaPayload::Base64(
                                entry["data"]["message"]["base64"]
                                    .as_str()
                                    .or_else(|| entry["message"]["base64"].as_str())
                                    .unwrap_or_default()
                                    .to_string(),
                            ),
                        },
                    }
                });

                if text.is_none() && media.is_none() {
                    continue;
                }
                events.push(ClientEvent::Message(InboundWhatsAppMessage {
                    from: remote_jid.to_string(),
                    push_name: entry["pushName"].as_str().map(|s| s.to_string()),
                    text,
                    media,
                }));
            }
        }
        other => {
            if !other.is_empty() {
                debug!("[whatsapp] Ignoring webhook event '{}'", other);
            }
        }
    }
    events
}

fn as_data_url(qr: &str) -> String {
    if qr.starts_with("data:") {
        qr.to_string()
    } else {
        format!("data:image/png;base64,{}", qr)
    }
}

/// Split long outbound text at newline/space boundaries.
pub(crate) fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let split_at = remaining[..max_len]
            .rfind('\n')
            .or_else(|| remaining[..max_len].rfind(' '))
            .unwrap_or(max_len);
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_prefers_word_boundaries() {
        let text = "aaaa bbbb cccc";
        let chunks = split_message(text, 9);
        assert_eq!(chunks, vec!["aaaa bbbb", "cccc"]);

        assert_eq!(split_message("short", 100), vec!["short"]);
    }

    #[test]
    fn qr_webhook_becomes_data_url() {
        let payload = json!({
            "event": "qrcode.updated",
            "instance": "shop-bot",
            "data": {"qrcode": {"base64": "AAAA"}},
        });
        let events = parse_webhook_events(&payload);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClientEvent::Qr(url) => assert_eq!(url, "data:image/png;base64,AAAA"),
            other => panic!("expected Qr, got {:?}", other),
        }
    }

    #[test]
    fn connection_states_map_to_lifecycle_events() {
        let open = json!({
            "event": "connection.update",
            "data": {"state": "open", "wuid": "15551234567@s.whatsapp.net"},
        });
        match &parse_webhook_events(&open)[0] {
            ClientEvent::Ready { phone_number } => {
                assert_eq!(phone_number.as_deref(), Some("15551234567"))
            }
            other => panic!("expected Ready, got {:?}", other),
        }

        let auth_close = json!({
            "event": "connection.update",
            "data": {"state": "close", "statusReason": 401},
        });
        assert!(matches!(
            parse_webhook_events(&auth_close)[0],
            ClientEvent::AuthFailure(_)
        ));

        let plain_close = json!({
            "event": "connection.update",
            "data": {"state": "close", "statusReason": 428},
        });
        assert!(matches!(
            parse_webhook_events(&plain_close)[0],
            ClientEvent::Disconnected(_)
        ));
    }

    #[test]
    fn inbound_messages_skip_own_and_empty_entries() {
        let payload = json!({
            "event": "messages.upsert",
            "data": [
                {"key": {"fromMe": true, "remoteJid": "x@s.whatsapp.net"},
                 "message": {"conversation": "me"}},
                {"key": {"fromMe": false, "remoteJid": "y@s.whatsapp.net"},
                 "pushName": "Alice",
                 "message": {"conversation": "hello"}},
                {"key": {"fromMe": false, "remoteJid": "z@s.whatsapp.net"},
                 "message": {}},
            ],
        });
        let events = parse_webhook_events(&payload);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClientEvent::Message(msg) => {
                assert_eq!(msg.from, "y@s.whatsapp.net");
                assert_eq!(msg.push_name.as_deref(), Some("Alice"));
                assert_eq!(msg.text.as_deref(), Some("hello"));
            }
            other => panic!("expected Message, got {:?}", other),
        }
    }

    #[test]
    fn image_message_extracts_media() {
        let payload = json!({
            "event": "messages.upsert",
            "data": {
                "key": {"fromMe": false, "remoteJid": "y@s.whatsapp.net"},
                "message": {
                    "imageMessage": {"mimetype": "image/jpeg", "url": "https://bridge/media/1"},
                },
            },
        });
        let events = parse_webhook_events(&payload);
        match &events[0] {
            ClientEvent::Message(msg) => {
                let media = msg.media.as_ref().unwrap();
                assert_eq!(media.mime_type, "image/jpeg");
                assert!(matches!(media.payload, MediaPayload::Url(_)));
            }
            other => panic!("expected Message, got {:?}", other),
        }
    }

    #[test]
    fn auth_error_classification() {
        assert!(is_auth_error(&classify_bridge_error(401, "no")));
        assert!(is_auth_error(&classify_bridge_error(403, "no")));
        assert!(!is_auth_error(&classify_bridge_error(500, "boom")));
        assert!(!is_auth_error(&GatewayError::invalid("x")));
    }
}
