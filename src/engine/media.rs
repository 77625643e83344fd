// Botgate Engine — Media Store Interface
// The object store itself is an external collaborator; this module carries
// the seam the pipeline uses: download inbound WhatsApp media, enforce the
// image-only MIME policy and the upload size cap, push the bytes to the
// configured store, and hand back the hosted URL.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::Attachment;
use crate::engine::config::ObjectStoreConfig;
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use reqwest::multipart;

/// Raw inbound media as delivered by the WhatsApp client: either already a
/// URL on the bridge, or base64 bytes from the wire.
#[derive(Debug, Clone)]
pub struct InboundMedia {
    pub mime_type: String,
    pub filename: Option<String>,
    pub payload: MediaPayload,
}

#[derive(Debug, Clone)]
pub enum MediaPayload {
    Url(String),
    Base64(String),
}

/// Upload seam. Implementations return the hosted attachment descriptor.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str, filename: &str)
        -> GatewayResult<Attachment>;
}

/// Guard applied before any upload: only images are processed, and only up
/// to the configured byte cap.
pub fn check_media(media: &InboundMedia, size: usize, max_bytes: u64) -> GatewayResult<()> {
    if !media.mime_type.starts_with("image/") {
        return Err(GatewayError::invalid(format!(
            "unsupported media type: {} (only images are processed)",
            media.mime_type
        )));
    }
    if size as u64 > max_bytes {
        return Err(GatewayError::PayloadTooLarge(format!(
            "media is {} bytes, limit is {}",
            size, max_bytes
        )));
    }
    Ok(())
}

/// Resolve inbound media to raw bytes: decode base64 payloads, fetch URLs.
pub async fn fetch_media_bytes(
    client: &reqwest::Client,
    media: &InboundMedia,
) -> GatewayResult<Vec<u8>> {
    match &media.payload {
        MediaPayload::Base64(b64) => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(b64.trim())
                .map_err(|e| GatewayError::invalid(format!("bad media payload: {}", e)))
        }
        MediaPayload::Url(url) => {
            let resp = client.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(GatewayError::channel(
                    "whatsapp",
                    format!("media download failed: {}", resp.status()),
                ));
            }
            Ok(resp.bytes().await?.to_vec())
        }
    }
}

// ── HTTP-backed store ──────────────────────────────────────────────────────

/// Cloudinary-style unsigned-folder upload over multipart POST.
pub struct HttpMediaStore {
    client: reqwest::Client,
    upload_url: String,
    api_key: String,
    api_secret: String,
    folder: String,
}

impl HttpMediaStore {
    pub fn new(config: &ObjectStoreConfig) -> Self {
        HttpMediaStore {
            client: reqwest::Client::new(),
            upload_url: format!(
                "https://api.cloudinary.com/v1_1/{}/image/upload",
                config.cloud_name
            ),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            folder: config.folder.clone(),
        }
    }
}

#[async_trait]
impl MediaStore for HttpMediaStore {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        filename: &str,
    ) -> GatewayResult<Attachment> {
        let size = bytes.len() as u64;
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|e| GatewayError::invalid(format!("bad mime type: {}", e)))?;
        let form = multipart::Form::new()
            .text("api_key", self.api_key.clone())
            .text("api_secret", self.api_secret.clone())
            .text("folder", self.folder.clone())
            .part("file", part);

        let resp = self.client.post(&self.upload_url).multipart(form).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            return Err(GatewayError::Internal(format!(
                "object store upload failed ({}): {}",
                status,
                body["error"]["message"].as_str().unwrap_or("unknown error")
            )));
        }

        let url = body["secure_url"]
            .as_str()
            .or_else(|| body["url"].as_str())
            .ok_or_else(|| GatewayError::Internal("object store returned no url".into()))?
            .to_string();

        info!("[media] Uploaded {} ({} bytes) -> {}", filename, size, url);
        Ok(Attachment {
            url,
            original_name: filename.to_string(),
            mime_type: mime_type.to_string(),
            size,
            uploaded_at: Utc::now(),
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
