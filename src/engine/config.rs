// Botgate Engine — Gateway Configuration
// All knobs come from the environment, loaded once at startup by main().
// Missing required variables fail fast: the process logs and exits 1
// before any session or store is touched.

use crate::atoms::error::{GatewayError, GatewayResult};
use std::path::PathBuf;
use std::time::Duration;

/// Credentials for the external object store that receives inbound media.
/// When unset, WhatsApp media messages get an explanatory reply instead.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub folder: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // ── LLM vendor ──
    pub llm_api_key: String,
    pub llm_model: String,
    /// Enable vendor-side search grounding for model calls.
    pub llm_search_grounding: bool,

    // ── Persistence ──
    pub db_path: PathBuf,

    // ── Object store (media uploads) ──
    pub object_store: Option<ObjectStoreConfig>,
    pub max_upload_bytes: u64,

    // ── WhatsApp bridge ──
    pub whatsapp_bridge_url: String,
    pub whatsapp_bridge_api_key: Option<String>,
    pub whatsapp_webhook_port: u16,
    pub whatsapp_auth_dir: PathBuf,
    pub whatsapp_cache_dir: PathBuf,

    // ── Engine knobs ──
    pub tool_loop_max_steps: u32,
    pub history_window: usize,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub public_idle_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> GatewayResult<Self> {
        let llm_api_key = required("LLM_API_KEY")?;

        let object_store = match std::env::var("OBJECT_STORE_CLOUD_NAME") {
            Ok(cloud_name) if !cloud_name.is_empty() => Some(ObjectStoreConfig {
                cloud_name,
                api_key: required("OBJECT_STORE_API_KEY")?,
                api_secret: required("OBJECT_STORE_API_SECRET")?,
                folder: optional("OBJECT_STORE_FOLDER").unwrap_or_else(|| "botgate".into()),
            }),
            _ => None,
        };

        Ok(GatewayConfig {
            llm_api_key,
            llm_model: optional("LLM_MODEL").unwrap_or_else(|| "gemini-2.0-flash".into()),
            llm_search_grounding: parse_or("LLM_SEARCH_GROUNDING", false)?,
            db_path: optional("GATEWAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_db_path),
            object_store,
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", 20 * 1024 * 1024)?,
            whatsapp_bridge_url: optional("WHATSAPP_BRIDGE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8085".into()),
            whatsapp_bridge_api_key: optional("WHATSAPP_BRIDGE_API_KEY"),
            whatsapp_webhook_port: parse_or("WHATSAPP_WEBHOOK_PORT", 8086)?,
            whatsapp_auth_dir: PathBuf::from(
                optional("WHATSAPP_AUTH_DIR").unwrap_or_else(|| "./.wwebjs_auth".into()),
            ),
            whatsapp_cache_dir: PathBuf::from(
                optional("WHATSAPP_CACHE_DIR").unwrap_or_else(|| "./.wwebjs_cache".into()),
            ),
            tool_loop_max_steps: parse_or("TOOL_LOOP_MAX_STEPS", 10)?,
            history_window: parse_or("HISTORY_WINDOW", 20)?,
            reconnect_base_delay: Duration::from_secs(parse_or("RECONNECT_BASE_DELAY_SECS", 5)?),
            max_reconnect_attempts: parse_or("MAX_RECONNECT_ATTEMPTS", 5)?,
            public_idle_timeout: optional("PUBLIC_IDLE_TIMEOUT_SECS")
                .map(|v| {
                    v.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| GatewayError::Config(format!("PUBLIC_IDLE_TIMEOUT_SECS: invalid value '{}'", v)))
                })
                .transpose()?,
            shutdown_grace: Duration::from_secs(parse_or("SHUTDOWN_GRACE_SECS", 10)?),
        })
    }

    /// Auth-data directory for one connection, mirroring the layout the
    /// external WhatsApp client persists its pairing state under.
    pub fn session_auth_dir(&self, connection_name: &str) -> PathBuf {
        self.whatsapp_auth_dir.join(format!("session-{}", connection_name))
    }
}

/// Default store location when GATEWAY_DB_PATH is unset.
fn default_db_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_default();
    home.join(".botgate").join("gateway.db")
}

fn required(name: &str) -> GatewayResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(GatewayError::Config(format!("missing required env var {}", name))),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> GatewayResult<T> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map_err(|_| GatewayError::Config(format!("{}: invalid value '{}'", name, v))),
        _ => Ok(default),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so they
    // cannot race each other under the parallel test runner.
    #[test]
    fn from_env_defaults_and_failures() {
        std::env::remove_var("LLM_API_KEY");
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(GatewayError::Config(_))
        ));

        std::env::set_var("LLM_API_KEY", "test-key");
        std::env::remove_var("OBJECT_STORE_CLOUD_NAME");
        std::env::remove_var("MAX_UPLOAD_BYTES");
        std::env::remove_var("PUBLIC_IDLE_TIMEOUT_SECS");

        let cfg = GatewayConfig::from_env().unwrap();
        assert_eq!(cfg.llm_model, "gemini-2.0-flash");
        assert_eq!(cfg.max_upload_bytes, 20 * 1024 * 1024);
        assert_eq!(cfg.tool_loop_max_steps, 10);
        assert_eq!(cfg.history_window, 20);
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert!(cfg.object_store.is_none());
        assert!(cfg.public_idle_timeout.is_none());

        std::env::set_var("MAX_UPLOAD_BYTES", "not-a-number");
        assert!(GatewayConfig::from_env().is_err());
        std::env::remove_var("MAX_UPLOAD_BYTES");

        let dir = cfg.session_auth_dir("shop-bot");
        assert!(dir.ends_with(".wwebjs_auth/session-shop-bot"));
    }
}
