// ── Botgate Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the gateway, built with `thiserror`.
//
// Design rules:
//   • Request-level variants mirror the HTTP taxonomy the external API
//     boundary maps to (status_code() below); infrastructure variants are
//     coarse-grained by domain (I/O, DB, Network, …).
//   • The `#[from]` attribute wires std/external error conversions.
//   • No variant carries secret material (API keys, passwords) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed input, validation failure, unsupported media type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing or invalid session token.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Non-owner / non-admin access to a resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Named resource absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate names, session already active, or a client state that does
    /// not permit the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Upload over the configured size limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Rate limit exceeded.
    #[error("too many requests: {0}")]
    TooManyRequests(String),

    /// LLM vendor failure. `transient` distinguishes retryable upstream
    /// hiccups (429/5xx) from misconfiguration (bad key, bad model id).
    #[error("llm error: {message}")]
    Llm { message: String, transient: bool },

    /// Tool-server failure (spawn, handshake, or invocation).
    #[error("tool error: {server}: {message}")]
    Tool { server: String, message: String },

    /// Channel / bridge failure (WhatsApp client, webhook listener).
    #[error("channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    /// Gateway configuration is invalid or missing.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite / rusqlite database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for errors without a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Internal(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn llm(message: impl Into<String>, transient: bool) -> Self {
        Self::Llm { message: message.into(), transient }
    }

    pub fn tool(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { server: server.into(), message: message.into() }
    }

    pub fn channel(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel { channel: channel.into(), message: message.into() }
    }

    /// HTTP status the external API boundary maps this error to.
    /// The boundary itself lives outside this crate; keeping the mapping here
    /// means routes never match on variants.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::PermissionDenied(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::PayloadTooLarge(_) => 413,
            Self::TooManyRequests(_) => 429,
            Self::Llm { transient, .. } => {
                if *transient {
                    502
                } else {
                    500
                }
            }
            _ => 500,
        }
    }

    /// Whether this error is worth retrying upstream.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Llm { transient: true, .. } | Self::Network(_))
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All gateway operations return this type.
pub type GatewayResult<T> = Result<T, GatewayError>;

// ── Tests ──────────────────────────────────────────────────────────────────
