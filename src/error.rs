//! Error types for proxycraft

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to initialize certificate authority: {0}")]
    CAInit(String),

    #[error("failed to load custom root CA from {path}: {reason}")]
    CALoad { path: String, reason: String },

    #[error("failed to mint leaf certificate for {host}: {reason}")]
    LeafMint { host: String, reason: String },

    #[error("connection does not support hijacking")]
    HijackUnsupported,

    #[error("TLS handshake with {peer} failed: {reason}")]
    TLSHandshake { peer: String, reason: String },

    #[error("failed to dial upstream {target}: {reason}")]
    UpstreamDial { target: String, reason: String },

    #[error("failed to CONNECT to upstream proxy {proxy}: {reason}")]
    UpstreamConnect { proxy: String, reason: String },

    #[error("dispatch to {target} failed: {reason}")]
    Dispatch { target: String, reason: String },

    #[error("request to {target} timed out after {elapsed_ms}ms")]
    Timeout { target: String, elapsed_ms: u64 },

    #[error("failed to decompress {encoding} body: {reason}")]
    Decompress { encoding: String, reason: String },

    #[error("failed to write to client stream: {0}")]
    StreamWrite(String),

    #[error("failed to deliver event to subscriber {conn_id}: {reason}")]
    SubscriptionSend { conn_id: u64, reason: String },

    #[error("invalid configuration field {field}={value}: {reason}")]
    InvalidConfig {
        field: String,
        value: String,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("toml serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("http error: {0}")]
    Http(#[from] http::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Whether this error reflects a routine connection teardown rather
    /// than something worth logging at `error!` level.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::HijackUnsupported
                | ProxyError::TLSHandshake { .. }
                | ProxyError::Io(_)
        )
    }

    /// Classify whether this failure should mark a traffic entry as a
    /// timeout, per the Traffic Store's error-classification rules.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProxyError::Timeout { .. } => true,
            ProxyError::Dispatch { reason, .. } | ProxyError::UpstreamDial { reason, .. } => {
                let lower = reason.to_lowercase();
                lower.contains("timed out")
                    || lower.contains("timeout")
                    || lower.contains("client.timeout exceeded while awaiting headers")
            }
            _ => false,
        }
    }
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
