/// Error messages that indicate a stalled (recoverable) connection.
///
/// Matched case-insensitively against the rendered error.
pub const STALLED_PATTERNS: &[&str] = &["socket hang up", "socket stalled", "connection reset"];

/// Errors returned by the Tether transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Socket stalled when trying to connect to {url}")]
    ConnectTimeout { url: String },

    #[error("socket closed: {reason}")]
    Closed { reason: String },

    #[error("not connected to relay")]
    NotConnected,

    #[error("frame serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("frame deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether this error means the connection stalled and is worth retrying.
    ///
    /// Anything else is fatal to the current connection.
    pub fn is_stalled(&self) -> bool {
        if matches!(self, TransportError::ConnectTimeout { .. }) {
            return true;
        }
        let rendered = self.to_string().to_lowercase();
        STALLED_PATTERNS.iter().any(|p| rendered.contains(p))
    }
}
