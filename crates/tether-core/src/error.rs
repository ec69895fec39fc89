use tether_transport::{JsonRpcError, TransportError};

/// Protocol-level errors for Tether.
///
/// Wraps transport errors and adds the protocol taxonomy: validation,
/// lookup misses, expiry, decoding, peer-reported failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Missing or invalid. {0}")]
    MissingOrInvalid(String),

    #[error("Non conforming namespaces. {0}")]
    NonConformingNamespaces(String),

    #[error("Not initialized. {0}")]
    NotInitialized(String),

    #[error("No matching key. {0}")]
    NoMatchingKey(String),

    #[error("Expired. {0}")]
    Expired(String),

    #[error("Unauthorized. {0}")]
    Unauthorized(String),

    #[error("Pairing already exists: {topic}. Please try again with a new connection URI.")]
    PairingExists { topic: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("peer error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("runtime shut down")]
    Shutdown,
}

impl ProtocolError {
    /// Validation failures are raised to the caller and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ProtocolError::MissingOrInvalid(_)
                | ProtocolError::NonConformingNamespaces(_)
                | ProtocolError::Unauthorized(_)
                | ProtocolError::PairingExists { .. }
        )
    }

    /// Code used when this error is reported back to a peer.
    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::NotInitialized(_) => 1,
            ProtocolError::NoMatchingKey(_) => 2,
            ProtocolError::MissingOrInvalid(_) | ProtocolError::PairingExists { .. } => 5,
            ProtocolError::Expired(_) => 6,
            ProtocolError::NonConformingNamespaces(_) => 9,
            ProtocolError::Unauthorized(_) => 3001,
            ProtocolError::Rpc { code, .. } => *code,
            _ => 0,
        }
    }

    /// Error reply carrying this error to a peer.
    pub fn to_payload(&self) -> JsonRpcError {
        match self {
            ProtocolError::Rpc { code, message } => JsonRpcError::new(*code, message.clone()),
            other => JsonRpcError::new(other.code(), other.to_string()),
        }
    }

    /// Stalled transport errors are recovered by reconnecting.
    pub fn is_stalled(&self) -> bool {
        match self {
            ProtocolError::Transport(e) => e.is_stalled(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<JsonRpcError> for ProtocolError {
    fn from(e: JsonRpcError) -> Self {
        ProtocolError::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}
