//! Peer-level JSON-RPC methods and the relay options each one publishes with.
use serde::{Deserialize, Serialize};
use tether_transport::JsonRpcError;

use crate::types::{FIVE_MINUTES, ONE_DAY, THIRTY_SECONDS};

/// Every method the engine speaks on pairing and session topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcMethod {
    #[serde(rename = "wc_sessionPropose")]
    SessionPropose,
    #[serde(rename = "wc_sessionSettle")]
    SessionSettle,
    #[serde(rename = "wc_sessionUpdate")]
    SessionUpdate,
    #[serde(rename = "wc_sessionExtend")]
    SessionExtend,
    #[serde(rename = "wc_sessionRequest")]
    SessionRequest,
    #[serde(rename = "wc_sessionEvent")]
    SessionEvent,
    #[serde(rename = "wc_sessionDelete")]
    SessionDelete,
    #[serde(rename = "wc_sessionPing")]
    SessionPing,
    #[serde(rename = "wc_pairingDelete")]
    PairingDelete,
    #[serde(rename = "wc_pairingPing")]
    PairingPing,
}

/// Relay options for one direction of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodOpts {
    pub ttl: u64,
    pub tag: u32,
    pub prompt: bool,
}

impl MethodOpts {
    const fn new(ttl: u64, tag: u32, prompt: bool) -> Self {
        Self { ttl, tag, prompt }
    }
}

/// Used when replying to a method nobody registered.
pub const UNREGISTERED_METHOD_OPTS: MethodOpts = MethodOpts::new(ONE_DAY, 0, false);

impl RpcMethod {
    pub const ALL: [RpcMethod; 10] = [
        RpcMethod::SessionPropose,
        RpcMethod::SessionSettle,
        RpcMethod::SessionUpdate,
        RpcMethod::SessionExtend,
        RpcMethod::SessionRequest,
        RpcMethod::SessionEvent,
        RpcMethod::SessionDelete,
        RpcMethod::SessionPing,
        RpcMethod::PairingDelete,
        RpcMethod::PairingPing,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::SessionPropose => "wc_sessionPropose",
            RpcMethod::SessionSettle => "wc_sessionSettle",
            RpcMethod::SessionUpdate => "wc_sessionUpdate",
            RpcMethod::SessionExtend => "wc_sessionExtend",
            RpcMethod::SessionRequest => "wc_sessionRequest",
            RpcMethod::SessionEvent => "wc_sessionEvent",
            RpcMethod::SessionDelete => "wc_sessionDelete",
            RpcMethod::SessionPing => "wc_sessionPing",
            RpcMethod::PairingDelete => "wc_pairingDelete",
            RpcMethod::PairingPing => "wc_pairingPing",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == method)
    }

    /// Pairing-level methods are handled by the pairing layer itself.
    pub fn is_pairing(&self) -> bool {
        matches!(self, RpcMethod::PairingDelete | RpcMethod::PairingPing)
    }

    pub const fn request_opts(&self) -> MethodOpts {
        match self {
            RpcMethod::SessionPropose => MethodOpts::new(FIVE_MINUTES, 1100, true),
            RpcMethod::SessionSettle => MethodOpts::new(FIVE_MINUTES, 1102, false),
            RpcMethod::SessionUpdate => MethodOpts::new(ONE_DAY, 1104, false),
            RpcMethod::SessionExtend => MethodOpts::new(ONE_DAY, 1106, false),
            RpcMethod::SessionRequest => MethodOpts::new(FIVE_MINUTES, 1108, true),
            RpcMethod::SessionEvent => MethodOpts::new(FIVE_MINUTES, 1110, true),
            RpcMethod::SessionDelete => MethodOpts::new(ONE_DAY, 1112, false),
            RpcMethod::SessionPing => MethodOpts::new(THIRTY_SECONDS, 1114, false),
            RpcMethod::PairingDelete => MethodOpts::new(ONE_DAY, 1000, false),
            RpcMethod::PairingPing => MethodOpts::new(THIRTY_SECONDS, 1002, false),
        }
    }

    pub const fn response_opts(&self) -> MethodOpts {
        match self {
            RpcMethod::SessionPropose => MethodOpts::new(FIVE_MINUTES, 1101, false),
            RpcMethod::SessionSettle => MethodOpts::new(FIVE_MINUTES, 1103, false),
            RpcMethod::SessionUpdate => MethodOpts::new(ONE_DAY, 1105, false),
            RpcMethod::SessionExtend => MethodOpts::new(ONE_DAY, 1107, false),
            RpcMethod::SessionRequest => MethodOpts::new(FIVE_MINUTES, 1109, false),
            RpcMethod::SessionEvent => MethodOpts::new(FIVE_MINUTES, 1111, false),
            RpcMethod::SessionDelete => MethodOpts::new(ONE_DAY, 1113, false),
            RpcMethod::SessionPing => MethodOpts::new(THIRTY_SECONDS, 1115, false),
            RpcMethod::PairingDelete => MethodOpts::new(ONE_DAY, 1001, false),
            RpcMethod::PairingPing => MethodOpts::new(THIRTY_SECONDS, 1003, false),
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── SDK error payloads ──────────────────────────────────────────────

/// Error payloads exchanged between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkError {
    UserRejected,
    UserDisconnected,
    UnsupportedNamespaceKey,
    Expired,
    WcMethodUnsupported,
}

impl SdkError {
    pub const fn code(&self) -> i64 {
        match self {
            SdkError::UserRejected => 5000,
            SdkError::UnsupportedNamespaceKey => 5104,
            SdkError::UserDisconnected => 6000,
            SdkError::Expired => 8000,
            SdkError::WcMethodUnsupported => 10001,
        }
    }

    pub const fn message(&self) -> &'static str {
        match self {
            SdkError::UserRejected => "User rejected.",
            SdkError::UnsupportedNamespaceKey => "Unsupported namespace key.",
            SdkError::UserDisconnected => "User disconnected.",
            SdkError::Expired => "Expired.",
            SdkError::WcMethodUnsupported => "Unsupported wc_ method.",
        }
    }

    /// Build the wire payload, appending `context` to the message.
    pub fn payload(&self, context: Option<&str>) -> JsonRpcError {
        let message = match context {
            Some(ctx) => format!("{} {ctx}", self.message()),
            None => self.message().to_string(),
        };
        JsonRpcError::new(self.code(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_roundtrip() {
        for method in RpcMethod::ALL {
            assert_eq!(RpcMethod::parse(method.as_str()), Some(method));
            let json = serde_json::to_value(method).unwrap();
            assert_eq!(json, method.as_str());
        }
        assert_eq!(RpcMethod::parse("wc_authRequest"), None);
    }

    #[test]
    fn tags_pair_request_and_response() {
        for method in RpcMethod::ALL {
            assert_eq!(method.response_opts().tag, method.request_opts().tag + 1);
        }
        assert_eq!(RpcMethod::SessionPropose.request_opts().tag, 1100);
        assert_eq!(RpcMethod::PairingPing.request_opts().ttl, 30);
        assert_eq!(RpcMethod::SessionUpdate.request_opts().ttl, ONE_DAY);
    }

    #[test]
    fn sdk_error_payloads() {
        let e = SdkError::UserDisconnected.payload(None);
        assert_eq!(e.code, 6000);
        assert_eq!(e.message, "User disconnected.");

        let e = SdkError::WcMethodUnsupported.payload(Some("wc_foo"));
        assert_eq!(e.code, 10001);
        assert_eq!(e.message, "Unsupported wc_ method. wc_foo");
    }

    #[test]
    fn only_pairing_methods_are_pairing() {
        assert!(RpcMethod::PairingPing.is_pairing());
        assert!(!RpcMethod::SessionPing.is_pairing());
    }
}
