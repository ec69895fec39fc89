use serde::{Deserialize, Serialize};

pub use tether_transport::now_ms;

// ── Durations (seconds) ─────────────────────────────────────────────

pub const ONE_SECOND: u64 = 1;
pub const FIVE_SECONDS: u64 = 5;
pub const THIRTY_SECONDS: u64 = 30;
pub const FIVE_MINUTES: u64 = 5 * 60;
pub const SIX_HOURS: u64 = 6 * 60 * 60;
pub const ONE_DAY: u64 = 24 * 60 * 60;
pub const SEVEN_DAYS: u64 = 7 * ONE_DAY;
pub const THIRTY_DAYS: u64 = 30 * ONE_DAY;

/// Protocol name and version carried in pairing URIs.
pub const PROTOCOL: &str = "wc";
pub const PROTOCOL_VERSION: u32 = 2;

/// Hex-encoded topic string.
pub type Topic = String;

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

/// Absolute expiry `ttl` seconds from now.
pub fn calc_expiry(ttl: u64) -> u64 {
    now_secs() + ttl
}

pub fn calc_expiry_at(ttl: u64, now_ms: u64) -> u64 {
    now_ms / 1000 + ttl
}

/// An expiry (seconds) is passed once the clock moves beyond it.
pub fn is_expired(expiry: u64) -> bool {
    is_expired_at(expiry, now_ms())
}

pub fn is_expired_at(expiry: u64, now_ms: u64) -> bool {
    expiry.saturating_mul(1000) < now_ms
}

/// Relay protocol selection stored with pairings and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for RelayProtocolOptions {
    fn default() -> Self {
        Self {
            protocol: tether_transport::RELAYER_DEFAULT_PROTOCOL.to_string(),
            data: None,
        }
    }
}

/// Application metadata exchanged during pairing and session negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
}

impl Metadata {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Self::default()
        }
    }
}

/// One side of a session: its public key and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: String,
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_in_the_past_is_expired() {
        let now = 1_700_000_000_000;
        assert!(is_expired_at(now / 1000 - 1, now));
        assert!(!is_expired_at(now / 1000 + 1, now));
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let now = 1_700_000_000_123;
        assert_eq!(calc_expiry_at(FIVE_MINUTES, now), 1_700_000_300);
    }

    #[test]
    fn relay_defaults_to_irn() {
        let relay = RelayProtocolOptions::default();
        assert_eq!(relay.protocol, "irn");
        let json = serde_json::to_value(&relay).unwrap();
        assert_eq!(json, serde_json::json!({"protocol": "irn"}));
    }

    #[test]
    fn participant_serializes_camel_case() {
        let p = Participant {
            public_key: "ab".into(),
            metadata: Metadata::new("dapp", "https://dapp.example"),
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["publicKey"], "ab");
        assert_eq!(json["metadata"]["name"], "dapp");
    }
}
