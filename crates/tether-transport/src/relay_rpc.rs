//! Relay-level RPC surface (publish / subscribe / delivery).
use serde::{Deserialize, Serialize};

/// Relay protocol used when none is configured.
pub const RELAYER_DEFAULT_PROTOCOL: &str = "irn";

/// Suffix of the method the relay uses to deliver a message.
const SUBSCRIPTION_SUFFIX: &str = "_subscription";

/// Method names for one relay protocol (`irn_publish`, `irn_subscribe`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMethods {
    pub publish: String,
    pub subscribe: String,
    pub batch_subscribe: String,
    pub unsubscribe: String,
    pub subscription: String,
}

impl RelayMethods {
    pub fn for_protocol(protocol: &str) -> Self {
        Self {
            publish: format!("{protocol}_publish"),
            subscribe: format!("{protocol}_subscribe"),
            batch_subscribe: format!("{protocol}_batchSubscribe"),
            unsubscribe: format!("{protocol}_unsubscribe"),
            subscription: format!("{protocol}{SUBSCRIPTION_SUFFIX}"),
        }
    }

    /// Whether `method` is a relay delivery, whatever the protocol prefix.
    pub fn is_subscription(method: &str) -> bool {
        method.ends_with(SUBSCRIPTION_SUFFIX)
    }
}

impl Default for RelayMethods {
    fn default() -> Self {
        Self::for_protocol(RELAYER_DEFAULT_PROTOCOL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishParams {
    pub topic: String,
    pub message: String,
    pub ttl: u64,
    pub tag: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSubscribeParams {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    pub topic: String,
    pub id: String,
}

/// Payload of an inbound `<protocol>_subscription` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub id: String,
    pub data: SubscriptionData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    pub topic: String,
    pub message: String,
    #[serde(default)]
    pub published_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irn_method_names() {
        let m = RelayMethods::default();
        assert_eq!(m.publish, "irn_publish");
        assert_eq!(m.batch_subscribe, "irn_batchSubscribe");
        assert_eq!(m.subscription, "irn_subscription");
    }

    #[test]
    fn subscription_detection_ignores_prefix() {
        assert!(RelayMethods::is_subscription("waku_subscription"));
        assert!(!RelayMethods::is_subscription("irn_subscribe"));
    }

    #[test]
    fn subscription_data_uses_camel_case() {
        let params: SubscriptionParams = serde_json::from_value(serde_json::json!({
            "id": "sub",
            "data": { "topic": "t", "message": "m", "publishedAt": 42 }
        }))
        .unwrap();
        assert_eq!(params.data.published_at, 42);
    }

    #[test]
    fn publish_omits_absent_prompt() {
        let params = PublishParams {
            topic: "t".into(),
            message: "m".into(),
            ttl: 300,
            tag: 1100,
            prompt: None,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("prompt").is_none());
    }
}
