use serde_json::Value;

use crate::store::{storage_key, Persisted, Store, CORE_STORAGE_PREFIX};
use crate::ProtocolError;

/// Durable key material, hex-encoded.
///
/// Tags are public keys (for private keys), topics (for symmetric keys),
/// or fixed names such as the client identity seed.
#[derive(Debug, Clone)]
pub struct KeyChain {
    keys: Store<String>,
}

impl KeyChain {
    pub fn new(custom_prefix: &str) -> Self {
        Self {
            keys: Store::new(
                "keychain",
                storage_key(CORE_STORAGE_PREFIX, custom_prefix, "keychain"),
            ),
        }
    }

    pub fn set(&mut self, tag: impl Into<String>, key: impl Into<String>) {
        self.keys.set(tag, key.into());
    }

    pub fn get(&self, tag: &str) -> Result<&str, ProtocolError> {
        self.keys.get(tag).map(String::as_str)
    }

    pub fn has(&self, tag: &str) -> bool {
        self.keys.has(tag)
    }

    pub fn del(&mut self, tag: &str) {
        self.keys.delete(tag);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Persisted for KeyChain {
    fn storage_key(&self) -> &str {
        self.keys.storage_key()
    }

    fn is_dirty(&self) -> bool {
        self.keys.is_dirty()
    }

    fn mark_clean(&mut self) {
        self.keys.mark_clean();
    }

    fn snapshot(&self) -> Result<Value, ProtocolError> {
        self.keys.snapshot()
    }

    fn restore(&mut self, value: Value) -> Result<(), ProtocolError> {
        self.keys.restore(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del() {
        let mut kc = KeyChain::new("");
        kc.set("topic", "00ff");
        assert!(kc.has("topic"));
        assert_eq!(kc.get("topic").unwrap(), "00ff");

        kc.del("topic");
        assert!(!kc.has("topic"));
        assert!(matches!(
            kc.get("topic"),
            Err(ProtocolError::NoMatchingKey(_))
        ));
    }

    #[test]
    fn storage_key_carries_custom_prefix() {
        let kc = KeyChain::new(":dapp");
        assert_eq!(kc.storage_key(), "wc@2:core:0.3:dapp//keychain");
    }
}
