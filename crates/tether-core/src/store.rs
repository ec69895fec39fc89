//! In-memory record maps that mirror themselves into [`Storage`](crate::Storage).
//!
//! Components mutate their stores synchronously on the event loop; the loop
//! writes back every store whose dirty flag is set after each step.
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::ProtocolError;

/// Storage context for the pairing/relay layer.
pub const CORE_STORAGE_PREFIX: &str = "wc@2:core:0.3";
/// Storage context for the session layer.
pub const CLIENT_STORAGE_PREFIX: &str = "wc@2:client:0.3";

/// `<context><custom>//<name>`, e.g. `wc@2:core:0.3//keychain`.
pub fn storage_key(context: &str, custom_prefix: &str, name: &str) -> String {
    format!("{context}{custom_prefix}//{name}")
}

/// Anything the loop writes back to storage.
pub trait Persisted {
    fn storage_key(&self) -> &str;

    fn is_dirty(&self) -> bool;

    fn mark_clean(&mut self);

    fn snapshot(&self) -> Result<Value, ProtocolError>;

    fn restore(&mut self, value: Value) -> Result<(), ProtocolError>;
}

/// Keyed record map with change tracking.
#[derive(Debug, Clone)]
pub struct Store<V> {
    name: &'static str,
    key: String,
    records: BTreeMap<String, V>,
    dirty: bool,
}

impl<V> Store<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(name: &'static str, key: String) -> Self {
        Self {
            name,
            key,
            records: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert or overwrite.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        self.records.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn get(&self, key: &str) -> Result<&V, ProtocolError> {
        self.records
            .get(key)
            .ok_or_else(|| ProtocolError::NoMatchingKey(format!("{}: {key}", self.name)))
    }

    pub fn get_mut(&mut self, key: &str) -> Result<&mut V, ProtocolError> {
        let name = self.name;
        match self.records.get_mut(key) {
            Some(value) => {
                self.dirty = true;
                Ok(value)
            }
            None => Err(ProtocolError::NoMatchingKey(format!("{name}: {key}"))),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<V> {
        let removed = self.records.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.records.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.records.iter()
    }

    /// Drop every record matching `pred`, returning what was removed.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&V) -> bool) -> Vec<V> {
        let keys: Vec<String> = self
            .records
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter_map(|k| self.delete(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<V> Persisted for Store<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    fn storage_key(&self) -> &str {
        &self.key
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn snapshot(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(&self.records)?)
    }

    fn restore(&mut self, value: Value) -> Result<(), ProtocolError> {
        let records: BTreeMap<String, V> = serde_json::from_value(value).map_err(|e| {
            ProtocolError::Storage(format!("restore {} failed: {e}", self.name))
        })?;
        tracing::debug!(store = self.name, count = records.len(), "restored");
        self.records = records;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store<u64> {
        Store::new("expirer", storage_key(CORE_STORAGE_PREFIX, "", "expirer"))
    }

    #[test]
    fn storage_key_format() {
        assert_eq!(
            storage_key(CORE_STORAGE_PREFIX, "", "keychain"),
            "wc@2:core:0.3//keychain"
        );
        assert_eq!(
            storage_key(CLIENT_STORAGE_PREFIX, ":wallet", "session"),
            "wc@2:client:0.3:wallet//session"
        );
    }

    #[test]
    fn missing_key_is_no_matching_key() {
        let s = store();
        let err = s.get("topic:x").unwrap_err();
        assert_eq!(err.to_string(), "No matching key. expirer: topic:x");
    }

    #[test]
    fn mutations_mark_dirty() {
        let mut s = store();
        assert!(!s.is_dirty());
        s.set("a", 1);
        assert!(s.is_dirty());
        s.mark_clean();

        assert!(s.delete("missing").is_none());
        assert!(!s.is_dirty());

        *s.get_mut("a").unwrap() = 2;
        assert!(s.is_dirty());
    }

    #[test]
    fn snapshot_restore() {
        let mut s = store();
        s.set("a", 1);
        s.set("b", 2);
        let snap = s.snapshot().unwrap();

        let mut restored = store();
        restored.restore(snap).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(*restored.get("b").unwrap(), 2);
        assert!(!restored.is_dirty());
    }

    #[test]
    fn remove_where_returns_removed() {
        let mut s = store();
        s.set("a", 1);
        s.set("b", 20);
        s.set("c", 30);
        let removed = s.remove_where(|v| *v > 10);
        assert_eq!(removed, vec![20, 30]);
        assert_eq!(s.len(), 1);
    }
}
