//! Request/response bookkeeping for every peer-level JSON-RPC exchange.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_transport::{JsonRpcRequest, JsonRpcResponse, RpcOutcome};

use crate::store::{storage_key, Persisted, Store, CORE_STORAGE_PREFIX};
use crate::types::{calc_expiry_at, is_expired_at, now_ms, Topic, THIRTY_DAYS};
use crate::ProtocolError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRecord {
    pub id: u64,
    pub topic: Topic,
    pub request: RecordedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RpcOutcome>,
    pub expiry: u64,
}

/// An unresolved request, as rebuilt by [`JsonRpcHistory::pending`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRpc {
    pub topic: Topic,
    pub request: JsonRpcRequest,
    pub chain_id: Option<String>,
}

pub struct JsonRpcHistory {
    records: Store<JsonRpcRecord>,
}

impl JsonRpcHistory {
    pub fn new(custom_prefix: &str) -> Self {
        Self {
            records: Store::new(
                "history",
                storage_key(CORE_STORAGE_PREFIX, custom_prefix, "history"),
            ),
        }
    }

    /// Record a request. A second request with the same id is ignored.
    pub fn set(&mut self, topic: &str, request: &JsonRpcRequest, chain_id: Option<String>) {
        self.set_at(topic, request, chain_id, now_ms())
    }

    pub fn set_at(
        &mut self,
        topic: &str,
        request: &JsonRpcRequest,
        chain_id: Option<String>,
        now_ms: u64,
    ) {
        let key = request.id.to_string();
        if self.records.has(&key) {
            return;
        }
        self.records.set(
            key,
            JsonRpcRecord {
                id: request.id,
                topic: topic.to_string(),
                request: RecordedRequest {
                    method: request.method.clone(),
                    params: request.params.clone(),
                },
                chain_id,
                response: None,
                expiry: calc_expiry_at(THIRTY_DAYS, now_ms),
            },
        );
    }

    /// Attach a response that arrived on `topic`. Returns the record only
    /// the first time, and never for a response on another topic.
    pub fn resolve(&mut self, topic: &str, response: &JsonRpcResponse) -> Option<JsonRpcRecord> {
        let key = response.id.to_string();
        let record = self.records.get(&key).ok()?;
        if record.topic != topic {
            tracing::debug!(%topic, id = response.id, expected = %record.topic, "response on foreign topic");
            return None;
        }
        if record.response.is_some() {
            return None;
        }
        let record = self.records.get_mut(&key).ok()?;
        record.response = Some(response.outcome.clone());
        Some(record.clone())
    }

    pub fn get(&self, topic: &str, id: u64) -> Result<&JsonRpcRecord, ProtocolError> {
        let record = self.records.get(&id.to_string())?;
        if record.topic != topic {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "mismatched topic for record {id}: {topic}"
            )));
        }
        Ok(record)
    }

    pub fn exists(&self, topic: &str, id: u64) -> bool {
        self.get(topic, id).is_ok()
    }

    /// Drop one record, or every record on `topic` when `id` is `None`.
    pub fn delete(&mut self, topic: &str, id: Option<u64>) {
        match id {
            Some(id) => {
                if self.exists(topic, id) {
                    self.records.delete(&id.to_string());
                }
            }
            None => {
                self.records.remove_where(|r| r.topic == topic);
            }
        }
    }

    /// Requests still waiting for a response.
    pub fn pending(&self) -> Vec<PendingRpc> {
        self.records
            .values()
            .filter(|r| r.response.is_none())
            .map(|r| PendingRpc {
                topic: r.topic.clone(),
                request: JsonRpcRequest::with_id(
                    r.id,
                    r.request.method.clone(),
                    r.request.params.clone(),
                ),
                chain_id: r.chain_id.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Prune records past their expiry. Returns how many were dropped.
    pub fn cleanup_at(&mut self, now_ms: u64) -> usize {
        let removed = self.records.remove_where(|r| is_expired_at(r.expiry, now_ms));
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "pruned expired history records");
        }
        removed.len()
    }
}

impl Persisted for JsonRpcHistory {
    fn storage_key(&self) -> &str {
        self.records.storage_key()
    }

    fn is_dirty(&self) -> bool {
        self.records.is_dirty()
    }

    fn mark_clean(&mut self) {
        self.records.mark_clean();
    }

    fn snapshot(&self) -> Result<Value, ProtocolError> {
        self.records.snapshot()
    }

    fn restore(&mut self, value: Value) -> Result<(), ProtocolError> {
        self.records.restore(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_transport::JsonRpcError;

    const NOW: u64 = 1_700_000_000_000;

    fn request(id: u64) -> JsonRpcRequest {
        JsonRpcRequest::with_id(id, "wc_sessionPing", json!({}))
    }

    #[test]
    fn set_is_idempotent() {
        let mut h = JsonRpcHistory::new("");
        h.set_at("t", &request(1), None, NOW);
        h.set_at("t", &JsonRpcRequest::with_id(1, "wc_other", json!({})), None, NOW);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("t", 1).unwrap().request.method, "wc_sessionPing");
    }

    #[test]
    fn resolve_attaches_once() {
        let mut h = JsonRpcHistory::new("");
        h.set_at("t", &request(1), None, NOW);

        let first = h.resolve("t", &JsonRpcResponse::result(1, json!(true)));
        assert!(first.is_some());
        assert!(h.resolve("t", &JsonRpcResponse::result(1, json!(false))).is_none());
        assert_eq!(
            h.get("t", 1).unwrap().response,
            Some(RpcOutcome::Result(json!(true)))
        );
        assert!(h.pending().is_empty());
    }

    #[test]
    fn resolve_unknown_is_none() {
        let mut h = JsonRpcHistory::new("");
        assert!(h
            .resolve("t", &JsonRpcResponse::error(9, JsonRpcError::new(1, "x")))
            .is_none());
    }

    #[test]
    fn response_on_another_topic_is_ignored() {
        let mut h = JsonRpcHistory::new("");
        h.set_at("t", &request(1), None, NOW);
        assert!(h.resolve("other", &JsonRpcResponse::result(1, json!(true))).is_none());
        assert_eq!(h.get("t", 1).unwrap().response, None);
        assert!(h.resolve("t", &JsonRpcResponse::result(1, json!(true))).is_some());
    }

    #[test]
    fn get_checks_topic() {
        let mut h = JsonRpcHistory::new("");
        h.set_at("t", &request(1), None, NOW);
        assert!(h.exists("t", 1));
        assert!(!h.exists("other", 1));
        assert!(matches!(
            h.get("t", 2),
            Err(ProtocolError::NoMatchingKey(_))
        ));
    }

    #[test]
    fn delete_whole_topic() {
        let mut h = JsonRpcHistory::new("");
        h.set_at("t", &request(1), None, NOW);
        h.set_at("t", &request(2), None, NOW);
        h.set_at("u", &request(3), None, NOW);

        h.delete("t", None);
        assert_eq!(h.len(), 1);
        h.delete("u", Some(3));
        assert!(h.is_empty());
    }

    #[test]
    fn pending_rebuilds_requests() {
        let mut h = JsonRpcHistory::new("");
        h.set_at("t", &request(5), Some("eip155:1".into()), NOW);
        let pending = h.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request.id, 5);
        assert_eq!(pending[0].chain_id.as_deref(), Some("eip155:1"));
    }

    #[test]
    fn cleanup_drops_expired() {
        let mut h = JsonRpcHistory::new("");
        h.set_at("t", &request(1), None, NOW);
        assert_eq!(h.cleanup_at(NOW), 0);
        let later = NOW + (THIRTY_DAYS + 1) * 1000;
        assert_eq!(h.cleanup_at(later), 1);
        assert!(h.is_empty());
    }
}
