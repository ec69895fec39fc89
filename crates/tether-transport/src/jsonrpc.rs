//! JSON-RPC 2.0 frames exchanged with the relay and between peers.
//!
//! Ids are integers derived from the clock so they stay unique across
//! restarts: `ms * 1000 + 3 random digits` for peer payloads and
//! `ms * 10^6 + 6 random digits` for relay-level requests.
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{now_ms, TransportError};

pub const JSONRPC_VERSION: &str = "2.0";

static LAST_PAYLOAD_ID: AtomicU64 = AtomicU64::new(0);
static LAST_RELAY_ID: AtomicU64 = AtomicU64::new(0);

/// Take `candidate` unless it does not move past the last issued id.
fn monotonic(last: &AtomicU64, candidate: u64) -> u64 {
    let mut prev = last.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(prev + 1);
        match last.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Id for a peer-to-peer JSON-RPC payload.
pub fn payload_id() -> u64 {
    let entropy: u64 = rand::rng().random_range(0..1_000);
    monotonic(&LAST_PAYLOAD_ID, now_ms() * 1_000 + entropy)
}

/// Id for a relay-level JSON-RPC request.
pub fn relay_rpc_id() -> u64 {
    let entropy: u64 = rand::rng().random_range(0..1_000_000);
    monotonic(&LAST_RELAY_ID, now_ms() * 1_000_000 + entropy)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Build a request with a fresh payload id.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self::with_id(payload_id(), method, params)
    }

    pub fn with_id(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(TransportError::Serialization)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Either half of a response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(Value),
    Error(JsonRpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl JsonRpcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            outcome: RpcOutcome::Result(result),
        }
    }

    pub fn error(id: u64, error: JsonRpcError) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            outcome: RpcOutcome::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, RpcOutcome::Error(_))
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(TransportError::Serialization)
    }
}

/// Any frame seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcPayload {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(TransportError::Deserialization)
    }

    pub fn id(&self) -> u64 {
        match self {
            JsonRpcPayload::Request(r) => r.id,
            JsonRpcPayload::Response(r) => r.id,
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(TransportError::Serialization)
    }
}

impl From<JsonRpcRequest> for JsonRpcPayload {
    fn from(r: JsonRpcRequest) -> Self {
        JsonRpcPayload::Request(r)
    }
}

impl From<JsonRpcResponse> for JsonRpcPayload {
    fn from(r: JsonRpcResponse) -> Self {
        JsonRpcPayload::Response(r)
    }
}
