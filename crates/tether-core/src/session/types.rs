//! Session-layer records and the params carried by `wc_session*` methods.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Participant, RelayProtocolOptions, Topic};

/// What a proposer asks for under one namespace key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredNamespace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<Vec<String>>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// What a responder grants under one namespace key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNamespace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<Vec<String>>,
    pub accounts: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

pub type RequiredNamespaces = BTreeMap<String, RequiredNamespace>;
pub type Namespaces = BTreeMap<String, SessionNamespace>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub topic: Topic,
    pub pairing_topic: Topic,
    pub relay: RelayProtocolOptions,
    /// Unix seconds.
    pub expiry: u64,
    pub acknowledged: bool,
    /// Public key of the side allowed to update and extend.
    pub controller: String,
    pub namespaces: Namespaces,
    #[serde(default)]
    pub required_namespaces: RequiredNamespaces,
    #[serde(default)]
    pub optional_namespaces: RequiredNamespaces,
    #[serde(rename = "self")]
    pub self_: Participant,
    pub peer: Participant,
}

impl SessionRecord {
    pub fn is_controller(&self) -> bool {
        self.controller == self.self_.public_key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    pub id: u64,
    pub expiry: u64,
    pub relays: Vec<RelayProtocolOptions>,
    pub proposer: Participant,
    pub required_namespaces: RequiredNamespaces,
    #[serde(default)]
    pub optional_namespaces: RequiredNamespaces,
    pub pairing_topic: Topic,
}

/// The inner call a dapp forwards to a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestArguments {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<u64>,
}

impl RequestArguments {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            expiry_timestamp: None,
        }
    }
}

/// `wc_sessionRequest` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestParams {
    pub request: RequestArguments,
    pub chain_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequestRecord {
    pub id: u64,
    pub topic: Topic,
    pub params: SessionRequestParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventData {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl SessionEventData {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

// ── Caller params ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub required_namespaces: RequiredNamespaces,
    pub optional_namespaces: RequiredNamespaces,
    /// Reuse this pairing if it is still active.
    pub pairing_topic: Option<Topic>,
    pub relays: Option<Vec<RelayProtocolOptions>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproveParams {
    pub id: u64,
    pub namespaces: Namespaces,
    pub relay_protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestParams {
    pub topic: Topic,
    pub request: RequestArguments,
    pub chain_id: String,
    /// Seconds the responder has to answer.
    pub expiry: Option<u64>,
}

// ── Wire params ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProposeParams {
    pub relays: Vec<RelayProtocolOptions>,
    pub proposer: Participant,
    #[serde(default)]
    pub required_namespaces: RequiredNamespaces,
    #[serde(default)]
    pub optional_namespaces: RequiredNamespaces,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProposeResult {
    pub relay: RelayProtocolOptions,
    pub responder_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SettleParams {
    pub relay: RelayProtocolOptions,
    pub namespaces: Namespaces,
    #[serde(default)]
    pub required_namespaces: RequiredNamespaces,
    #[serde(default)]
    pub optional_namespaces: RequiredNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_topic: Option<Topic>,
    pub controller: Participant,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UpdateParams {
    pub namespaces: Namespaces,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExtendParams {
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventParams {
    pub event: SessionEventData,
    pub chain_id: String,
}
