//! Pairings: short-lived channels that bootstrap trust from a shared URI.
//!
//! `created → (paired) → activated → (ping)* → deleted | expired`
mod uri;

pub use uri::PairingUri;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tether_transport::{JsonRpcRequest, JsonRpcResponse, RpcOutcome};
use tokio::sync::oneshot;

use crate::crypto::Crypto;
use crate::expirer::ExpirerTarget;
use crate::rpc::{RpcMethod, SdkError};
use crate::runtime::ClientEvent;
use crate::services::{RequestOptions, Services};
use crate::store::{storage_key, Persisted, Store, CORE_STORAGE_PREFIX};
use crate::types::{calc_expiry, is_expired, Metadata, RelayProtocolOptions, Topic, FIVE_MINUTES, THIRTY_DAYS};
use crate::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRecord {
    pub topic: Topic,
    /// Unix seconds.
    pub expiry: u64,
    pub relay: RelayProtocolOptions,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
}

/// Result of [`Pairing::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPairing {
    pub topic: Topic,
    pub uri: String,
}

pub struct Pairing {
    pairings: Store<PairingRecord>,
    /// Methods upper layers handle on pairing topics.
    registered: BTreeSet<String>,
}

impl Pairing {
    pub fn new(custom_prefix: &str) -> Self {
        Self {
            pairings: Store::new(
                "pairing",
                storage_key(CORE_STORAGE_PREFIX, custom_prefix, "pairing"),
            ),
            registered: BTreeSet::new(),
        }
    }

    pub fn get(&self, topic: &str) -> Option<&PairingRecord> {
        self.pairings.get(topic).ok()
    }

    pub fn get_pairings(&self) -> Vec<PairingRecord> {
        self.pairings.values().cloned().collect()
    }

    pub fn exists(&self, topic: &str) -> bool {
        self.pairings.has(topic)
    }

    pub fn register<I, S>(&mut self, methods: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registered.extend(methods.into_iter().map(Into::into));
    }

    pub fn is_registered(&self, method: &str) -> bool {
        self.registered.contains(method)
    }

    // ── Operations ──────────────────────────────────────────────────

    /// New pairing with a random key, offered through the returned URI.
    pub(crate) fn create(&mut self, services: &mut Services) -> Result<CreatedPairing, ProtocolError> {
        let sym_key = Crypto::random_sym_key();
        let topic = services.crypto.set_sym_key(&sym_key, None)?;
        let expiry = calc_expiry(FIVE_MINUTES);
        let relay = RelayProtocolOptions::default();
        let record = PairingRecord {
            topic: topic.clone(),
            expiry,
            relay: relay.clone(),
            active: false,
            peer_metadata: None,
        };
        self.pairings.set(topic.clone(), record);
        services.subscribe(&topic, relay.clone());
        services.set_expiry(ExpirerTarget::Topic(topic.clone()), expiry);

        let uri = PairingUri::new(topic.clone(), sym_key, relay, expiry).to_string();
        tracing::debug!(%topic, "pairing created");
        Ok(CreatedPairing { topic, uri })
    }

    /// Join the pairing offered by `uri`.
    pub(crate) fn pair(
        &mut self,
        services: &mut Services,
        uri: &str,
        activate: bool,
    ) -> Result<PairingRecord, ProtocolError> {
        let params: PairingUri = uri.parse()?;
        let topic = params.topic.clone();
        if self.get(&topic).is_some_and(|p| p.active) {
            return Err(ProtocolError::PairingExists { topic });
        }

        let expiry = params
            .expiry_timestamp
            .unwrap_or_else(|| calc_expiry(FIVE_MINUTES));
        let record = PairingRecord {
            topic: topic.clone(),
            expiry,
            relay: params.relay.clone(),
            active: false,
            peer_metadata: None,
        };
        self.pairings.set(topic.clone(), record);
        services.set_expiry(ExpirerTarget::Topic(topic.clone()), expiry);
        if activate {
            self.activate(services, &topic)?;
        }
        let record = self.pairings.get(&topic)?.clone();
        services.emit(ClientEvent::PairingCreated {
            pairing: record.clone(),
        });

        if !services.crypto.has_keys(&topic) {
            services.crypto.set_sym_key(&params.sym_key, Some(&topic))?;
        }
        services.subscribe(&topic, params.relay);
        Ok(record)
    }

    /// Mark a pairing in use and extend it to the long-lived expiry.
    pub(crate) fn activate(&mut self, services: &mut Services, topic: &str) -> Result<(), ProtocolError> {
        let expiry = calc_expiry(THIRTY_DAYS);
        let record = self.pairings.get_mut(topic)?;
        record.active = true;
        record.expiry = expiry;
        services.set_expiry(ExpirerTarget::Topic(topic.to_string()), expiry);
        Ok(())
    }

    pub(crate) fn update_expiry(
        &mut self,
        services: &mut Services,
        topic: &str,
        expiry: u64,
    ) -> Result<(), ProtocolError> {
        self.valid_pairing(services, topic)?;
        self.pairings.get_mut(topic)?.expiry = expiry;
        services.set_expiry(ExpirerTarget::Topic(topic.to_string()), expiry);
        Ok(())
    }

    pub(crate) fn update_metadata(&mut self, topic: &str, metadata: Metadata) -> Result<(), ProtocolError> {
        self.pairings.get_mut(topic)?.peer_metadata = Some(metadata);
        Ok(())
    }

    /// Ping the peer. The receiver yields the peer's answer.
    pub(crate) fn ping(
        &mut self,
        services: &mut Services,
        topic: &str,
    ) -> Result<oneshot::Receiver<Result<Value, ProtocolError>>, ProtocolError> {
        self.valid_pairing(services, topic)?;
        let sent = services.send_request(topic, RpcMethod::PairingPing, json!({}), RequestOptions::default())?;
        Ok(services.waiter(RpcMethod::PairingPing, sent.id))
    }

    /// Answer a registered request that arrived on a pairing topic.
    pub(crate) fn respond(
        &mut self,
        services: &mut Services,
        topic: &str,
        response: JsonRpcResponse,
    ) -> Result<(), ProtocolError> {
        self.valid_pairing(services, topic)?;
        let pending = services
            .history
            .get(topic, response.id)
            .is_ok_and(|record| record.response.is_none() && self.is_registered(&record.request.method));
        if !pending {
            return Err(ProtocolError::NoMatchingKey(format!(
                "no pending request {} on pairing {topic}",
                response.id
            )));
        }
        match response.outcome {
            RpcOutcome::Result(value) => services.send_result(response.id, topic, value)?,
            RpcOutcome::Error(error) => services.send_error(response.id, topic, error)?,
        };
        Ok(())
    }

    /// Tell the peer, then forget the pairing.
    pub(crate) fn disconnect(&mut self, services: &mut Services, topic: &str) -> Result<(), ProtocolError> {
        self.valid_pairing(services, topic)?;
        let reason = serde_json::to_value(SdkError::UserDisconnected.payload(None))?;
        services.send_request(topic, RpcMethod::PairingDelete, reason, RequestOptions::default())?;
        self.delete_pairing(services, topic);
        services.emit(ClientEvent::PairingDeleted {
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn delete_pairing(&mut self, services: &mut Services, topic: &str) {
        services.unsubscribe(topic);
        self.pairings.delete(topic);
        services.crypto.delete_sym_key(topic);
        services.del_expiry(&ExpirerTarget::Topic(topic.to_string()));
    }

    /// Drop pairings whose expiry passed while the client was down.
    pub(crate) fn purge_expired(&mut self, services: &mut Services) {
        let expired: Vec<Topic> = self
            .pairings
            .values()
            .filter(|p| is_expired(p.expiry))
            .map(|p| p.topic.clone())
            .collect();
        for topic in expired {
            tracing::debug!(%topic, "purging expired pairing");
            self.delete_pairing(services, &topic);
        }
    }

    fn valid_pairing(&mut self, services: &mut Services, topic: &str) -> Result<(), ProtocolError> {
        let Some(record) = self.get(topic) else {
            return Err(ProtocolError::NoMatchingKey(format!(
                "pairing topic doesn't exist: {topic}"
            )));
        };
        if is_expired(record.expiry) {
            self.delete_pairing(services, topic);
            return Err(ProtocolError::Expired(format!("pairing topic: {topic}")));
        }
        Ok(())
    }

    // ── Inbound ─────────────────────────────────────────────────────

    pub(crate) fn on_request(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
        method: RpcMethod,
    ) -> Result<(), ProtocolError> {
        match method {
            RpcMethod::PairingPing => {
                self.valid_pairing(services, topic)?;
                services.send_result(request.id, topic, json!(true))?;
                services.emit(ClientEvent::PairingPing {
                    id: request.id,
                    topic: topic.to_string(),
                });
            }
            RpcMethod::PairingDelete => {
                self.valid_pairing(services, topic)?;
                services.send_result(request.id, topic, json!(true))?;
                self.delete_pairing(services, topic);
                services.emit(ClientEvent::PairingDeleted {
                    topic: topic.to_string(),
                });
            }
            other => tracing::debug!(%other, "not a pairing method"),
        }
        Ok(())
    }

    /// A method nobody on this client speaks arrived on a pairing topic.
    pub(crate) fn on_unknown_request(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        if self.is_registered(&request.method) {
            self.valid_pairing(services, topic)?;
            tracing::debug!(method = %request.method, %topic, "registered method on pairing topic");
            services.emit(ClientEvent::PairingRequest {
                topic: topic.to_string(),
                request: request.clone(),
            });
            return Ok(());
        }
        tracing::debug!(method = %request.method, %topic, "unsupported method on pairing topic");
        let error = SdkError::WcMethodUnsupported.payload(Some(&request.method));
        services.send_error(request.id, topic, error)?;
        Ok(())
    }

    pub(crate) fn on_response(&mut self, services: &mut Services, method: RpcMethod, response: &JsonRpcResponse) {
        if method != RpcMethod::PairingPing {
            return;
        }
        let outcome = match &response.outcome {
            RpcOutcome::Result(value) => Ok(value.clone()),
            RpcOutcome::Error(e) => Err(e.clone().into()),
        };
        services.resolve_waiter(method, response.id, outcome);
    }

    /// Expiry fired for `topic`. Returns whether it was a pairing.
    pub(crate) fn on_expired(&mut self, services: &mut Services, topic: &str) -> bool {
        if !self.pairings.has(topic) {
            return false;
        }
        tracing::debug!(%topic, "pairing expired");
        self.delete_pairing(services, topic);
        services.emit(ClientEvent::PairingExpired {
            topic: topic.to_string(),
        });
        true
    }
}

impl Persisted for Pairing {
    fn storage_key(&self) -> &str {
        self.pairings.storage_key()
    }

    fn is_dirty(&self) -> bool {
        self.pairings.is_dirty()
    }

    fn mark_clean(&mut self) {
        self.pairings.mark_clean();
    }

    fn snapshot(&self) -> Result<Value, ProtocolError> {
        self.pairings.snapshot()
    }

    fn restore(&mut self, value: Value) -> Result<(), ProtocolError> {
        self.pairings.restore(value)
    }
}
