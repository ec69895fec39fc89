//! Shared plumbing under pairing and session logic.
//!
//! Owns key material, request history, the expirer and the relay client,
//! plus the waiters that hand peer responses back to callers. Pairing and
//! the session engine borrow it mutably for every operation.
use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tether_transport::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RelayConfig, TransportError};
use tokio::sync::oneshot;

use crate::crypto::{Crypto, DecodeOptions, EncodeOptions};
use crate::expirer::{Expirer, ExpirerEvent, ExpirerTarget};
use crate::history::JsonRpcHistory;
use crate::relayer::publisher::PublishOpts;
use crate::relayer::{Relayer, RelayerEvent};
use crate::rpc::{RpcMethod, UNREGISTERED_METHOD_OPTS};
use crate::runtime::effect::Effect;
use crate::runtime::ClientEvent;
use crate::types::{now_ms, RelayProtocolOptions, Topic, ONE_DAY};
use crate::ProtocolError;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ProtocolError>>;

/// Options for an outbound peer request.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestOptions {
    /// Relay ttl in seconds, replacing the method default.
    pub ttl: Option<u64>,
    pub chain_id: Option<String>,
    /// Fail instead of queueing for retry.
    pub hard_fail: bool,
}

/// Ids of a request handed to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SentRequest {
    /// Peer-level JSON-RPC id.
    pub id: u64,
    /// Relay-level publish id.
    pub relay_id: u64,
}

/// What to do once the relay settles a hard-fail publish.
#[derive(Debug)]
pub(crate) enum PublishHook {
    /// Tell the caller whether the relay accepted it.
    Notify(Reply<()>),
    /// Roll back the session if the settle never reaches the relay.
    Settle { topic: Topic },
    /// Fail the response waiter of the request.
    Request { method: RpcMethod, id: u64 },
}

pub(crate) struct Services {
    pub crypto: Crypto,
    pub history: JsonRpcHistory,
    pub expirer: Expirer,
    pub relayer: Relayer,
    relay_config: RelayConfig,
    effects: Vec<Effect>,
    relayer_events: VecDeque<RelayerEvent>,
    expired: VecDeque<ExpirerTarget>,
    waiters: HashMap<(RpcMethod, u64), Reply<Value>>,
    publish_hooks: HashMap<u64, PublishHook>,
}

impl Services {
    pub fn new(
        crypto: Crypto,
        history: JsonRpcHistory,
        expirer: Expirer,
        relayer: Relayer,
        relay_config: RelayConfig,
    ) -> Self {
        Self {
            crypto,
            history,
            expirer,
            relayer,
            relay_config,
            effects: Vec::new(),
            relayer_events: VecDeque::new(),
            expired: VecDeque::new(),
            waiters: HashMap::new(),
            publish_hooks: HashMap::new(),
        }
    }

    // ── Effects and events ──────────────────────────────────────────

    pub fn emit(&mut self, event: ClientEvent) {
        self.effects.push(Effect::Emit(event));
    }

    /// Move whatever the relayer buffered into our own queues.
    ///
    /// Socket open requests are served here since they need the identity key.
    pub fn collect_relayer(&mut self) {
        loop {
            self.effects.extend(self.relayer.drain_effects());
            let events = self.relayer.drain_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                if event == RelayerEvent::OpenRequested {
                    self.open_socket();
                } else {
                    self.relayer_events.push_back(event);
                }
            }
        }
    }

    fn open_socket(&mut self) {
        match self.connect_urls() {
            Ok(urls) => self.effects.push(Effect::Connect { urls }),
            Err(e) => {
                tracing::error!("cannot build relay url: {e}");
                let error = match e {
                    ProtocolError::Transport(e) => e,
                    other => TransportError::Config(other.to_string()),
                };
                self.relayer.on_connect_failed(&error);
            }
        }
    }

    fn connect_urls(&mut self) -> Result<Vec<url::Url>, ProtocolError> {
        let mut bases = vec![self.relay_config.relay_url_str().to_string()];
        if let Some(failover) = self.relay_config.failover_url_str() {
            bases.push(failover.to_string());
        }
        bases
            .iter()
            .map(|base| {
                let auth = self.crypto.sign_identity_assertion(base, ONE_DAY)?;
                Ok(self.relay_config.endpoint_url(base, &auth)?)
            })
            .collect()
    }

    pub fn next_relayer_event(&mut self) -> Option<RelayerEvent> {
        self.collect_relayer();
        self.relayer_events.pop_front()
    }

    pub fn next_expired(&mut self) -> Option<ExpirerTarget> {
        self.expired.pop_front()
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.collect_relayer();
        std::mem::take(&mut self.effects)
    }

    // ── Relay passthrough ───────────────────────────────────────────

    pub fn subscribe(&mut self, topic: &str, relay: RelayProtocolOptions) -> String {
        let id = self.relayer.subscribe(topic, relay);
        self.collect_relayer();
        id
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        self.relayer.unsubscribe(topic);
        self.collect_relayer();
    }

    pub fn publish(&mut self, topic: &str, message: &str, opts: PublishOpts) -> u64 {
        let id = self.relayer.publish(topic, message, opts, now_ms());
        self.collect_relayer();
        id
    }

    // ── Peer JSON-RPC ───────────────────────────────────────────────

    /// Encrypt, record and publish a request on `topic`.
    pub fn send_request(
        &mut self,
        topic: &str,
        method: RpcMethod,
        params: Value,
        options: RequestOptions,
    ) -> Result<SentRequest, ProtocolError> {
        let request = JsonRpcRequest::new(method.as_str(), params);
        let message = self
            .crypto
            .encode(topic, &request.to_json()?, &EncodeOptions::default())?;
        self.history.set(topic, &request, options.chain_id);

        let mut opts = PublishOpts::from(method.request_opts());
        if let Some(ttl) = options.ttl {
            opts.ttl = ttl;
        }
        opts.hard_fail = options.hard_fail;
        let relay_id = self.publish(topic, &message, opts);
        tracing::debug!(%topic, %method, id = request.id, "request sent");
        Ok(SentRequest {
            id: request.id,
            relay_id,
        })
    }

    pub fn send_result(&mut self, id: u64, topic: &str, result: Value) -> Result<u64, ProtocolError> {
        self.send_response(topic, JsonRpcResponse::result(id, result))
    }

    pub fn send_error(
        &mut self,
        id: u64,
        topic: &str,
        error: JsonRpcError,
    ) -> Result<u64, ProtocolError> {
        self.send_response(topic, JsonRpcResponse::error(id, error))
    }

    fn send_response(
        &mut self,
        topic: &str,
        response: JsonRpcResponse,
    ) -> Result<u64, ProtocolError> {
        let opts = self
            .history
            .get(topic, response.id)
            .ok()
            .and_then(|record| RpcMethod::parse(&record.request.method))
            .map(|method| method.response_opts())
            .unwrap_or(UNREGISTERED_METHOD_OPTS);
        let message = self
            .crypto
            .encode(topic, &response.to_json()?, &EncodeOptions::default())?;
        self.history.resolve(topic, &response);
        Ok(self.publish(topic, &message, opts.into()))
    }

    /// Open and parse an envelope. Undecodable traffic yields `None`.
    pub fn decode(&self, topic: &str, message: &str) -> Option<tether_transport::JsonRpcPayload> {
        let text = self
            .crypto
            .decode(topic, message, &DecodeOptions::default())?;
        match tether_transport::JsonRpcPayload::parse(&text) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::debug!(%topic, "decoded message is not JSON-RPC: {e}");
                None
            }
        }
    }

    // ── Waiters ─────────────────────────────────────────────────────

    /// Wait for the peer's response to request `id`.
    pub fn waiter(&mut self, method: RpcMethod, id: u64) -> oneshot::Receiver<Result<Value, ProtocolError>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert((method, id), tx);
        rx
    }

    /// Hand a response to whoever waits on it. Returns whether anyone did.
    pub fn resolve_waiter(
        &mut self,
        method: RpcMethod,
        id: u64,
        outcome: Result<Value, ProtocolError>,
    ) -> bool {
        match self.waiters.remove(&(method, id)) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn hook(&mut self, relay_id: u64, hook: PublishHook) {
        self.publish_hooks.insert(relay_id, hook);
    }

    pub fn take_hook(&mut self, relay_id: u64) -> Option<PublishHook> {
        self.publish_hooks.remove(&relay_id)
    }

    // ── Expiry ──────────────────────────────────────────────────────

    pub fn set_expiry(&mut self, target: ExpirerTarget, expiry: u64) {
        let events = self.expirer.set(target, expiry);
        self.queue_expired(events);
    }

    pub fn del_expiry(&mut self, target: &ExpirerTarget) {
        if let Some(event) = self.expirer.del(target) {
            tracing::trace!(?event, "expiry removed");
        }
    }

    fn queue_expired(&mut self, events: Vec<ExpirerEvent>) {
        for event in events {
            if let ExpirerEvent::Expired { target, .. } = event {
                tracing::debug!(%target, "expired");
                self.expired.push_back(target);
            }
        }
    }

    // ── Pulse ───────────────────────────────────────────────────────

    pub fn on_pulse(&mut self, now: u64) {
        self.relayer.on_pulse(now);
        self.collect_relayer();
        self.history.cleanup_at(now);
        let events = self
            .expirer
            .check_expirations_at(now, self.relayer.is_connected());
        self.queue_expired(events);
        self.waiters.retain(|_, tx| !tx.is_closed());
        self.publish_hooks.retain(|_, hook| match hook {
            PublishHook::Notify(tx) => !tx.is_closed(),
            _ => true,
        });
    }
}

#[cfg(test)]
impl Services {
    /// Disconnected services over an in-memory relay URL.
    pub(crate) fn for_tests() -> Self {
        let mut crypto = Crypto::new(crate::keychain::KeyChain::new(""));
        let client_id = crypto.client_id().unwrap();
        Services::new(
            crypto,
            JsonRpcHistory::new(""),
            Expirer::new(""),
            Relayer::new(crate::relayer::RelayerConfig::default(), client_id, ""),
            RelayConfig::new().relay_url("memory://relay"),
        )
    }

    /// Client events emitted so far.
    pub(crate) fn emitted(&mut self) -> Vec<ClientEvent> {
        self.take_effects()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }
}
