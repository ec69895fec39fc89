//! Runtime state: every protocol component behind one owner.
//!
//! Handlers are synchronous and never do I/O. They mutate state and leave
//! effects in [`Services`]; the loop drains them with [`CoreState::take_effects`]
//! and hands them to the executor.
use std::collections::HashMap;

use serde_json::Value;
use tether_transport::{JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, TransportError};
use tokio::sync::oneshot;

use crate::crypto::Crypto;
use crate::expirer::{Expirer, ExpirerTarget};
use crate::history::JsonRpcHistory;
use crate::keychain::KeyChain;
use crate::pairing::Pairing;
use crate::relayer::{Relayer, RelayerEvent};
use crate::rpc::RpcMethod;
use crate::services::{PublishHook, Services};
use crate::session::SessionEngine;
use crate::storage::Storage;
use crate::store::Persisted;
use crate::types::now_ms;
use crate::ProtocolError;

use super::effect::{Effect, TimerKey};
use super::{ClientEvent, Command, CoreConfig};

pub(crate) struct CoreState {
    pub services: Services,
    pub pairing: Pairing,
    pub engine: SessionEngine,
}

impl CoreState {
    pub fn new(config: &CoreConfig, keychain: KeyChain) -> Result<Self, ProtocolError> {
        let prefix = config.storage_prefix.as_str();
        let mut crypto = Crypto::new(keychain);
        let client_id = crypto.client_id()?;
        let relayer = Relayer::new(config.relayer.clone(), client_id, prefix);
        let services = Services::new(
            crypto,
            JsonRpcHistory::new(prefix),
            Expirer::new(prefix),
            relayer,
            config.relay.clone(),
        );
        Ok(Self {
            services,
            pairing: Pairing::new(prefix),
            engine: SessionEngine::new(config.metadata.clone(), prefix),
        })
    }

    /// Build the state from whatever `storage` holds.
    ///
    /// The keychain comes first: the client id the relayer is built with
    /// derives from the identity seed stored in it.
    pub async fn load(config: &CoreConfig, storage: &dyn Storage) -> Result<Self, ProtocolError> {
        let mut keychain = KeyChain::new(&config.storage_prefix);
        if let Some(value) = storage.get_item(keychain.storage_key()).await? {
            keychain.restore(value)?;
        }
        let keychain_key = keychain.storage_key().to_string();
        let mut state = Self::new(config, keychain)?;

        let keys: Vec<String> = state
            .persisted_mut()
            .iter()
            .map(|p| p.storage_key().to_string())
            .filter(|key| *key != keychain_key)
            .collect();
        let mut loaded = HashMap::new();
        for key in keys {
            if let Some(value) = storage.get_item(&key).await? {
                loaded.insert(key, value);
            }
        }
        for store in state.persisted_mut() {
            if let Some(value) = loaded.remove(store.storage_key()) {
                store.restore(value)?;
            }
        }
        tracing::debug!(
            pairings = state.pairing.get_pairings().len(),
            sessions = state.engine.sessions().len(),
            "state restored"
        );
        Ok(state)
    }

    pub fn client_id(&mut self) -> Result<String, ProtocolError> {
        self.services.crypto.client_id()
    }

    /// Drop what expired while the client was down and open the socket.
    pub fn start(&mut self) {
        self.pairing.purge_expired(&mut self.services);
        self.engine.on_restored(&mut self.services);
        self.services.relayer.start();
    }

    fn persisted_mut(&mut self) -> Vec<&mut dyn Persisted> {
        let mut all: Vec<&mut dyn Persisted> = Vec::with_capacity(8);
        all.push(self.services.crypto.keychain_mut());
        all.push(&mut self.services.history);
        all.push(&mut self.services.expirer);
        all.push(self.services.relayer.subscriber_mut());
        all.push(&mut self.pairing);
        all.extend(self.engine.persisted_mut());
        all
    }

    /// Snapshots of every store changed since the last call.
    pub fn dirty_snapshots(&mut self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        for store in self.persisted_mut() {
            if !store.is_dirty() {
                continue;
            }
            match store.snapshot() {
                Ok(value) => {
                    out.push((store.storage_key().to_string(), value));
                    store.mark_clean();
                }
                Err(e) => tracing::error!(key = store.storage_key(), "snapshot failed: {e}"),
            }
        }
        out
    }

    // ── Effects ─────────────────────────────────────────────────────

    /// Process everything the last step queued, then hand over the effects.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        loop {
            let mut progressed = false;
            while let Some(event) = self.services.next_relayer_event() {
                self.on_relayer_event(event);
                progressed = true;
            }
            while let Some(target) = self.services.next_expired() {
                self.on_expired(target);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        self.services.take_effects()
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Apply one application command. Returns `false` on shutdown.
    pub fn handle_command(&mut self, command: Command) -> bool {
        let Self {
            services,
            pairing,
            engine,
        } = self;
        // A caller that stopped waiting is not an error.
        match command {
            Command::CreatePairing { reply } => {
                let _ = reply.send(pairing.create(services));
            }
            Command::Pair {
                uri,
                activate,
                reply,
            } => {
                let _ = reply.send(pairing.pair(services, &uri, activate));
            }
            Command::ActivatePairing { topic, reply } => {
                let _ = reply.send(pairing.activate(services, &topic));
            }
            Command::UpdatePairingExpiry {
                topic,
                expiry,
                reply,
            } => {
                let _ = reply.send(pairing.update_expiry(services, &topic, expiry));
            }
            Command::UpdatePairingMetadata {
                topic,
                metadata,
                reply,
            } => {
                let _ = reply.send(pairing.update_metadata(&topic, metadata));
            }
            Command::RegisterMethods { methods } => pairing.register(methods),
            Command::GetPairings { reply } => {
                let _ = reply.send(pairing.get_pairings());
            }
            Command::Connect { params, reply } => {
                let _ = reply.send(engine.connect(pairing, services, params));
            }
            Command::Approve { params, reply } => {
                let _ = reply.send(engine.approve(pairing, services, params));
            }
            Command::Reject { id, reason, reply } => {
                let _ = reply.send(engine.reject(services, id, reason));
            }
            Command::Update {
                topic,
                namespaces,
                reply,
            } => {
                let _ = reply.send(engine.update(services, &topic, namespaces));
            }
            Command::Extend { topic, reply } => {
                let _ = reply.send(engine.extend(services, &topic));
            }
            Command::Request { params, reply } => {
                let _ = reply.send(engine.request(services, params));
            }
            Command::Respond {
                topic,
                response,
                reply,
            } => {
                let answered = if pairing.exists(&topic) {
                    pairing.respond(services, &topic, response)
                } else {
                    engine.respond(services, &topic, response)
                };
                let _ = reply.send(answered);
            }
            Command::Ping { topic, reply } => {
                let _ = reply.send(engine.ping(pairing, services, &topic));
            }
            Command::Emit {
                topic,
                event,
                chain_id,
                reply,
            } => {
                let published = engine
                    .emit(services, &topic, event, chain_id)
                    .map(|relay_id| {
                        let (tx, rx) = oneshot::channel();
                        services.hook(relay_id, PublishHook::Notify(tx));
                        rx
                    });
                let _ = reply.send(published);
            }
            Command::Disconnect { topic, reply } => {
                let _ = reply.send(engine.disconnect(pairing, services, &topic));
            }
            Command::Find { required, reply } => {
                let _ = reply.send(engine.find(&required));
            }
            Command::GetSessions { reply } => {
                let _ = reply.send(engine.sessions());
            }
            Command::GetProposals { reply } => {
                let _ = reply.send(engine.proposals());
            }
            Command::GetPendingRequests { reply } => {
                let _ = reply.send(engine.get_pending_session_requests());
            }
            Command::SetOnline { online } => services.relayer.set_online(online),
            Command::RestartTransport => services.relayer.restart_transport(),
            Command::Shutdown => {
                tracing::info!("client shutting down");
                services.relayer.transport_close();
                return false;
            }
        }
        true
    }

    // ── Transport input ─────────────────────────────────────────────

    pub fn on_frame(&mut self, text: &str) {
        self.services.relayer.on_frame(text);
    }

    pub fn on_connected(&mut self) {
        self.services.relayer.on_connected(now_ms());
    }

    pub fn on_connect_failed(&mut self, error: &TransportError) {
        self.services.relayer.on_connect_failed(error);
    }

    pub fn on_socket_closed(&mut self, reason: &str) {
        self.services.relayer.on_socket_closed(reason);
    }

    pub fn on_socket_error(&mut self, error: &TransportError) {
        self.services.relayer.on_socket_error(error);
    }

    pub fn on_timer(&mut self, key: TimerKey) {
        self.services.relayer.on_timer(key);
    }

    pub fn on_pulse(&mut self) {
        self.services.on_pulse(now_ms());
    }

    // ── Relayer events ──────────────────────────────────────────────

    fn on_relayer_event(&mut self, event: RelayerEvent) {
        match event {
            RelayerEvent::OpenRequested => {}
            RelayerEvent::Connected => self.services.emit(ClientEvent::RelayerConnect),
            RelayerEvent::Disconnected => self.services.emit(ClientEvent::RelayerDisconnect),
            RelayerEvent::TransportClosed => tracing::debug!("transport closed"),
            RelayerEvent::Message { topic, message, .. } => self.on_message(&topic, &message),
            RelayerEvent::Published { id, topic } => {
                if let Some(PublishHook::Notify(tx)) = self.services.take_hook(id) {
                    let _ = tx.send(Ok(()));
                }
                self.services.emit(ClientEvent::RelayerPublish { id, topic });
            }
            RelayerEvent::PublishFailed { id, reason } => self.on_publish_failed(id, &reason),
            RelayerEvent::PublishAbandoned {
                id,
                topic,
                attempts,
            } => {
                self.on_publish_failed(id, &format!("abandoned after {attempts} attempts"));
                self.services.emit(ClientEvent::PublishAbandoned {
                    id,
                    topic,
                    attempts,
                });
            }
            RelayerEvent::SubscriptionCreated(record) => {
                tracing::trace!(topic = %record.topic, id = %record.id, "subscription created");
            }
            RelayerEvent::SubscriptionDeleted { id, topic } => {
                tracing::trace!(%topic, %id, "subscription deleted");
            }
            RelayerEvent::Resubscribed => self.services.emit(ClientEvent::SubscriptionResubscribed),
            RelayerEvent::ConnectionStalled => self.services.emit(ClientEvent::ConnectionStalled),
            RelayerEvent::Error(message) => self.services.emit(ClientEvent::RelayerError { message }),
        }
    }

    fn on_publish_failed(&mut self, relay_id: u64, reason: &str) {
        match self.services.take_hook(relay_id) {
            Some(PublishHook::Notify(tx)) => {
                let _ = tx.send(Err(ProtocolError::Publish(reason.to_string())));
            }
            Some(PublishHook::Settle { topic }) => {
                self.engine
                    .on_settle_publish_failed(&mut self.services, &topic, reason);
            }
            Some(PublishHook::Request { method, id }) => {
                self.services
                    .resolve_waiter(method, id, Err(ProtocolError::Publish(reason.to_string())));
            }
            None => tracing::debug!(relay_id, "publish failed: {reason}"),
        }
    }

    // ── Peer traffic ────────────────────────────────────────────────

    fn on_message(&mut self, topic: &str, message: &str) {
        let Some(payload) = self.services.decode(topic, message) else {
            tracing::debug!(%topic, "undecodable message dropped");
            return;
        };
        match payload {
            JsonRpcPayload::Request(request) => self.on_peer_request(topic, request),
            JsonRpcPayload::Response(response) => self.on_peer_response(topic, response),
        }
    }

    fn on_peer_request(&mut self, topic: &str, request: JsonRpcRequest) {
        if self.services.history.exists(topic, request.id) {
            tracing::debug!(%topic, id = request.id, "duplicate request dropped");
            return;
        }
        self.services.history.set(topic, &request, None);
        match RpcMethod::parse(&request.method) {
            Some(method) => {
                self.engine
                    .on_request(&mut self.pairing, &mut self.services, topic, &request, method)
            }
            None if self.pairing.exists(topic) => {
                if let Err(e) = self
                    .pairing
                    .on_unknown_request(&mut self.services, topic, &request)
                {
                    tracing::warn!(%topic, "cannot answer unknown method: {e}");
                }
            }
            None => tracing::debug!(%topic, method = %request.method, "unsupported method dropped"),
        }
    }

    fn on_peer_response(&mut self, topic: &str, response: JsonRpcResponse) {
        let Some(record) = self.services.history.resolve(topic, &response) else {
            tracing::debug!(%topic, id = response.id, "response without pending request dropped");
            return;
        };
        match RpcMethod::parse(&record.request.method) {
            Some(method) => self.engine.on_response(
                &mut self.pairing,
                &mut self.services,
                topic,
                &response,
                method,
            ),
            None => tracing::debug!(method = %record.request.method, "response to unknown method"),
        }
    }

    // ── Expiry ──────────────────────────────────────────────────────

    fn on_expired(&mut self, target: ExpirerTarget) {
        let handled = match &target {
            ExpirerTarget::Topic(topic) => {
                self.pairing.on_expired(&mut self.services, topic)
                    || self.engine.on_expired(&mut self.services, &target)
            }
            ExpirerTarget::Id(_) => self.engine.on_expired(&mut self.services, &target),
        };
        if !handled {
            tracing::debug!(%target, "expiry for unknown target");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::Metadata;
    use tether_transport::RelayConfig;

    fn config() -> CoreConfig {
        CoreConfig {
            relay: RelayConfig::new().relay_url("memory://relay"),
            metadata: Metadata::new("wallet", "https://wallet.example"),
            ..CoreConfig::default()
        }
    }

    fn emitted(effects: &[Effect]) -> Vec<ClientEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn state_survives_a_restart() {
        let storage = MemoryStorage::new();
        let mut state = CoreState::load(&config(), &storage).await.unwrap();
        let client_id = state.client_id().unwrap();
        let created = state.pairing.create(&mut state.services).unwrap();
        for (key, value) in state.dirty_snapshots() {
            storage.set_item(&key, value).await.unwrap();
        }
        assert!(state.dirty_snapshots().is_empty());

        let mut restored = CoreState::load(&config(), &storage).await.unwrap();
        assert_eq!(restored.client_id().unwrap(), client_id);
        assert!(restored.pairing.exists(&created.topic));
        assert!(restored.services.crypto.has_keys(&created.topic));
        assert!(restored
            .services
            .expirer
            .has(&ExpirerTarget::Topic(created.topic)));
    }

    #[tokio::test]
    async fn start_asks_for_a_socket_and_arms_the_cutoff() {
        let mut state = CoreState::load(&config(), &MemoryStorage::new()).await.unwrap();
        state.start();
        let effects = state.take_effects();
        assert!(effects.iter().any(|e| matches!(e, Effect::Connect { .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Arm {
                key: TimerKey::TransportCutoff,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn expired_pairing_is_reported() {
        let mut state = CoreState::load(&config(), &MemoryStorage::new()).await.unwrap();
        let created = state.pairing.create(&mut state.services).unwrap();
        state.take_effects();

        state
            .services
            .set_expiry(ExpirerTarget::Topic(created.topic.clone()), 1);
        let events = emitted(&state.take_effects());
        assert!(events.contains(&ClientEvent::PairingExpired {
            topic: created.topic.clone()
        }));
        assert!(!state.pairing.exists(&created.topic));
    }

    #[tokio::test]
    async fn responses_only_resolve_requests_sent_on_their_topic() {
        let mut state = CoreState::load(&config(), &MemoryStorage::new()).await.unwrap();
        let first = state.pairing.create(&mut state.services).unwrap();
        let second = state.pairing.create(&mut state.services).unwrap();
        let mut answer = state.pairing.ping(&mut state.services, &first.topic).unwrap();
        let id = state.services.history.pending()[0].request.id;

        state.on_peer_response(&second.topic, JsonRpcResponse::result(id, Value::Bool(true)));
        assert!(answer.try_recv().is_err());
        assert!(state.services.history.get(&first.topic, id).unwrap().response.is_none());

        state.on_peer_response(&first.topic, JsonRpcResponse::result(id, Value::Bool(true)));
        assert_eq!(answer.try_recv().unwrap().unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn respond_on_a_pairing_topic_answers_a_registered_request() {
        let mut state = CoreState::load(&config(), &MemoryStorage::new()).await.unwrap();
        let created = state.pairing.create(&mut state.services).unwrap();
        state.pairing.register(["wc_authRequest"]);
        let request = JsonRpcRequest::new("wc_authRequest", Value::Null);
        state.services.history.set(&created.topic, &request, None);
        state
            .pairing
            .on_unknown_request(&mut state.services, &created.topic, &request)
            .unwrap();

        let (tx, rx) = oneshot::channel();
        assert!(state.handle_command(Command::Respond {
            topic: created.topic.clone(),
            response: JsonRpcResponse::result(request.id, Value::Bool(true)),
            reply: tx,
        }));
        rx.await.unwrap().unwrap();
        assert!(state
            .services
            .history
            .get(&created.topic, request.id)
            .unwrap()
            .response
            .is_some());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let mut state = CoreState::load(&config(), &MemoryStorage::new()).await.unwrap();
        let (tx, rx) = oneshot::channel();
        assert!(state.handle_command(Command::GetPairings { reply: tx }));
        assert!(rx.await.unwrap().is_empty());
        assert!(!state.handle_command(Command::Shutdown));
    }
}
