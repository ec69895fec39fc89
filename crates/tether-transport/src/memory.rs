//! In-process relay for tests and local demos.
//!
//! Speaks the relay's JSON-RPC surface (publish, subscribe, batch
//! subscribe, unsubscribe, delivery) over [`RelaySocket`] channels. Messages
//! published to a topic nobody listens to are kept in a mailbox and flushed
//! to the first subscriber. A few switches let tests inject failures: drop
//! publish acks, refuse connections, drop every live connection.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use crate::{
    now_ms, relay_rpc_id, BatchSubscribeParams, Connector, JsonRpcError, JsonRpcPayload,
    JsonRpcRequest, JsonRpcResponse, PublishParams, RelayMethods, RelaySocket, SocketEvent,
    SubscribeParams, SubscriptionData, SubscriptionParams, TransportError, UnsubscribeParams,
};

/// One RPC the relay received, kept for assertions.
#[derive(Debug, Clone)]
pub struct RecordedRpc {
    pub connection: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct RelayState {
    next_connection: u64,
    next_subscription: u64,
    connections: HashMap<u64, mpsc::Sender<SocketEvent>>,
    subscriptions: HashMap<String, HashSet<u64>>,
    mailbox: HashMap<String, Vec<(String, u64)>>,
    log: Vec<RecordedRpc>,
    drop_publish_acks: usize,
    refuse_connections: bool,
}

/// Loopback relay shared by every client connected to it.
#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    methods: RelayMethods,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            methods: RelayMethods::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Failure injection ───────────────────────────────────────────

    /// Deliver the next `n` publishes but never acknowledge them.
    pub fn drop_publish_acks(&self, n: usize) {
        self.lock().drop_publish_acks = n;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Close every live connection and forget all subscriptions.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        for (_, tx) in state.connections.drain() {
            let _ = tx.try_send(SocketEvent::Closed {
                reason: "relay restarting".into(),
            });
        }
        state.subscriptions.clear();
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Number of RPCs received with this method.
    pub fn rpc_count(&self, method: &str) -> usize {
        self.lock().log.iter().filter(|r| r.method == method).count()
    }

    /// Params of every RPC received with this method, oldest first.
    pub fn rpc_params(&self, method: &str) -> Vec<Value> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.method == method)
            .map(|r| r.params.clone())
            .collect()
    }

    pub fn rpc_log(&self) -> Vec<RecordedRpc> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Number of live connections subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .subscriptions
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    // ── Request handling ────────────────────────────────────────────

    fn handle_frame(&self, connection: u64, text: &str) {
        let request = match JsonRpcPayload::parse(text) {
            Ok(JsonRpcPayload::Request(r)) => r,
            // Acks for deliveries need no handling.
            Ok(JsonRpcPayload::Response(_)) => return,
            Err(e) => {
                tracing::debug!("memory relay: bad frame: {e}");
                return;
            }
        };

        let mut state = self.lock();
        state.log.push(RecordedRpc {
            connection,
            method: request.method.clone(),
            params: request.params.clone(),
        });

        let reply = if request.method == self.methods.publish {
            self.on_publish(&mut state, connection, &request)
        } else if request.method == self.methods.subscribe {
            self.on_subscribe(&mut state, connection, &request)
        } else if request.method == self.methods.batch_subscribe {
            self.on_batch_subscribe(&mut state, connection, &request)
        } else if request.method == self.methods.unsubscribe {
            self.on_unsubscribe(&mut state, connection, &request)
        } else {
            Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(-32601, format!("method not found: {}", request.method)),
            ))
        };

        if let Some(response) = reply {
            send_to(&state, connection, response.into());
        }
    }

    fn on_publish(
        &self,
        state: &mut RelayState,
        connection: u64,
        request: &JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let params: PublishParams = match serde_json::from_value(request.params.clone()) {
            Ok(p) => p,
            Err(e) => return Some(invalid_params(request.id, e)),
        };
        let published_at = now_ms();
        let listeners: Vec<u64> = state
            .subscriptions
            .get(&params.topic)
            .map(|s| s.iter().copied().filter(|c| *c != connection).collect())
            .unwrap_or_default();

        if listeners.is_empty() {
            state
                .mailbox
                .entry(params.topic.clone())
                .or_default()
                .push((params.message.clone(), published_at));
        } else {
            for listener in listeners {
                self.deliver(state, listener, &params.topic, &params.message, published_at);
            }
        }

        if state.drop_publish_acks > 0 {
            state.drop_publish_acks -= 1;
            return None;
        }
        Some(JsonRpcResponse::result(request.id, json!(true)))
    }

    fn on_subscribe(
        &self,
        state: &mut RelayState,
        connection: u64,
        request: &JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let params: SubscribeParams = match serde_json::from_value(request.params.clone()) {
            Ok(p) => p,
            Err(e) => return Some(invalid_params(request.id, e)),
        };
        let id = self.add_subscription(state, connection, &params.topic);
        Some(JsonRpcResponse::result(request.id, json!(id)))
    }

    fn on_batch_subscribe(
        &self,
        state: &mut RelayState,
        connection: u64,
        request: &JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let params: BatchSubscribeParams = match serde_json::from_value(request.params.clone()) {
            Ok(p) => p,
            Err(e) => return Some(invalid_params(request.id, e)),
        };
        let ids: Vec<String> = params
            .topics
            .iter()
            .map(|topic| self.add_subscription(state, connection, topic))
            .collect();
        Some(JsonRpcResponse::result(request.id, json!(ids)))
    }

    fn on_unsubscribe(
        &self,
        state: &mut RelayState,
        connection: u64,
        request: &JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let params: UnsubscribeParams = match serde_json::from_value(request.params.clone()) {
            Ok(p) => p,
            Err(e) => return Some(invalid_params(request.id, e)),
        };
        if let Some(subs) = state.subscriptions.get_mut(&params.topic) {
            subs.remove(&connection);
            if subs.is_empty() {
                state.subscriptions.remove(&params.topic);
            }
        }
        Some(JsonRpcResponse::result(request.id, json!(true)))
    }

    fn add_subscription(&self, state: &mut RelayState, connection: u64, topic: &str) -> String {
        state
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(connection);
        state.next_subscription += 1;
        let id = format!("memory-sub-{}", state.next_subscription);

        if let Some(stored) = state.mailbox.remove(topic) {
            for (message, published_at) in stored {
                self.deliver(state, connection, topic, &message, published_at);
            }
        }
        id
    }

    fn deliver(
        &self,
        state: &RelayState,
        connection: u64,
        topic: &str,
        message: &str,
        published_at: u64,
    ) {
        let params = SubscriptionParams {
            id: format!("{connection}:{topic}"),
            data: SubscriptionData {
                topic: topic.to_string(),
                message: message.to_string(),
                published_at,
            },
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };
        let request =
            JsonRpcRequest::with_id(relay_rpc_id(), self.methods.subscription.clone(), params);
        send_to(state, connection, request.into());
    }

    fn drop_connection(&self, connection: u64) {
        let mut state = self.lock();
        state.connections.remove(&connection);
        for subs in state.subscriptions.values_mut() {
            subs.remove(&connection);
        }
        state.subscriptions.retain(|_, subs| !subs.is_empty());
    }
}

fn send_to(state: &RelayState, connection: u64, payload: JsonRpcPayload) {
    let Some(tx) = state.connections.get(&connection) else {
        return;
    };
    match payload.to_json() {
        Ok(text) => {
            if tx.try_send(SocketEvent::Message(text)).is_err() {
                tracing::warn!(connection, "memory relay: client buffer full, frame dropped");
            }
        }
        Err(e) => tracing::warn!("memory relay: {e}"),
    }
}

fn invalid_params(id: u64, e: serde_json::Error) -> JsonRpcResponse {
    JsonRpcResponse::error(id, JsonRpcError::new(-32602, format!("invalid params: {e}")))
}

#[async_trait::async_trait]
impl Connector for MemoryRelay {
    async fn connect(&self, url: &Url) -> Result<RelaySocket, TransportError> {
        let (socket, peer) = RelaySocket::channel(1024);
        let connection = {
            let mut state = self.lock();
            if state.refuse_connections {
                return Err(TransportError::Connect {
                    url: url.to_string(),
                    source: anyhow::anyhow!("connection refused"),
                });
            }
            state.next_connection += 1;
            let connection = state.next_connection;
            state.connections.insert(connection, peer.events);
            connection
        };

        let relay = self.clone();
        let mut frames = peer.frames;
        tokio::spawn(async move {
            while let Some(text) = frames.recv().await {
                relay.handle_frame(connection, &text);
            }
            relay.drop_connection(connection);
        });

        Ok(socket)
    }
}
