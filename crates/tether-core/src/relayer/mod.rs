//! Relay client: one socket shared by the publisher and the subscriber.
//!
//! The relayer is pure state. Socket writes, timers and connection attempts
//! leave as [`Effect`]s; what the layers above need to know leaves as
//! [`RelayerEvent`]s. Both are buffered and drained by the runtime after
//! every step.
pub mod publisher;
pub mod subscriber;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tether_transport::{
    JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, RelayMethods, RpcOutcome, SubscriptionParams,
    TransportError,
};

use crate::messages::MessageCache;
use crate::runtime::effect::{Effect, TimerKey};
use crate::types::{RelayProtocolOptions, Topic};

use publisher::{PublishOpts, Publisher, PublisherAction, RetryPolicy};
use subscriber::{Subscriber, SubscriberAction, SubscriptionRecord, SubscriptionState};

/// Timing and sizing knobs for the relay client.
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub protocol: String,
    pub publish_timeout: Duration,
    pub subscribe_timeout: Duration,
    /// How long a message on a pending topic waits for the subscription.
    pub pending_resolution_timeout: Duration,
    /// Flat delay before reconnecting after a drop.
    pub reconnect_delay: Duration,
    /// Close an idle socket when nothing got subscribed after start.
    pub transport_cutoff: Duration,
    pub batch_subscribe_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            protocol: tether_transport::RELAYER_DEFAULT_PROTOCOL.to_string(),
            publish_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            pending_resolution_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            transport_cutoff: Duration::from_secs(10),
            batch_subscribe_limit: 500,
            retry: RetryPolicy::default(),
        }
    }
}

/// What the relayer reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayerEvent {
    /// A socket is wanted; the owner of the identity key builds the URL.
    OpenRequested,
    Connected,
    Disconnected,
    /// An inbound envelope on a subscribed topic, seen for the first time.
    Message {
        topic: Topic,
        message: String,
        published_at: u64,
    },
    Published { id: u64, topic: Topic },
    PublishFailed { id: u64, reason: String },
    PublishAbandoned { id: u64, topic: Topic, attempts: u32 },
    SubscriptionCreated(SubscriptionRecord),
    SubscriptionDeleted { id: String, topic: Topic },
    Resubscribed,
    ConnectionStalled,
    TransportClosed,
    Error(String),
}

#[derive(Debug, Clone)]
struct ParkedMessage {
    topic: Topic,
    message: String,
    published_at: u64,
}

pub struct Relayer {
    config: RelayerConfig,
    publisher: Publisher,
    subscriber: Subscriber,
    messages: MessageCache,

    connected: bool,
    connecting: bool,
    explicitly_closed: bool,
    online: bool,

    parked: BTreeMap<u64, ParkedMessage>,
    next_parked: u64,

    effects: Vec<Effect>,
    events: Vec<RelayerEvent>,
}

impl Relayer {
    pub fn new(config: RelayerConfig, client_id: String, custom_prefix: &str) -> Self {
        let methods = RelayMethods::for_protocol(&config.protocol);
        let publisher = Publisher::new(methods.clone(), config.publish_timeout, config.retry);
        let subscriber = Subscriber::new(
            methods,
            client_id,
            config.subscribe_timeout,
            config.batch_subscribe_limit,
            custom_prefix,
        );
        Self {
            config,
            publisher,
            subscriber,
            messages: MessageCache::new(),
            connected: false,
            connecting: false,
            explicitly_closed: false,
            online: true,
            parked: BTreeMap::new(),
            next_parked: 0,
            effects: Vec::new(),
            events: Vec::new(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn subscriber_mut(&mut self) -> &mut Subscriber {
        &mut self.subscriber
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn is_subscribed(&self, topic: &str) -> SubscriptionState {
        self.subscriber.is_subscribed(topic)
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn drain_events(&mut self) -> Vec<RelayerEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Connection management ───────────────────────────────────────

    /// Open the socket. The idle cutoff closes it again if nothing gets
    /// subscribed in time.
    pub fn start(&mut self) {
        self.transport_open();
        self.effects.push(Effect::Arm {
            key: TimerKey::TransportCutoff,
            after: self.config.transport_cutoff,
        });
    }

    /// Ask for a socket unless one is open or being opened.
    pub fn transport_open(&mut self) {
        if self.connected || self.connecting || !self.online {
            return;
        }
        self.connecting = true;
        self.explicitly_closed = false;
        self.events.push(RelayerEvent::OpenRequested);
    }

    /// Close the socket; no reconnect follows until the next open.
    pub fn transport_close(&mut self) {
        self.explicitly_closed = true;
        self.close_socket();
    }

    /// Close and reopen.
    pub fn restart_transport(&mut self) {
        if self.connecting {
            return;
        }
        tracing::info!("restarting relay transport");
        self.close_socket();
        self.explicitly_closed = false;
        self.transport_open();
    }

    fn close_socket(&mut self) {
        self.connecting = false;
        self.effects.push(Effect::Disarm(TimerKey::Reconnect));
        self.effects.push(Effect::Close);
        if self.connected {
            self.on_disconnected();
        }
    }

    /// Host network reachability changed.
    pub fn set_online(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        if online {
            tracing::info!("network back online, restarting transport");
            self.restart_transport();
        } else {
            tracing::info!("network offline, closing transport");
            self.transport_close();
        }
    }

    pub fn on_connected(&mut self, now: u64) {
        self.connecting = false;
        self.connected = true;
        tracing::info!("relay connected");
        self.events.push(RelayerEvent::Connected);

        let actions = self.subscriber.reset();
        self.apply_subscriber(actions);
        let actions = self.publisher.drain(now);
        self.apply_publisher(actions);
    }

    /// A connection attempt failed. Stalled attempts schedule a reconnect.
    pub fn on_connect_failed(&mut self, error: &TransportError) {
        self.connecting = false;
        if error.is_stalled() {
            tracing::warn!("relay connect stalled, retrying: {error}");
            self.schedule_reconnect();
        } else {
            tracing::warn!("relay connect failed: {error}");
            self.events.push(RelayerEvent::Error(error.to_string()));
        }
    }

    /// The relay closed the socket without an error.
    pub fn on_socket_closed(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        tracing::info!(%reason, "relay socket closed");
        self.on_disconnected();
        self.schedule_reconnect();
    }

    pub fn on_socket_error(&mut self, error: &TransportError) {
        if error.is_stalled() {
            tracing::warn!("relay socket stalled: {error}");
            self.effects.push(Effect::Close);
            if self.connected {
                self.on_disconnected();
            }
            self.schedule_reconnect();
        } else {
            tracing::warn!("relay socket error, closing: {error}");
            self.events.push(RelayerEvent::Error(error.to_string()));
            self.transport_close();
        }
    }

    fn on_disconnected(&mut self) {
        self.connected = false;
        let actions = self.subscriber.on_disable();
        self.apply_subscriber(actions);
        let actions = self.publisher.on_disconnected();
        self.apply_publisher(actions);
        self.events.push(RelayerEvent::Disconnected);
        self.events.push(RelayerEvent::TransportClosed);
    }

    fn schedule_reconnect(&mut self) {
        if self.explicitly_closed || !self.online {
            return;
        }
        self.effects.push(Effect::Arm {
            key: TimerKey::Reconnect,
            after: self.config.reconnect_delay,
        });
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Publish an already encoded envelope. Returns the relay request id.
    pub fn publish(&mut self, topic: &str, message: &str, opts: PublishOpts, now: u64) -> u64 {
        let (id, actions) = self
            .publisher
            .publish(topic, message, opts, self.connected, now);
        self.apply_publisher(actions);
        self.messages.set(topic, message);
        if !self.connected {
            self.transport_open();
        }
        id
    }

    /// Subscribe to `topic`. Returns the subscription id.
    pub fn subscribe(&mut self, topic: &str, relay: RelayProtocolOptions) -> String {
        let (id, actions) = self.subscriber.subscribe(topic, relay, self.connected);
        self.apply_subscriber(actions);
        if !self.connected {
            self.transport_open();
        }
        id
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        let actions = self.subscriber.unsubscribe(topic, self.connected);
        self.apply_subscriber(actions);
        self.messages.del(topic);
        self.drop_parked(topic);
    }

    // ── Timers and pulse ────────────────────────────────────────────

    pub fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Publish(id) => {
                let actions = self.publisher.on_timeout(id);
                self.apply_publisher(actions);
            }
            TimerKey::Subscribe(rpc_id) => {
                let actions = self.subscriber.on_timeout(rpc_id);
                self.apply_subscriber(actions);
            }
            TimerKey::Parked(n) => {
                if let Some(parked) = self.parked.remove(&n) {
                    tracing::debug!(topic = %parked.topic, "subscription never resolved, message dropped");
                }
            }
            TimerKey::Reconnect => {
                if !self.explicitly_closed && self.online {
                    self.transport_open();
                }
            }
            TimerKey::TransportCutoff => {
                if self.connected && !self.subscriber.has_any() {
                    tracing::info!("no subscriptions after start, closing idle transport");
                    self.close_socket();
                }
            }
        }
    }

    pub fn on_pulse(&mut self, now: u64) {
        let actions = self.publisher.on_pulse(self.connected, now);
        self.apply_publisher(actions);
        let actions = self.subscriber.check_pending(self.connected);
        self.apply_subscriber(actions);
    }

    // ── Inbound frames ──────────────────────────────────────────────

    pub fn on_frame(&mut self, text: &str) {
        let payload = match JsonRpcPayload::parse(text) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("unreadable relay frame: {e}");
                return;
            }
        };
        match payload {
            JsonRpcPayload::Request(request) => self.on_relay_request(request),
            JsonRpcPayload::Response(response) => self.on_relay_response(response),
        }
    }

    fn on_relay_request(&mut self, request: JsonRpcRequest) {
        if !RelayMethods::is_subscription(&request.method) {
            tracing::debug!(method = %request.method, "ignoring relay request");
            return;
        }
        if let Ok(ack) = JsonRpcResponse::result(request.id, json!(true)).to_json() {
            self.effects.push(Effect::Send(ack));
        }
        let params: SubscriptionParams = match serde_json::from_value(request.params) {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!("malformed subscription payload: {e}");
                return;
            }
        };
        let data = params.data;
        if data.message.is_empty() {
            tracing::debug!(topic = %data.topic, "empty message dropped");
            return;
        }
        match self.subscriber.is_subscribed(&data.topic) {
            SubscriptionState::Subscribed => {
                self.accept(data.topic, data.message, data.published_at)
            }
            SubscriptionState::Pending => self.park(ParkedMessage {
                topic: data.topic,
                message: data.message,
                published_at: data.published_at,
            }),
            SubscriptionState::NotSubscribed => {
                tracing::debug!(topic = %data.topic, "message on unsubscribed topic dropped");
            }
        }
    }

    fn accept(&mut self, topic: Topic, message: String, published_at: u64) {
        if self.messages.has(&topic, &message) {
            tracing::debug!(%topic, "duplicate message dropped");
            return;
        }
        self.messages.set(&topic, &message);
        self.events.push(RelayerEvent::Message {
            topic,
            message,
            published_at,
        });
    }

    fn park(&mut self, message: ParkedMessage) {
        self.next_parked += 1;
        let n = self.next_parked;
        tracing::debug!(topic = %message.topic, "subscription pending, message parked");
        self.parked.insert(n, message);
        self.effects.push(Effect::Arm {
            key: TimerKey::Parked(n),
            after: self.config.pending_resolution_timeout,
        });
    }

    fn release_parked(&mut self, topic: &str) {
        let ready: Vec<u64> = self
            .parked
            .iter()
            .filter(|(_, p)| p.topic == topic)
            .map(|(n, _)| *n)
            .collect();
        for n in ready {
            if let Some(parked) = self.parked.remove(&n) {
                self.effects.push(Effect::Disarm(TimerKey::Parked(n)));
                self.accept(parked.topic, parked.message, parked.published_at);
            }
        }
    }

    fn drop_parked(&mut self, topic: &str) {
        let stale: Vec<u64> = self
            .parked
            .iter()
            .filter(|(_, p)| p.topic == topic)
            .map(|(n, _)| *n)
            .collect();
        for n in stale {
            self.parked.remove(&n);
            self.effects.push(Effect::Disarm(TimerKey::Parked(n)));
        }
    }

    fn on_relay_response(&mut self, response: JsonRpcResponse) {
        let error = match &response.outcome {
            RpcOutcome::Result(_) => None,
            RpcOutcome::Error(e) => Some(e.message.clone()),
        };
        if self.publisher.owns(response.id) {
            let actions = self.publisher.on_ack(response.id, error);
            self.apply_publisher(actions);
        } else if self.subscriber.owns(response.id) {
            let actions = self.subscriber.on_ack(response.id, error);
            self.apply_subscriber(actions);
        } else {
            tracing::debug!(id = response.id, "response to unknown relay request");
        }
    }

    // ── Action plumbing ─────────────────────────────────────────────

    fn apply_publisher(&mut self, actions: Vec<PublisherAction>) {
        for action in actions {
            match action {
                PublisherAction::Send(frame) => self.effects.push(Effect::Send(frame)),
                PublisherAction::ArmTimeout { id, after } => self.effects.push(Effect::Arm {
                    key: TimerKey::Publish(id),
                    after,
                }),
                PublisherAction::DisarmTimeout(id) => {
                    self.effects.push(Effect::Disarm(TimerKey::Publish(id)))
                }
                PublisherAction::Published { id, topic } => {
                    self.events.push(RelayerEvent::Published { id, topic })
                }
                PublisherAction::Failed { id, reason } => {
                    self.events.push(RelayerEvent::PublishFailed { id, reason })
                }
                PublisherAction::Abandoned {
                    id,
                    topic,
                    attempts,
                } => self.events.push(RelayerEvent::PublishAbandoned {
                    id,
                    topic,
                    attempts,
                }),
                PublisherAction::Stalled => self.on_stalled(),
            }
        }
    }

    fn apply_subscriber(&mut self, actions: Vec<SubscriberAction>) {
        for action in actions {
            match action {
                SubscriberAction::Send(frame) => self.effects.push(Effect::Send(frame)),
                SubscriberAction::ArmTimeout { rpc_id, after } => self.effects.push(Effect::Arm {
                    key: TimerKey::Subscribe(rpc_id),
                    after,
                }),
                SubscriberAction::DisarmTimeout(rpc_id) => {
                    self.effects.push(Effect::Disarm(TimerKey::Subscribe(rpc_id)))
                }
                SubscriberAction::Created(record) => {
                    let topic = record.topic.clone();
                    self.events.push(RelayerEvent::SubscriptionCreated(record));
                    self.release_parked(&topic);
                }
                SubscriberAction::Deleted { id, topic } => {
                    self.events
                        .push(RelayerEvent::SubscriptionDeleted { id, topic })
                }
                SubscriberAction::Resubscribed => self.events.push(RelayerEvent::Resubscribed),
                SubscriberAction::Stalled => self.on_stalled(),
            }
        }
    }

    fn on_stalled(&mut self) {
        tracing::warn!("relay connection stalled");
        self.events.push(RelayerEvent::ConnectionStalled);
        self.restart_transport();
    }
}
