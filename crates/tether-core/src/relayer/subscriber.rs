//! Topic subscriptions: idempotent subscribe, batch restore after reconnect.
//!
//! A topic is either subscribed (acked, or recorded after a timeout),
//! pending (RPC sent or waiting for a connection), or cached (known from a
//! previous connection, to be batch-resubscribed by [`Subscriber::reset`]).
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_transport::{
    relay_rpc_id, BatchSubscribeParams, JsonRpcRequest, RelayMethods, SubscribeParams,
    UnsubscribeParams,
};

use crate::crypto::hash_hex;
use crate::store::{storage_key, Persisted, CORE_STORAGE_PREFIX};
use crate::types::{RelayProtocolOptions, Topic};
use crate::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub topic: Topic,
    pub relay: RelayProtocolOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribed,
    Pending,
    NotSubscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberAction {
    Send(String),
    ArmTimeout { rpc_id: u64, after: Duration },
    DisarmTimeout(u64),
    Created(SubscriptionRecord),
    Deleted { id: String, topic: Topic },
    /// A subscribe RPC went unanswered.
    Stalled,
    /// Every topic cached at disconnect has been subscribed again.
    Resubscribed,
}

/// `hex(sha256(topic ‖ client id))`.
pub fn subscription_id(topic: &str, client_id: &str) -> String {
    hash_hex(format!("{topic}{client_id}").as_bytes())
}

/// topic → subscription ids.
#[derive(Debug, Default, Clone)]
pub struct TopicMap {
    map: BTreeMap<Topic, Vec<String>>,
}

impl TopicMap {
    pub fn set(&mut self, topic: &str, id: &str) {
        let ids = self.map.entry(topic.to_string()).or_default();
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }

    pub fn get(&self, topic: &str) -> &[String] {
        self.map.get(topic).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn exists(&self, topic: &str, id: &str) -> bool {
        self.get(topic).iter().any(|existing| existing == id)
    }

    pub fn delete(&mut self, topic: &str, id: Option<&str>) {
        match id {
            Some(id) => {
                if let Some(ids) = self.map.get_mut(topic) {
                    ids.retain(|existing| existing != id);
                    if ids.is_empty() {
                        self.map.remove(topic);
                    }
                }
            }
            None => {
                self.map.remove(topic);
            }
        }
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.map.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[derive(Debug, Clone)]
struct PendingSubscription {
    id: String,
    relay: RelayProtocolOptions,
    /// RPC written to the relay; unsent ones go out on the next pulse.
    sent: bool,
}

#[derive(Debug, Clone)]
enum InFlight {
    Single { topic: Topic },
    Batch { topics: Vec<Topic>, restore: bool },
    Unsubscribe,
}

pub struct Subscriber {
    methods: RelayMethods,
    client_id: String,
    timeout: Duration,
    batch_limit: usize,
    storage_key: String,
    subscriptions: BTreeMap<String, SubscriptionRecord>,
    topic_map: TopicMap,
    pending: BTreeMap<Topic, PendingSubscription>,
    in_flight: HashMap<u64, InFlight>,
    cached: BTreeMap<String, SubscriptionRecord>,
    restores_outstanding: usize,
    dirty: bool,
}

impl Subscriber {
    pub fn new(
        methods: RelayMethods,
        client_id: String,
        timeout: Duration,
        batch_limit: usize,
        custom_prefix: &str,
    ) -> Self {
        Self {
            methods,
            client_id,
            timeout,
            batch_limit: batch_limit.max(1),
            storage_key: storage_key(CORE_STORAGE_PREFIX, custom_prefix, "subscription"),
            subscriptions: BTreeMap::new(),
            topic_map: TopicMap::default(),
            pending: BTreeMap::new(),
            in_flight: HashMap::new(),
            cached: BTreeMap::new(),
            restores_outstanding: 0,
            dirty: false,
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> SubscriptionState {
        if !self.topic_map.get(topic).is_empty() {
            SubscriptionState::Subscribed
        } else if self.pending.contains_key(topic)
            || self.cached.values().any(|r| r.topic == topic)
        {
            SubscriptionState::Pending
        } else {
            SubscriptionState::NotSubscribed
        }
    }

    /// Subscribe once per topic. Returns the subscription id.
    pub fn subscribe(
        &mut self,
        topic: &str,
        relay: RelayProtocolOptions,
        connected: bool,
    ) -> (String, Vec<SubscriberAction>) {
        if let Some(id) = self.topic_map.get(topic).first() {
            return (id.clone(), Vec::new());
        }
        if let Some(pending) = self.pending.get(topic) {
            return (pending.id.clone(), Vec::new());
        }
        if let Some(cached) = self.cached.values().find(|r| r.topic == topic) {
            return (cached.id.clone(), Vec::new());
        }

        let id = subscription_id(topic, &self.client_id);
        self.pending.insert(
            topic.to_string(),
            PendingSubscription {
                id: id.clone(),
                relay,
                sent: connected,
            },
        );

        let mut actions = Vec::new();
        if connected {
            self.send_subscribe(topic, &mut actions);
        } else {
            tracing::debug!(%topic, "relay offline, subscription pending");
        }
        (id, actions)
    }

    fn send_subscribe(&mut self, topic: &str, actions: &mut Vec<SubscriberAction>) {
        let rpc_id = relay_rpc_id();
        let params = SubscribeParams {
            topic: topic.to_string(),
        };
        if let Some(frame) = frame(rpc_id, &self.methods.subscribe, params) {
            actions.push(SubscriberAction::Send(frame));
            actions.push(SubscriberAction::ArmTimeout {
                rpc_id,
                after: self.timeout,
            });
            self.in_flight.insert(
                rpc_id,
                InFlight::Single {
                    topic: topic.to_string(),
                },
            );
        }
    }

    fn send_batch(&mut self, topics: Vec<Topic>, restore: bool, actions: &mut Vec<SubscriberAction>) {
        for chunk in topics.chunks(self.batch_limit) {
            let rpc_id = relay_rpc_id();
            let params = BatchSubscribeParams {
                topics: chunk.to_vec(),
            };
            if let Some(frame) = frame(rpc_id, &self.methods.batch_subscribe, params) {
                actions.push(SubscriberAction::Send(frame));
                actions.push(SubscriberAction::ArmTimeout {
                    rpc_id,
                    after: self.timeout,
                });
                if restore {
                    self.restores_outstanding += 1;
                }
                self.in_flight.insert(
                    rpc_id,
                    InFlight::Batch {
                        topics: chunk.to_vec(),
                        restore,
                    },
                );
            }
        }
    }

    pub fn owns(&self, rpc_id: u64) -> bool {
        self.in_flight.contains_key(&rpc_id)
    }

    /// Relay response to a subscribe, batch subscribe or unsubscribe RPC.
    pub fn on_ack(&mut self, rpc_id: u64, error: Option<String>) -> Vec<SubscriberAction> {
        let Some(request) = self.in_flight.remove(&rpc_id) else {
            return Vec::new();
        };
        let mut actions = vec![SubscriberAction::DisarmTimeout(rpc_id)];
        if let Some(reason) = &error {
            tracing::warn!(rpc_id, %reason, "relay rejected subscription request");
        }
        match request {
            InFlight::Unsubscribe => {}
            InFlight::Single { topic } => {
                if error.is_some() {
                    // Retried on the next pulse.
                    if let Some(pending) = self.pending.get_mut(&topic) {
                        pending.sent = false;
                    }
                } else {
                    self.on_subscribed(&topic, &mut actions);
                }
            }
            InFlight::Batch { topics, restore } => {
                for topic in &topics {
                    if error.is_some() {
                        if let Some(pending) = self.pending.get_mut(topic) {
                            pending.sent = false;
                        }
                    } else {
                        self.on_subscribed(topic, &mut actions);
                    }
                }
                if restore {
                    self.restore_done(&mut actions);
                }
            }
        }
        actions
    }

    /// A subscribe RPC went unanswered. The subscription is recorded anyway.
    pub fn on_timeout(&mut self, rpc_id: u64) -> Vec<SubscriberAction> {
        let Some(request) = self.in_flight.remove(&rpc_id) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        match request {
            InFlight::Unsubscribe => return actions,
            InFlight::Single { topic } => {
                tracing::warn!(%topic, "subscribe timed out");
                self.on_subscribed(&topic, &mut actions);
            }
            InFlight::Batch { topics, restore } => {
                tracing::warn!(count = topics.len(), "batch subscribe timed out");
                for topic in &topics {
                    self.on_subscribed(topic, &mut actions);
                }
                if restore {
                    self.restore_done(&mut actions);
                }
            }
        }
        actions.push(SubscriberAction::Stalled);
        actions
    }

    fn restore_done(&mut self, actions: &mut Vec<SubscriberAction>) {
        self.restores_outstanding = self.restores_outstanding.saturating_sub(1);
        if self.restores_outstanding == 0 {
            actions.push(SubscriberAction::Resubscribed);
        }
    }

    fn on_subscribed(&mut self, topic: &str, actions: &mut Vec<SubscriberAction>) {
        let Some(pending) = self.pending.remove(topic) else {
            return;
        };
        let record = SubscriptionRecord {
            id: pending.id,
            topic: topic.to_string(),
            relay: pending.relay,
        };
        self.topic_map.set(topic, &record.id);
        self.subscriptions.insert(record.id.clone(), record.clone());
        self.dirty = true;
        actions.push(SubscriberAction::Created(record));
    }

    /// Drop every subscription for `topic`, telling the relay when connected.
    pub fn unsubscribe(&mut self, topic: &str, connected: bool) -> Vec<SubscriberAction> {
        let mut actions = Vec::new();
        self.pending.remove(topic);

        let cached: Vec<String> = self
            .cached
            .values()
            .filter(|r| r.topic == topic)
            .map(|r| r.id.clone())
            .collect();
        for id in cached {
            self.cached.remove(&id);
            self.dirty = true;
        }

        let ids = self.topic_map.get(topic).to_vec();
        for id in ids {
            if connected {
                let rpc_id = relay_rpc_id();
                let params = UnsubscribeParams {
                    topic: topic.to_string(),
                    id: id.clone(),
                };
                if let Some(frame) = frame(rpc_id, &self.methods.unsubscribe, params) {
                    actions.push(SubscriberAction::Send(frame));
                    self.in_flight.insert(rpc_id, InFlight::Unsubscribe);
                }
            }
            self.subscriptions.remove(&id);
            self.topic_map.delete(topic, Some(&id));
            self.dirty = true;
            actions.push(SubscriberAction::Deleted {
                id,
                topic: topic.to_string(),
            });
        }
        actions
    }

    /// Transport closed: cache everything, clear locally. Nothing is sent.
    pub fn on_disable(&mut self) -> Vec<SubscriberAction> {
        let mut actions = Vec::new();
        for (rpc_id, request) in self.in_flight.drain() {
            actions.push(SubscriberAction::DisarmTimeout(rpc_id));
            let topics = match request {
                InFlight::Single { topic } => vec![topic],
                InFlight::Batch { topics, .. } => topics,
                InFlight::Unsubscribe => Vec::new(),
            };
            for topic in topics {
                if let Some(pending) = self.pending.get_mut(&topic) {
                    pending.sent = false;
                }
            }
        }
        self.restores_outstanding = 0;

        let current = std::mem::take(&mut self.subscriptions);
        self.cached.extend(current);
        self.topic_map.clear();
        actions
    }

    /// After reconnect: batch-resubscribe cached topics and unsent pending ones.
    pub fn reset(&mut self) -> Vec<SubscriberAction> {
        let mut actions = Vec::new();
        for (_, record) in std::mem::take(&mut self.cached) {
            self.pending
                .entry(record.topic.clone())
                .or_insert(PendingSubscription {
                    id: record.id,
                    relay: record.relay,
                    sent: false,
                });
        }
        let topics = self.take_unsent();
        if topics.is_empty() {
            actions.push(SubscriberAction::Resubscribed);
            return actions;
        }
        tracing::info!(count = topics.len(), "restoring subscriptions");
        self.send_batch(topics, true, &mut actions);
        actions
    }

    /// Pulse: subscribe whatever never reached the relay.
    pub fn check_pending(&mut self, connected: bool) -> Vec<SubscriberAction> {
        let mut actions = Vec::new();
        if !connected {
            return actions;
        }
        let topics = self.take_unsent();
        if !topics.is_empty() {
            self.send_batch(topics, false, &mut actions);
        }
        actions
    }

    fn take_unsent(&mut self) -> Vec<Topic> {
        self.pending
            .iter_mut()
            .filter(|(_, p)| !p.sent)
            .map(|(topic, p)| {
                p.sent = true;
                topic.clone()
            })
            .collect()
    }

    /// Subscribed topics.
    pub fn topics(&self) -> Vec<Topic> {
        self.topic_map.topics()
    }

    pub fn ids(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&SubscriptionRecord> {
        self.subscriptions.get(id)
    }

    /// Whether any topic is subscribed, pending or cached.
    pub fn has_any(&self) -> bool {
        !self.subscriptions.is_empty() || !self.pending.is_empty() || !self.cached.is_empty()
    }

    pub fn has_cached(&self) -> bool {
        !self.cached.is_empty()
    }
}

fn frame(rpc_id: u64, method: &str, params: impl Serialize) -> Option<String> {
    let params = serde_json::to_value(params).ok()?;
    JsonRpcRequest::with_id(rpc_id, method, params).to_json().ok()
}

impl Persisted for Subscriber {
    fn storage_key(&self) -> &str {
        &self.storage_key
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Current and cached subscriptions together.
    fn snapshot(&self) -> Result<Value, ProtocolError> {
        let mut all: BTreeMap<&String, &SubscriptionRecord> = self.cached.iter().collect();
        all.extend(self.subscriptions.iter());
        Ok(serde_json::to_value(all)?)
    }

    /// Restored subscriptions land in the cache until the first connection.
    fn restore(&mut self, value: Value) -> Result<(), ProtocolError> {
        let records: BTreeMap<String, SubscriptionRecord> = serde_json::from_value(value)
            .map_err(|e| ProtocolError::Storage(format!("restore subscription failed: {e}")))?;
        tracing::debug!(count = records.len(), "restored subscriptions");
        self.cached = records;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber() -> Subscriber {
        Subscriber::new(
            RelayMethods::default(),
            "did:key:zclient".into(),
            Duration::from_secs(10),
            2,
            "",
        )
    }

    fn frames(actions: &[SubscriberAction]) -> Vec<serde_json::Value> {
        actions
            .iter()
            .filter_map(|a| match a {
                SubscriberAction::Send(f) => Some(serde_json::from_str(f).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn rpc_id(actions: &[SubscriberAction]) -> u64 {
        frames(actions)[0]["id"].as_u64().unwrap()
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut s = subscriber();
        let (id, actions) = s.subscribe("t1", RelayProtocolOptions::default(), true);
        assert_eq!(id, subscription_id("t1", "did:key:zclient"));
        assert_eq!(frames(&actions).len(), 1);
        assert_eq!(frames(&actions)[0]["method"], "irn_subscribe");

        let (again, actions) = s.subscribe("t1", RelayProtocolOptions::default(), true);
        assert_eq!(again, id);
        assert!(actions.is_empty());
        assert_eq!(s.is_subscribed("t1"), SubscriptionState::Pending);
    }

    #[test]
    fn ack_creates_subscription() {
        let mut s = subscriber();
        let (id, actions) = s.subscribe("t1", RelayProtocolOptions::default(), true);
        let rpc = rpc_id(&actions);

        let actions = s.on_ack(rpc, None);
        assert!(actions.iter().any(
            |a| matches!(a, SubscriberAction::Created(r) if r.id == id && r.topic == "t1")
        ));
        assert_eq!(s.is_subscribed("t1"), SubscriptionState::Subscribed);
        assert!(s.is_dirty());
    }

    #[test]
    fn timeout_records_and_stalls() {
        let mut s = subscriber();
        let (_, actions) = s.subscribe("t1", RelayProtocolOptions::default(), true);
        let actions = s.on_timeout(rpc_id(&actions));
        assert!(actions.contains(&SubscriberAction::Stalled));
        assert_eq!(s.is_subscribed("t1"), SubscriptionState::Subscribed);
    }

    #[test]
    fn offline_subscribe_goes_out_on_pulse() {
        let mut s = subscriber();
        let (_, actions) = s.subscribe("t1", RelayProtocolOptions::default(), false);
        assert!(actions.is_empty());
        assert!(s.check_pending(false).is_empty());

        let actions = s.check_pending(true);
        let sent = frames(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["method"], "irn_batchSubscribe");
        assert_eq!(sent[0]["params"]["topics"], serde_json::json!(["t1"]));
        assert!(s.check_pending(true).is_empty());
    }

    #[test]
    fn disable_then_reset_resubscribes_in_one_batch() {
        let mut s = subscriber();
        for topic in ["t1", "t2"] {
            let (_, actions) = s.subscribe(topic, RelayProtocolOptions::default(), true);
            s.on_ack(rpc_id(&actions), None);
        }

        s.on_disable();
        assert!(s.topics().is_empty());
        assert_eq!(s.is_subscribed("t1"), SubscriptionState::Pending);

        let actions = s.reset();
        let sent = frames(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["params"]["topics"], serde_json::json!(["t1", "t2"]));

        let actions = s.on_ack(sent[0]["id"].as_u64().unwrap(), None);
        assert!(actions.contains(&SubscriberAction::Resubscribed));
        assert_eq!(s.topics(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn batches_are_chunked() {
        let mut s = subscriber();
        for topic in ["a", "b", "c"] {
            s.subscribe(topic, RelayProtocolOptions::default(), false);
        }
        let actions = s.check_pending(true);
        assert_eq!(frames(&actions).len(), 2);
    }

    #[test]
    fn unsubscribe_sends_and_deletes() {
        let mut s = subscriber();
        let (id, actions) = s.subscribe("t1", RelayProtocolOptions::default(), true);
        s.on_ack(rpc_id(&actions), None);

        let actions = s.unsubscribe("t1", true);
        let sent = frames(&actions);
        assert_eq!(sent[0]["method"], "irn_unsubscribe");
        assert_eq!(sent[0]["params"]["id"], id.as_str());
        assert!(actions.contains(&SubscriberAction::Deleted {
            id,
            topic: "t1".into()
        }));
        assert_eq!(s.is_subscribed("t1"), SubscriptionState::NotSubscribed);
    }

    #[test]
    fn snapshot_includes_cache_and_restore_fills_cache() {
        let mut s = subscriber();
        let (_, actions) = s.subscribe("t1", RelayProtocolOptions::default(), true);
        s.on_ack(rpc_id(&actions), None);
        s.on_disable();
        let (_, actions) = s.subscribe("t2", RelayProtocolOptions::default(), true);
        s.on_ack(rpc_id(&actions), None);

        let snap = s.snapshot().unwrap();
        assert_eq!(snap.as_object().unwrap().len(), 2);

        let mut restored = subscriber();
        restored.restore(snap).unwrap();
        assert!(restored.has_cached());
        assert!(restored.topics().is_empty());
        let actions = restored.reset();
        assert_eq!(frames(&actions)[0]["params"]["topics"].as_array().unwrap().len(), 2);
    }
}
