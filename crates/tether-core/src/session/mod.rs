//! Session engine.
//!
//! `proposed → settled(unacknowledged) → acknowledged → (update|extend|ping|request|event)* → deleted|expired`
//!
//! Every operation borrows [`Pairing`] and [`Services`] from the runtime
//! state; nothing here touches the socket directly.
pub mod namespaces;
mod queue;
pub mod types;

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tether_transport::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcOutcome};
use tokio::sync::oneshot;

use crate::expirer::ExpirerTarget;
use crate::pairing::Pairing;
use crate::rpc::{RpcMethod, SdkError};
use crate::runtime::ClientEvent;
use crate::services::{PublishHook, Reply, RequestOptions, Services};
use crate::store::{storage_key, Persisted, Store, CLIENT_STORAGE_PREFIX};
use crate::types::{
    calc_expiry, is_expired, Metadata, Participant, RelayProtocolOptions, Topic, FIVE_MINUTES,
    SEVEN_DAYS,
};
use crate::ProtocolError;

use namespaces::{
    check_conforming, is_chain_granted, is_event_granted, is_method_granted, validate_namespaces,
    validate_required,
};
use queue::RequestQueue;
use types::*;

/// Bounds for the responder's answer window on `request`, in seconds.
pub const REQUEST_EXPIRY_MIN: u64 = FIVE_MINUTES;
pub const REQUEST_EXPIRY_MAX: u64 = SEVEN_DAYS;

pub(crate) type Waiter = oneshot::Receiver<Result<Value, ProtocolError>>;

/// Result of [`SessionEngine::connect`].
#[derive(Debug)]
pub(crate) struct Connected {
    /// Set when a fresh pairing was created for this proposal.
    pub uri: Option<String>,
    pub pairing_topic: Topic,
    pub proposal_id: u64,
    /// Resolves with the settled session.
    pub approval: Waiter,
}

/// Result of [`SessionEngine::approve`].
#[derive(Debug)]
pub(crate) struct Approved {
    pub topic: Topic,
    /// Resolves with the session once the proposer acknowledges the settle.
    pub acknowledged: Waiter,
}

/// Result of [`SessionEngine::request`].
#[derive(Debug)]
pub(crate) struct SentSessionRequest {
    pub id: u64,
    pub response: Waiter,
    pub timeout: Duration,
}

/// Proposer-side state between the propose response and the settle request.
#[derive(Debug, Clone)]
struct PendingSettle {
    proposal_id: u64,
    /// Proposal expiry, carried over so the wait stays bounded on the loop.
    expiry: u64,
    pairing_topic: Topic,
    self_public_key: String,
    required_namespaces: RequiredNamespaces,
    optional_namespaces: RequiredNamespaces,
}

pub struct SessionEngine {
    metadata: Metadata,
    sessions: Store<SessionRecord>,
    proposals: Store<ProposalRecord>,
    requests: Store<PendingRequestRecord>,
    queue: RequestQueue,
    /// Proposer: proposal id → `connect` caller.
    approvals: HashMap<u64, Reply<Value>>,
    /// Responder: session topic → `approve` caller.
    acknowledgements: HashMap<Topic, Reply<Value>>,
    awaiting_settle: HashMap<Topic, PendingSettle>,
    /// Last accepted id per `(topic, kind)` for ordered inbound methods.
    last_accepted: HashMap<(Topic, String), u64>,
}

fn parse_params<T: DeserializeOwned>(request: &JsonRpcRequest, context: &str) -> Result<T, ProtocolError> {
    serde_json::from_value(request.params.clone())
        .map_err(|e| ProtocolError::MissingOrInvalid(format!("{context} params: {e}")))
}

fn settle_reply(tx: Reply<Value>, outcome: Result<&SessionRecord, ProtocolError>) {
    let outcome = outcome.and_then(|session| Ok(serde_json::to_value(session)?));
    // The caller may have stopped waiting.
    let _ = tx.send(outcome);
}

fn outcome_of(response: &JsonRpcResponse) -> Result<Value, ProtocolError> {
    match &response.outcome {
        RpcOutcome::Result(value) => Ok(value.clone()),
        RpcOutcome::Error(e) => Err(e.clone().into()),
    }
}

impl SessionEngine {
    pub fn new(metadata: Metadata, custom_prefix: &str) -> Self {
        let key = |name| storage_key(CLIENT_STORAGE_PREFIX, custom_prefix, name);
        Self {
            metadata,
            sessions: Store::new("session", key("session")),
            proposals: Store::new("proposal", key("proposal")),
            requests: Store::new("request", key("request")),
            queue: RequestQueue::default(),
            approvals: HashMap::new(),
            acknowledgements: HashMap::new(),
            awaiting_settle: HashMap::new(),
            last_accepted: HashMap::new(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn session(&self, topic: &str) -> Option<&SessionRecord> {
        self.sessions.get(topic).ok()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.values().cloned().collect()
    }

    pub fn proposals(&self) -> Vec<ProposalRecord> {
        self.proposals.values().cloned().collect()
    }

    pub fn get_pending_session_requests(&self) -> Vec<PendingRequestRecord> {
        self.requests.values().cloned().collect()
    }

    /// Sessions whose grants cover `required`.
    pub fn find(&self, required: &RequiredNamespaces) -> Vec<SessionRecord> {
        self.sessions
            .values()
            .filter(|s| check_conforming(required, &s.namespaces, "find()").is_ok())
            .cloned()
            .collect()
    }

    pub(crate) fn persisted_mut(&mut self) -> [&mut dyn Persisted; 3] {
        [&mut self.sessions, &mut self.proposals, &mut self.requests]
    }

    /// Re-queue pending requests loaded from storage.
    pub(crate) fn on_restored(&mut self, services: &mut Services) {
        let mut ids: Vec<u64> = self.requests.values().map(|r| r.id).collect();
        ids.sort_unstable();
        for id in ids {
            self.queue.push(id);
        }
        self.process_queue(services);
    }

    // ── Proposer operations ─────────────────────────────────────────

    pub(crate) fn connect(
        &mut self,
        pairing: &mut Pairing,
        services: &mut Services,
        params: ConnectParams,
    ) -> Result<Connected, ProtocolError> {
        validate_required(&params.required_namespaces, "connect()")?;
        validate_required(&params.optional_namespaces, "connect()")?;

        let reusable = params
            .pairing_topic
            .as_deref()
            .filter(|topic| pairing.get(topic).is_some_and(|p| p.active));
        let (pairing_topic, uri) = match reusable {
            Some(topic) => (topic.to_string(), None),
            None => {
                let created = pairing.create(services)?;
                (created.topic, Some(created.uri))
            }
        };

        let public_key = services.crypto.generate_key_pair();
        let relays = params
            .relays
            .unwrap_or_else(|| vec![RelayProtocolOptions::default()]);
        let proposer = Participant {
            public_key,
            metadata: self.metadata.clone(),
        };
        let propose = ProposeParams {
            relays: relays.clone(),
            proposer: proposer.clone(),
            required_namespaces: params.required_namespaces.clone(),
            optional_namespaces: params.optional_namespaces.clone(),
        };
        let sent = services.send_request(
            &pairing_topic,
            RpcMethod::SessionPropose,
            serde_json::to_value(&propose)?,
            RequestOptions::default(),
        )?;

        let expiry = calc_expiry(FIVE_MINUTES);
        self.proposals.set(
            sent.id.to_string(),
            ProposalRecord {
                id: sent.id,
                expiry,
                relays,
                proposer,
                required_namespaces: params.required_namespaces,
                optional_namespaces: params.optional_namespaces,
                pairing_topic: pairing_topic.clone(),
            },
        );
        services.set_expiry(ExpirerTarget::Id(sent.id), expiry);

        let (tx, rx) = oneshot::channel();
        self.approvals.insert(sent.id, tx);
        tracing::debug!(%pairing_topic, id = sent.id, "session proposed");
        Ok(Connected {
            uri,
            pairing_topic,
            proposal_id: sent.id,
            approval: rx,
        })
    }

    // ── Responder operations ────────────────────────────────────────

    pub(crate) fn approve(
        &mut self,
        pairing: &mut Pairing,
        services: &mut Services,
        params: ApproveParams,
    ) -> Result<Approved, ProtocolError> {
        let proposal = self.valid_proposal(services, params.id)?;
        validate_namespaces(&params.namespaces, "approve()")?;
        check_conforming(&proposal.required_namespaces, &params.namespaces, "approve()")?;
        if params.relay_protocol.as_deref().is_some_and(str::is_empty) {
            return Err(ProtocolError::MissingOrInvalid("approve() relayProtocol: ".into()));
        }

        let self_public_key = services.crypto.generate_key_pair();
        let topic = services.crypto.generate_shared_key(
            &self_public_key,
            &proposal.proposer.public_key,
            None,
        )?;
        let relay = RelayProtocolOptions {
            protocol: params
                .relay_protocol
                .unwrap_or_else(|| RelayProtocolOptions::default().protocol),
            data: None,
        };

        let result = ProposeResult {
            relay: relay.clone(),
            responder_public_key: self_public_key.clone(),
        };
        services.send_result(params.id, &proposal.pairing_topic, serde_json::to_value(&result)?)?;
        self.delete_proposal(services, params.id);
        if let Err(e) = pairing.activate(services, &proposal.pairing_topic) {
            tracing::warn!(pairing_topic = %proposal.pairing_topic, "cannot activate pairing: {e}");
        }
        services.subscribe(&topic, relay.clone());

        let controller = Participant {
            public_key: self_public_key.clone(),
            metadata: self.metadata.clone(),
        };
        let expiry = calc_expiry(SEVEN_DAYS);
        let settle = SettleParams {
            relay: relay.clone(),
            namespaces: params.namespaces.clone(),
            required_namespaces: proposal.required_namespaces.clone(),
            optional_namespaces: proposal.optional_namespaces.clone(),
            pairing_topic: Some(proposal.pairing_topic.clone()),
            controller: controller.clone(),
            expiry,
        };
        let sent = services.send_request(
            &topic,
            RpcMethod::SessionSettle,
            serde_json::to_value(&settle)?,
            RequestOptions {
                hard_fail: true,
                ..RequestOptions::default()
            },
        )?;
        services.hook(sent.relay_id, PublishHook::Settle { topic: topic.clone() });

        self.sessions.set(
            topic.clone(),
            SessionRecord {
                topic: topic.clone(),
                pairing_topic: proposal.pairing_topic,
                relay,
                expiry,
                acknowledged: false,
                controller: self_public_key,
                namespaces: params.namespaces,
                required_namespaces: proposal.required_namespaces,
                optional_namespaces: proposal.optional_namespaces,
                self_: controller,
                peer: proposal.proposer,
            },
        );
        services.set_expiry(ExpirerTarget::Topic(topic.clone()), expiry);

        let (tx, rx) = oneshot::channel();
        self.acknowledgements.insert(topic.clone(), tx);
        tracing::info!(%topic, "session approved");
        Ok(Approved {
            topic,
            acknowledged: rx,
        })
    }

    pub(crate) fn reject(
        &mut self,
        services: &mut Services,
        id: u64,
        reason: JsonRpcError,
    ) -> Result<(), ProtocolError> {
        let proposal = self.valid_proposal(services, id)?;
        services.send_error(id, &proposal.pairing_topic, reason)?;
        self.delete_proposal(services, id);
        Ok(())
    }

    pub(crate) fn respond(
        &mut self,
        services: &mut Services,
        topic: &str,
        response: JsonRpcResponse,
    ) -> Result<(), ProtocolError> {
        self.valid_session(services, topic)?;
        let id = response.id;
        match response.outcome {
            RpcOutcome::Result(value) => services.send_result(id, topic, value)?,
            RpcOutcome::Error(error) => services.send_error(id, topic, error)?,
        };
        self.delete_pending_request(services, id);
        self.process_queue(services);
        Ok(())
    }

    // ── Either side ─────────────────────────────────────────────────

    pub(crate) fn update(
        &mut self,
        services: &mut Services,
        topic: &str,
        namespaces: Namespaces,
    ) -> Result<Waiter, ProtocolError> {
        self.valid_session(services, topic)?;
        let session = self.sessions.get(topic)?;
        if !session.is_controller() {
            return Err(ProtocolError::Unauthorized(format!("update() controller: {topic}")));
        }
        validate_namespaces(&namespaces, "update()")?;
        check_conforming(&session.required_namespaces, &namespaces, "update()")?;

        let params = UpdateParams {
            namespaces: namespaces.clone(),
        };
        let sent = services.send_request(
            topic,
            RpcMethod::SessionUpdate,
            serde_json::to_value(&params)?,
            RequestOptions::default(),
        )?;
        self.sessions.get_mut(topic)?.namespaces = namespaces;
        Ok(services.waiter(RpcMethod::SessionUpdate, sent.id))
    }

    pub(crate) fn extend(&mut self, services: &mut Services, topic: &str) -> Result<Waiter, ProtocolError> {
        self.valid_session(services, topic)?;
        if !self.sessions.get(topic)?.is_controller() {
            return Err(ProtocolError::Unauthorized(format!("extend() controller: {topic}")));
        }
        let expiry = calc_expiry(SEVEN_DAYS);
        let sent = services.send_request(
            topic,
            RpcMethod::SessionExtend,
            serde_json::to_value(ExtendParams { expiry })?,
            RequestOptions::default(),
        )?;
        self.set_session_expiry(services, topic, expiry)?;
        Ok(services.waiter(RpcMethod::SessionExtend, sent.id))
    }

    pub(crate) fn request(
        &mut self,
        services: &mut Services,
        params: RequestParams,
    ) -> Result<SentSessionRequest, ProtocolError> {
        let RequestParams {
            topic,
            mut request,
            chain_id,
            expiry,
        } = params;
        self.valid_session(services, &topic)?;
        let namespaces = &self.sessions.get(&topic)?.namespaces;
        if !is_chain_granted(namespaces, &chain_id) {
            return Err(ProtocolError::MissingOrInvalid(format!("request() chainId: {chain_id}")));
        }
        if request.method.is_empty() {
            return Err(ProtocolError::MissingOrInvalid("request() method is empty".into()));
        }
        if !is_method_granted(namespaces, &chain_id, &request.method) {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "request() method: {}",
                request.method
            )));
        }
        if let Some(expiry) = expiry {
            if !(REQUEST_EXPIRY_MIN..=REQUEST_EXPIRY_MAX).contains(&expiry) {
                return Err(ProtocolError::MissingOrInvalid(format!(
                    "request() expiry: {expiry}. Expiry must be a number (in seconds) between {REQUEST_EXPIRY_MIN} and {REQUEST_EXPIRY_MAX}"
                )));
            }
        }

        let ttl = expiry.unwrap_or(FIVE_MINUTES);
        request.expiry_timestamp = Some(calc_expiry(ttl));
        let wire = SessionRequestParams {
            request: request.clone(),
            chain_id: chain_id.clone(),
        };
        let sent = services.send_request(
            &topic,
            RpcMethod::SessionRequest,
            serde_json::to_value(&wire)?,
            RequestOptions {
                ttl: Some(ttl),
                chain_id: Some(chain_id.clone()),
                hard_fail: true,
            },
        )?;
        services.hook(
            sent.relay_id,
            PublishHook::Request {
                method: RpcMethod::SessionRequest,
                id: sent.id,
            },
        );
        let response = services.waiter(RpcMethod::SessionRequest, sent.id);
        services.emit(ClientEvent::SessionRequestSent {
            id: sent.id,
            topic,
            request,
            chain_id,
        });
        Ok(SentSessionRequest {
            id: sent.id,
            response,
            timeout: Duration::from_secs(ttl),
        })
    }

    /// Ping a session, or the pairing when `topic` is one.
    pub(crate) fn ping(
        &mut self,
        pairing: &mut Pairing,
        services: &mut Services,
        topic: &str,
    ) -> Result<Waiter, ProtocolError> {
        if self.sessions.has(topic) {
            self.valid_session(services, topic)?;
            let sent = services.send_request(topic, RpcMethod::SessionPing, json!({}), RequestOptions::default())?;
            return Ok(services.waiter(RpcMethod::SessionPing, sent.id));
        }
        if pairing.exists(topic) {
            return pairing.ping(services, topic);
        }
        Err(ProtocolError::NoMatchingKey(format!("ping() topic doesn't exist: {topic}")))
    }

    /// Returns the relay id of the event publish.
    pub(crate) fn emit(
        &mut self,
        services: &mut Services,
        topic: &str,
        event: SessionEventData,
        chain_id: String,
    ) -> Result<u64, ProtocolError> {
        self.valid_session(services, topic)?;
        let namespaces = &self.sessions.get(topic)?.namespaces;
        if !is_chain_granted(namespaces, &chain_id) {
            return Err(ProtocolError::MissingOrInvalid(format!("emit() chainId: {chain_id}")));
        }
        if event.name.is_empty() || !is_event_granted(namespaces, &chain_id, &event.name) {
            return Err(ProtocolError::MissingOrInvalid(format!("emit() event: {}", event.name)));
        }
        let params = EventParams { event, chain_id };
        let sent = services.send_request(
            topic,
            RpcMethod::SessionEvent,
            serde_json::to_value(&params)?,
            RequestOptions::default(),
        )?;
        Ok(sent.relay_id)
    }

    /// Tear down a session, or the pairing when `topic` is one.
    pub(crate) fn disconnect(
        &mut self,
        pairing: &mut Pairing,
        services: &mut Services,
        topic: &str,
    ) -> Result<(), ProtocolError> {
        if self.sessions.has(topic) {
            self.valid_session(services, topic)?;
            let reason = serde_json::to_value(SdkError::UserDisconnected.payload(None))?;
            services.send_request(topic, RpcMethod::SessionDelete, reason, RequestOptions::default())?;
            self.delete_session(services, topic);
            return Ok(());
        }
        if pairing.exists(topic) {
            return pairing.disconnect(services, topic);
        }
        Err(ProtocolError::NoMatchingKey(format!(
            "disconnect() topic doesn't exist: {topic}"
        )))
    }

    // ── Inbound requests ────────────────────────────────────────────

    pub(crate) fn on_request(
        &mut self,
        pairing: &mut Pairing,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
        method: RpcMethod,
    ) {
        let handled = match method {
            RpcMethod::SessionPropose => self.on_propose(services, topic, request),
            RpcMethod::SessionSettle => self.on_settle(services, topic, request),
            RpcMethod::SessionUpdate => self.on_update(services, topic, request),
            RpcMethod::SessionExtend => self.on_extend(services, topic, request),
            RpcMethod::SessionPing => self.on_ping(services, topic, request),
            RpcMethod::SessionDelete => self.on_delete(services, topic, request),
            RpcMethod::SessionRequest => self.on_session_request(services, topic, request),
            RpcMethod::SessionEvent => self.on_event(services, topic, request),
            RpcMethod::PairingPing | RpcMethod::PairingDelete => pairing.on_request(services, topic, request, method),
        };
        if let Err(e) = handled {
            tracing::warn!(%topic, %method, id = request.id, "inbound request rejected: {e}");
            if let Err(send) = services.send_error(request.id, topic, e.to_payload()) {
                tracing::debug!(%topic, "cannot reply with error: {send}");
            }
        }
    }

    fn on_propose(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        let params: ProposeParams = parse_params(request, "onSessionProposeRequest()")?;
        validate_required(&params.required_namespaces, "onSessionProposeRequest()")?;

        let expiry = calc_expiry(FIVE_MINUTES);
        let proposal = ProposalRecord {
            id: request.id,
            expiry,
            relays: params.relays,
            proposer: params.proposer,
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
            pairing_topic: topic.to_string(),
        };
        self.proposals.set(request.id.to_string(), proposal.clone());
        services.set_expiry(ExpirerTarget::Id(request.id), expiry);
        services.emit(ClientEvent::SessionProposal {
            id: request.id,
            proposal,
        });
        Ok(())
    }

    fn on_settle(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        let context = "onSessionSettleRequest()";
        let params: SettleParams = parse_params(request, context)?;
        if params.relay.protocol.is_empty() {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "{context} relay protocol should be a string"
            )));
        }
        if params.controller.public_key.is_empty() {
            return Err(ProtocolError::MissingOrInvalid(format!("{context} controller")));
        }
        validate_namespaces(&params.namespaces, context)?;
        if is_expired(params.expiry) {
            return Err(ProtocolError::Expired(context.to_string()));
        }
        let Some(pending) = self.awaiting_settle.remove(topic) else {
            return Err(ProtocolError::NoMatchingKey(format!(
                "{context} no proposal awaits settlement on {topic}"
            )));
        };
        let waited_for = self
            .approvals
            .get(&pending.proposal_id)
            .is_some_and(|tx| !tx.is_closed());
        if !waited_for || is_expired(pending.expiry) {
            // Reply while the session key still exists, then forget it.
            let refusal = ProtocolError::Expired(format!("{context} proposal {} expired", pending.proposal_id));
            tracing::info!(%topic, "late settle refused: {refusal}");
            if let Err(e) = services.send_error(request.id, topic, refusal.to_payload()) {
                tracing::debug!(%topic, "cannot refuse settle: {e}");
            }
            self.abandon_settle(services, topic, pending);
            return Ok(());
        }
        services.del_expiry(&ExpirerTarget::Id(pending.proposal_id));

        let session = SessionRecord {
            topic: topic.to_string(),
            pairing_topic: params.pairing_topic.unwrap_or(pending.pairing_topic),
            relay: params.relay,
            expiry: params.expiry,
            acknowledged: true,
            controller: params.controller.public_key.clone(),
            namespaces: params.namespaces,
            required_namespaces: pending.required_namespaces,
            optional_namespaces: pending.optional_namespaces,
            self_: Participant {
                public_key: pending.self_public_key,
                metadata: self.metadata.clone(),
            },
            peer: params.controller,
        };
        self.sessions.set(topic.to_string(), session.clone());
        services.set_expiry(ExpirerTarget::Topic(topic.to_string()), session.expiry);
        services.send_result(request.id, topic, json!(true))?;

        if let Some(tx) = self.approvals.remove(&pending.proposal_id) {
            settle_reply(tx, Ok(&session));
        }
        tracing::info!(%topic, "session settled");
        services.emit(ClientEvent::SessionConnect { session });
        Ok(())
    }

    fn on_update(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        let key = (topic.to_string(), "session_update".to_string());
        if self.is_out_of_sync(&key, request.id) {
            tracing::info!(id = request.id, "discarding out of sync request");
            return Ok(());
        }
        let params: UpdateParams = parse_params(request, "onSessionUpdateRequest()")?;
        self.valid_session(services, topic)?;
        let session = self.sessions.get(topic)?;
        if session.controller != session.peer.public_key {
            return Err(ProtocolError::Unauthorized(format!(
                "onSessionUpdateRequest() peer is not controller of {topic}"
            )));
        }
        validate_namespaces(&params.namespaces, "update()")?;
        check_conforming(&session.required_namespaces, &params.namespaces, "update()")?;

        self.sessions.get_mut(topic)?.namespaces = params.namespaces.clone();
        services.send_result(request.id, topic, json!(true))?;
        services.emit(ClientEvent::SessionUpdate {
            id: request.id,
            topic: topic.to_string(),
            namespaces: params.namespaces,
        });
        self.last_accepted.insert(key, request.id);
        Ok(())
    }

    fn on_extend(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        self.valid_session(services, topic)?;
        self.set_session_expiry(services, topic, calc_expiry(SEVEN_DAYS))?;
        services.send_result(request.id, topic, json!(true))?;
        services.emit(ClientEvent::SessionExtend {
            id: request.id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn on_ping(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        self.valid_session(services, topic)?;
        services.send_result(request.id, topic, json!(true))?;
        services.emit(ClientEvent::SessionPing {
            id: request.id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn on_delete(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        self.valid_session(services, topic)?;
        services.send_result(request.id, topic, json!(true))?;
        self.delete_session(services, topic);
        services.emit(ClientEvent::SessionDelete {
            id: request.id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn on_session_request(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        let params: SessionRequestParams = parse_params(request, "onSessionRequest()")?;
        self.valid_session(services, topic)?;
        let namespaces = &self.sessions.get(topic)?.namespaces;
        if !is_chain_granted(namespaces, &params.chain_id) {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "request() chainId: {}",
                params.chain_id
            )));
        }
        if !is_method_granted(namespaces, &params.chain_id, &params.request.method) {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "request() method: {}",
                params.request.method
            )));
        }

        let expiry = params
            .request
            .expiry_timestamp
            .unwrap_or_else(|| calc_expiry(FIVE_MINUTES));
        self.requests.set(
            request.id.to_string(),
            PendingRequestRecord {
                id: request.id,
                topic: topic.to_string(),
                params,
            },
        );
        self.queue.push(request.id);
        services.set_expiry(ExpirerTarget::Id(request.id), expiry);
        self.process_queue(services);
        Ok(())
    }

    fn on_event(
        &mut self,
        services: &mut Services,
        topic: &str,
        request: &JsonRpcRequest,
    ) -> Result<(), ProtocolError> {
        let params: EventParams = parse_params(request, "onSessionEventRequest()")?;
        let key = (topic.to_string(), format!("session_event_{}", params.event.name));
        if self.is_out_of_sync(&key, request.id) {
            tracing::info!(id = request.id, "discarding out of sync request");
            return Ok(());
        }
        self.valid_session(services, topic)?;
        let namespaces = &self.sessions.get(topic)?.namespaces;
        if !is_event_granted(namespaces, &params.chain_id, &params.event.name) {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "emit() event: {}",
                params.event.name
            )));
        }

        services.send_result(request.id, topic, json!(true))?;
        services.emit(ClientEvent::SessionEvent {
            id: request.id,
            topic: topic.to_string(),
            event: params.event,
            chain_id: params.chain_id,
        });
        self.last_accepted.insert(key, request.id);
        Ok(())
    }

    /// Ids lead with milliseconds (`ms * 1000 + 3 random digits`). An id
    /// from an earlier millisecond, or not after the last one in the same
    /// millisecond, arrived out of order.
    fn is_out_of_sync(&self, key: &(Topic, String), id: u64) -> bool {
        let Some(&last) = self.last_accepted.get(key) else {
            return false;
        };
        let (prefix, last_prefix) = (id / 1000, last / 1000);
        prefix < last_prefix || (prefix == last_prefix && id <= last)
    }

    // ── Inbound responses ───────────────────────────────────────────

    pub(crate) fn on_response(
        &mut self,
        pairing: &mut Pairing,
        services: &mut Services,
        topic: &str,
        response: &JsonRpcResponse,
        method: RpcMethod,
    ) {
        match method {
            RpcMethod::SessionPropose => self.on_propose_response(pairing, services, response),
            RpcMethod::SessionSettle => self.on_settle_response(services, topic, response),
            RpcMethod::SessionUpdate
            | RpcMethod::SessionExtend
            | RpcMethod::SessionPing
            | RpcMethod::SessionRequest => {
                if !services.resolve_waiter(method, response.id, outcome_of(response)) {
                    tracing::debug!(%method, id = response.id, "nobody waits for response");
                }
            }
            RpcMethod::PairingPing | RpcMethod::PairingDelete => pairing.on_response(services, method, response),
            RpcMethod::SessionEvent | RpcMethod::SessionDelete => {
                tracing::debug!(%method, id = response.id, "peer acknowledged");
            }
        }
    }

    fn on_propose_response(&mut self, pairing: &mut Pairing, services: &mut Services, response: &JsonRpcResponse) {
        let id = response.id;
        let Some(proposal) = self.proposals.get(&id.to_string()).ok().cloned() else {
            tracing::debug!(id, "response for unknown proposal");
            return;
        };
        self.delete_proposal(services, id);

        let settled = outcome_of(response)
            .and_then(|value| {
                serde_json::from_value::<ProposeResult>(value).map_err(|e| {
                    ProtocolError::MissingOrInvalid(format!("onSessionProposeResponse() result: {e}"))
                })
            })
            .and_then(|result| {
                let topic = services.crypto.generate_shared_key(
                    &proposal.proposer.public_key,
                    &result.responder_public_key,
                    None,
                )?;
                Ok((topic, result.relay))
            });
        match settled {
            Ok((topic, relay)) => {
                tracing::debug!(%topic, id, "proposal accepted, awaiting settle");
                self.awaiting_settle.insert(
                    topic.clone(),
                    PendingSettle {
                        proposal_id: id,
                        expiry: proposal.expiry,
                        pairing_topic: proposal.pairing_topic.clone(),
                        self_public_key: proposal.proposer.public_key,
                        required_namespaces: proposal.required_namespaces,
                        optional_namespaces: proposal.optional_namespaces,
                    },
                );
                services.set_expiry(ExpirerTarget::Id(id), proposal.expiry);
                services.subscribe(&topic, relay);
                if let Err(e) = pairing.activate(services, &proposal.pairing_topic) {
                    tracing::warn!(pairing_topic = %proposal.pairing_topic, "cannot activate pairing: {e}");
                }
            }
            Err(e) => {
                tracing::info!(id, "proposal rejected: {e}");
                services.crypto.delete_key_pair(&proposal.proposer.public_key);
                if let Some(tx) = self.approvals.remove(&id) {
                    settle_reply(tx, Err(e));
                }
            }
        }
    }

    fn on_settle_response(&mut self, services: &mut Services, topic: &str, response: &JsonRpcResponse) {
        match outcome_of(response) {
            Ok(_) => {
                let Ok(session) = self.sessions.get_mut(topic) else {
                    tracing::debug!(%topic, "settle acknowledged for unknown session");
                    return;
                };
                session.acknowledged = true;
                let session = session.clone();
                if let Some(tx) = self.acknowledgements.remove(topic) {
                    settle_reply(tx, Ok(&session));
                }
            }
            Err(e) => {
                tracing::info!(%topic, "settle refused: {e}");
                if let Some(tx) = self.acknowledgements.remove(topic) {
                    settle_reply(tx, Err(e));
                }
                self.delete_session(services, topic);
            }
        }
    }

    /// A settle publish never reached the relay: undo the session.
    pub(crate) fn on_settle_publish_failed(&mut self, services: &mut Services, topic: &str, reason: &str) {
        tracing::warn!(%topic, "settle publish failed, rolling back: {reason}");
        if let Some(tx) = self.acknowledgements.remove(topic) {
            settle_reply(tx, Err(ProtocolError::Publish(reason.to_string())));
        }
        self.delete_session(services, topic);
    }

    // ── Expiry ──────────────────────────────────────────────────────

    /// Returns whether the target belonged to the session layer.
    pub(crate) fn on_expired(&mut self, services: &mut Services, target: &ExpirerTarget) -> bool {
        match target {
            ExpirerTarget::Topic(topic) if self.sessions.has(topic) => {
                tracing::debug!(%topic, "session expired");
                self.delete_session(services, topic);
                services.emit(ClientEvent::SessionExpire {
                    topic: topic.clone(),
                });
                true
            }
            ExpirerTarget::Id(id) if self.proposals.has(&id.to_string()) => {
                tracing::debug!(id, "proposal expired");
                self.delete_proposal(services, *id);
                if let Some(tx) = self.approvals.remove(id) {
                    settle_reply(tx, Err(ProtocolError::Expired("Proposal expired".into())));
                }
                services.emit(ClientEvent::ProposalExpire { id: *id });
                true
            }
            ExpirerTarget::Id(id) if self.settling_topic(*id).is_some() => {
                if let Some(topic) = self.settling_topic(*id) {
                    tracing::debug!(id, %topic, "proposal expired before settlement");
                    if let Some(pending) = self.awaiting_settle.remove(&topic) {
                        self.abandon_settle(services, &topic, pending);
                    }
                }
                services.emit(ClientEvent::ProposalExpire { id: *id });
                true
            }
            ExpirerTarget::Id(id) if self.requests.has(&id.to_string()) => {
                tracing::debug!(id, "pending request expired");
                self.delete_pending_request(services, *id);
                self.process_queue(services);
                true
            }
            _ => false,
        }
    }

    // ── Internals ───────────────────────────────────────────────────

    fn valid_session(&mut self, services: &mut Services, topic: &str) -> Result<(), ProtocolError> {
        let Some(session) = self.session(topic) else {
            return Err(ProtocolError::NoMatchingKey(format!(
                "session topic doesn't exist: {topic}"
            )));
        };
        if is_expired(session.expiry) {
            self.delete_session(services, topic);
            return Err(ProtocolError::Expired(format!("session topic: {topic}")));
        }
        Ok(())
    }

    fn valid_proposal(&mut self, services: &mut Services, id: u64) -> Result<ProposalRecord, ProtocolError> {
        let Ok(proposal) = self.proposals.get(&id.to_string()).cloned() else {
            return Err(ProtocolError::NoMatchingKey(format!("proposal id doesn't exist: {id}")));
        };
        if is_expired(proposal.expiry) {
            self.delete_proposal(services, id);
            return Err(ProtocolError::Expired(format!("proposal id: {id}")));
        }
        Ok(proposal)
    }

    fn set_session_expiry(&mut self, services: &mut Services, topic: &str, expiry: u64) -> Result<(), ProtocolError> {
        self.sessions.get_mut(topic)?.expiry = expiry;
        services.set_expiry(ExpirerTarget::Topic(topic.to_string()), expiry);
        Ok(())
    }

    fn settling_topic(&self, proposal_id: u64) -> Option<Topic> {
        self.awaiting_settle
            .iter()
            .find(|(_, pending)| pending.proposal_id == proposal_id)
            .map(|(topic, _)| topic.clone())
    }

    /// Drop everything derived for a settlement that will never complete.
    fn abandon_settle(&mut self, services: &mut Services, topic: &str, pending: PendingSettle) {
        services.unsubscribe(topic);
        services.crypto.delete_sym_key(topic);
        services.crypto.delete_key_pair(&pending.self_public_key);
        services.del_expiry(&ExpirerTarget::Id(pending.proposal_id));
        if let Some(tx) = self.approvals.remove(&pending.proposal_id) {
            settle_reply(tx, Err(ProtocolError::Expired("Proposal expired".into())));
        }
    }

    fn delete_proposal(&mut self, services: &mut Services, id: u64) {
        self.proposals.delete(&id.to_string());
        services.del_expiry(&ExpirerTarget::Id(id));
    }

    fn delete_pending_request(&mut self, services: &mut Services, id: u64) {
        self.requests.delete(&id.to_string());
        services.del_expiry(&ExpirerTarget::Id(id));
        self.queue.finish(id);
    }

    fn delete_session(&mut self, services: &mut Services, topic: &str) {
        let Some(session) = self.sessions.delete(topic) else {
            return;
        };
        services.unsubscribe(topic);
        services.crypto.delete_sym_key(topic);
        services.crypto.delete_key_pair(&session.self_.public_key);
        services.del_expiry(&ExpirerTarget::Topic(topic.to_string()));

        let stale: Vec<u64> = self
            .requests
            .values()
            .filter(|r| r.topic == topic)
            .map(|r| r.id)
            .collect();
        for id in stale {
            self.delete_pending_request(services, id);
        }
        self.last_accepted.retain(|(t, _), _| t != topic);
        if let Some(tx) = self.acknowledgements.remove(topic) {
            settle_reply(
                tx,
                Err(ProtocolError::NoMatchingKey(format!("session topic doesn't exist: {topic}"))),
            );
        }
        self.process_queue(services);
    }

    /// Hand the next queued request to the application if none is in flight.
    fn process_queue(&mut self, services: &mut Services) {
        while let Some(id) = self.queue.next() {
            match self.requests.get(&id.to_string()) {
                Ok(record) => {
                    services.emit(ClientEvent::SessionRequest {
                        id,
                        topic: record.topic.clone(),
                        params: record.params.clone(),
                    });
                    return;
                }
                Err(_) => self.queue.finish(id),
            }
        }
    }
}
