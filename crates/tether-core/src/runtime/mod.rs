//! Client runtime: one event loop owning every protocol component.
//!
//! [`TetherCore::spawn`] loads persisted state, starts the loop and hands
//! back a cloneable [`ClientHandle`] plus the [`ClientEvent`] stream. The
//! application never touches the socket, the key material or the stores.
pub(crate) mod effect;
mod executor;
mod r#loop;
mod state;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_transport::{Connector, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RelayConfig};
use tokio::sync::{mpsc, oneshot};

use crate::heartbeat::HEARTBEAT_INTERVAL;
use crate::pairing::{CreatedPairing, PairingRecord};
use crate::relayer::RelayerConfig;
use crate::services::Reply;
use crate::session::types::{
    ApproveParams, ConnectParams, Namespaces, PendingRequestRecord, ProposalRecord,
    RequestArguments, RequestParams, RequiredNamespaces, SessionEventData, SessionRecord,
    SessionRequestParams,
};
use crate::session::{Approved, Connected, SentSessionRequest, Waiter};
use crate::storage::Storage;
use crate::types::{Metadata, Topic, FIVE_MINUTES, THIRTY_SECONDS};
use crate::ProtocolError;

use state::CoreState;

// ── Configuration ───────────────────────────────────────────────────

/// Everything a client needs besides its connector and storage.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub relay: RelayConfig,
    pub relayer: RelayerConfig,
    /// Pulse driving expiry sweeps and publish retries.
    pub heartbeat_interval: Duration,
    /// Inserted into every storage key, so several clients can share a store.
    pub storage_prefix: String,
    /// Advertised to peers in proposals and settlements.
    pub metadata: Metadata,
    /// Capacity of the event channel. Events beyond it are dropped.
    pub event_buffer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::new(),
            relayer: RelayerConfig::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            storage_prefix: String::new(),
            metadata: Metadata::default(),
            event_buffer: 1024,
        }
    }
}

// ── Events (runtime → app) ──────────────────────────────────────────

/// What the client reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    // ── Session ─────────────────────────────
    SessionProposal {
        id: u64,
        proposal: ProposalRecord,
    },
    SessionConnect {
        session: SessionRecord,
    },
    /// Handed out one at a time; answer with [`ClientHandle::respond`].
    SessionRequest {
        id: u64,
        topic: Topic,
        params: SessionRequestParams,
    },
    SessionRequestSent {
        id: u64,
        topic: Topic,
        request: RequestArguments,
        chain_id: String,
    },
    SessionUpdate {
        id: u64,
        topic: Topic,
        namespaces: Namespaces,
    },
    SessionExtend {
        id: u64,
        topic: Topic,
    },
    SessionPing {
        id: u64,
        topic: Topic,
    },
    SessionEvent {
        id: u64,
        topic: Topic,
        event: SessionEventData,
        chain_id: String,
    },
    SessionDelete {
        id: u64,
        topic: Topic,
    },
    SessionExpire {
        topic: Topic,
    },
    ProposalExpire {
        id: u64,
    },
    // ── Pairing ─────────────────────────────
    PairingCreated {
        pairing: PairingRecord,
    },
    PairingDeleted {
        topic: Topic,
    },
    PairingExpired {
        topic: Topic,
    },
    PairingPing {
        id: u64,
        topic: Topic,
    },
    /// A method registered with [`ClientHandle::register_methods`] arrived
    /// on a pairing topic. Answer with [`ClientHandle::respond`].
    PairingRequest {
        topic: Topic,
        request: JsonRpcRequest,
    },
    // ── Relay ───────────────────────────────
    RelayerConnect,
    RelayerDisconnect,
    /// The relay acknowledged a publish.
    RelayerPublish {
        id: u64,
        topic: Topic,
    },
    RelayerError {
        message: String,
    },
    /// Publishes or subscriptions stopped getting answers; the transport
    /// is being restarted.
    ConnectionStalled,
    SubscriptionResubscribed,
    PublishAbandoned {
        id: u64,
        topic: Topic,
        attempts: u32,
    },
}

// ── Commands (app → runtime) ────────────────────────────────────────

pub(crate) enum Command {
    CreatePairing {
        reply: Reply<CreatedPairing>,
    },
    Pair {
        uri: String,
        activate: bool,
        reply: Reply<PairingRecord>,
    },
    ActivatePairing {
        topic: Topic,
        reply: Reply<()>,
    },
    UpdatePairingExpiry {
        topic: Topic,
        expiry: u64,
        reply: Reply<()>,
    },
    UpdatePairingMetadata {
        topic: Topic,
        metadata: Metadata,
        reply: Reply<()>,
    },
    RegisterMethods {
        methods: Vec<String>,
    },
    GetPairings {
        reply: oneshot::Sender<Vec<PairingRecord>>,
    },
    Connect {
        params: ConnectParams,
        reply: Reply<Connected>,
    },
    Approve {
        params: ApproveParams,
        reply: Reply<Approved>,
    },
    Reject {
        id: u64,
        reason: JsonRpcError,
        reply: Reply<()>,
    },
    Update {
        topic: Topic,
        namespaces: Namespaces,
        reply: Reply<Waiter>,
    },
    Extend {
        topic: Topic,
        reply: Reply<Waiter>,
    },
    Request {
        params: RequestParams,
        reply: Reply<SentSessionRequest>,
    },
    Respond {
        topic: Topic,
        response: JsonRpcResponse,
        reply: Reply<()>,
    },
    Ping {
        topic: Topic,
        reply: Reply<Waiter>,
    },
    Emit {
        topic: Topic,
        event: SessionEventData,
        chain_id: String,
        reply: Reply<oneshot::Receiver<Result<(), ProtocolError>>>,
    },
    Disconnect {
        topic: Topic,
        reply: Reply<()>,
    },
    Find {
        required: RequiredNamespaces,
        reply: oneshot::Sender<Vec<SessionRecord>>,
    },
    GetSessions {
        reply: oneshot::Sender<Vec<SessionRecord>>,
    },
    GetProposals {
        reply: oneshot::Sender<Vec<ProposalRecord>>,
    },
    GetPendingRequests {
        reply: oneshot::Sender<Vec<PendingRequestRecord>>,
    },
    SetOnline {
        online: bool,
    },
    RestartTransport,
    Shutdown,
}

// ── Pending peer answers ────────────────────────────────────────────

/// A peer answer the caller may await, optionally bounded by a deadline.
#[derive(Debug)]
pub struct Pending<T = Value> {
    rx: Waiter,
    deadline: Option<(Duration, &'static str)>,
    _answer: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Pending<T> {
    fn new(rx: Waiter) -> Self {
        Self {
            rx,
            deadline: None,
            _answer: PhantomData,
        }
    }

    fn with_deadline(rx: Waiter, after: Duration, expired: &'static str) -> Self {
        Self {
            rx,
            deadline: Some((after, expired)),
            _answer: PhantomData,
        }
    }

    /// Wait for the answer. A missed deadline is [`ProtocolError::Expired`].
    pub async fn wait(self) -> Result<T, ProtocolError> {
        let received = match self.deadline {
            Some((after, expired)) => tokio::time::timeout(after, self.rx)
                .await
                .map_err(|_| ProtocolError::Expired(expired.to_string()))?,
            None => self.rx.await,
        };
        let value = received.map_err(|_| ProtocolError::Shutdown)??;
        Ok(serde_json::from_value(value)?)
    }
}

/// A proposal sent by [`ClientHandle::connect`].
#[derive(Debug)]
pub struct Connection {
    /// Pairing URI to hand to the responder; `None` when an active pairing
    /// was reused.
    pub uri: Option<String>,
    pub pairing_topic: Topic,
    pub proposal_id: u64,
    /// Resolves with the session once the responder settles it.
    pub approval: Pending<SessionRecord>,
}

/// A session settled by [`ClientHandle::approve`].
#[derive(Debug)]
pub struct Approval {
    pub topic: Topic,
    /// Resolves once the proposer acknowledges the settlement.
    pub acknowledged: Pending<SessionRecord>,
}

/// A request sent by [`ClientHandle::request`].
#[derive(Debug)]
pub struct RequestHandle {
    pub id: u64,
    /// The responder's result; a peer error becomes [`ProtocolError::Rpc`].
    pub response: Pending<Value>,
}

// ── ClientHandle (app-facing API) ───────────────────────────────────

/// Handle to a running client. Cheap to clone.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
    client_id: Arc<str>,
}

impl ClientHandle {
    /// `did:key` identifying this client to the relay.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| ProtocolError::Shutdown)?;
        rx.await.map_err(|_| ProtocolError::Shutdown)?
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| ProtocolError::Shutdown)?;
        rx.await.map_err(|_| ProtocolError::Shutdown)
    }

    async fn notify(&self, command: Command) -> Result<(), ProtocolError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| ProtocolError::Shutdown)
    }

    // ── Pairing ─────────────────────────────

    /// Create a pairing and return its URI.
    pub async fn create_pairing(&self) -> Result<CreatedPairing, ProtocolError> {
        self.call(|reply| Command::CreatePairing { reply }).await
    }

    /// Join the pairing offered by `uri`.
    pub async fn pair(&self, uri: &str, activate: bool) -> Result<PairingRecord, ProtocolError> {
        let uri = uri.to_string();
        self.call(|reply| Command::Pair { uri, activate, reply }).await
    }

    pub async fn activate_pairing(&self, topic: &str) -> Result<(), ProtocolError> {
        let topic = topic.to_string();
        self.call(|reply| Command::ActivatePairing { topic, reply }).await
    }

    pub async fn update_pairing_expiry(&self, topic: &str, expiry: u64) -> Result<(), ProtocolError> {
        let topic = topic.to_string();
        self.call(|reply| Command::UpdatePairingExpiry { topic, expiry, reply })
            .await
    }

    pub async fn update_pairing_metadata(&self, topic: &str, metadata: Metadata) -> Result<(), ProtocolError> {
        let topic = topic.to_string();
        self.call(|reply| Command::UpdatePairingMetadata {
            topic,
            metadata,
            reply,
        })
        .await
    }

    /// Methods the application handles itself on pairing topics. Unknown
    /// methods not registered here are answered with an error.
    pub async fn register_methods<I, S>(&self, methods: I) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods = methods.into_iter().map(Into::into).collect();
        self.notify(Command::RegisterMethods { methods }).await
    }

    pub async fn pairings(&self) -> Result<Vec<PairingRecord>, ProtocolError> {
        self.query(|reply| Command::GetPairings { reply }).await
    }

    // ── Session ─────────────────────────────

    /// Propose a session, on a fresh pairing unless `pairing_topic` names
    /// an active one.
    pub async fn connect(&self, params: ConnectParams) -> Result<Connection, ProtocolError> {
        let connected = self.call(|reply| Command::Connect { params, reply }).await?;
        Ok(Connection {
            uri: connected.uri,
            pairing_topic: connected.pairing_topic,
            proposal_id: connected.proposal_id,
            approval: Pending::with_deadline(
                connected.approval,
                Duration::from_secs(FIVE_MINUTES),
                "Proposal expired",
            ),
        })
    }

    pub async fn approve(&self, params: ApproveParams) -> Result<Approval, ProtocolError> {
        let approved = self.call(|reply| Command::Approve { params, reply }).await?;
        Ok(Approval {
            topic: approved.topic,
            acknowledged: Pending::new(approved.acknowledged),
        })
    }

    pub async fn reject(&self, id: u64, reason: JsonRpcError) -> Result<(), ProtocolError> {
        self.call(|reply| Command::Reject { id, reason, reply }).await
    }

    /// Replace the granted namespaces. Controller only.
    pub async fn update(&self, topic: &str, namespaces: Namespaces) -> Result<Pending, ProtocolError> {
        let topic = topic.to_string();
        let rx = self
            .call(|reply| Command::Update {
                topic,
                namespaces,
                reply,
            })
            .await?;
        Ok(Pending::new(rx))
    }

    /// Push the session expiry seven days out. Controller only.
    pub async fn extend(&self, topic: &str) -> Result<Pending, ProtocolError> {
        let topic = topic.to_string();
        let rx = self.call(|reply| Command::Extend { topic, reply }).await?;
        Ok(Pending::new(rx))
    }

    pub async fn request(&self, params: RequestParams) -> Result<RequestHandle, ProtocolError> {
        let sent = self.call(|reply| Command::Request { params, reply }).await?;
        Ok(RequestHandle {
            id: sent.id,
            response: Pending::with_deadline(sent.response, sent.timeout, "Request expired"),
        })
    }

    /// Answer a [`ClientEvent::SessionRequest`] or a
    /// [`ClientEvent::PairingRequest`].
    pub async fn respond(&self, topic: &str, response: JsonRpcResponse) -> Result<(), ProtocolError> {
        let topic = topic.to_string();
        self.call(|reply| Command::Respond {
            topic,
            response,
            reply,
        })
        .await
    }

    /// Ping a session or pairing and wait for the peer.
    pub async fn ping(&self, topic: &str) -> Result<(), ProtocolError> {
        let topic = topic.to_string();
        let rx = self.call(|reply| Command::Ping { topic, reply }).await?;
        Pending::<Value>::with_deadline(rx, Duration::from_secs(THIRTY_SECONDS), "Ping expired")
            .wait()
            .await?;
        Ok(())
    }

    /// Send a session event; returns once the relay accepted it.
    pub async fn emit(&self, topic: &str, event: SessionEventData, chain_id: &str) -> Result<(), ProtocolError> {
        let topic = topic.to_string();
        let chain_id = chain_id.to_string();
        let published = self
            .call(|reply| Command::Emit {
                topic,
                event,
                chain_id,
                reply,
            })
            .await?;
        published.await.map_err(|_| ProtocolError::Shutdown)?
    }

    /// Tear down a session or a pairing, telling the peer first.
    pub async fn disconnect(&self, topic: &str) -> Result<(), ProtocolError> {
        let topic = topic.to_string();
        self.call(|reply| Command::Disconnect { topic, reply }).await
    }

    /// Sessions whose grants cover `required`.
    pub async fn find(&self, required: RequiredNamespaces) -> Result<Vec<SessionRecord>, ProtocolError> {
        self.query(|reply| Command::Find { required, reply }).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionRecord>, ProtocolError> {
        self.query(|reply| Command::GetSessions { reply }).await
    }

    pub async fn proposals(&self) -> Result<Vec<ProposalRecord>, ProtocolError> {
        self.query(|reply| Command::GetProposals { reply }).await
    }

    /// Session requests received and not yet answered, including the one
    /// most recently handed out as [`ClientEvent::SessionRequest`]. Events
    /// are dropped when the event channel is full; answering a listed
    /// request with [`ClientHandle::respond`] moves the queue on.
    pub async fn pending_session_requests(&self) -> Result<Vec<PendingRequestRecord>, ProtocolError> {
        self.query(|reply| Command::GetPendingRequests { reply }).await
    }

    // ── Transport ───────────────────────────

    /// Report host network reachability. Going offline closes the socket.
    pub async fn set_online(&self, online: bool) -> Result<(), ProtocolError> {
        self.notify(Command::SetOnline { online }).await
    }

    pub async fn restart_transport(&self) -> Result<(), ProtocolError> {
        self.notify(Command::RestartTransport).await
    }

    /// Close the socket and stop the loop.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

// ── Spawning ────────────────────────────────────────────────────────

/// Channels returned to the application when the client starts.
pub struct CoreChannels {
    pub handle: ClientHandle,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Entry point: load state and start the event loop.
pub struct TetherCore;

impl TetherCore {
    /// Restore persisted state from `storage`, then spawn the loop.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn spawn(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn Storage>,
    ) -> Result<CoreChannels, ProtocolError> {
        let mut state = CoreState::load(&config, storage.as_ref()).await?;
        let client_id: Arc<str> = state.client_id()?.into();
        state.start();

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(config.event_buffer);

        tokio::spawn(r#loop::core_loop(
            state, config, connector, storage, cmd_rx, event_tx,
        ));

        tracing::info!(%client_id, "client started");
        Ok(CoreChannels {
            handle: ClientHandle { cmd_tx, client_id },
            events: event_rx,
        })
    }
}
