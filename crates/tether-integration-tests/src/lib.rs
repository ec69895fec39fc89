//! Shared harness for end-to-end tests: two or more clients talking
//! through one in-process relay.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tether_core::{
    ApproveParams, ClientEvent, ClientHandle, ConnectParams, CoreConfig, MemoryStorage, Metadata,
    Namespaces, RequiredNamespace, RequiredNamespaces, SessionNamespace, SessionRecord,
    TetherCore,
};
use tether_transport::MemoryRelay;
use tokio::sync::mpsc;

/// How long a test waits for any single event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Config with timings short enough for tests.
pub fn fast_config(name: &str) -> CoreConfig {
    let mut config = CoreConfig {
        heartbeat_interval: Duration::from_millis(100),
        metadata: Metadata::new(name, format!("https://{name}.example")),
        ..CoreConfig::default()
    };
    config.relayer.reconnect_delay = Duration::from_millis(100);
    config.relayer.publish_timeout = Duration::from_millis(500);
    config.relayer.subscribe_timeout = Duration::from_secs(2);
    config
}

/// One running client plus its event stream.
pub struct Peer {
    pub handle: ClientHandle,
    pub events: mpsc::Receiver<ClientEvent>,
    pub storage: MemoryStorage,
}

impl Peer {
    pub async fn spawn(relay: &MemoryRelay, name: &str) -> anyhow::Result<Self> {
        Self::spawn_with(relay, fast_config(name), MemoryStorage::new()).await
    }

    /// Start a client on existing storage, e.g. to simulate a restart.
    pub async fn spawn_with(
        relay: &MemoryRelay,
        config: CoreConfig,
        storage: MemoryStorage,
    ) -> anyhow::Result<Self> {
        let channels = TetherCore::spawn(
            config,
            Arc::new(relay.clone()),
            Arc::new(storage.clone()),
        )
        .await?;
        Ok(Self {
            handle: channels.handle,
            events: channels.events,
            storage,
        })
    }

    /// Skip events until one matches `pick`.
    pub async fn wait_for<T>(
        &mut self,
        what: &str,
        mut pick: impl FnMut(&ClientEvent) -> Option<T>,
    ) -> anyhow::Result<T> {
        let events = &mut self.events;
        tokio::time::timeout(EVENT_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if let Some(found) = pick(&event) {
                    return Ok(found);
                }
            }
            Err(anyhow!("event stream closed while waiting for {what}"))
        })
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
    }

    /// Events that arrive within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<ClientEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            seen.push(event);
        }
        seen
    }
}

/// Poll `check` until it holds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting until {what}"))
}

/// How many subscribe RPCs, single or batched, named `topic`.
pub fn subscribe_requests(relay: &MemoryRelay, topic: &str) -> usize {
    let single = relay
        .rpc_params("irn_subscribe")
        .into_iter()
        .filter(|p| p["topic"] == topic)
        .count();
    let batched = relay
        .rpc_params("irn_batchSubscribe")
        .into_iter()
        .filter(|p| {
            p["topics"]
                .as_array()
                .is_some_and(|topics| topics.iter().any(|t| t == topic))
        })
        .count();
    single + batched
}

// ── Namespaces used across scenarios ───────────────────────────────

pub const CHAIN: &str = "eip155:1";
pub const ACCOUNT: &str = "eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb";

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn required_namespaces() -> RequiredNamespaces {
    BTreeMap::from([(
        "eip155".to_string(),
        RequiredNamespace {
            chains: Some(strings(&[CHAIN])),
            methods: strings(&["eth_sendTransaction", "personal_sign"]),
            events: strings(&["accountsChanged", "chainChanged"]),
        },
    )])
}

pub fn granted_namespaces() -> Namespaces {
    BTreeMap::from([(
        "eip155".to_string(),
        SessionNamespace {
            chains: None,
            accounts: strings(&[ACCOUNT]),
            methods: strings(&["eth_sendTransaction", "personal_sign"]),
            events: strings(&["accountsChanged", "chainChanged"]),
        },
    )])
}

/// A settled, acknowledged session between a proposer and a responder.
pub struct Established {
    pub topic: String,
    pub pairing_topic: String,
    pub proposer_view: SessionRecord,
    pub responder_view: SessionRecord,
}

/// Run the whole pairing and proposal dance between `dapp` and `wallet`.
pub async fn establish(dapp: &mut Peer, wallet: &mut Peer) -> anyhow::Result<Established> {
    let connection = dapp
        .handle
        .connect(ConnectParams {
            required_namespaces: required_namespaces(),
            ..ConnectParams::default()
        })
        .await?;
    let uri = connection.uri.context("a fresh pairing carries a uri")?;
    wallet.handle.pair(&uri, false).await?;

    let id = wallet
        .wait_for("session proposal", |e| match e {
            ClientEvent::SessionProposal { id, .. } => Some(*id),
            _ => None,
        })
        .await?;
    let approval = wallet
        .handle
        .approve(ApproveParams {
            id,
            namespaces: granted_namespaces(),
            relay_protocol: None,
        })
        .await?;

    let proposer_view = connection.approval.wait().await?;
    let responder_view = approval.acknowledged.wait().await?;
    Ok(Established {
        topic: approval.topic,
        pairing_topic: connection.pairing_topic,
        proposer_view,
        responder_view,
    })
}
