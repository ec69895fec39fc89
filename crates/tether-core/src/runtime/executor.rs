//! Effect executor: the only place that touches I/O.
//!
//! - Send -> socket write
//! - Emit -> event channel (never blocks the loop)
//! - Arm / Disarm -> one sleeping task per timer key, aborted on disarm
//! - Connect -> a task trying each endpoint in turn
//! - Close -> drop the socket
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tether_transport::{Connector, RelaySocket, TransportError, Url};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::effect::{Effect, TimerKey};
use super::ClientEvent;

/// Completions of work the executor started, fed back into the loop.
pub(super) enum Internal {
    Timer {
        key: TimerKey,
        generation: u64,
    },
    Connected {
        attempt: u64,
        result: Result<RelaySocket, TransportError>,
    },
}

pub(super) struct Io {
    pub socket: Option<RelaySocket>,
    timers: HashMap<TimerKey, (u64, AbortHandle)>,
    next_generation: u64,
    /// Bumped on every connect and close; stale attempts are discarded.
    attempt: u64,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    internal_tx: mpsc::UnboundedSender<Internal>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl Io {
    pub fn new(
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        internal_tx: mpsc::UnboundedSender<Internal>,
        event_tx: mpsc::Sender<ClientEvent>,
    ) -> Self {
        Self {
            socket: None,
            timers: HashMap::new(),
            next_generation: 0,
            attempt: 0,
            connector,
            connect_timeout,
            internal_tx,
            event_tx,
        }
    }

    /// Execute effects in order. Returns the reason if the socket broke
    /// while writing.
    pub async fn execute(&mut self, effects: Vec<Effect>) -> Option<String> {
        let mut broken = None;
        for effect in effects {
            match effect {
                Effect::Send(frame) => {
                    let Some(socket) = &self.socket else {
                        tracing::debug!("no relay socket, frame dropped");
                        continue;
                    };
                    if let Err(e) = socket.send(frame).await {
                        tracing::warn!("relay write failed: {e}");
                        self.socket = None;
                        broken = Some(e.to_string());
                    }
                }
                Effect::Emit(event) => {
                    // try_send: a slow consumer loses events, the loop never stalls.
                    // Lost session requests stay listed in pending_session_requests.
                    if let Err(e) = self.event_tx.try_send(event) {
                        tracing::warn!("client event dropped: {e}");
                    }
                }
                Effect::Arm { key, after } => self.arm(key, after),
                Effect::Disarm(key) => self.disarm(key),
                Effect::Connect { urls } => self.connect(urls),
                Effect::Close => self.close(),
            }
        }
        broken
    }

    // ── Timers ──────────────────────────────────────────────────────

    fn arm(&mut self, key: TimerKey, after: Duration) {
        self.disarm(key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Internal::Timer { key, generation });
        });
        self.timers.insert(key, (generation, task.abort_handle()));
    }

    fn disarm(&mut self, key: TimerKey) {
        if let Some((_, handle)) = self.timers.remove(&key) {
            handle.abort();
        }
    }

    /// Whether a timer message is still current. A re-armed or disarmed
    /// key makes older messages stale.
    pub fn fired(&mut self, key: TimerKey, generation: u64) -> bool {
        match self.timers.get(&key) {
            Some((current, _)) if *current == generation => {
                self.timers.remove(&key);
                true
            }
            _ => false,
        }
    }

    // ── Connection ──────────────────────────────────────────────────

    fn connect(&mut self, urls: Vec<Url>) {
        self.attempt += 1;
        let attempt = self.attempt;
        let connector = Arc::clone(&self.connector);
        let timeout = self.connect_timeout;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = open(connector.as_ref(), &urls, timeout).await;
            let _ = tx.send(Internal::Connected { attempt, result });
        });
    }

    fn close(&mut self) {
        self.attempt += 1;
        if self.socket.take().is_some() {
            tracing::debug!("relay socket dropped");
        }
    }

    /// Adopt the outcome of a connection attempt. `None` when the attempt
    /// was superseded.
    pub fn on_connect_result(
        &mut self,
        attempt: u64,
        result: Result<RelaySocket, TransportError>,
    ) -> Option<Result<(), TransportError>> {
        if attempt != self.attempt {
            tracing::debug!(attempt, "stale connection attempt discarded");
            return None;
        }
        Some(result.map(|socket| {
            self.socket = Some(socket);
        }))
    }
}

impl Drop for Io {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }
}

/// Try each endpoint in order, each bounded by `timeout`.
async fn open(
    connector: &dyn Connector,
    urls: &[Url],
    timeout: Duration,
) -> Result<RelaySocket, TransportError> {
    let mut last = TransportError::NotConnected;
    for url in urls {
        let host = url.host_str().unwrap_or_default().to_string();
        match tokio::time::timeout(timeout, connector.connect(url)).await {
            Ok(Ok(socket)) => {
                tracing::debug!(%host, "relay socket open");
                return Ok(socket);
            }
            Ok(Err(e)) => {
                tracing::warn!(%host, "relay connect failed: {e}");
                last = e;
            }
            Err(_) => {
                tracing::warn!(%host, "relay connect timed out");
                let mut bare = url.clone();
                bare.set_query(None);
                last = TransportError::ConnectTimeout {
                    url: bare.to_string(),
                };
            }
        }
    }
    Err(last)
}
