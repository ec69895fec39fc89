//! The client event loop.
//!
//! A single task owns [`CoreState`] and multiplexes application commands,
//! relay socket events, executor completions (timers, connection attempts)
//! and the heartbeat pulse. After every step it executes the resulting
//! effects and writes changed stores back to storage.
use std::sync::Arc;

use tether_transport::{Connector, RelaySocket, SocketEvent};
use tokio::sync::mpsc;

use crate::heartbeat::HeartBeat;
use crate::storage::Storage;

use super::executor::{Internal, Io};
use super::state::CoreState;
use super::{ClientEvent, Command, CoreConfig};

pub(super) async fn core_loop(
    mut state: CoreState,
    config: CoreConfig,
    connector: Arc<dyn Connector>,
    storage: Arc<dyn Storage>,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();
    let mut io = Io::new(
        connector,
        config.relay.connect_timeout_duration(),
        internal_tx,
        event_tx,
    );
    // First pulse one interval from now.
    let mut pulse = HeartBeat::new(config.heartbeat_interval).start();

    // Effects queued by start() and restore.
    step(&mut state, &mut io, storage.as_ref()).await;

    loop {
        tokio::select! {
            // ── 1. Application commands ─────────────────────────
            command = cmd_rx.recv() => {
                let Some(command) = command else {
                    tracing::info!("every client handle dropped, stopping");
                    break;
                };
                if !state.handle_command(command) {
                    step(&mut state, &mut io, storage.as_ref()).await;
                    break;
                }
            }

            // ── 2. Relay socket ─────────────────────────────────
            event = next_socket_event(&mut io.socket) => {
                match event {
                    Some(SocketEvent::Message(text)) => state.on_frame(&text),
                    Some(SocketEvent::Closed { reason }) => {
                        io.socket = None;
                        state.on_socket_closed(&reason);
                    }
                    Some(SocketEvent::Error(e)) => {
                        io.socket = None;
                        state.on_socket_error(&e);
                    }
                    None => {
                        io.socket = None;
                        state.on_socket_closed("socket hang up");
                    }
                }
            }

            // ── 3. Timers and connection attempts ───────────────
            Some(internal) = internal_rx.recv() => {
                match internal {
                    Internal::Timer { key, generation } => {
                        if io.fired(key, generation) {
                            state.on_timer(key);
                        }
                    }
                    Internal::Connected { attempt, result } => {
                        match io.on_connect_result(attempt, result) {
                            Some(Ok(())) => state.on_connected(),
                            Some(Err(e)) => state.on_connect_failed(&e),
                            None => {}
                        }
                    }
                }
            }

            // ── 4. Heartbeat ────────────────────────────────────
            _ = pulse.tick() => state.on_pulse(),
        }

        step(&mut state, &mut io, storage.as_ref()).await;
    }

    tracing::debug!("client loop stopped");
}

/// Run effects until the state settles, then persist what changed.
async fn step(state: &mut CoreState, io: &mut Io, storage: &dyn Storage) {
    loop {
        let effects = state.take_effects();
        if effects.is_empty() {
            break;
        }
        if let Some(reason) = io.execute(effects).await {
            state.on_socket_closed(&reason);
        }
    }
    for (key, value) in state.dirty_snapshots() {
        if let Err(e) = storage.set_item(&key, value).await {
            tracing::error!(%key, "cannot persist store: {e}");
        }
    }
}

/// Next event from the socket, or never when there is none.
async fn next_socket_event(socket: &mut Option<RelaySocket>) -> Option<SocketEvent> {
    match socket {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}
