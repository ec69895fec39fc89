use std::time::Duration;

use url::Url;

use super::ClientEvent;

/// A timer owned by the event loop. Re-arming a key replaces its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Publish attempt, by relay request id.
    Publish(u64),
    /// Subscribe or batch subscribe RPC, by relay request id.
    Subscribe(u64),
    /// Message parked on a topic whose subscription is still pending.
    Parked(u64),
    Reconnect,
    TransportCutoff,
}

/// Intent produced by the pure protocol state.
///
/// Handlers return or buffer effects; the executor is the only code that
/// touches the socket, timers or the event channel.
#[derive(Debug)]
pub enum Effect {
    /// Write a frame to the relay socket.
    Send(String),

    /// Hand an event to the application.
    Emit(ClientEvent),

    Arm { key: TimerKey, after: Duration },

    Disarm(TimerKey),

    /// Open the relay socket, trying each endpoint in order.
    Connect { urls: Vec<Url> },

    /// Drop the relay socket.
    Close,
}
