use tokio::sync::mpsc;
use url::Url;

use crate::TransportError;

/// Something that happened on an open relay socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// A text frame from the relay.
    Message(String),
    /// The relay closed the connection cleanly.
    Closed { reason: String },
    /// The connection failed.
    Error(TransportError),
}

/// An open connection to the relay.
///
/// Dropping the socket closes the underlying connection.
pub struct RelaySocket {
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<SocketEvent>,
}

/// The connector-side ends of a [`RelaySocket`].
pub struct SocketPeer {
    /// Frames the client wants written.
    pub frames: mpsc::Receiver<String>,
    /// Events to hand back to the client.
    pub events: mpsc::Sender<SocketEvent>,
}

impl RelaySocket {
    /// Create a socket and the ends a connector drives.
    pub fn channel(capacity: usize) -> (RelaySocket, SocketPeer) {
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        (
            RelaySocket {
                outgoing: frames_tx,
                incoming: events_rx,
            },
            SocketPeer {
                frames: frames_rx,
                events: events_tx,
            },
        )
    }

    /// Queue a text frame for the relay.
    pub async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed {
                reason: "socket writer gone".into(),
            })
    }

    /// Next event, or `None` once the connector side is gone.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.incoming.recv().await
    }
}

/// Opens relay connections.
///
/// In production: [`WebSocketConnector`](crate::WebSocketConnector).
/// In tests: [`MemoryRelay`](crate::MemoryRelay).
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<RelaySocket, TransportError>;
}
