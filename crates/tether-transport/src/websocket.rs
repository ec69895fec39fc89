//! Websocket connector (tokio-tungstenite).
//!
//! Each connection gets one pump task that owns both halves of the stream:
//! frames queued on the [`RelaySocket`] are written out, text frames read
//! from the relay are handed back as [`SocketEvent::Message`]. The task ends
//! (and closes the websocket) when the socket is dropped.
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message,
};
use url::Url;

use crate::{Connector, RelaySocket, SocketEvent, SocketPeer, TransportError};

/// Opens relay connections over websockets.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    buffer: usize,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self { buffer: 256 }
    }

    /// Channel capacity in both directions (default: 256).
    pub fn with_buffer(buffer: usize) -> Self {
        Self { buffer }
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<RelaySocket, TransportError> {
        let request = url.as_str().into_client_request()?;

        tracing::debug!(host = url.host_str().unwrap_or_default(), "connecting to relay");
        let (ws_stream, _) = connect_async(request).await?;

        let (socket, peer) = RelaySocket::channel(self.buffer);
        tokio::spawn(pump(ws_stream, peer));
        Ok(socket)
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn pump(ws_stream: WsStream, peer: SocketPeer) {
    let SocketPeer { mut frames, events } = peer;
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            let _ = events.send(SocketEvent::Error(e.into())).await;
                            break;
                        }
                    }
                    None => {
                        // Socket dropped by the client.
                        let _ = write.close().await;
                        break;
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(SocketEvent::Message(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            tracing::warn!("failed to answer relay ping");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by relay".to_string());
                        tracing::info!(%reason, "relay closed the websocket");
                        let _ = events.send(SocketEvent::Closed { reason }).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("websocket error: {e}");
                        let _ = events.send(SocketEvent::Error(e.into())).await;
                        break;
                    }
                    None => {
                        let _ = events
                            .send(SocketEvent::Closed {
                                reason: "socket hang up".to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        }
    }
}
