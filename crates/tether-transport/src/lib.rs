//! Tether relay transport layer.
//!
//! Everything the protocol engine needs to talk to the message relay:
//! JSON-RPC frame types, the relay method table, connection configuration,
//! and the [`Connector`] abstraction with a websocket implementation.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tether_transport::{Connector, JsonRpcRequest, RelayConfig, WebSocketConnector};
//!
//! # async fn example() -> Result<(), tether_transport::TransportError> {
//! let config = RelayConfig::new().project_id("my-project");
//! let url = config.endpoint_url(config.relay_url_str(), "<signed identity token>")?;
//!
//! let mut socket = WebSocketConnector::new().connect(&url).await?;
//! let frame = JsonRpcRequest::new("irn_subscribe", serde_json::json!({ "topic": "abc" }));
//! socket.send(frame.to_json()?).await?;
//!
//! while let Some(event) = socket.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod jsonrpc;
pub mod memory;
mod relay_rpc;
mod socket;
mod websocket;

pub use config::{RelayConfig, DEFAULT_RELAY_URL, FAILOVER_RELAY_URL};
pub use error::{TransportError, STALLED_PATTERNS};
pub use jsonrpc::{
    payload_id, relay_rpc_id, JsonRpcError, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse,
    RpcOutcome, JSONRPC_VERSION,
};
pub use memory::MemoryRelay;
pub use relay_rpc::{
    BatchSubscribeParams, PublishParams, RelayMethods, SubscribeParams, SubscriptionData,
    SubscriptionParams, UnsubscribeParams, RELAYER_DEFAULT_PROTOCOL,
};
pub use socket::{Connector, RelaySocket, SocketEvent, SocketPeer};
pub use websocket::WebSocketConnector;

// Re-export for callers assembling relay endpoints.
pub use url::Url;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
