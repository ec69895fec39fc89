//! Tether protocol engine.
//!
//! Pairs two applications over a shared relay, negotiates scoped sessions
//! between them and carries encrypted JSON-RPC traffic on top of
//! `tether-transport`.
//!
//! Wire format: JSON-RPC 2.0 inside base64 envelopes.
//! Crypto: X25519 key agreement, HKDF-SHA256, ChaCha20-Poly1305, Ed25519 JWTs.

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod expirer;
pub mod heartbeat;
pub mod history;
pub mod jwt;
pub mod keychain;
pub mod messages;
pub mod pairing;
pub mod relayer;
pub mod rpc;
pub mod runtime;
pub(crate) mod services;
pub mod session;
pub mod storage;
pub mod store;
pub mod types;

pub use crypto::{Crypto, DecodeOptions, EncodeOptions};
pub use envelope::{Envelope, EnvelopeType};
pub use error::ProtocolError;
pub use expirer::{Expirer, ExpirerEvent, ExpirerTarget};
pub use history::JsonRpcHistory;
pub use keychain::KeyChain;
pub use pairing::{CreatedPairing, PairingRecord, PairingUri};
pub use relayer::publisher::RetryPolicy;
pub use relayer::{RelayerConfig, RelayerEvent};
pub use rpc::{MethodOpts, RpcMethod, SdkError};
pub use runtime::{
    Approval, ClientEvent, ClientHandle, Connection, CoreChannels, CoreConfig, Pending,
    RequestHandle, TetherCore,
};
pub use session::types::{
    ApproveParams, ConnectParams, Namespaces, PendingRequestRecord, ProposalRecord,
    RequestArguments, RequestParams, RequiredNamespace, RequiredNamespaces, SessionEventData,
    SessionNamespace, SessionRecord, SessionRequestParams,
};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use types::{Metadata, Participant, Topic};
