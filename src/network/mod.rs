//! P2P Networking module
//!
//! Speaks the Bitcoin wire protocol to keep a header chain in sync.
//!
//! # Features
//! - Binary message framing with checksum verification
//! - Version/verack handshake and ping/pong keepalive
//! - Address exchange (addr/getaddr) and DNS seed discovery
//! - Header-first chain synchronization

pub mod addrman;
pub mod codec;
pub mod discovery;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod session;
pub mod sync;
pub mod wire;

pub use addrman::{AddrManager, AddressStatus, NetworkAddress};
pub use codec::{MessageCodec, HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use discovery::{default_seeds, resolve_seed, PeerDiscovery, RetryPolicy, SeedReport};
pub use message::{
    GetHeadersMessage, Message, Network, VersionMessage, MAX_ADDR_PER_MESSAGE, PROTOCOL_VERSION,
    USER_AGENT,
};
pub use node::{
    network_data_dir, Node, NodeConfig, NodeError, NodeStatus, DEFAULT_DATA_DIR, MAX_PEERS,
};
pub use peer::{PeerDirectory, PeerError, PeerHandle, PeerInfo, SessionCommand};
pub use server::{connect_to_peer, Server};
pub use session::{run_session, spawn_session, SessionConfig, SessionState};
pub use sync::{ChainSync, SyncReport, HEADERS_RESPONSE_TIMEOUT};
pub use wire::{NetAddr, ServiceFlags, TimestampedAddr, WireError};
