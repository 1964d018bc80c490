//! Peer management for P2P networking
//!
//! [`PeerDirectory`] is the registry shared by the dialer, the listener and
//! every session: the address book plus the set of sessions that completed
//! their handshake. Each registry sits behind its own `RwLock`.

use crate::core::block::BlockHash;
use crate::core::blockchain::ChainError;
use crate::network::addrman::{AddrManager, AddressStatus};
use crate::network::message::VersionMessage;
use crate::network::wire::{ServiceFlags, TimestampedAddr};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Peer disconnected")]
    Closed,
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

/// What the remote side told us in its `version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub version: i32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
    /// Whether we dialed this peer
    pub outbound: bool,
}

impl PeerInfo {
    pub fn from_version(version: &VersionMessage, outbound: bool) -> Self {
        Self {
            version: version.version,
            services: version.services,
            user_agent: version.user_agent.clone(),
            start_height: version.start_height,
            relay: version.relay,
            outbound,
        }
    }
}

/// Requests a running session accepts from outside
#[derive(Debug)]
pub enum SessionCommand {
    /// Send `getheaders` and reply with the size of the next `headers` batch
    /// once it has been handed to the chain
    RequestHeaders {
        locator: Vec<BlockHash>,
        stop: BlockHash,
        reply: oneshot::Sender<usize>,
    },
    /// Close the connection
    Disconnect,
}

/// Handle for talking to a ready session
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub info: PeerInfo,
    commands: mpsc::Sender<SessionCommand>,
    alive: Arc<AtomicBool>,
}

impl PeerHandle {
    pub fn new(
        addr: SocketAddr,
        info: PeerInfo,
        commands: mpsc::Sender<SessionCommand>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            addr,
            info,
            commands,
            alive,
        }
    }

    /// Advisory liveness, cleared when a ping goes unanswered
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Ask the session for headers following `locator`
    pub async fn request_headers(
        &self,
        locator: Vec<BlockHash>,
        stop: BlockHash,
    ) -> Result<oneshot::Receiver<usize>, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::RequestHeaders {
                locator,
                stop,
                reply,
            })
            .await
            .map_err(|_| PeerError::Closed)?;
        Ok(rx)
    }

    pub async fn disconnect(&self) -> Result<(), PeerError> {
        self.commands
            .send(SessionCommand::Disconnect)
            .await
            .map_err(|_| PeerError::Closed)
    }
}

/// Known addresses and ready sessions
#[derive(Default)]
pub struct PeerDirectory {
    addresses: RwLock<AddrManager>,
    peers: RwLock<HashMap<SocketAddr, PeerHandle>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address. Returns false for port 0 or a known host.
    pub async fn add_address(&self, ip: IpAddr, port: u16) -> bool {
        self.addresses
            .write()
            .await
            .add(ip, port, ServiceFlags::empty())
    }

    /// Merge the entries of an `addr` message, returning how many were new
    pub async fn add_addresses(&self, addrs: &[TimestampedAddr]) -> usize {
        let mut book = self.addresses.write().await;
        addrs
            .iter()
            .filter(|entry| book.add(entry.addr.ip, entry.addr.port, entry.addr.services))
            .count()
    }

    /// Addresses never dialed
    pub async fn next_unconnected(&self) -> Vec<SocketAddr> {
        self.addresses.read().await.unconnected()
    }

    pub async fn mark_attempted(&self, ip: IpAddr) -> bool {
        self.addresses.write().await.attempt(&ip)
    }

    pub async fn mark_connected(&self, ip: IpAddr, services: ServiceFlags) -> bool {
        self.addresses.write().await.good(&ip, services)
    }

    pub async fn address_status(&self, ip: IpAddr) -> Option<AddressStatus> {
        self.addresses.read().await.get(&ip).map(|entry| entry.status)
    }

    /// Register a session that completed its handshake. Inbound peers
    /// connect from an ephemeral port, so only dialed addresses are marked.
    pub async fn promote(&self, handle: PeerHandle) {
        if handle.info.outbound {
            self.mark_connected(handle.addr.ip(), handle.info.services)
                .await;
        }
        log::info!(
            "Peer {} ready ({}, height {})",
            handle.addr,
            handle.info.user_agent,
            handle.info.start_height
        );
        self.peers.write().await.insert(handle.addr, handle);
    }

    /// Drop a closed session
    pub async fn remove(&self, addr: &SocketAddr) -> Option<PeerHandle> {
        let removed = self.peers.write().await.remove(addr);
        if removed.is_some() {
            log::info!("Peer {} removed", addr);
        }
        removed
    }

    /// Sessions whose alive flag is set
    pub async fn count_alive(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| peer.is_alive())
            .count()
    }

    /// Handles of every registered session, ordered by address
    pub async fn ready_peers(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = self.peers.read().await.values().cloned().collect();
        peers.sort_by_key(|peer| peer.addr);
        peers
    }

    /// Up to `limit` addresses to advertise
    pub async fn known_addresses(&self, limit: usize) -> Vec<TimestampedAddr> {
        self.addresses.read().await.sample(limit)
    }

    pub async fn address_count(&self) -> usize {
        self.addresses.read().await.size()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}
