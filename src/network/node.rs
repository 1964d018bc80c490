//! P2P Node implementation
//!
//! The main node that orchestrates all networking components: it opens
//! the stores, spawns the chain manager, seeds the peer directory, keeps
//! the number of live peers at the configured maximum and runs header
//! sync periodically.

use crate::core::block::BlockHash;
use crate::core::blockchain::{Chain, ChainError};
use crate::core::manager::{ChainHandle, ChainManager};
use crate::network::discovery::{default_seeds, resolve_seed, PeerDiscovery, RetryPolicy};
use crate::network::message::{Network, USER_AGENT};
use crate::network::peer::PeerDirectory;
use crate::network::server::{connect_to_peer, Server, CONNECT_TIMEOUT};
use crate::network::session::{run_session, SessionConfig};
use crate::network::sync::ChainSync;
use crate::storage::{
    BlockBodyStore, FileBodyStore, FileHeaderStore, HeaderStore, StorageConfig, StorageError,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default cap on live peers
pub const MAX_PEERS: usize = 50;

/// Default base data directory
pub const DEFAULT_DATA_DIR: &str = ".goldchain";

/// Where `network` keeps its stores under `base`
pub fn network_data_dir(base: &Path, network: Network) -> PathBuf {
    match network.data_subdir() {
        Some(subdir) => base.join(subdir),
        None => base.to_path_buf(),
    }
}

/// Node startup errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Stored chain starts at {found}, not the {network} genesis {expected}")]
    WrongNetwork {
        network: Network,
        expected: BlockHash,
        found: BlockHash,
    },
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    /// Port to listen on
    pub port: u16,
    /// Accept inbound connections
    pub listen: bool,
    pub max_peers: usize,
    /// Data directory for header and body storage
    pub data_dir: PathBuf,
    /// DNS seeds
    pub seeds: Vec<String>,
    /// Initial peers to connect to (`host[:port]`)
    pub bootstrap_peers: Vec<String>,
    pub user_agent: String,
    pub connect_interval: Duration,
    pub sync_interval: Duration,
    pub retry: RetryPolicy,
    pub idle_timeout: Duration,
    pub pong_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_network(Network::Main)
    }
}

impl NodeConfig {
    /// Defaults for `network`: its port and DNS seeds
    pub fn for_network(network: Network) -> Self {
        let session = SessionConfig::default();
        Self {
            network,
            port: network.default_port(),
            listen: false,
            max_peers: MAX_PEERS,
            data_dir: network_data_dir(Path::new(DEFAULT_DATA_DIR), network),
            seeds: default_seeds(network),
            bootstrap_peers: Vec::new(),
            user_agent: USER_AGENT.to_string(),
            connect_interval: Duration::from_secs(5),
            sync_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            idle_timeout: session.idle_timeout,
            pong_timeout: session.pong_timeout,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            network: self.network,
            user_agent: self.user_agent.clone(),
            idle_timeout: self.idle_timeout,
            pong_timeout: self.pong_timeout,
            ..SessionConfig::default()
        }
    }
}

/// Node status information
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub network: Network,
    pub height: Option<u64>,
    pub tip: Option<BlockHash>,
    pub orphans: usize,
    pub peers: usize,
    pub alive_peers: usize,
    pub addresses: usize,
    pub syncing: bool,
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    directory: Arc<PeerDirectory>,
    chain: ChainHandle,
    sync: Arc<ChainSync>,
    /// Outbound connects in flight
    dialing: Arc<AtomicUsize>,
    chain_task: JoinHandle<()>,
}

impl Node {
    /// Open the on-disk stores under `config.data_dir` and start the chain
    /// manager. Storage failures here are fatal.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let storage = StorageConfig::with_data_dir(&config.data_dir);
        let headers = FileHeaderStore::open(&storage)?;
        let bodies = FileBodyStore::open(&storage)?;
        log::info!(
            "Opened header store {} ({} headers)",
            headers.path().display(),
            headers.len()
        );
        Self::with_stores(config, headers, bodies)
    }

    /// Start on caller-provided stores. Must run inside a tokio runtime.
    pub fn with_stores<H, B>(config: NodeConfig, headers: H, bodies: B) -> Result<Self, NodeError>
    where
        H: HeaderStore,
        B: BlockBodyStore,
    {
        let network = config.network;
        let mut chain = Chain::open(headers, bodies)?;
        if chain.bootstrap_genesis(network.genesis_block())? {
            log::info!("Stored {} genesis block", network);
        }

        let expected = network.genesis_header().hash();
        if let Some(first) = chain.lookup_by_height(0)? {
            if first.hash != expected {
                return Err(NodeError::WrongNetwork {
                    network,
                    expected,
                    found: first.hash,
                });
            }
        }
        if let Some(tip) = chain.tip() {
            log::info!("Chain tip {} at height {}", tip.hash, tip.height);
        }

        let (chain, chain_task) = ChainManager::spawn(chain);
        let directory = Arc::new(PeerDirectory::new());
        let sync = Arc::new(ChainSync::new(chain.clone(), directory.clone()));

        Ok(Self {
            config,
            directory,
            chain,
            sync,
            dialing: Arc::new(AtomicUsize::new(0)),
            chain_task,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn directory(&self) -> Arc<PeerDirectory> {
        self.directory.clone()
    }

    pub fn chain(&self) -> ChainHandle {
        self.chain.clone()
    }

    pub fn chain_sync(&self) -> Arc<ChainSync> {
        self.sync.clone()
    }

    /// Listen (if configured), seed the directory, then keep peers topped
    /// up and sync on a timer. Only returns on a startup error.
    pub async fn run(&self) -> Result<(), NodeError> {
        let _accept = if self.config.listen {
            let server = Server::bind(self.config.port)
                .await
                .map_err(|source| NodeError::Bind {
                    port: self.config.port,
                    source,
                })?;
            Some(server.spawn_accept_loop(
                self.config.session_config(),
                self.directory.clone(),
                self.chain.clone(),
            ))
        } else {
            None
        };

        self.add_bootstrap_peers().await;
        self.discovery().bootstrap().await;

        let mut connect_tick = tokio::time::interval(self.config.connect_interval);
        let mut sync_tick = tokio::time::interval(self.config.sync_interval);
        loop {
            tokio::select! {
                _ = connect_tick.tick() => {
                    self.maintain_connections().await;
                }
                _ = sync_tick.tick() => {
                    self.spawn_sync();
                }
            }
        }
    }

    fn discovery(&self) -> PeerDiscovery {
        PeerDiscovery::new(
            self.config.seeds.clone(),
            self.config.network.default_port(),
            self.config.retry.clone(),
            self.directory.clone(),
        )
    }

    async fn add_bootstrap_peers(&self) {
        for peer in &self.config.bootstrap_peers {
            match resolve_seed(peer, self.config.network.default_port()).await {
                Ok(addrs) => {
                    for addr in addrs {
                        self.directory.add_address(addr.ip(), addr.port()).await;
                    }
                }
                Err(e) => log::warn!("Cannot resolve bootstrap peer {}: {}", peer, e),
            }
        }
    }

    /// Dial unconnected addresses until live peers plus in-flight dials
    /// reach `max_peers`. Returns the number of dials started.
    pub async fn maintain_connections(&self) -> usize {
        let alive = self.directory.count_alive().await;
        let in_flight = self.dialing.load(Ordering::Relaxed);
        let wanted = self.config.max_peers.saturating_sub(alive + in_flight);
        if wanted == 0 {
            return 0;
        }

        let mut candidates = self.directory.next_unconnected().await;
        if candidates.is_empty() && alive == 0 && in_flight == 0 {
            log::info!("No addresses left to dial, querying seeds again");
            self.discovery().resolve_once().await;
            candidates = self.directory.next_unconnected().await;
        }

        let mut started = 0;
        for addr in candidates.into_iter().take(wanted) {
            self.directory.mark_attempted(addr.ip()).await;
            self.dial(addr);
            started += 1;
        }
        if started > 0 {
            log::debug!("Dialing {} peers ({} alive)", started, alive);
        }
        started
    }

    /// Connect and run an outbound session. The dial counts as in flight
    /// until the handshake completes or the connection ends.
    fn dial(&self, addr: SocketAddr) {
        let directory = self.directory.clone();
        let chain = self.chain.clone();
        let config = self.config.session_config();
        let dialing = self.dialing.clone();
        dialing.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let stream = match connect_to_peer(addr, CONNECT_TIMEOUT).await {
                Ok(stream) => stream,
                Err(e) => {
                    dialing.fetch_sub(1, Ordering::Relaxed);
                    log::debug!("{}", e);
                    return;
                }
            };
            log::info!("Connected to {}", addr);

            let (ready_tx, ready_rx) = oneshot::channel();
            tokio::spawn(async move {
                // Err means the session ended before its handshake
                let _ = ready_rx.await;
                dialing.fetch_sub(1, Ordering::Relaxed);
            });

            // Outcome is logged by the session
            let _ = run_session(
                stream,
                addr,
                true,
                config,
                directory,
                chain,
                Some(ready_tx),
            )
            .await;
        });
    }

    /// Run a sync pass in the background unless one is running
    pub fn spawn_sync(&self) -> JoinHandle<()> {
        let sync = self.sync.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.fill_blockchain().await {
                log::error!("Header sync failed: {}", e);
            }
        })
    }

    pub async fn status(&self) -> Result<NodeStatus, ChainError> {
        let stats = self.chain.stats().await?;
        Ok(NodeStatus {
            network: self.config.network,
            height: stats.height,
            tip: stats.tip,
            orphans: stats.orphans,
            peers: self.directory.peer_count().await,
            alive_peers: self.directory.count_alive().await,
            addresses: self.directory.address_count().await,
            syncing: self.sync.is_syncing().await,
        })
    }

    /// Close every session
    pub async fn shutdown(&self) {
        for peer in self.directory.ready_peers().await {
            let _ = peer.disconnect().await;
        }
        log::info!("Node shut down");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.chain_task.abort();
    }
}
