//! Chain synchronization with peers
//!
//! Header-first sync: ask each ready peer for headers after our tip and
//! keep asking while it answers with full batches.

use crate::core::block::BlockHash;
use crate::core::blockchain::{ChainError, MAX_HEADERS_PER_MESSAGE};
use crate::core::manager::ChainHandle;
use crate::network::peer::{PeerDirectory, PeerHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// How long to wait for a peer's `headers` batch
pub const HEADERS_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Peers asked
    pub peers: usize,
    /// Headers received across all batches
    pub headers: usize,
    /// Peers that did not answer in time
    pub timeouts: usize,
}

/// Chain synchronization manager
pub struct ChainSync {
    chain: ChainHandle,
    directory: Arc<PeerDirectory>,
    response_timeout: Duration,
    syncing: RwLock<bool>,
}

impl ChainSync {
    pub fn new(chain: ChainHandle, directory: Arc<PeerDirectory>) -> Self {
        Self::with_timeout(chain, directory, HEADERS_RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(
        chain: ChainHandle,
        directory: Arc<PeerDirectory>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            directory,
            response_timeout,
            syncing: RwLock::new(false),
        }
    }

    pub async fn is_syncing(&self) -> bool {
        *self.syncing.read().await
    }

    /// Pull headers from every ready peer in turn. A pass already running
    /// makes this a no-op.
    pub async fn fill_blockchain(&self) -> Result<SyncReport, ChainError> {
        {
            let mut syncing = self.syncing.write().await;
            if *syncing {
                return Ok(SyncReport::default());
            }
            *syncing = true;
        }

        let result = self.sync_all().await;
        *self.syncing.write().await = false;
        result
    }

    async fn sync_all(&self) -> Result<SyncReport, ChainError> {
        let mut report = SyncReport::default();
        for peer in self.directory.ready_peers().await {
            report.peers += 1;
            self.sync_from(&peer, &mut report).await?;
        }

        let height = self.chain.stats().await?.height;
        log::info!(
            "Sync pass done: {} peers, {} headers, height {:?}",
            report.peers,
            report.headers,
            height
        );
        Ok(report)
    }

    async fn sync_from(&self, peer: &PeerHandle, report: &mut SyncReport) -> Result<(), ChainError> {
        loop {
            let tip = self.chain.tip().await?.map(|t| t.hash);
            let locator: Vec<BlockHash> = tip.into_iter().collect();

            let reply = match peer.request_headers(locator, BlockHash::zero()).await {
                Ok(reply) => reply,
                Err(e) => {
                    log::debug!("Skipping {}: {}", peer.addr, e);
                    return Ok(());
                }
            };

            match tokio::time::timeout(self.response_timeout, reply).await {
                Ok(Ok(count)) => {
                    report.headers += count;
                    if count < MAX_HEADERS_PER_MESSAGE {
                        log::debug!("{} has no more headers ({} in last batch)", peer.addr, count);
                        return Ok(());
                    }
                    if self.chain.tip().await?.map(|t| t.hash) == tip {
                        log::warn!("Full batch from {} did not extend the tip", peer.addr);
                        return Ok(());
                    }
                }
                Ok(Err(_)) => {
                    log::debug!("{} went away during sync", peer.addr);
                    return Ok(());
                }
                Err(_) => {
                    report.timeouts += 1;
                    log::warn!("Timed out waiting for headers from {}", peer.addr);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{Block, BlockHeader};
    use crate::core::blockchain::tests::{memory_chain, mine_chain};
    use crate::core::manager::ChainManager;
    use crate::network::peer::{PeerInfo, SessionCommand};
    use crate::network::wire::ServiceFlags;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn info() -> PeerInfo {
        PeerInfo {
            version: 70013,
            services: ServiceFlags::NETWORK,
            user_agent: "/fake/".into(),
            start_height: 0,
            relay: false,
            outbound: true,
        }
    }

    /// Peer that serves batches from `headers` straight into the chain
    fn serving_peer(
        addr: &str,
        genesis: BlockHash,
        headers: Vec<BlockHeader>,
        chain: ChainHandle,
    ) -> PeerHandle {
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let SessionCommand::RequestHeaders { locator, reply, .. } = command {
                    let start = match locator.first() {
                        Some(hash) if *hash == genesis => 0,
                        Some(hash) => headers
                            .iter()
                            .position(|h| h.hash() == *hash)
                            .map_or(0, |i| i + 1),
                        None => 0,
                    };
                    let batch: Vec<BlockHeader> = headers
                        .iter()
                        .skip(start)
                        .take(MAX_HEADERS_PER_MESSAGE)
                        .copied()
                        .collect();
                    for header in &batch {
                        chain.submit(Block::header_only(*header)).await.unwrap();
                    }
                    let _ = reply.send(batch.len());
                }
            }
        });
        PeerHandle::new(addr.parse().unwrap(), info(), tx, Arc::new(AtomicBool::new(true)))
    }

    fn setup() -> (ChainHandle, BlockHash) {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let genesis = chain.tip().unwrap().hash;
        let (handle, _task) = ChainManager::spawn(chain);
        (handle, genesis)
    }

    #[tokio::test]
    async fn test_full_batches_continue() {
        let (chain, genesis) = setup();
        let directory = Arc::new(PeerDirectory::new());
        let headers = mine_chain(genesis, MAX_HEADERS_PER_MESSAGE + 500);
        directory
            .promote(serving_peer("10.0.0.1:8333", genesis, headers, chain.clone()))
            .await;

        let sync = ChainSync::new(chain.clone(), directory);
        let report = sync.fill_blockchain().await.unwrap();

        assert_eq!(report.peers, 1);
        assert_eq!(report.headers, MAX_HEADERS_PER_MESSAGE + 500);
        assert_eq!(
            chain.stats().await.unwrap().height,
            Some((MAX_HEADERS_PER_MESSAGE + 500) as u64)
        );
        assert!(!sync.is_syncing().await);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (chain, genesis) = setup();
        let directory = Arc::new(PeerDirectory::new());

        // Holds requests without ever answering
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(command) = rx.recv().await {
                held.push(command);
            }
        });
        directory
            .promote(PeerHandle::new(
                "10.0.0.1:8333".parse().unwrap(),
                info(),
                tx,
                Arc::new(AtomicBool::new(true)),
            ))
            .await;
        directory
            .promote(serving_peer(
                "10.0.0.2:8333",
                genesis,
                mine_chain(genesis, 3),
                chain.clone(),
            ))
            .await;

        let sync = ChainSync::with_timeout(chain.clone(), directory, Duration::from_millis(50));
        let report = sync.fill_blockchain().await.unwrap();

        assert_eq!(report.peers, 2);
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.headers, 3);
        assert_eq!(chain.stats().await.unwrap().height, Some(3));
    }

    #[tokio::test]
    async fn test_no_peers() {
        let (chain, _) = setup();
        let sync = ChainSync::new(chain, Arc::new(PeerDirectory::new()));
        assert_eq!(sync.fill_blockchain().await.unwrap(), SyncReport::default());
    }
}
