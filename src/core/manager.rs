//! Chain manager actor
//!
//! A single task owns the [`Chain`] and serves requests from a bounded
//! queue, so header submissions (and the orphan cascades they trigger) are
//! serialized without any lock. [`ChainHandle`] is the cloneable client
//! used by peer sessions and the sync loop.

use crate::core::block::{Block, BlockHash, BlockHeader, StoredHeader};
use crate::core::blockchain::{Chain, ChainError, ChainStats, SubmitOutcome};
use crate::core::transaction::Transaction;
use crate::storage::{BlockBodyStore, HeaderStore};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Pending requests the actor will queue before callers wait
pub const CHAIN_QUEUE_SIZE: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, ChainError>>;

enum ChainRequest {
    Submit {
        block: Block,
        reply: Reply<SubmitOutcome>,
    },
    Tip {
        reply: oneshot::Sender<Option<StoredHeader>>,
    },
    ByHash {
        hash: BlockHash,
        reply: Reply<Option<StoredHeader>>,
    },
    ByHeight {
        height: u64,
        reply: Reply<Option<StoredHeader>>,
    },
    Body {
        hash: BlockHash,
        reply: Reply<Option<Vec<Transaction>>>,
    },
    HeadersAfter {
        locator: Vec<BlockHash>,
        stop: BlockHash,
        max: usize,
        reply: Reply<Vec<BlockHeader>>,
    },
    Stats {
        reply: oneshot::Sender<ChainStats>,
    },
}

/// Spawns the actor that owns a chain
pub struct ChainManager;

impl ChainManager {
    /// Move `chain` into its own task. The task ends once every handle
    /// has been dropped.
    pub fn spawn<H, B>(chain: Chain<H, B>) -> (ChainHandle, JoinHandle<()>)
    where
        H: HeaderStore,
        B: BlockBodyStore,
    {
        let (tx, rx) = mpsc::channel(CHAIN_QUEUE_SIZE);
        let task = tokio::spawn(Self::run(chain, rx));
        (ChainHandle { tx }, task)
    }

    async fn run<H, B>(mut chain: Chain<H, B>, mut rx: mpsc::Receiver<ChainRequest>)
    where
        H: HeaderStore,
        B: BlockBodyStore,
    {
        while let Some(request) = rx.recv().await {
            match request {
                ChainRequest::Submit { block, reply } => {
                    let _ = reply.send(chain.submit(block));
                }
                ChainRequest::Tip { reply } => {
                    let _ = reply.send(chain.tip().copied());
                }
                ChainRequest::ByHash { hash, reply } => {
                    let _ = reply.send(chain.lookup_by_hash(&hash));
                }
                ChainRequest::ByHeight { height, reply } => {
                    let _ = reply.send(chain.lookup_by_height(height));
                }
                ChainRequest::Body { hash, reply } => {
                    let _ = reply.send(chain.body(&hash));
                }
                ChainRequest::HeadersAfter {
                    locator,
                    stop,
                    max,
                    reply,
                } => {
                    let _ = reply.send(chain.headers_after(&locator, &stop, max));
                }
                ChainRequest::Stats { reply } => {
                    let _ = reply.send(chain.stats());
                }
            }
        }
        log::debug!("Chain manager stopped");
    }
}

/// Client side of the chain manager
#[derive(Clone)]
pub struct ChainHandle {
    tx: mpsc::Sender<ChainRequest>,
}

impl ChainHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ChainRequest,
    ) -> Result<T, ChainError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ChainError::Unavailable)?;
        rx.await.map_err(|_| ChainError::Unavailable)
    }

    /// Validate and link a block
    pub async fn submit(&self, block: Block) -> Result<SubmitOutcome, ChainError> {
        self.request(|reply| ChainRequest::Submit { block, reply })
            .await?
    }

    /// Current best header, `None` before bootstrap
    pub async fn tip(&self) -> Result<Option<StoredHeader>, ChainError> {
        self.request(|reply| ChainRequest::Tip { reply }).await
    }

    pub async fn lookup_by_hash(
        &self,
        hash: BlockHash,
    ) -> Result<Option<StoredHeader>, ChainError> {
        self.request(|reply| ChainRequest::ByHash { hash, reply })
            .await?
    }

    pub async fn lookup_by_height(&self, height: u64) -> Result<Option<StoredHeader>, ChainError> {
        self.request(|reply| ChainRequest::ByHeight { height, reply })
            .await?
    }

    pub async fn body(&self, hash: BlockHash) -> Result<Option<Vec<Transaction>>, ChainError> {
        self.request(|reply| ChainRequest::Body { hash, reply })
            .await?
    }

    /// Headers to answer a `getheaders` request with
    pub async fn headers_after(
        &self,
        locator: Vec<BlockHash>,
        stop: BlockHash,
        max: usize,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        self.request(|reply| ChainRequest::HeadersAfter {
            locator,
            stop,
            max,
            reply,
        })
        .await?
    }

    pub async fn stats(&self) -> Result<ChainStats, ChainError> {
        self.request(|reply| ChainRequest::Stats { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blockchain::tests::{memory_chain, mine_chain};

    #[tokio::test]
    async fn test_actor_roundtrip() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let (handle, _task) = ChainManager::spawn(chain);

        let genesis = handle.tip().await.unwrap().unwrap();
        assert_eq!(genesis.height, 0);

        let headers = mine_chain(genesis.hash, 2);
        let outcome = handle.submit(Block::header_only(headers[1])).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Orphaned);
        let outcome = handle.submit(Block::header_only(headers[0])).await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Extended {
                height: 1,
                reattached: 1
            }
        );

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.height, Some(2));
        assert_eq!(stats.orphans, 0);
        assert_eq!(
            handle.lookup_by_height(2).await.unwrap().unwrap().hash,
            headers[1].hash()
        );
        assert!(handle
            .lookup_by_hash(headers[0].hash())
            .await
            .unwrap()
            .is_some());
        assert!(handle.body(genesis.hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_serialize() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let genesis = chain.tip().unwrap().hash;
        let (handle, _task) = ChainManager::spawn(chain);

        let headers = mine_chain(genesis, 20);
        let mut tasks = Vec::new();
        for header in headers.iter().rev() {
            let handle = handle.clone();
            let block = Block::header_only(*header);
            tasks.push(tokio::spawn(async move { handle.submit(block).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.height, Some(20));
        assert_eq!(stats.orphans, 0);
    }

    #[tokio::test]
    async fn test_unavailable_after_stop() {
        let (handle, task) = ChainManager::spawn(memory_chain());
        task.abort();
        let _ = task.await;
        assert!(matches!(handle.tip().await, Err(ChainError::Unavailable)));
    }
}
