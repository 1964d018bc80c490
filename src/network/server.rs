//! TCP server and connection handling
//!
//! Accepts inbound peers and dials outbound ones. Every connection ends up
//! in a [`session`](super::session) either way.

use crate::core::manager::ChainHandle;
use crate::network::peer::{PeerDirectory, PeerError};
use crate::network::session::{spawn_session, SessionConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How long an outbound TCP connect may take
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to a port on all interfaces
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        Self::bind_addr(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    pub async fn bind_addr(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }

    /// Accept forever, starting an inbound session per connection
    pub fn spawn_accept_loop(
        self,
        config: SessionConfig,
        directory: Arc<PeerDirectory>,
        chain: ChainHandle,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.accept().await {
                    Ok((stream, addr)) => {
                        log::info!("Inbound connection from {}", addr);
                        spawn_session(
                            stream,
                            addr,
                            false,
                            config.clone(),
                            directory.clone(),
                            chain.clone(),
                        );
                    }
                    Err(e) => {
                        log::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, PeerError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::ConnectionFailed(format!("{}: timed out", addr)))?
        .map_err(|e| PeerError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Cannot set TCP_NODELAY for {}: {}", addr, e);
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::Block;
    use crate::core::blockchain::tests::memory_chain;
    use crate::core::manager::ChainManager;
    use crate::network::codec::MessageCodec;
    use crate::network::message::Message;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn test_inbound_session_sends_version() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let (chain, _task) = ChainManager::spawn(chain);
        let directory = Arc::new(PeerDirectory::new());

        let server = Server::bind_addr("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr();
        assert_ne!(server.port(), 0);
        let _accept = server.spawn_accept_loop(SessionConfig::default(), directory, chain);

        let stream = connect_to_peer(addr, CONNECT_TIMEOUT).await.unwrap();
        let mut reader = FramedRead::new(stream, MessageCodec::default());
        let first = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(first, Message::Version(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            connect_to_peer(addr, Duration::from_secs(2)).await,
            Err(PeerError::ConnectionFailed(_))
        ));
    }
}
