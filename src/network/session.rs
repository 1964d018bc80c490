//! Peer session state machine
//!
//! One session per TCP connection, inbound or outbound. A reader task
//! decodes frames into a bounded queue; the session task owns the write
//! half and reacts to three sources: decoded messages, commands from
//! [`PeerHandle`]s and the keepalive deadline.
//!
//! ```text
//! Connecting -> HandshakeSent -> Ready -> Idle <-> AwaitingPong
//!                                  \________________________\-> Closed
//! ```

use crate::core::block::{Block, BlockHash, BlockHeader};
use crate::core::blockchain::{ChainError, SubmitOutcome, MAX_HEADERS_PER_MESSAGE};
use crate::core::manager::ChainHandle;
use crate::network::codec::MessageCodec;
use crate::network::message::{
    GetHeadersMessage, Message, Network, VersionMessage, MAX_ADDR_PER_MESSAGE, PROTOCOL_VERSION,
    USER_AGENT,
};
use crate::network::peer::{PeerDirectory, PeerError, PeerHandle, PeerInfo, SessionCommand};
use crate::network::wire::{NetAddr, ServiceFlags};
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Silence after which we ping
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How long a ping may go unanswered
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Decoded messages buffered between reader and session
pub const SESSION_QUEUE_SIZE: usize = 64;

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub network: Network,
    /// Services we advertise
    pub services: ServiceFlags,
    pub user_agent: String,
    /// Whether we want transaction announcements
    pub relay: bool,
    pub idle_timeout: Duration,
    pub pong_timeout: Duration,
    pub queue_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            network: Network::Main,
            services: ServiceFlags::empty(),
            user_agent: USER_AGENT.to_string(),
            relay: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            queue_size: SESSION_QUEUE_SIZE,
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    HandshakeSent,
    Ready,
    Idle,
    AwaitingPong,
    Closed,
}

impl SessionState {
    /// Handshake completed and connection still open
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Idle | SessionState::AwaitingPong
        )
    }
}

enum SessionEvent {
    Message(Message),
    /// End of stream, with the I/O error that caused it if any
    Closed(Option<io::Error>),
}

/// Run a session on its own task
pub fn spawn_session<S>(
    stream: S,
    addr: SocketAddr,
    outbound: bool,
    config: SessionConfig,
    directory: Arc<PeerDirectory>,
    chain: ChainHandle,
) -> JoinHandle<Result<(), PeerError>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(run_session(stream, addr, outbound, config, directory, chain, None))
}

/// Drive a connection until it closes. The peer is removed from the
/// directory on the way out. `ready` fires once the handshake completes
/// and is dropped unsent if the session ends before that.
pub async fn run_session<S>(
    stream: S,
    addr: SocketAddr,
    outbound: bool,
    config: SessionConfig,
    directory: Arc<PeerDirectory>,
    chain: ChainHandle,
    ready: Option<oneshot::Sender<()>>,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let codec = MessageCodec::new(config.network);
    let (read_half, write_half) = tokio::io::split(stream);
    let (events_tx, events_rx) = mpsc::channel(config.queue_size.max(1));
    let reader = tokio::spawn(read_loop(
        FramedRead::new(read_half, codec),
        addr,
        events_tx,
    ));

    let mut session = PeerSession::new(
        FramedWrite::new(write_half, codec),
        addr,
        outbound,
        config,
        directory.clone(),
        chain,
        ready,
    );
    let result = session.run(events_rx).await;

    reader.abort();
    directory.remove(&addr).await;
    drop(session);
    match &result {
        Ok(()) => log::info!("Session with {} closed", addr),
        Err(e) => log::warn!("Session with {} failed: {}", addr, e),
    }
    result
}

async fn read_loop<R>(
    mut reader: FramedRead<R, MessageCodec>,
    addr: SocketAddr,
    events: mpsc::Sender<SessionEvent>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let event = match reader.next().await {
            Some(Ok(Ok(message))) => SessionEvent::Message(message),
            Some(Ok(Err(err))) => {
                log::warn!("Dropped message from {}: {}", addr, err);
                continue;
            }
            Some(Err(err)) => SessionEvent::Closed(Some(err)),
            None => SessionEvent::Closed(None),
        };
        let closed = matches!(event, SessionEvent::Closed(_));
        if events.send(event).await.is_err() || closed {
            break;
        }
    }
}

/// Handling side of a connection
pub struct PeerSession<W> {
    addr: SocketAddr,
    outbound: bool,
    config: SessionConfig,
    state: SessionState,
    writer: FramedWrite<W, MessageCodec>,
    directory: Arc<PeerDirectory>,
    chain: ChainHandle,
    alive: Arc<AtomicBool>,
    commands_tx: mpsc::Sender<SessionCommand>,
    commands_rx: mpsc::Receiver<SessionCommand>,
    last_activity: Instant,
    /// Outstanding ping nonce and when it was sent
    ping: Option<(u64, Instant)>,
    /// Waiting for the next `headers` batch
    pending_headers: Option<oneshot::Sender<usize>>,
    ready: Option<oneshot::Sender<()>>,
}

impl<W> PeerSession<W>
where
    W: AsyncWrite + Unpin,
{
    fn new(
        writer: FramedWrite<W, MessageCodec>,
        addr: SocketAddr,
        outbound: bool,
        config: SessionConfig,
        directory: Arc<PeerDirectory>,
        chain: ChainHandle,
        ready: Option<oneshot::Sender<()>>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            addr,
            outbound,
            config,
            state: SessionState::Connecting,
            writer,
            directory,
            chain,
            alive: Arc::new(AtomicBool::new(false)),
            commands_tx,
            commands_rx,
            last_activity: Instant::now(),
            ping: None,
            pending_headers: None,
            ready,
        }
    }

    async fn run(&mut self, mut events: mpsc::Receiver<SessionEvent>) -> Result<(), PeerError> {
        let result = self.drive(&mut events).await;
        self.alive.store(false, Ordering::Relaxed);
        self.transition(SessionState::Closed);
        result
    }

    async fn drive(&mut self, events: &mut mpsc::Receiver<SessionEvent>) -> Result<(), PeerError> {
        self.send_version().await?;

        loop {
            let deadline = self.deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Message(message)) => {
                        self.last_activity = Instant::now();
                        self.handle_message(message).await?;
                    }
                    Some(SessionEvent::Closed(Some(err))) => return Err(PeerError::Network(err)),
                    Some(SessionEvent::Closed(None)) | None => return Ok(()),
                },
                Some(command) = self.commands_rx.recv() => match command {
                    SessionCommand::RequestHeaders { locator, stop, reply } => {
                        self.request_headers(locator, stop, reply).await?;
                    }
                    SessionCommand::Disconnect => {
                        log::info!("Disconnecting {}", self.addr);
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep_until(deadline) => self.on_timeout().await?,
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::trace!("{}: {:?} -> {:?}", self.addr, self.state, next);
            self.state = next;
        }
    }

    fn deadline(&self) -> Instant {
        match self.ping {
            Some((_, sent)) => sent + self.config.pong_timeout,
            None => self.last_activity + self.config.idle_timeout,
        }
    }

    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        log::trace!("{} <- {}", self.addr, message);
        self.writer.send(message).await?;
        Ok(())
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn send_version(&mut self) -> Result<(), PeerError> {
        let start_height = match self.chain.tip().await {
            Ok(tip) => tip
                .map(|t| i32::try_from(t.height).unwrap_or(i32::MAX))
                .unwrap_or(0),
            Err(e) => {
                log::warn!("Chain tip unavailable for version to {}: {}", self.addr, e);
                0
            }
        };

        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: self.config.services,
            timestamp: chrono::Utc::now().timestamp(),
            receiver: NetAddr::from_socket_addr(self.addr, ServiceFlags::empty()),
            sender: NetAddr::unspecified(),
            nonce: rand::random(),
            user_agent: self.config.user_agent.clone(),
            start_height,
            relay: self.config.relay,
        };
        self.send(Message::Version(version)).await?;
        self.transition(SessionState::HandshakeSent);
        Ok(())
    }

    async fn accept_version(&mut self, version: VersionMessage) -> Result<(), PeerError> {
        let info = PeerInfo::from_version(&version, self.outbound);
        log::debug!(
            "Version from {}: protocol {}, services {:?}, height {}",
            self.addr,
            info.version,
            info.services,
            info.start_height
        );

        self.alive.store(true, Ordering::Relaxed);
        let handle = PeerHandle::new(
            self.addr,
            info,
            self.commands_tx.clone(),
            self.alive.clone(),
        );
        self.directory.promote(handle).await;

        self.send(Message::Verack).await?;
        self.send(Message::GetAddr).await?;
        self.transition(SessionState::Ready);
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        log::trace!("{} -> {}", self.addr, message);

        if !self.state.is_ready() {
            return match message {
                Message::Version(version) => self.accept_version(version).await,
                other => {
                    log::debug!("Ignoring {} from {} before handshake", other, self.addr);
                    Ok(())
                }
            };
        }

        match message {
            Message::Version(_) => log::debug!("Duplicate version from {}", self.addr),
            Message::Verack => log::debug!("Handshake with {} acknowledged", self.addr),
            Message::Ping(nonce) => self.send(Message::Pong(nonce)).await?,
            Message::Pong(nonce) => self.accept_pong(nonce),
            Message::Addr(addrs) => {
                let added = self.directory.add_addresses(&addrs).await;
                log::debug!(
                    "{} sent {} addresses, {} new",
                    self.addr,
                    addrs.len(),
                    added
                );
            }
            Message::GetAddr => {
                let addrs = self.directory.known_addresses(MAX_ADDR_PER_MESSAGE).await;
                self.send(Message::Addr(addrs)).await?;
            }
            Message::GetHeaders(request) => self.serve_headers(request).await?,
            Message::Headers(headers) => self.accept_headers(headers).await?,
            Message::Unsupported { command, .. } => {
                log::debug!("Ignoring '{}' from {}", command, self.addr)
            }
        }
        Ok(())
    }

    async fn serve_headers(&mut self, request: GetHeadersMessage) -> Result<(), PeerError> {
        match self
            .chain
            .headers_after(request.locator, request.stop, MAX_HEADERS_PER_MESSAGE)
            .await
        {
            Ok(headers) => self.send(Message::Headers(headers)).await,
            Err(ChainError::Unavailable) => Err(ChainError::Unavailable.into()),
            Err(e) => {
                log::warn!("Cannot serve headers to {}: {}", self.addr, e);
                Ok(())
            }
        }
    }

    async fn accept_headers(&mut self, headers: Vec<BlockHeader>) -> Result<(), PeerError> {
        let count = headers.len();
        let mut linked = 0;
        let mut orphaned = 0;

        for header in headers {
            match self.chain.submit(Block::header_only(header)).await {
                Ok(SubmitOutcome::Orphaned) => orphaned += 1,
                Ok(outcome) if outcome.advanced_tip() => linked += 1,
                Ok(_) => {}
                Err(ChainError::Unavailable) => return Err(ChainError::Unavailable.into()),
                Err(e) => log::warn!(
                    "Rejected header {} from {}: {}",
                    header.hash(),
                    self.addr,
                    e
                ),
            }
        }

        log::info!(
            "Received {} headers from {} ({} linked, {} orphaned)",
            count,
            self.addr,
            linked,
            orphaned
        );
        if let Some(reply) = self.pending_headers.take() {
            let _ = reply.send(count);
        }
        Ok(())
    }

    async fn request_headers(
        &mut self,
        locator: Vec<BlockHash>,
        stop: BlockHash,
        reply: oneshot::Sender<usize>,
    ) -> Result<(), PeerError> {
        if !self.state.is_ready() {
            log::debug!("Header request for {} before handshake", self.addr);
            return Ok(());
        }
        self.send(Message::GetHeaders(GetHeadersMessage::new(locator, stop)))
            .await?;
        self.pending_headers = Some(reply);
        Ok(())
    }

    // =========================================================================
    // Keepalive
    // =========================================================================

    fn accept_pong(&mut self, nonce: u64) {
        match self.ping {
            Some((expected, _)) if expected == nonce => {
                self.ping = None;
                self.alive.store(true, Ordering::Relaxed);
                self.transition(SessionState::Idle);
            }
            _ => log::debug!("Unexpected pong {} from {}", nonce, self.addr),
        }
    }

    async fn on_timeout(&mut self) -> Result<(), PeerError> {
        if self.ping.take().is_some() {
            log::warn!("{} did not answer ping, marking not alive", self.addr);
            self.alive.store(false, Ordering::Relaxed);
            self.transition(SessionState::Idle);
            self.last_activity = Instant::now();
            return Ok(());
        }

        if !self.state.is_ready() {
            log::debug!("Still waiting for version from {}", self.addr);
            self.last_activity = Instant::now();
            return Ok(());
        }

        self.transition(SessionState::Idle);
        let nonce = rand::random();
        self.send(Message::Ping(nonce)).await?;
        self.ping = Some((nonce, Instant::now()));
        self.transition(SessionState::AwaitingPong);
        Ok(())
    }
}
