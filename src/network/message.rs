//! Network message types for P2P communication
//!
//! Payload layouts for the subset of the Bitcoin protocol the node speaks.
//! Framing (magic, command, length, checksum) lives in [`super::codec`].

use crate::core::block::{Block, BlockHash, BlockHeader, BLOCK_HEADER_SIZE};
use crate::core::blockchain::MAX_HEADERS_PER_MESSAGE;
use crate::network::wire::{
    ensure_remaining, read_array, read_count, read_varint, read_varstr, write_varint,
    write_varstr, NetAddr, ServiceFlags, TimestampedAddr, WireError, MAX_USER_AGENT_LENGTH,
};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Protocol version
pub const PROTOCOL_VERSION: i32 = 70013;

/// User agent sent in our `version` message
pub const USER_AGENT: &str = concat!("/goldchain:", env!("CARGO_PKG_VERSION"), "/");

/// Maximum entries in one `addr` message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Maximum hashes in a block locator
pub const MAX_LOCATOR_HASHES: usize = 101;

// =============================================================================
// Networks
// =============================================================================

/// Networks whose magic values frame valid messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Main,
    Testnet,
    Regtest,
    Signet,
}

impl Network {
    pub const ALL: [Network; 4] = [
        Network::Main,
        Network::Testnet,
        Network::Regtest,
        Network::Signet,
    ];

    /// Start-string of every frame on this network
    pub fn magic(&self) -> u32 {
        match self {
            Network::Main => 0xD9B4BEF9,
            Network::Testnet => 0x0709110B,
            Network::Regtest => 0xDAB5BFFA,
            Network::Signet => 0x40CF030A,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Network> {
        Self::ALL.into_iter().find(|n| n.magic() == magic)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Main => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
            Network::Signet => 38333,
        }
    }

    /// First header of this network's chain
    pub fn genesis_header(&self) -> BlockHeader {
        match self {
            Network::Main => Block::genesis_header(),
            Network::Testnet => Block::genesis_header_with(1296688602, 0x1d00ffff, 414098458),
            Network::Regtest => Block::genesis_header_with(1296688602, 0x207fffff, 2),
            Network::Signet => Block::genesis_header_with(1598918400, 0x1e0377ae, 52613770),
        }
    }

    /// Genesis header with its coinbase body
    pub fn genesis_block(&self) -> Block {
        Block::genesis_with(self.genesis_header())
    }

    /// Directory under the data dir holding this network's stores;
    /// main uses the data dir itself
    pub fn data_subdir(&self) -> Option<&'static str> {
        match self {
            Network::Main => None,
            Network::Testnet => Some("testnet3"),
            Network::Regtest => Some("regtest"),
            Network::Signet => Some("signet"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
            Network::Signet => "signet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" | "bitcoin" => Ok(Network::Main),
            "test" | "testnet" | "testnet3" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// `version` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    /// Sender's clock (unix seconds)
    pub timestamp: i64,
    pub receiver: NetAddr,
    pub sender: NetAddr,
    /// Random per-connection value for self-connection detection
    pub nonce: u64,
    pub user_agent: String,
    /// Best height known to the sender
    pub start_height: i32,
    /// Whether the sender wants transaction announcements
    pub relay: bool,
}

impl VersionMessage {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.version);
        dst.put_u64_le(self.services.bits());
        dst.put_i64_le(self.timestamp);
        self.receiver.encode(dst);
        self.sender.encode(dst);
        dst.put_u64_le(self.nonce);
        write_varstr(dst, &self.user_agent);
        dst.put_i32_le(self.start_height);
        dst.put_u8(self.relay as u8);
    }

    fn decode(src: &mut &[u8]) -> Result<Self, WireError> {
        ensure_remaining(src, 20, "version header")?;
        let version = src.get_i32_le();
        let services = ServiceFlags::from_bits_retain(src.get_u64_le());
        let timestamp = src.get_i64_le();
        let receiver = NetAddr::decode(src)?;
        let sender = NetAddr::decode(src)?;
        ensure_remaining(src, 8, "version nonce")?;
        let nonce = src.get_u64_le();
        let user_agent = read_varstr(src, MAX_USER_AGENT_LENGTH)?;
        ensure_remaining(src, 4, "start height")?;
        let start_height = src.get_i32_le();
        // BIP 37: peers that omit the byte want relay
        let relay = if src.has_remaining() {
            src.get_u8() != 0
        } else {
            true
        };

        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// `getheaders` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    /// Hashes we have, newest first
    pub locator: Vec<BlockHash>,
    /// Last header wanted, zero for "as many as allowed"
    pub stop: BlockHash,
}

impl GetHeadersMessage {
    pub fn new(locator: Vec<BlockHash>, stop: BlockHash) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            locator,
            stop,
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.version);
        write_varint(dst, self.locator.len() as u64);
        for hash in &self.locator {
            dst.put_slice(hash.as_bytes());
        }
        dst.put_slice(self.stop.as_bytes());
    }

    fn decode(src: &mut &[u8]) -> Result<Self, WireError> {
        ensure_remaining(src, 4, "getheaders version")?;
        let version = src.get_u32_le();
        let count = read_count(src, MAX_LOCATOR_HASHES, "locator")?;
        ensure_remaining(src, (count + 1) * 32, "locator hashes")?;
        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(BlockHash::from_bytes(read_array(src, "locator hash")?));
        }
        let stop = BlockHash::from_bytes(read_array(src, "stop hash")?);
        Ok(Self {
            version,
            locator,
            stop,
        })
    }
}

// =============================================================================
// Message
// =============================================================================

/// Every message the node understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Opens the handshake
    Version(VersionMessage),
    /// Acknowledges a `version`
    Verack,
    /// Asks for known peer addresses
    GetAddr,
    /// Peer addresses
    Addr(Vec<TimestampedAddr>),
    /// Keep-alive ping
    Ping(u64),
    /// Keep-alive pong response
    Pong(u64),
    GetHeaders(GetHeadersMessage),
    /// Up to 2000 headers following a locator
    Headers(Vec<BlockHeader>),
    /// Any command we don't handle; payload kept as received
    Unsupported { command: String, payload: Vec<u8> },
}

impl Message {
    /// Command name in the frame header
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Unsupported { command, .. } => command,
        }
    }

    /// Serialize the payload (frame body) of this message
    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Message::Version(version) => version.encode(dst),
            Message::Verack | Message::GetAddr => {}
            Message::Addr(addrs) => {
                write_varint(dst, addrs.len() as u64);
                for addr in addrs {
                    addr.encode(dst);
                }
            }
            Message::Ping(nonce) | Message::Pong(nonce) => dst.put_u64_le(*nonce),
            Message::GetHeaders(request) => request.encode(dst),
            Message::Headers(headers) => {
                write_varint(dst, headers.len() as u64);
                for header in headers {
                    dst.put_slice(&header.to_bytes());
                    // Header-only entries carry no transactions
                    write_varint(dst, 0);
                }
            }
            Message::Unsupported { payload, .. } => dst.put_slice(payload),
        }
    }

    /// Decode the payload of a well-framed message. Failures are reported
    /// as `WireError::Protocol` naming the command.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Message, WireError> {
        let mut src = payload;
        Self::decode_inner(command, &mut src).map_err(|e| e.in_command(command))
    }

    fn decode_inner(command: &str, src: &mut &[u8]) -> Result<Message, WireError> {
        let message = match command {
            "version" => Message::Version(VersionMessage::decode(src)?),
            "verack" => Message::Verack,
            "getaddr" => Message::GetAddr,
            "addr" => {
                let count = read_count(src, MAX_ADDR_PER_MESSAGE, "addr")?;
                ensure_remaining(src, count * TimestampedAddr::SIZE, "addr entries")?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(TimestampedAddr::decode(src)?);
                }
                Message::Addr(addrs)
            }
            "ping" => {
                ensure_remaining(src, 8, "ping nonce")?;
                Message::Ping(src.get_u64_le())
            }
            "pong" => {
                ensure_remaining(src, 8, "pong nonce")?;
                Message::Pong(src.get_u64_le())
            }
            "getheaders" => Message::GetHeaders(GetHeadersMessage::decode(src)?),
            "headers" => {
                let count = read_count(src, MAX_HEADERS_PER_MESSAGE, "headers")?;
                ensure_remaining(src, count * (BLOCK_HEADER_SIZE + 1), "headers")?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    let bytes: [u8; BLOCK_HEADER_SIZE] = read_array(src, "header")?;
                    // tx_count is always zero in a headers message
                    read_varint(src)?;
                    headers.push(BlockHeader::from_bytes(&bytes));
                }
                Message::Headers(headers)
            }
            other => Message::Unsupported {
                command: other.to_string(),
                payload: src.to_vec(),
            },
        };
        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Addr(addrs) => write!(f, "addr({})", addrs.len()),
            Message::Ping(nonce) => write!(f, "ping({})", nonce),
            Message::Pong(nonce) => write!(f, "pong({})", nonce),
            Message::Headers(headers) => write!(f, "headers({})", headers.len()),
            other => f.write_str(other.command()),
        }
    }
}
