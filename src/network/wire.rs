//! Primitive wire encodings
//!
//! Variable-length integers and strings, network addresses and service
//! bits, as laid out by the Bitcoin P2P protocol. All integers are
//! little-endian except the port of a network address.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Serialized size of a network address without timestamp
pub const NET_ADDR_SIZE: usize = 26;

/// Longest user agent accepted in a `version` message
pub const MAX_USER_AGENT_LENGTH: usize = 256;

// =============================================================================
// Errors
// =============================================================================

/// Per-message codec errors. None of these tear down a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Framing error: {0}")]
    Framing(String),
    #[error("Checksum mismatch in '{command}' message")]
    Checksum { command: String },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Protocol error in '{command}' message: {reason}")]
    Protocol { command: String, reason: String },
}

impl WireError {
    /// Attach a command name to a primitive decode failure
    pub fn in_command(self, command: &str) -> Self {
        match self {
            WireError::Decode(reason) => WireError::Protocol {
                command: command.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// Fail with `Decode` unless `src` holds at least `n` more bytes
pub fn ensure_remaining(src: &impl Buf, n: usize, what: &str) -> Result<(), WireError> {
    if src.remaining() < n {
        return Err(WireError::Decode(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            src.remaining()
        )));
    }
    Ok(())
}

// =============================================================================
// Varint / Varstr
// =============================================================================

/// Encoded size of a varint
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn write_varint(dst: &mut impl BufMut, value: u64) {
    match value {
        0..=0xfc => dst.put_u8(value as u8),
        0xfd..=0xffff => {
            dst.put_u8(0xfd);
            dst.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            dst.put_u8(0xfe);
            dst.put_u32_le(value as u32);
        }
        _ => {
            dst.put_u8(0xff);
            dst.put_u64_le(value);
        }
    }
}

pub fn read_varint(src: &mut impl Buf) -> Result<u64, WireError> {
    ensure_remaining(src, 1, "varint")?;
    match src.get_u8() {
        0xfd => {
            ensure_remaining(src, 2, "varint")?;
            Ok(src.get_u16_le() as u64)
        }
        0xfe => {
            ensure_remaining(src, 4, "varint")?;
            Ok(src.get_u32_le() as u64)
        }
        0xff => {
            ensure_remaining(src, 8, "varint")?;
            Ok(src.get_u64_le())
        }
        small => Ok(small as u64),
    }
}

/// Read a varint used as an element count, bounded by `max`
pub fn read_count(src: &mut impl Buf, max: usize, what: &str) -> Result<usize, WireError> {
    let count = read_varint(src)?;
    if count > max as u64 {
        return Err(WireError::Decode(format!(
            "{} count {} exceeds {}",
            what, count, max
        )));
    }
    Ok(count as usize)
}

pub fn write_varstr(dst: &mut impl BufMut, s: &str) {
    write_varint(dst, s.len() as u64);
    dst.put_slice(s.as_bytes());
}

pub fn read_varstr(src: &mut impl Buf, max: usize) -> Result<String, WireError> {
    let len = read_count(src, max, "string")?;
    ensure_remaining(src, len, "string")?;
    let mut bytes = vec![0u8; len];
    src.copy_to_slice(&mut bytes);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn read_array<const N: usize>(src: &mut impl Buf, what: &str) -> Result<[u8; N], WireError> {
    ensure_remaining(src, N, what)?;
    let mut out = [0u8; N];
    src.copy_to_slice(&mut out);
    Ok(out)
}

// =============================================================================
// Service Flags
// =============================================================================

bitflags! {
    /// Services advertised by a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServiceFlags: u64 {
        /// Full node, can serve blocks
        const NETWORK = 1;
        const GETUTXO = 1 << 1;
        const BLOOM = 1 << 2;
        const WITNESS = 1 << 3;
        const COMPACT_FILTERS = 1 << 6;
        /// Pruned node serving the last 288 blocks
        const NETWORK_LIMITED = 1 << 10;
    }
}

// =============================================================================
// Network Address
// =============================================================================

/// Network address as carried in `version` and `addr` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddr {
    pub services: ServiceFlags,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddr {
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> Self {
        Self {
            services,
            ip: normalize_ip(ip),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    /// `0.0.0.0:0` with no services
    pub fn unspecified() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, ServiceFlags::empty())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u64_le(self.services.bits());
        let v6 = match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        dst.put_slice(&v6.octets());
        dst.put_u16(self.port);
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        ensure_remaining(src, NET_ADDR_SIZE, "network address")?;
        let services = ServiceFlags::from_bits_retain(src.get_u64_le());
        let mut octets = [0u8; 16];
        src.copy_to_slice(&mut octets);
        let port = src.get_u16();
        Ok(Self::new(IpAddr::V6(Ipv6Addr::from(octets)), port, services))
    }
}

/// Fold IPv4-mapped IPv6 addresses to IPv4 so one host has one key
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Address entry of an `addr` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddr {
    /// Last time the address was seen (unix seconds)
    pub time: u32,
    pub addr: NetAddr,
}

impl TimestampedAddr {
    pub const SIZE: usize = 4 + NET_ADDR_SIZE;

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.time);
        self.addr.encode(dst);
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        ensure_remaining(src, Self::SIZE, "address entry")?;
        let time = src.get_u32_le();
        let addr = NetAddr::decode(src)?;
        Ok(Self { time, addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode_varint(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, value);
        buf.to_vec()
    }

    #[test]
    fn test_varint_boundaries() {
        let cases: [(u64, &[u8]); 7] = [
            (0, &[0x00]),
            (0xfc, &[0xfc]),
            (0xfd, &[0xfd, 0xfd, 0x00]),
            (0xffff, &[0xfd, 0xff, 0xff]),
            (0x10000, &[0xfe, 0x00, 0x00, 0x01, 0x00]),
            (0xffffffff, &[0xfe, 0xff, 0xff, 0xff, 0xff]),
            (
                0x1_0000_0000,
                &[0xff, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
            ),
        ];

        for (value, expected) in cases {
            let bytes = encode_varint(value);
            assert_eq!(bytes, expected, "encoding {:#x}", value);
            assert_eq!(bytes.len(), varint_size(value));
            assert_eq!(read_varint(&mut &bytes[..]).unwrap(), value);
        }
    }

    #[test]
    fn test_truncated_varint() {
        assert!(matches!(
            read_varint(&mut &[0xfd, 0x01][..]),
            Err(WireError::Decode(_))
        ));
        assert!(matches!(
            read_varint(&mut &[][..]),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn test_varstr() {
        let mut buf = BytesMut::new();
        write_varstr(&mut buf, "/Satoshi:0.21.0/");
        assert_eq!(buf[0] as usize, "/Satoshi:0.21.0/".len());
        let mut src = &buf[..];
        assert_eq!(read_varstr(&mut src, 256).unwrap(), "/Satoshi:0.21.0/");
        assert!(src.is_empty());

        // Length prefix longer than the data
        assert!(read_varstr(&mut &[0x05, b'a'][..], 256).is_err());
        // Length prefix over the limit
        assert!(read_varstr(&mut &[0x05, b'a', b'b', b'c', b'd', b'e'][..], 4).is_err());
    }

    #[test]
    fn test_net_addr_layout() {
        let addr = NetAddr::new("10.0.0.1".parse().unwrap(), 8333, ServiceFlags::NETWORK);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);

        assert_eq!(buf.len(), NET_ADDR_SIZE);
        assert_eq!(&buf[0..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            &buf[8..24],
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 1]
        );
        // Port is big-endian
        assert_eq!(&buf[24..26], &[0x20, 0x8d]);

        let decoded = NetAddr::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, addr);
        assert!(decoded.ip.is_ipv4());
    }

    #[test]
    fn test_ipv6_addr_roundtrip() {
        let addr = NetAddr::new("2001:db8::1".parse().unwrap(), 18333, ServiceFlags::empty());
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        assert_eq!(NetAddr::decode(&mut &buf[..]).unwrap(), addr);
    }

    #[test]
    fn test_unknown_service_bits_kept() {
        let mut buf = BytesMut::new();
        NetAddr {
            services: ServiceFlags::from_bits_retain(1 << 40 | 1),
            ..NetAddr::unspecified()
        }
        .encode(&mut buf);
        let decoded = NetAddr::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded.services.bits(), 1 << 40 | 1);
    }

    #[test]
    fn test_decode_error_names_command() {
        let err = WireError::Decode("short".into()).in_command("version");
        assert!(matches!(err, WireError::Protocol { ref command, .. } if command == "version"));
    }
}
