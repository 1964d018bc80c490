//! Frame codec
//!
//! `magic(4) | command(12) | length(4) | checksum(4) | payload`
//!
//! The decoder yields `Result<Message, WireError>` items so a corrupt or
//! malformed frame is reported and skipped while the stream carries on.
//! Only I/O errors end a `FramedRead`.

use crate::crypto::checksum;
use crate::network::message::{Message, Network};
use crate::network::wire::WireError;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size
pub const HEADER_SIZE: usize = 24;

/// Width of the NUL-padded command field
pub const COMMAND_SIZE: usize = 12;

/// Largest payload accepted (32 MiB)
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Codec for the Bitcoin message framing
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    network: Network,
}

impl MessageCodec {
    pub fn new(network: Network) -> Self {
        Self { network }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(Network::Main)
    }
}

fn read_magic(src: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

/// Offset of the next known magic after position 0, if one is buffered
fn find_next_magic(src: &[u8]) -> Option<usize> {
    (1..=src.len().saturating_sub(4)).find(|&i| Network::from_magic(read_magic(src, i)).is_some())
}

fn parse_command(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let (name, padding) = raw.split_at(end);
    if name.is_empty() || !padding.iter().all(|&b| b == 0) {
        return None;
    }
    if !name.iter().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(String::from_utf8_lossy(name).into_owned())
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = msg.command();
        if command.is_empty() || command.len() > COMMAND_SIZE || !command.is_ascii() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid command name '{}'", command),
            ));
        }

        let mut payload = BytesMut::new();
        msg.encode_payload(&mut payload);
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("'{}' payload of {} bytes is too large", command, payload.len()),
            ));
        }

        let mut name = [0u8; COMMAND_SIZE];
        name[..command.len()].copy_from_slice(command.as_bytes());

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32_le(self.network.magic());
        dst.put_slice(&name);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Result<Message, WireError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let magic = read_magic(src, 0);
        if Network::from_magic(magic).is_none() {
            let skip = find_next_magic(src).unwrap_or(src.len() - 3);
            src.advance(skip);
            return Ok(Some(Err(WireError::Framing(format!(
                "unknown magic {:#010x}, skipped {} bytes",
                magic, skip
            )))));
        }

        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let Some(command) = parse_command(&src[4..4 + COMMAND_SIZE]) else {
            src.advance(1);
            return Ok(Some(Err(WireError::Framing(
                "malformed command name".to_string(),
            ))));
        };

        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            src.advance(1);
            return Ok(Some(Err(WireError::Framing(format!(
                "'{}' declares {} bytes, limit is {}",
                command, length, MAX_MESSAGE_SIZE
            )))));
        }

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        let expected = [src[20], src[21], src[22], src[23]];
        src.advance(HEADER_SIZE);
        let payload = src.split_to(length);

        if checksum(&payload) != expected {
            return Ok(Some(Err(WireError::Checksum { command })));
        }

        Ok(Some(Message::decode_payload(&command, &payload)))
    }
}
