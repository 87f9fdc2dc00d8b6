// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing and message parsing for the broker wire protocol.
//!
//! ```text
//! +----------------+-------------------------------+
//! | msg_sz (4B BE) | body (msg_sz bytes)            |
//! +----------------+-------------------------------+
//! ```
//!
//! The body layout depends on `type`:
//!
//! ```text
//! type(1) glen(1) group(glen) [slen(2) endpoint(slen) | mlen(2) payload(mlen)]
//! ```
//!
//! JOIN, LEAVE and HEALTHCHECK carry a `slen`/endpoint pair after the group
//! name (the spec table only calls this out for JOIN/LEAVE, but HEALTHCHECK
//! needs an endpoint too and no other field is defined for it, so it reuses
//! the identical shape). BROADCAST carries `mlen`/payload instead. SUBSCRIBE
//! and LISTMEMBERS carry only the group name.
//!
//! `type` is fixed to six values (1-6); there is no wire-level message for
//! group creation. `GroupRegistry::create` is reached only through the
//! out-of-scope external entry point, never through a parsed frame, matching
//! both the closed type enumeration and the original, whose `create_group`
//! is likewise never called from parsed network input.

use crate::error::{BrokerError, Result};
use std::io::{self, Read};

/// Frame header size (4 bytes, big-endian length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Reserved handshake magic. Never emitted by the current protocol.
pub const PROTOCOL_MAGIC: u32 = 19_910_121;

/// Maximum endpoint string length (`A.B.C.D:port`, decimal).
pub const MAX_ENDPOINT_LEN: usize = 254;

/// Maximum group name length.
pub const MAX_GROUP_NAME_LEN: usize = 255;

/// Protocol message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Join = 1,
    Leave = 2,
    Broadcast = 3,
    Subscribe = 4,
    Healthcheck = 5,
    ListMembers = 6,
}

impl MessageType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Join),
            2 => Some(Self::Leave),
            3 => Some(Self::Broadcast),
            4 => Some(Self::Subscribe),
            5 => Some(Self::Healthcheck),
            6 => Some(Self::ListMembers),
            _ => None,
        }
    }
}

/// A fully decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Join { group: String, endpoint: String },
    Leave { group: String, endpoint: String },
    Broadcast { group: String, payload: Vec<u8> },
    Subscribe { group: String },
    Healthcheck { group: String, endpoint: String },
    ListMembers { group: String },
}

/// Parses one frame body (the bytes after the 4-byte length prefix) into a
/// [`Message`]. Unknown `type` values are rejected as `BadName` since the
/// protocol has no "unknown message" reply.
pub fn parse_message(body: &[u8]) -> Result<Message> {
    if body.len() < 2 {
        return Err(BrokerError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame shorter than header",
        )));
    }
    let msg_type = MessageType::from_byte(body[0])
        .ok_or_else(|| BrokerError::BadName(format!("unknown message type {}", body[0])))?;
    let glen = body[1] as usize;
    if glen == 0 || glen > MAX_GROUP_NAME_LEN {
        return Err(BrokerError::BadName(format!(
            "invalid group name length {glen}"
        )));
    }
    let mut cursor = 2usize;
    let group = take_str(body, &mut cursor, glen, "group name")?;

    match msg_type {
        MessageType::Join | MessageType::Leave | MessageType::Healthcheck => {
            let slen = take_u16(body, &mut cursor)? as usize;
            let endpoint = take_str(body, &mut cursor, slen, "endpoint")?;
            Ok(match msg_type {
                MessageType::Join => Message::Join { group, endpoint },
                MessageType::Leave => Message::Leave { group, endpoint },
                _ => Message::Healthcheck { group, endpoint },
            })
        }
        MessageType::Broadcast => {
            let mlen = take_u16(body, &mut cursor)? as usize;
            let payload = take_bytes(body, &mut cursor, mlen, "payload")?;
            Ok(Message::Broadcast { group, payload })
        }
        MessageType::Subscribe => Ok(Message::Subscribe { group }),
        MessageType::ListMembers => Ok(Message::ListMembers { group }),
    }
}

fn truncated(what: &'static str) -> BrokerError {
    BrokerError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("truncated frame: missing {what}"),
    ))
}

fn take_u16(body: &[u8], cursor: &mut usize) -> Result<u16> {
    let end = *cursor + 2;
    if end > body.len() {
        return Err(truncated("length field"));
    }
    let v = u16::from_be_bytes([body[*cursor], body[*cursor + 1]]);
    *cursor = end;
    Ok(v)
}

fn take_bytes(body: &[u8], cursor: &mut usize, len: usize, what: &'static str) -> Result<Vec<u8>> {
    let end = *cursor + len;
    if end > body.len() {
        return Err(truncated(what));
    }
    let out = body[*cursor..end].to_vec();
    *cursor = end;
    Ok(out)
}

fn take_str(body: &[u8], cursor: &mut usize, len: usize, what: &'static str) -> Result<String> {
    let bytes = take_bytes(body, cursor, len, what)?;
    String::from_utf8(bytes)
        .map_err(|_| BrokerError::BadName(format!("{what} is not valid UTF-8")))
}

/// Encodes `payload` as a standalone frame: `[len: u32 BE][payload]`.
///
/// Used for LISTMEMBERS replies, where a fresh frame is built rather than
/// re-emitted verbatim (unlike BROADCAST fan-out, which retransmits the
/// inbound frame bytes unchanged).
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Internal state for incremental reading.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingLength { bytes_read: usize },
    ReadingBody { expected_len: usize, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

/// Per-connection incremental frame reader.
///
/// Owns the partial-read state so the reactor can call [`FrameReader::decode`]
/// repeatedly as a socket becomes readable, draining it until it would
/// block, without losing progress on a frame split across many reads.
#[derive(Debug)]
pub struct FrameReader {
    state: ReadState,
    buffer: Vec<u8>,
    max_size: usize,
}

impl FrameReader {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
        }
    }

    /// Attempts to decode one complete frame body from `reader`.
    ///
    /// - `Ok(Some(body))`: a full frame arrived; `body` excludes the length
    ///   prefix.
    /// - `Ok(None)`: the read would block; call again once the socket is
    ///   readable.
    /// - `Err(e)`: I/O error, oversized frame, or peer close.
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            let kind = io::ErrorKind::UnexpectedEof;
                            return Err(io::Error::new(
                                kind,
                                if bytes_read == 0 {
                                    "connection closed"
                                } else {
                                    "incomplete frame header"
                                },
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::ReadingLength { bytes_read: total };
                                continue;
                            }
                            let len = u32::from_be_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;
                            if len > self.max_size {
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("frame too large: {len} bytes (max {})", self.max_size),
                                ));
                            }
                            if len == 0 {
                                self.state = ReadState::default();
                                return Ok(Some(Vec::new()));
                            }
                            self.buffer.resize(len, 0);
                            self.state = ReadState::ReadingBody {
                                expected_len: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::ReadingLength { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "incomplete frame body",
                        ));
                    }
                    Ok(n) => {
                        let total = bytes_read + n;
                        if total < expected_len {
                            self.state = ReadState::ReadingBody {
                                expected_len,
                                bytes_read: total,
                            };
                            continue;
                        }
                        let body = std::mem::replace(&mut self.buffer, vec![0u8; FRAME_HEADER_SIZE]);
                        self.state = ReadState::default();
                        return Ok(Some(body));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.state = ReadState::ReadingBody {
                            expected_len,
                            bytes_read,
                        };
                        return Ok(None);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_of(body: &[u8]) -> Vec<u8> {
        encode_frame(body)
    }

    #[test]
    fn decodes_join_message() {
        let mut body = vec![MessageType::Join as u8, 2, b'g', b'1'];
        let endpoint = b"1.2.3.4:80";
        body.extend_from_slice(&(endpoint.len() as u16).to_be_bytes());
        body.extend_from_slice(endpoint);
        let msg = parse_message(&body).unwrap();
        assert_eq!(
            msg,
            Message::Join {
                group: "g1".to_string(),
                endpoint: "1.2.3.4:80".to_string(),
            }
        );
    }

    #[test]
    fn decodes_broadcast_message() {
        let mut body = vec![MessageType::Broadcast as u8, 2, b'g', b'1'];
        let payload = b"hello";
        body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        body.extend_from_slice(payload);
        let msg = parse_message(&body).unwrap();
        assert_eq!(
            msg,
            Message::Broadcast {
                group: "g1".to_string(),
                payload: payload.to_vec(),
            }
        );
    }

    #[test]
    fn decodes_subscribe_and_listmembers_with_only_group() {
        let body = vec![MessageType::Subscribe as u8, 2, b'g', b'1'];
        assert_eq!(
            parse_message(&body).unwrap(),
            Message::Subscribe { group: "g1".to_string() }
        );
        let body = vec![MessageType::ListMembers as u8, 2, b'g', b'1'];
        assert_eq!(
            parse_message(&body).unwrap(),
            Message::ListMembers { group: "g1".to_string() }
        );
    }

    #[test]
    fn rejects_unknown_type() {
        let body = vec![99, 2, b'g', b'1'];
        assert!(parse_message(&body).is_err());

        // type=7 is not a valid tag either: the protocol's type space is
        // fixed to 1-6, with no wire-level message for group creation.
        let body = vec![7, 2, b'g', b'1'];
        assert!(parse_message(&body).is_err());
    }

    #[test]
    fn rejects_truncated_frame() {
        let body = vec![MessageType::Join as u8, 5, b'g', b'1'];
        assert!(parse_message(&body).is_err());
    }

    #[test]
    fn rejects_zero_length_group_name() {
        let body = vec![MessageType::Subscribe as u8, 0];
        assert!(parse_message(&body).is_err());
    }

    #[test]
    fn rejects_group_name_over_max_len() {
        let mut body = vec![MessageType::Subscribe as u8, 255];
        body.extend_from_slice(&[b'g'; 255]);
        // glen itself can never exceed a u8's range (255 == MAX_GROUP_NAME_LEN),
        // so this only exercises the boundary, not an over-limit rejection;
        // the length check is still asserted directly against the constant.
        assert!(MAX_GROUP_NAME_LEN <= u8::MAX as usize);
        assert!(parse_message(&body).is_ok());
    }

    #[test]
    fn frame_reader_handles_split_reads() {
        let full = frame_of(b"hello world");
        let (first, second) = full.split_at(3);
        let mut chained = Cursor::new(first.to_vec()).chain(Cursor::new(second.to_vec()));
        let mut reader = FrameReader::new(1024);
        let body = loop {
            match reader.decode(&mut chained).unwrap() {
                Some(body) => break body,
                None => continue,
            }
        };
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn frame_reader_rejects_oversized_frame() {
        let frame = frame_of(&vec![0u8; 100]);
        let mut cursor = Cursor::new(frame);
        let mut reader = FrameReader::new(10);
        let err = reader.decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn frame_reader_would_block_returns_none() {
        struct WouldBlockReader;
        impl Read for WouldBlockReader {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "would block"))
            }
        }
        let mut reader = FrameReader::new(1024);
        let mut source = WouldBlockReader;
        assert!(reader.decode(&mut source).unwrap().is_none());
    }
}
