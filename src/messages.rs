//! # Wire Protocol Messages
//!
//! The five routing payloads and the SecureMessage framing around
//! them, as fixed byte layouts. All integers are little-endian.
//!
//! ## Payload Layout
//!
//! Common header: one type byte, null-terminated source id,
//! null-terminated destination id (empty-then-null for the broadcast
//! forms), 8-byte timestamp. Type-specific suffix:
//!
//! | Type | Tag | Suffix |
//! |------|-----|--------|
//! | HELLO | 0 | position (3× f64), speed (f64), direction (f64) |
//! | ROUTE_REQUEST | 1 | request id (u32), hop count (u8), origin timestamp (u64) |
//! | ROUTE_REPLY | 2 | hop count (u8), lifetime ms (u32), count-prefixed id list |
//! | ROUTE_ERROR | 3 | unreachable id (null-terminated) |
//! | DATA | 4 | opaque payload (rest of buffer) |
//!
//! ## Framing
//!
//! `payload_len:u32 ‖ payload ‖ sig_len:u16 ‖ sig ‖ timestamp:u64 ‖
//! sequence:u32 ‖ cert_len:u16 ‖ cert`
//!
//! Decoding a malformed or truncated buffer fails with [`DecodeError`]
//! and mutates nothing; trailing garbage after a complete message is
//! also rejected.

use crate::crypto::SecureMessage;

/// Decoding error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of buffer.
    UnexpectedEof,
    /// Unknown message type tag.
    InvalidMessageType(u8),
    /// An id field is not valid UTF-8 or is missing its terminator.
    InvalidString,
    /// A declared length does not fit the buffer.
    InvalidLength,
    /// Bytes left over after a complete message.
    TrailingBytes,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of buffer"),
            DecodeError::InvalidMessageType(tag) => write!(f, "invalid message type {tag}"),
            DecodeError::InvalidString => write!(f, "invalid id string"),
            DecodeError::InvalidLength => write!(f, "length field out of bounds"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after message"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Routing message kinds and their wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Periodic signed position beacon.
    Hello = 0,
    /// Reactive route discovery flood.
    RouteRequest = 1,
    /// Unicast reply carrying the discovered path.
    RouteReply = 2,
    /// Broken-route notification.
    RouteError = 3,
    /// Application payload.
    Data = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(MessageType::Hello),
            1 => Ok(MessageType::RouteRequest),
            2 => Ok(MessageType::RouteReply),
            3 => Ok(MessageType::RouteError),
            4 => Ok(MessageType::Data),
            other => Err(DecodeError::InvalidMessageType(other)),
        }
    }
}

/// Type-specific body of a routing message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Position beacon; units are meters, m/s, and heading degrees.
    Hello {
        x: f64,
        y: f64,
        z: f64,
        speed: f64,
        direction: f64,
    },
    /// Route discovery. `hop_count` is hops traversed so far;
    /// `origin_timestamp` is the originator's clock when it first
    /// issued this request id.
    RouteRequest {
        request_id: u32,
        hop_count: u8,
        origin_timestamp: u64,
    },
    /// Route reply. `hop_count` counts hops back from the replying
    /// destination; `path` lists the ids traversed so far.
    RouteReply {
        hop_count: u8,
        lifetime_ms: u32,
        path: Vec<String>,
    },
    /// A destination became unreachable through the reporting node.
    RouteError { unreachable: String },
    /// Opaque application bytes.
    Data { payload: Vec<u8> },
}

/// One decoded routing message: common header plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingMessage {
    /// Originator id. Never rewritten by forwarders.
    pub source: String,
    /// Target id; empty for broadcast forms.
    pub destination: String,
    /// Originator wall clock (ms) when the message was created.
    pub timestamp: u64,
    /// Type-specific content.
    pub body: MessageBody,
}

impl RoutingMessage {
    /// Wire tag for this message.
    pub fn message_type(&self) -> MessageType {
        match self.body {
            MessageBody::Hello { .. } => MessageType::Hello,
            MessageBody::RouteRequest { .. } => MessageType::RouteRequest,
            MessageBody::RouteReply { .. } => MessageType::RouteReply,
            MessageBody::RouteError { .. } => MessageType::RouteError,
            MessageBody::Data { .. } => MessageType::Data,
        }
    }

    /// Encode to the canonical byte layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.message_type() as u8);
        put_str0(&mut out, &self.source);
        put_str0(&mut out, &self.destination);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        match &self.body {
            MessageBody::Hello {
                x,
                y,
                z,
                speed,
                direction,
            } => {
                out.extend_from_slice(&x.to_le_bytes());
                out.extend_from_slice(&y.to_le_bytes());
                out.extend_from_slice(&z.to_le_bytes());
                out.extend_from_slice(&speed.to_le_bytes());
                out.extend_from_slice(&direction.to_le_bytes());
            }
            MessageBody::RouteRequest {
                request_id,
                hop_count,
                origin_timestamp,
            } => {
                out.extend_from_slice(&request_id.to_le_bytes());
                out.push(*hop_count);
                out.extend_from_slice(&origin_timestamp.to_le_bytes());
            }
            MessageBody::RouteReply {
                hop_count,
                lifetime_ms,
                path,
            } => {
                out.push(*hop_count);
                out.extend_from_slice(&lifetime_ms.to_le_bytes());
                out.push(path.len().min(u8::MAX as usize) as u8);
                for id in path.iter().take(u8::MAX as usize) {
                    put_str0(&mut out, id);
                }
            }
            MessageBody::RouteError { unreachable } => {
                put_str0(&mut out, unreachable);
            }
            MessageBody::Data { payload } => {
                out.extend_from_slice(payload);
            }
        }
        out
    }

    /// Decode from the canonical byte layout.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let kind = MessageType::try_from(r.read_u8()?)?;
        let source = r.read_str0()?;
        let destination = r.read_str0()?;
        let timestamp = r.read_u64()?;
        let body = match kind {
            MessageType::Hello => {
                let x = r.read_f64()?;
                let y = r.read_f64()?;
                let z = r.read_f64()?;
                let speed = r.read_f64()?;
                let direction = r.read_f64()?;
                MessageBody::Hello {
                    x,
                    y,
                    z,
                    speed,
                    direction,
                }
            }
            MessageType::RouteRequest => {
                let request_id = r.read_u32()?;
                let hop_count = r.read_u8()?;
                let origin_timestamp = r.read_u64()?;
                MessageBody::RouteRequest {
                    request_id,
                    hop_count,
                    origin_timestamp,
                }
            }
            MessageType::RouteReply => {
                let hop_count = r.read_u8()?;
                let lifetime_ms = r.read_u32()?;
                let count = r.read_u8()? as usize;
                let mut path = Vec::with_capacity(count.min(32));
                for _ in 0..count {
                    path.push(r.read_str0()?);
                }
                MessageBody::RouteReply {
                    hop_count,
                    lifetime_ms,
                    path,
                }
            }
            MessageType::RouteError => MessageBody::RouteError {
                unreachable: r.read_str0()?,
            },
            MessageType::Data => MessageBody::Data {
                payload: r.read_rest().to_vec(),
            },
        };
        if !r.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            source,
            destination,
            timestamp,
            body,
        })
    }
}

/// Read the originator id out of an encoded payload without decoding
/// the rest. Used to pick a cached verification key before the
/// envelope check runs.
pub fn peek_source(payload: &[u8]) -> Option<&str> {
    let rest = payload.get(1..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

// ============================================================================
// SecureMessage framing
// ============================================================================

/// Frame a [`SecureMessage`] for transmission.
pub fn encode_secure(message: &SecureMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        4 + message.payload.len()
            + 2
            + message.signature.len()
            + 12
            + 2
            + message.sender_cert.len(),
    );
    out.extend_from_slice(&(message.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&message.payload);
    out.extend_from_slice(&(message.signature.len() as u16).to_le_bytes());
    out.extend_from_slice(&message.signature);
    out.extend_from_slice(&message.timestamp.to_le_bytes());
    out.extend_from_slice(&message.sequence.to_le_bytes());
    out.extend_from_slice(&(message.sender_cert.len() as u16).to_le_bytes());
    out.extend_from_slice(&message.sender_cert);
    out
}

/// Parse a received frame back into a [`SecureMessage`].
pub fn decode_secure(buf: &[u8]) -> Result<SecureMessage, DecodeError> {
    let mut r = Reader::new(buf);
    let payload_len = r.read_u32()? as usize;
    let payload = r.read_bytes(payload_len)?.to_vec();
    let sig_len = r.read_u16()? as usize;
    let signature = r.read_bytes(sig_len)?.to_vec();
    let timestamp = r.read_u64()?;
    let sequence = r.read_u32()?;
    let cert_len = r.read_u16()? as usize;
    let sender_cert = r.read_bytes(cert_len)?.to_vec();
    if !r.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(SecureMessage {
        payload,
        signature,
        timestamp,
        sequence,
        sender_cert,
    })
}

// ============================================================================
// Cursor helpers
// ============================================================================

fn put_str0(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::InvalidLength)?;
        if end > self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_str0(&mut self) -> Result<String, DecodeError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::InvalidString)?;
        let s = std::str::from_utf8(&rest[..end]).map_err(|_| DecodeError::InvalidString)?;
        self.pos += end + 1;
        Ok(s.to_string())
    }

    fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}
