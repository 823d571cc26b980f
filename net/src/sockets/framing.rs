/*
Frame layout on the wire, all integers little endian:

  frame      := length:u16 flags:u8 body
  DATA       := handle:i32 payload
  DATA|PACK  := (handle:i32 length:u16 payload)*
  PING       := (empty body)
  CONNECT_*  := handshake fields, see ConnectRequest and ConnectAck

The length includes the 3 byte header. COMPRESSED may be added to either data
layout, the whole body is then compressed. Fragments are described in fragments.rs.
*/

use crate::{
    data_types::{MessageLength, ProtocolVersion, StreamHandle},
    error_codes::{TransportError, TransportResult},
};

use super::{
    buffer_pool::PooledBuffer, compression::CompressionType, FRAME_HEADER_SIZE, HANDLE_SIZE,
    PACKED_ENTRY_HEADER_SIZE,
};

pub type FrameFlags = u8;

pub const FRAME_PING: FrameFlags = 0x00;
pub const FRAME_DATA: FrameFlags = 0x02;
pub const FRAME_COMPRESSED: FrameFlags = 0x04;
pub const FRAME_FRAGMENT: FrameFlags = 0x08;
pub const FRAME_PACKING: FrameFlags = 0x10;
pub const FRAME_FRAGMENT_HEADER: FrameFlags = 0x20;
pub const FRAME_CONNECT_REQUEST: FrameFlags = 0x40;
pub const FRAME_CONNECT_ACK: FrameFlags = 0x41;
pub const FRAME_CONNECT_NAK: FrameFlags = 0x42;

pub const MIN_PROTOCOL_VERSION: ProtocolVersion = 1;
pub const MAX_PROTOCOL_VERSION: ProtocolVersion = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: MessageLength,
    pub flags: FrameFlags,
}

impl FrameHeader {
    pub fn encode(self: &Self) -> [u8; FRAME_HEADER_SIZE] {
        let length = self.length.to_le_bytes();
        [length[0], length[1], self.flags]
    }

    /// Returns None until enough bytes have arrived to hold a header
    pub fn decode(bytes: &[u8]) -> Option<FrameHeader> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(FrameHeader {
            length: MessageLength::from_le_bytes([bytes[0], bytes[1]]),
            flags: bytes[2],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Ping,
    Data { packed: bool, compressed: bool },
    FirstFragment,
    NextFragment,
    ConnectRequest,
    ConnectAck,
    ConnectNak,
}

/// Only the exact flag combinations this end writes are recognised, anything else
/// is None
pub fn frame_kind(flags: FrameFlags) -> Option<FrameKind> {
    const DATA_PACKED: FrameFlags = FRAME_DATA | FRAME_PACKING;
    const DATA_COMPRESSED: FrameFlags = FRAME_DATA | FRAME_COMPRESSED;
    const DATA_PACKED_COMPRESSED: FrameFlags = FRAME_DATA | FRAME_PACKING | FRAME_COMPRESSED;
    const FIRST_FRAGMENT: FrameFlags = FRAME_DATA | FRAME_FRAGMENT_HEADER;
    const NEXT_FRAGMENT: FrameFlags = FRAME_DATA | FRAME_FRAGMENT;

    match flags {
        FRAME_PING => Some(FrameKind::Ping),
        FRAME_DATA => Some(FrameKind::Data { packed: false, compressed: false }),
        DATA_PACKED => Some(FrameKind::Data { packed: true, compressed: false }),
        DATA_COMPRESSED => Some(FrameKind::Data { packed: false, compressed: true }),
        DATA_PACKED_COMPRESSED => Some(FrameKind::Data { packed: true, compressed: true }),
        FIRST_FRAGMENT => Some(FrameKind::FirstFragment),
        NEXT_FRAGMENT => Some(FrameKind::NextFragment),
        FRAME_CONNECT_REQUEST => Some(FrameKind::ConnectRequest),
        FRAME_CONNECT_ACK => Some(FrameKind::ConnectAck),
        FRAME_CONNECT_NAK => Some(FrameKind::ConnectNak),
        _ => None,
    }
}

/// One demultiplexed message as the receiver sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub handle: StreamHandle,
    pub payload: Vec<u8>,
}

/// Largest payload that fits a single message frame
pub fn max_single_payload(max_message_size: MessageLength) -> usize {
    (max_message_size as usize).saturating_sub(FRAME_HEADER_SIZE + HANDLE_SIZE)
}

/// Writes a complete single message frame into an empty buffer
pub fn encode_message(
    buffer: &mut PooledBuffer,
    handle: StreamHandle,
    payload: &[u8],
    max_message_size: MessageLength,
) -> TransportResult<()> {
    let max = max_single_payload(max_message_size);
    if payload.len() > max {
        return Err(TransportError::MessageTooLarge {
            length: payload.len(),
            max,
        });
    }
    let length = FRAME_HEADER_SIZE + HANDLE_SIZE + payload.len();
    let header = FrameHeader {
        length: length as MessageLength,
        flags: FRAME_DATA,
    };
    buffer.extend_from_slice(&header.encode())?;
    buffer.extend_from_slice(&handle.to_le_bytes())?;
    buffer.extend_from_slice(payload)
}

/// Writes a header-only frame
pub fn encode_ping(buffer: &mut PooledBuffer) -> TransportResult<()> {
    let header = FrameHeader {
        length: FRAME_HEADER_SIZE as MessageLength,
        flags: FRAME_PING,
    };
    buffer.extend_from_slice(&header.encode())
}

/// Splits the (uncompressed) body of a data frame into messages, preserving their
/// order
pub fn decode_data(packed: bool, body: &[u8], messages: &mut Vec<InboundMessage>) -> TransportResult<usize> {
    if !packed {
        if body.len() < HANDLE_SIZE {
            return Err(TransportError::Protocol(format!(
                "data frame of {} bytes is too short to hold a stream handle",
                body.len()
            )));
        }
        messages.push(InboundMessage {
            handle: read_handle(body),
            payload: body[HANDLE_SIZE..].to_vec(),
        });
        return Ok(1);
    }

    let mut count = 0;
    let mut position = 0;
    while position < body.len() {
        let entry = &body[position..];
        if entry.len() < PACKED_ENTRY_HEADER_SIZE {
            return Err(TransportError::Protocol(format!(
                "packed frame has {} trailing bytes, too short for an entry header",
                entry.len()
            )));
        }
        let handle = read_handle(entry);
        let length = MessageLength::from_le_bytes([entry[HANDLE_SIZE], entry[HANDLE_SIZE + 1]]) as usize;
        let end = PACKED_ENTRY_HEADER_SIZE + length;
        if entry.len() < end {
            return Err(TransportError::Protocol(format!(
                "packed entry claims {length} bytes but only {} remain",
                entry.len() - PACKED_ENTRY_HEADER_SIZE
            )));
        }
        messages.push(InboundMessage {
            handle,
            payload: entry[PACKED_ENTRY_HEADER_SIZE..end].to_vec(),
        });
        position += end;
        count += 1;
    }
    Ok(count)
}

pub(crate) fn read_handle(bytes: &[u8]) -> StreamHandle {
    StreamHandle::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Sent by the connecting side as the first frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub min_version: ProtocolVersion,
    pub max_version: ProtocolVersion,
    pub max_message_size: MessageLength,
    pub ping_timeout_secs: u16,
    pub compression: CompressionType,
}

/// Sent by the accepting side with the values both ends will use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub version: ProtocolVersion,
    pub max_message_size: MessageLength,
    pub ping_timeout_secs: u16,
    pub compression: CompressionType,
}

const CONNECT_REQUEST_SIZE: usize = 9;
const CONNECT_ACK_SIZE: usize = 7;

impl ConnectRequest {
    pub fn encode(self: &Self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + CONNECT_REQUEST_SIZE);
        let header = FrameHeader {
            length: (FRAME_HEADER_SIZE + CONNECT_REQUEST_SIZE) as MessageLength,
            flags: FRAME_CONNECT_REQUEST,
        };
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&self.min_version.to_le_bytes());
        frame.extend_from_slice(&self.max_version.to_le_bytes());
        frame.extend_from_slice(&self.max_message_size.to_le_bytes());
        frame.extend_from_slice(&self.ping_timeout_secs.to_le_bytes());
        frame.push(self.compression.to_wire());
        frame
    }

    /// A compression type this end does not know is treated as no compression
    pub fn decode(body: &[u8]) -> TransportResult<Self> {
        if body.len() != CONNECT_REQUEST_SIZE {
            return Err(TransportError::Protocol(format!(
                "connect request has {} bytes, expected {CONNECT_REQUEST_SIZE}",
                body.len()
            )));
        }
        Ok(Self {
            min_version: read_u16(body, 0),
            max_version: read_u16(body, 2),
            max_message_size: read_u16(body, 4),
            ping_timeout_secs: read_u16(body, 6),
            compression: CompressionType::from_wire(body[8]).unwrap_or_default(),
        })
    }

    /// Picks the highest version both sides support along with the smaller of the
    /// two message sizes and ping timeouts. Compression is used only when both ends
    /// asked for the same type. None means the versions do not overlap.
    pub fn negotiate(
        self: &Self,
        max_message_size: MessageLength,
        ping_timeout_secs: u16,
        compression: CompressionType,
    ) -> Option<ConnectAck> {
        let lowest = self.min_version.max(MIN_PROTOCOL_VERSION);
        let highest = self.max_version.min(MAX_PROTOCOL_VERSION);
        if lowest > highest {
            return None;
        }
        Some(ConnectAck {
            version: highest,
            max_message_size: self.max_message_size.min(max_message_size),
            ping_timeout_secs: self.ping_timeout_secs.min(ping_timeout_secs),
            compression: if self.compression == compression {
                compression
            } else {
                CompressionType::None
            },
        })
    }
}

impl ConnectAck {
    pub fn encode(self: &Self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + CONNECT_ACK_SIZE);
        let header = FrameHeader {
            length: (FRAME_HEADER_SIZE + CONNECT_ACK_SIZE) as MessageLength,
            flags: FRAME_CONNECT_ACK,
        };
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&self.version.to_le_bytes());
        frame.extend_from_slice(&self.max_message_size.to_le_bytes());
        frame.extend_from_slice(&self.ping_timeout_secs.to_le_bytes());
        frame.push(self.compression.to_wire());
        frame
    }

    pub fn decode(body: &[u8]) -> TransportResult<Self> {
        if body.len() != CONNECT_ACK_SIZE {
            return Err(TransportError::Protocol(format!(
                "connect ack has {} bytes, expected {CONNECT_ACK_SIZE}",
                body.len()
            )));
        }
        let compression = CompressionType::from_wire(body[6]).ok_or_else(|| {
            TransportError::Protocol(format!("connect ack selected unknown compression type {}", body[6]))
        })?;
        Ok(Self {
            version: read_u16(body, 0),
            max_message_size: read_u16(body, 2),
            ping_timeout_secs: read_u16(body, 4),
            compression,
        })
    }
}

pub fn encode_connect_nak() -> Vec<u8> {
    FrameHeader {
        length: FRAME_HEADER_SIZE as MessageLength,
        flags: FRAME_CONNECT_NAK,
    }
    .encode()
    .to_vec()
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}
