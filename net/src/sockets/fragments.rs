/*
A message too large for one frame is split into a first fragment followed by as many
next fragments as it takes. Fragments are never compressed or packed.

  DATA|FRAGMENT_HEADER := total:u32 fragment_id:u16 handle:i32 chunk
  DATA|FRAGMENT        := fragment_id:u16 chunk

Fragments of different messages may interleave, the fragment id says which message
each chunk belongs to.
*/

use std::collections::HashMap;

use crate::{
    data_types::{FragmentId, MessageLength, StreamHandle},
    error_codes::{TransportError, TransportResult},
};

use super::{
    buffer_pool::{BufferPool, PooledBuffer},
    framing::{read_handle, read_u16, FrameHeader, InboundMessage, FRAME_DATA, FRAME_FRAGMENT, FRAME_FRAGMENT_HEADER},
    FRAME_HEADER_SIZE, HANDLE_SIZE,
};

const TOTAL_SIZE: usize = size_of::<u32>();
const FRAGMENT_ID_SIZE: usize = size_of::<FragmentId>();

pub const FIRST_FRAGMENT_OVERHEAD: usize = FRAME_HEADER_SIZE + TOTAL_SIZE + FRAGMENT_ID_SIZE + HANDLE_SIZE;
pub const NEXT_FRAGMENT_OVERHEAD: usize = FRAME_HEADER_SIZE + FRAGMENT_ID_SIZE;

/// Frames needed to carry `length` payload bytes when no frame may exceed
/// `max_message_size`
pub fn fragment_count(length: usize, max_message_size: usize) -> usize {
    let first = max_message_size.saturating_sub(FIRST_FRAGMENT_OVERHEAD);
    if length <= first {
        return 1;
    }
    let next = max_message_size.saturating_sub(NEXT_FRAGMENT_OVERHEAD).max(1);
    1 + (length - first).div_ceil(next)
}

/// Splits a payload into fragment frames, one pooled buffer each. Nothing is kept
/// if the pool runs dry part way through.
pub fn encode_fragments(
    pool: &BufferPool,
    fragment_id: FragmentId,
    handle: StreamHandle,
    payload: &[u8],
    max_message_size: usize,
) -> TransportResult<Vec<PooledBuffer>> {
    if max_message_size <= FIRST_FRAGMENT_OVERHEAD {
        return Err(TransportError::InvalidArgument(format!(
            "frames of {max_message_size} bytes are too small to carry fragments"
        )));
    }
    let total = u32::try_from(payload.len()).map_err(|_| TransportError::MessageTooLarge {
        length: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frames = Vec::with_capacity(fragment_count(payload.len(), max_message_size));
    let (chunk, mut rest) = payload.split_at((max_message_size - FIRST_FRAGMENT_OVERHEAD).min(payload.len()));

    let mut buffer = pool.acquire()?;
    let header = FrameHeader {
        length: (FIRST_FRAGMENT_OVERHEAD + chunk.len()) as MessageLength,
        flags: FRAME_DATA | FRAME_FRAGMENT_HEADER,
    };
    buffer.extend_from_slice(&header.encode())?;
    buffer.extend_from_slice(&total.to_le_bytes())?;
    buffer.extend_from_slice(&fragment_id.to_le_bytes())?;
    buffer.extend_from_slice(&handle.to_le_bytes())?;
    buffer.extend_from_slice(chunk)?;
    frames.push(buffer);

    while !rest.is_empty() {
        let (chunk, remainder) = rest.split_at((max_message_size - NEXT_FRAGMENT_OVERHEAD).min(rest.len()));
        let mut buffer = pool.acquire()?;
        let header = FrameHeader {
            length: (NEXT_FRAGMENT_OVERHEAD + chunk.len()) as MessageLength,
            flags: FRAME_DATA | FRAME_FRAGMENT,
        };
        buffer.extend_from_slice(&header.encode())?;
        buffer.extend_from_slice(&fragment_id.to_le_bytes())?;
        buffer.extend_from_slice(chunk)?;
        frames.push(buffer);
        rest = remainder;
    }
    Ok(frames)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstFragment<'a> {
    pub total: usize,
    pub fragment_id: FragmentId,
    pub handle: StreamHandle,
    pub chunk: &'a [u8],
}

pub fn decode_first_fragment(body: &[u8]) -> TransportResult<FirstFragment<'_>> {
    let header_size = FIRST_FRAGMENT_OVERHEAD - FRAME_HEADER_SIZE;
    if body.len() < header_size {
        return Err(TransportError::Protocol(format!(
            "first fragment of {} bytes is shorter than its {header_size} byte header",
            body.len()
        )));
    }
    Ok(FirstFragment {
        total: u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize,
        fragment_id: read_u16(body, TOTAL_SIZE),
        handle: read_handle(&body[TOTAL_SIZE + FRAGMENT_ID_SIZE..]),
        chunk: &body[header_size..],
    })
}

pub fn decode_next_fragment(body: &[u8]) -> TransportResult<(FragmentId, &[u8])> {
    if body.len() < FRAGMENT_ID_SIZE {
        return Err(TransportError::Protocol(format!(
            "fragment of {} bytes is too short to hold a fragment id",
            body.len()
        )));
    }
    Ok((read_u16(body, 0), &body[FRAGMENT_ID_SIZE..]))
}

struct PartialMessage {
    handle: StreamHandle,
    total: usize,
    payload: Vec<u8>,
}

/// Collects fragments until each message is complete
#[derive(Default)]
pub struct Reassembly {
    partial: HashMap<FragmentId, PartialMessage>,
}

impl Reassembly {
    /// Starts a message. `limit` is the largest message this end will put back
    /// together.
    pub fn first(self: &mut Self, fragment: FirstFragment<'_>, limit: usize) -> TransportResult<Option<InboundMessage>> {
        if fragment.total > limit {
            return Err(TransportError::Protocol(format!(
                "fragmented message of {} bytes exceeds the {limit} byte limit",
                fragment.total
            )));
        }
        if fragment.chunk.len() > fragment.total {
            return Err(TransportError::Protocol(format!(
                "first fragment carries {} bytes of a {} byte message",
                fragment.chunk.len(),
                fragment.total
            )));
        }
        if self.partial.contains_key(&fragment.fragment_id) {
            return Err(TransportError::Protocol(format!(
                "fragment id {} reused before its message was complete",
                fragment.fragment_id
            )));
        }

        let mut payload = Vec::with_capacity(fragment.total);
        payload.extend_from_slice(fragment.chunk);
        let partial = PartialMessage {
            handle: fragment.handle,
            total: fragment.total,
            payload,
        };
        Ok(self.complete_or_keep(fragment.fragment_id, partial))
    }

    pub fn next(self: &mut Self, fragment_id: FragmentId, chunk: &[u8]) -> TransportResult<Option<InboundMessage>> {
        let Some(mut partial) = self.partial.remove(&fragment_id) else {
            return Err(TransportError::Protocol(format!(
                "fragment {fragment_id} arrived without a first fragment"
            )));
        };
        if partial.payload.len() + chunk.len() > partial.total {
            return Err(TransportError::Protocol(format!(
                "fragment {fragment_id} overruns its {} byte message",
                partial.total
            )));
        }
        partial.payload.extend_from_slice(chunk);
        Ok(self.complete_or_keep(fragment_id, partial))
    }

    /// Messages started but not yet complete
    pub fn pending(self: &Self) -> usize {
        self.partial.len()
    }

    pub fn clear(self: &mut Self) {
        self.partial.clear();
    }

    fn complete_or_keep(self: &mut Self, fragment_id: FragmentId, partial: PartialMessage) -> Option<InboundMessage> {
        if partial.payload.len() == partial.total {
            Some(InboundMessage {
                handle: partial.handle,
                payload: partial.payload,
            })
        } else {
            self.partial.insert(fragment_id, partial);
            None
        }
    }
}
