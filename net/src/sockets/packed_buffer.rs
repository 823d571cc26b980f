use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};

use crate::{
    data_types::{ChannelId, MessageCount, MessageLength, StreamHandle},
    error_codes::{TransportError, TransportResult},
};

use super::{
    buffer_pool::{BufferPool, PooledBuffer},
    channel::ChannelState,
    framing::{FrameHeader, FRAME_DATA, FRAME_PACKING},
    FRAME_HEADER_SIZE, PACKED_ENTRY_HEADER_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackState {
    /// No frame is being built, call init_buffer()
    Idle,
    Filling,
    /// Finalized and read-only, ready to submit
    Packed,
    /// Handed to the channel and not yet written to the socket
    InFlight,
}

/// Marks a packed frame as in flight for as long as the transmit path holds it
pub(crate) struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The frame a packed buffer is building. The channel keeps a weak reference to
/// every slot it hands out and revokes them when it closes, which returns the
/// frame to the pool even though the application still owns the packed buffer.
#[derive(Default)]
pub(crate) struct FrameSlot {
    buffer: Option<PooledBuffer>,
    revoked: bool,
}

impl FrameSlot {
    pub(crate) fn revoke(self: &mut Self) {
        self.revoked = true;
        self.buffer = None;
    }
}

pub(crate) fn revoke_slot(slot: &Weak<Mutex<FrameSlot>>) {
    if let Some(slot) = slot.upgrade() {
        slot.lock().unwrap_or_else(PoisonError::into_inner).revoke();
    }
}

/// Accumulates several messages for one channel into a single frame. The caller
/// decides how many messages go into each frame, then packs and submits it.
pub struct PackedBuffer {
    channel_id: ChannelId,
    pool: Arc<BufferPool>,
    slot: Arc<Mutex<FrameSlot>>,
    max_frame_size: usize,
    message_count: MessageCount,
    packed: bool,
    in_flight: Arc<AtomicBool>,
}

impl PackedBuffer {
    pub(crate) fn new(channel_id: ChannelId, pool: &Arc<BufferPool>, max_message_size: MessageLength) -> Self {
        Self {
            channel_id,
            pool: pool.clone(),
            slot: Arc::new(Mutex::new(FrameSlot::default())),
            max_frame_size: pool.buffer_size().min(max_message_size as usize),
            message_count: 0,
            packed: false,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Lets the owning channel take the frame back when it closes
    pub(crate) fn lease(self: &Self) -> Weak<Mutex<FrameSlot>> {
        Arc::downgrade(&self.slot)
    }

    pub fn channel_id(self: &Self) -> ChannelId {
        self.channel_id
    }

    pub fn state(self: &Self) -> PackState {
        if self.in_flight.load(Ordering::Acquire) {
            PackState::InFlight
        } else if self.slot().buffer.is_none() {
            PackState::Idle
        } else if self.packed {
            PackState::Packed
        } else {
            PackState::Filling
        }
    }

    /// Starts a new frame. Fails while the previous frame from this buffer is
    /// still waiting to be written, and once the channel has closed.
    pub fn init_buffer(self: &mut Self) -> TransportResult<()> {
        if self.in_flight.load(Ordering::Acquire) {
            return Err(TransportError::InvalidState(
                "previous frame from this packed buffer is still in flight".to_owned(),
            ));
        }

        let mut slot = self.slot();
        if slot.revoked {
            return Err(self.closed());
        }
        let mut buffer = match slot.buffer.take() {
            Some(buffer) => buffer,
            None => self.pool.acquire()?,
        };
        buffer.clear();
        buffer.extend_from_slice(&[0u8; FRAME_HEADER_SIZE])?;
        slot.buffer = Some(buffer);
        drop(slot);

        self.message_count = 0;
        self.packed = false;
        Ok(())
    }

    /// Appends one message with its stream handle and length
    pub fn add_message(self: &mut Self, payload: &[u8], handle: StreamHandle) -> TransportResult<()> {
        let max_frame_size = self.max_frame_size;
        self.with_filling_buffer(|buffer| {
            let needed = PACKED_ENTRY_HEADER_SIZE + payload.len();
            let remaining = max_frame_size.saturating_sub(buffer.len());
            if needed > remaining {
                return Err(TransportError::BufferFull { needed, remaining });
            }

            buffer.extend_from_slice(&handle.to_le_bytes())?;
            buffer.extend_from_slice(&(payload.len() as MessageLength).to_le_bytes())?;
            buffer.extend_from_slice(payload)
        })?;
        self.message_count += 1;
        Ok(())
    }

    /// Writes the frame header. After this the frame is read-only until the next
    /// init_buffer(). Returns the length of the finished frame.
    pub fn pack(self: &mut Self) -> TransportResult<usize> {
        match self.state() {
            PackState::Filling => {}
            PackState::Packed | PackState::InFlight => {
                return Err(TransportError::InvalidState("buffer is already packed".to_owned()))
            }
            PackState::Idle => {
                return Err(TransportError::InvalidState(
                    "buffer must be initialized before packing".to_owned(),
                ))
            }
        }
        if self.message_count == 0 {
            return Err(TransportError::InvalidState("cannot pack an empty buffer".to_owned()));
        }

        let length = self.with_filling_buffer(|buffer| {
            let header = FrameHeader {
                length: buffer.len() as MessageLength,
                flags: FRAME_DATA | FRAME_PACKING,
            };
            buffer.write_at(0, &header.encode())?;
            Ok(buffer.len())
        })?;
        self.packed = true;
        Ok(length)
    }

    /// Messages in the frame being built, zero once the channel has taken it back
    pub fn message_count(self: &Self) -> MessageCount {
        if self.slot().buffer.is_some() {
            self.message_count
        } else {
            0
        }
    }

    /// Bytes written so far including the frame header
    pub fn len(self: &Self) -> usize {
        self.slot().buffer.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(self: &Self) -> bool {
        self.message_count() == 0
    }

    /// Space left for entries, each of which also costs an entry header
    pub fn remaining(self: &Self) -> usize {
        match &self.slot().buffer {
            Some(buffer) if !self.packed => self.max_frame_size.saturating_sub(buffer.len()),
            _ => 0,
        }
    }

    /// Hands the finished frame to the transmit path, which owns it until it has been
    /// written. The pooled buffer goes back to the pool after that, so the next
    /// init_buffer() leases a fresh one.
    pub(crate) fn take_frame(self: &mut Self) -> TransportResult<(PooledBuffer, InFlight)> {
        if self.state() != PackState::Packed {
            return Err(TransportError::InvalidState(
                "only a packed buffer can be submitted, call pack() first".to_owned(),
            ));
        }
        let buffer = self
            .slot()
            .buffer
            .take()
            .ok_or_else(|| TransportError::InvalidState("packed buffer has no frame".to_owned()))?;
        self.in_flight.store(true, Ordering::Release);
        self.packed = false;
        self.message_count = 0;
        Ok((buffer, InFlight(self.in_flight.clone())))
    }

    fn slot(self: &Self) -> MutexGuard<'_, FrameSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed(self: &Self) -> TransportError {
        TransportError::ChannelNotActive {
            channel_id: self.channel_id,
            state: ChannelState::Closed,
        }
    }

    fn with_filling_buffer<T>(
        self: &Self,
        action: impl FnOnce(&mut PooledBuffer) -> TransportResult<T>,
    ) -> TransportResult<T> {
        if self.packed || self.in_flight.load(Ordering::Acquire) {
            return Err(TransportError::InvalidState(
                "cannot add to a buffer that has been packed".to_owned(),
            ));
        }
        let mut slot = self.slot();
        if slot.revoked {
            return Err(self.closed());
        }
        match slot.buffer.as_mut() {
            Some(buffer) => action(buffer),
            None => Err(TransportError::InvalidState(
                "call init_buffer() before adding messages".to_owned(),
            )),
        }
    }
}
