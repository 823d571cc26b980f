use std::{
    collections::VecDeque,
    fmt, io,
    io::ErrorKind,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use log::{error, info, warn};

#[cfg(debug_assertions)]
use log::debug;

use crate::{
    config::ChannelConfig,
    data_types::{ChannelId, FragmentId, MessageCount, MessageLength, ProtocolVersion, ServerId, StreamHandle},
    error_codes::{TransportError, TransportResult},
};

use super::{
    buffer_pool::{BufferPool, PooledBuffer},
    compression::{compress, decompress, CompressionType},
    connection::SocketStream,
    fragments::{decode_first_fragment, decode_next_fragment, encode_fragments, fragment_count, Reassembly},
    framing::{
        decode_data, encode_connect_nak, encode_message, encode_ping, frame_kind, max_single_payload, ConnectAck,
        ConnectRequest, FrameHeader, FrameKind, InboundMessage, FRAME_COMPRESSED, FRAME_CONNECT_ACK,
        FRAME_CONNECT_NAK, FRAME_CONNECT_REQUEST, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
    },
    packed_buffer::{revoke_slot, FrameSlot, InFlight, PackedBuffer},
    write_flags::{effective_flags, SubmitOptions, WriteFlags, WritePriority},
    FRAME_HEADER_SIZE,
};

const MAX_FRAME_SIZE: usize = MessageLength::MAX as usize;
const RECEIVE_BUFFER_SIZE: usize = MAX_FRAME_SIZE << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Initializing,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the channel came into existence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Client { address: String },
    Accepted { server_id: ServerId, peer: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitProgress {
    InProgress,
    Active,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_written: u64,
    pub messages_written: u64,
    pub bytes_written: u64,
    pub frames_read: u64,
    pub messages_read: u64,
    pub bytes_read: u64,
    pub pings_sent: u64,
    pub pings_received: u64,
    pub frames_compressed: u64,
    pub fragments_written: u64,
    pub messages_reassembled: u64,
}

/// Snapshot of a channel for monitoring
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub state: ChannelState,
    pub protocol_version: ProtocolVersion,
    pub max_message_size: MessageLength,
    pub ping_timeout_secs: u16,
    pub compression: CompressionType,
    pub config: Arc<ChannelConfig>,
    pub queued_frames: usize,
    pub bytes_queued: usize,
    pub pool_buffer_size: usize,
    pub stats: ChannelStats,
}

struct OutboundFrame {
    buffer: PooledBuffer,
    flags: WriteFlags,
    messages: MessageCount,
    fragment: bool,
    _in_flight: Option<InFlight>,
}

impl OutboundFrame {
    fn new(buffer: PooledBuffer, flags: WriteFlags, messages: MessageCount) -> Self {
        Self {
            buffer,
            flags,
            messages,
            fragment: false,
            _in_flight: None,
        }
    }
}

/// One connection. Submissions are framed into pooled buffers and queued by
/// priority, then written when the caller flushes, when the submission asks for a
/// direct write, or when the queue grows past the high-water mark. Nothing happens
/// in the background, the application drives the channel by calling into it.
pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    state: ChannelState,
    config: Arc<ChannelConfig>,
    flush_order: Vec<WritePriority>,
    flush_position: usize,
    stream: Option<Box<dyn SocketStream>>,
    pool: Arc<BufferPool>,

    queues: [VecDeque<OutboundFrame>; 3],
    partial: Option<(OutboundFrame, usize)>,
    bytes_queued: usize,

    protocol_version: ProtocolVersion,
    max_message_size: MessageLength,
    ping_timeout_secs: u16,
    compression: CompressionType,
    request_sent: bool,

    next_fragment_id: FragmentId,
    reassembly: Reassembly,
    packed_slots: Vec<Weak<Mutex<FrameSlot>>>,

    receive_buffer: Box<[u8]>,
    receive_count: usize,
    consumed_count: usize,

    last_sent: Instant,
    last_received: Instant,
    stats: ChannelStats,
}

impl Channel {
    pub(crate) fn client(
        id: ChannelId,
        address: &str,
        config: ChannelConfig,
        stream: Box<dyn SocketStream>,
        pool: &Arc<BufferPool>,
    ) -> TransportResult<Self> {
        let kind = ChannelKind::Client { address: address.to_owned() };
        Self::new(id, kind, config, stream, pool)
    }

    pub(crate) fn accepted(
        id: ChannelId,
        server_id: ServerId,
        config: ChannelConfig,
        stream: Box<dyn SocketStream>,
        pool: &Arc<BufferPool>,
    ) -> TransportResult<Self> {
        let kind = ChannelKind::Accepted { server_id, peer: stream.peer() };
        Self::new(id, kind, config, stream, pool)
    }

    fn new(
        id: ChannelId,
        kind: ChannelKind,
        config: ChannelConfig,
        stream: Box<dyn SocketStream>,
        pool: &Arc<BufferPool>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let flush_order = config.flush_order()?;
        pool.reserve(config.guaranteed_output_buffers);

        info!("Channel {id}: Created {kind:?}");

        let now = Instant::now();
        Ok(Self {
            id,
            kind,
            state: ChannelState::Initializing,
            max_message_size: config.max_message_size.min(pool.buffer_size().min(MAX_FRAME_SIZE) as MessageLength),
            ping_timeout_secs: config.ping_timeout_secs,
            config: Arc::new(config),
            flush_order,
            flush_position: 0,
            stream: Some(stream),
            pool: pool.clone(),

            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            partial: None,
            bytes_queued: 0,

            protocol_version: MAX_PROTOCOL_VERSION,
            compression: CompressionType::None,
            request_sent: false,

            next_fragment_id: 0,
            reassembly: Reassembly::default(),
            packed_slots: Vec::new(),

            receive_buffer: vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
            receive_count: 0,
            consumed_count: 0,

            last_sent: now,
            last_received: now,
            stats: ChannelStats::default(),
        })
    }

    pub fn id(self: &Self) -> ChannelId {
        self.id
    }

    pub fn kind(self: &Self) -> &ChannelKind {
        &self.kind
    }

    pub fn state(self: &Self) -> ChannelState {
        self.state
    }

    pub fn config(self: &Self) -> Arc<ChannelConfig> {
        self.config.clone()
    }

    pub fn pool(self: &Self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn max_message_size(self: &Self) -> MessageLength {
        self.max_message_size
    }

    /// Replaces the configuration as a whole. Limits negotiated during the
    /// handshake stay as they are.
    pub fn set_config(self: &mut Self, config: ChannelConfig) -> TransportResult<()> {
        if matches!(self.state, ChannelState::Closing | ChannelState::Closed) {
            return Err(self.not_active());
        }
        config.validate()?;
        self.flush_order = config.flush_order()?;
        self.flush_position = 0;
        info!("Channel {}: Configuration replaced", self.id);
        self.config = Arc::new(config);
        Ok(())
    }

    /// Advances the connection handshake. Call repeatedly until it reports Active.
    pub fn init(self: &mut Self) -> TransportResult<InitProgress> {
        match self.state {
            ChannelState::Active => return Ok(InitProgress::Active),
            ChannelState::Initializing => {}
            _ => return Err(self.not_active()),
        }

        let result = if matches!(self.kind, ChannelKind::Client { .. }) {
            self.init_client()
        } else {
            self.init_accepted()
        };
        result.map_err(|e| self.fail(e))
    }

    fn init_client(self: &mut Self) -> TransportResult<InitProgress> {
        if !self.request_sent {
            let request = ConnectRequest {
                min_version: MIN_PROTOCOL_VERSION,
                max_version: MAX_PROTOCOL_VERSION,
                max_message_size: self.max_message_size,
                ping_timeout_secs: self.ping_timeout_secs,
                compression: self.config.compression_type,
            };
            self.queue_control(&request.encode())?;
            self.request_sent = true;
        }
        self.flush_internal()?;

        self.receive()?;
        let Some((header, start, end)) = self.next_frame()? else {
            return Ok(InitProgress::InProgress);
        };
        match header.flags {
            FRAME_CONNECT_ACK => {
                let ack = ConnectAck::decode(&self.receive_buffer[start..end])?;
                self.protocol_version = ack.version;
                self.max_message_size = ack.max_message_size.min(self.max_message_size);
                self.ping_timeout_secs = ack.ping_timeout_secs;
                self.compression = ack.compression;
                self.activate();
                Ok(InitProgress::Active)
            }
            FRAME_CONNECT_NAK => Err(TransportError::Protocol(
                "server refused the connection, no common protocol version".to_owned(),
            )),
            flags => Err(TransportError::Protocol(format!(
                "expected a connect ack during the handshake, received frame flags {flags:#04x}"
            ))),
        }
    }

    fn init_accepted(self: &mut Self) -> TransportResult<InitProgress> {
        self.receive()?;
        let Some((header, start, end)) = self.next_frame()? else {
            return Ok(InitProgress::InProgress);
        };
        if header.flags != FRAME_CONNECT_REQUEST {
            return Err(TransportError::Protocol(format!(
                "expected a connect request during the handshake, received frame flags {:#04x}",
                header.flags
            )));
        }

        let request = ConnectRequest::decode(&self.receive_buffer[start..end])?;
        match request.negotiate(self.max_message_size, self.ping_timeout_secs, self.config.compression_type) {
            Some(ack) => {
                self.queue_control(&ack.encode())?;
                self.flush_internal()?;
                self.protocol_version = ack.version;
                self.max_message_size = ack.max_message_size;
                self.ping_timeout_secs = ack.ping_timeout_secs;
                self.compression = ack.compression;
                self.activate();
                Ok(InitProgress::Active)
            }
            None => {
                self.queue_control(&encode_connect_nak())?;
                self.flush_internal()?;
                Err(TransportError::Protocol(format!(
                    "client supports versions {}..={} but this end supports {MIN_PROTOCOL_VERSION}..={MAX_PROTOCOL_VERSION}",
                    request.min_version, request.max_version
                )))
            }
        }
    }

    fn activate(self: &mut Self) {
        self.state = ChannelState::Active;
        info!(
            "Channel {}: Active, version {} max message {} bytes ping timeout {}s compression {:?}",
            self.id, self.protocol_version, self.max_message_size, self.ping_timeout_secs, self.compression
        );
    }

    /// Creates a packed buffer that can be filled and submitted to this channel. The
    /// channel takes its frame back when it closes.
    pub fn packed_buffer(self: &mut Self) -> TransportResult<PackedBuffer> {
        self.ensure_active()?;
        self.packed_slots.retain(|slot| slot.strong_count() > 0);
        let packed = PackedBuffer::new(self.id, &self.pool, self.max_message_size);
        self.packed_slots.push(packed.lease());
        Ok(packed)
    }

    /// Frames one message and queues it. A message too large for one frame is sent
    /// as fragments. Returns the number of bytes still waiting to be written, zero
    /// when everything reached the socket.
    pub fn submit(
        self: &mut Self,
        payload: &[u8],
        handle: StreamHandle,
        options: &SubmitOptions,
    ) -> TransportResult<usize> {
        self.ensure_active()?;
        let flags = effective_flags(options.flags, &self.config);
        if payload.len() > max_single_payload(self.max_message_size) {
            return self.submit_fragmented(payload, handle, flags, options.priority);
        }
        self.ensure_capacity(1)?;

        let mut buffer = self.pool.acquire()?;
        encode_message(&mut buffer, handle, payload, self.max_message_size)?;
        self.compress_frame(&mut buffer, flags)?;

        self.enqueue(OutboundFrame::new(buffer, flags, 1), options.priority);
        self.after_enqueue(flags)
    }

    /// Queues a packed frame. The packed buffer stays in flight until the frame has
    /// been written.
    pub fn submit_packed(self: &mut Self, packed: &mut PackedBuffer, options: &SubmitOptions) -> TransportResult<usize> {
        self.ensure_active()?;
        if packed.channel_id() != self.id {
            return Err(TransportError::InvalidArgument(format!(
                "packed buffer belongs to channel {} not channel {}",
                packed.channel_id(),
                self.id
            )));
        }
        if packed.len() > self.max_message_size as usize {
            return Err(TransportError::MessageTooLarge {
                length: packed.len(),
                max: self.max_message_size as usize,
            });
        }
        self.ensure_capacity(1)?;

        let flags = effective_flags(options.flags, &self.config);
        let messages = packed.message_count();
        let (mut buffer, in_flight) = packed.take_frame()?;
        self.compress_frame(&mut buffer, flags)?;

        let mut frame = OutboundFrame::new(buffer, flags, messages);
        frame._in_flight = Some(in_flight);
        self.enqueue(frame, options.priority);
        self.after_enqueue(flags)
    }

    /// Writes queued frames in priority order. Returns the bytes still queued,
    /// non-zero when the socket would not take everything.
    pub fn flush(self: &mut Self) -> TransportResult<usize> {
        self.ensure_active()?;
        self.flush_internal()
    }

    /// Sends a header-only frame so the other end knows this one is alive
    pub fn ping(self: &mut Self) -> TransportResult<usize> {
        self.ensure_active()?;
        let mut buffer = self.pool.acquire()?;
        encode_ping(&mut buffer)?;
        self.enqueue(OutboundFrame::new(buffer, WriteFlags::DIRECT_SOCKET_WRITE, 0), WritePriority::High);
        self.stats.pings_sent += 1;
        self.flush_internal()
    }

    /// Pings when this end has been quiet for a third of the ping timeout and fails
    /// the channel when the other end has been quiet for the whole timeout
    pub fn keep_alive(self: &mut Self) -> TransportResult<()> {
        self.ensure_active()?;
        let timeout = Duration::from_secs(self.ping_timeout_secs as u64);
        if self.last_received.elapsed() > timeout {
            let e = io::Error::new(
                ErrorKind::TimedOut,
                format!("nothing received for {} seconds", self.ping_timeout_secs),
            );
            return Err(self.fail_io(e));
        }
        if self.last_sent.elapsed() > timeout / 3 {
            self.ping()?;
        }
        Ok(())
    }

    /// Reads whatever the socket has and returns the complete messages in the order
    /// they were sent. Pings are consumed here and fragments are held until their
    /// message is complete.
    pub fn read(self: &mut Self) -> TransportResult<Vec<InboundMessage>> {
        self.ensure_active()?;
        self.receive()?;

        let mut messages = Vec::new();
        loop {
            let frame = match self.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            };
            if let Err(e) = self.read_frame(frame, &mut messages) {
                return Err(self.fail(e));
            }
        }
        self.compact();
        Ok(messages)
    }

    fn read_frame(
        self: &mut Self,
        (header, start, end): (FrameHeader, usize, usize),
        messages: &mut Vec<InboundMessage>,
    ) -> TransportResult<()> {
        self.stats.frames_read += 1;
        let body = &self.receive_buffer[start..end];
        match frame_kind(header.flags) {
            Some(FrameKind::Ping) => self.stats.pings_received += 1,
            Some(FrameKind::Data { packed, compressed: false }) => {
                let count = decode_data(packed, body, messages)?;
                self.stats.messages_read += count as u64;
            }
            Some(FrameKind::Data { packed, compressed: true }) => {
                let limit = self.max_message_size as usize - FRAME_HEADER_SIZE;
                let inflated = decompress(self.compression, body, limit)?;
                let count = decode_data(packed, &inflated, messages)?;
                self.stats.messages_read += count as u64;
            }
            Some(FrameKind::FirstFragment) => {
                let limit = self.config.max_fragmented_message_size;
                let complete = self.reassembly.first(decode_first_fragment(body)?, limit)?;
                self.deliver_reassembled(complete, messages);
            }
            Some(FrameKind::NextFragment) => {
                let (fragment_id, chunk) = decode_next_fragment(body)?;
                let complete = self.reassembly.next(fragment_id, chunk)?;
                self.deliver_reassembled(complete, messages);
            }
            _ => {
                return Err(TransportError::Protocol(format!(
                    "unexpected frame flags {:#04x} on an active channel",
                    header.flags
                )))
            }
        }
        Ok(())
    }

    fn deliver_reassembled(self: &mut Self, complete: Option<InboundMessage>, messages: &mut Vec<InboundMessage>) {
        if let Some(message) = complete {
            #[cfg(debug_assertions)]
            debug!("Channel {}: Reassembled {} byte message", self.id, message.payload.len());

            self.stats.messages_read += 1;
            self.stats.messages_reassembled += 1;
            messages.push(message);
        }
    }

    /// Closes the channel. Queued frames get one best-effort flush, then every
    /// buffer goes back to the pool and the socket is shut down.
    pub fn close(self: &mut Self) -> TransportResult<()> {
        match self.state {
            ChannelState::Initializing | ChannelState::Active => {}
            _ => return Err(self.not_active()),
        }
        let was_active = self.state == ChannelState::Active;
        self.state = ChannelState::Closing;
        if was_active && self.bytes_queued > 0 {
            if let Err(e) = self.flush_internal() {
                warn!("Channel {}: Discarding queued frames, final flush failed: {e}", self.id);
            }
        }
        self.release_resources();
        info!("Channel {}: Closed", self.id);
        Ok(())
    }

    pub fn info(self: &Self) -> ChannelInfo {
        ChannelInfo {
            id: self.id,
            kind: self.kind.clone(),
            state: self.state,
            protocol_version: self.protocol_version,
            max_message_size: self.max_message_size,
            ping_timeout_secs: self.ping_timeout_secs,
            compression: self.compression,
            config: self.config.clone(),
            queued_frames: self.queued_frames(),
            bytes_queued: self.bytes_queued,
            pool_buffer_size: self.pool.buffer_size(),
            stats: self.stats.clone(),
        }
    }

    pub fn bytes_queued(self: &Self) -> usize {
        self.bytes_queued
    }

    pub fn queued_frames(self: &Self) -> usize {
        self.queues.iter().map(|q| q.len()).sum::<usize>() + self.partial.is_some() as usize
    }

    fn ensure_active(self: &Self) -> TransportResult<()> {
        if self.state == ChannelState::Active {
            Ok(())
        } else {
            Err(self.not_active())
        }
    }

    fn not_active(self: &Self) -> TransportError {
        TransportError::ChannelNotActive {
            channel_id: self.id,
            state: self.state,
        }
    }

    /// Limits the frames a channel can hold before they reach the socket. `needed`
    /// is the number of frames about to be queued.
    fn ensure_capacity(self: &mut Self, needed: usize) -> TransportResult<()> {
        let max = self.config.max_output_buffers;
        if needed > max {
            return Err(TransportError::ResourceExhausted(format!(
                "channel {} would need {needed} frames but holds at most {max}",
                self.id
            )));
        }
        if self.queued_frames() + needed > max {
            self.flush_internal()?;
            if self.queued_frames() + needed > max {
                return Err(TransportError::ResourceExhausted(format!(
                    "channel {} has {} frames waiting to be written, flush before submitting more",
                    self.id,
                    self.queued_frames()
                )));
            }
        }
        Ok(())
    }

    /// Queues every fragment of an oversized message back to back at one priority
    fn submit_fragmented(
        self: &mut Self,
        payload: &[u8],
        handle: StreamHandle,
        flags: WriteFlags,
        priority: WritePriority,
    ) -> TransportResult<usize> {
        let limit = self.config.max_fragmented_message_size;
        if payload.len() > limit {
            return Err(TransportError::MessageTooLarge {
                length: payload.len(),
                max: limit,
            });
        }
        let max_message_size = self.max_message_size as usize;
        self.ensure_capacity(fragment_count(payload.len(), max_message_size))?;

        let fragment_id = self.next_fragment_id;
        let buffers = encode_fragments(&self.pool, fragment_id, handle, payload, max_message_size)?;
        self.next_fragment_id = fragment_id.wrapping_add(1);

        #[cfg(debug_assertions)]
        debug!(
            "Channel {}: Split {} byte message into {} fragments with id {fragment_id}",
            self.id,
            payload.len(),
            buffers.len()
        );

        let last = buffers.len() - 1;
        for (index, buffer) in buffers.into_iter().enumerate() {
            let mut frame = OutboundFrame::new(buffer, flags, (index == last) as MessageCount);
            frame.fragment = true;
            self.enqueue(frame, priority);
        }
        self.after_enqueue(flags)
    }

    /// Replaces the body of a data frame with its compressed form when compression
    /// was negotiated, the body reaches the threshold, the flags allow it and the
    /// result is smaller
    fn compress_frame(self: &mut Self, buffer: &mut PooledBuffer, flags: WriteFlags) -> TransportResult<()> {
        if self.compression == CompressionType::None || flags.contains(WriteFlags::DO_NOT_COMPRESS) {
            return Ok(());
        }
        let frame = buffer.as_slice();
        let Some(header) = FrameHeader::decode(frame) else {
            return Ok(());
        };
        let body = &frame[FRAME_HEADER_SIZE..];
        if body.len() < self.config.compression_threshold {
            return Ok(());
        }

        let compressed = match compress(self.compression, self.config.compression_level, body) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!("Channel {}: Sending frame uncompressed, compression failed: {e}", self.id);
                return Ok(());
            }
        };
        if compressed.len() >= body.len() {
            return Ok(());
        }

        let header = FrameHeader {
            length: (FRAME_HEADER_SIZE + compressed.len()) as MessageLength,
            flags: header.flags | FRAME_COMPRESSED,
        };
        buffer.clear();
        buffer.extend_from_slice(&header.encode())?;
        buffer.extend_from_slice(&compressed)?;
        self.stats.frames_compressed += 1;
        Ok(())
    }

    fn queue_control(self: &mut Self, frame: &[u8]) -> TransportResult<()> {
        let mut buffer = self.pool.acquire()?;
        buffer.extend_from_slice(frame)?;
        self.enqueue(OutboundFrame::new(buffer, WriteFlags::DIRECT_SOCKET_WRITE, 0), WritePriority::High);
        Ok(())
    }

    fn enqueue(self: &mut Self, frame: OutboundFrame, priority: WritePriority) {
        #[cfg(debug_assertions)]
        debug!(
            "Channel {}: Queued {} byte frame at {priority:?} priority with {:?}",
            self.id,
            frame.buffer.len(),
            frame.flags
        );

        self.bytes_queued += frame.buffer.len();
        self.queues[priority.index()].push_back(frame);
    }

    fn after_enqueue(self: &mut Self, flags: WriteFlags) -> TransportResult<usize> {
        if flags.contains(WriteFlags::DIRECT_SOCKET_WRITE) || self.bytes_queued > self.config.high_water_mark {
            self.flush_internal()
        } else {
            Ok(self.bytes_queued)
        }
    }

    /// Takes the next frame by walking the flush order round robin
    fn next_outbound(self: &mut Self) -> Option<OutboundFrame> {
        for _ in 0..self.flush_order.len() {
            let priority = self.flush_order[self.flush_position];
            self.flush_position = (self.flush_position + 1) % self.flush_order.len();
            if let Some(frame) = self.queues[priority.index()].pop_front() {
                return Some(frame);
            }
        }
        None
    }

    fn flush_internal(self: &mut Self) -> TransportResult<usize> {
        loop {
            if self.partial.is_none() {
                match self.next_outbound() {
                    Some(frame) => self.partial = Some((frame, 0)),
                    None => break,
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(TransportError::InvalidState(format!("channel {} has no socket", self.id)));
            };
            let Some((frame, offset)) = self.partial.as_mut() else {
                break;
            };

            match stream.write(&frame.buffer.as_slice()[*offset..], frame.flags) {
                Ok(0) => break,
                Ok(count) => {
                    *offset += count;
                    self.bytes_queued -= count;
                    self.stats.bytes_written += count as u64;
                    self.last_sent = Instant::now();
                    if *offset < frame.buffer.len() {
                        break;
                    }
                    self.stats.frames_written += 1;
                    self.stats.messages_written += frame.messages as u64;
                    self.stats.fragments_written += frame.fragment as u64;
                    self.partial = None;
                }
                Err(e) => return Err(self.fail_io(e)),
            }
        }
        Ok(self.bytes_queued)
    }

    fn receive(self: &mut Self) -> TransportResult<()> {
        loop {
            if self.receive_count == self.receive_buffer.len() {
                self.compact();
                if self.receive_count == self.receive_buffer.len() {
                    return Ok(());
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(TransportError::InvalidState(format!("channel {} has no socket", self.id)));
            };

            match stream.read(&mut self.receive_buffer[self.receive_count..]) {
                Ok(0) => return Ok(()),
                Ok(count) => {
                    #[cfg(debug_assertions)]
                    debug!("Channel {}: Received {count} bytes", self.id);

                    self.receive_count += count;
                    self.stats.bytes_read += count as u64;
                    self.last_received = Instant::now();
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => return Ok(()),
                    ErrorKind::Interrupted => {}
                    ErrorKind::TimedOut => {
                        warn!("Channel {}: Timeout reading from socket", self.id);
                        return Ok(());
                    }
                    _ => return Err(self.fail_io(e)),
                },
            }
        }
    }

    /// Returns the header and body range of the next complete frame, if there is one
    fn next_frame(self: &mut Self) -> TransportResult<Option<(FrameHeader, usize, usize)>> {
        let residual = &self.receive_buffer[self.consumed_count..self.receive_count];
        let Some(header) = FrameHeader::decode(residual) else {
            return Ok(None);
        };

        let length = header.length as usize;
        let limit = match self.state {
            ChannelState::Active => self.max_message_size as usize,
            _ => MAX_FRAME_SIZE,
        };
        if length < FRAME_HEADER_SIZE || length > limit {
            return Err(TransportError::Protocol(format!(
                "frame length {length} is outside the range {FRAME_HEADER_SIZE}..={limit}"
            )));
        }
        if residual.len() < length {
            return Ok(None);
        }

        let start = self.consumed_count + FRAME_HEADER_SIZE;
        let end = self.consumed_count + length;
        self.consumed_count = end;
        Ok(Some((header, start, end)))
    }

    /// Moves unconsumed bytes to the front once the free space gets too small for
    /// a whole frame
    fn compact(self: &mut Self) {
        let residual = self.receive_count - self.consumed_count;
        if residual == 0 {
            self.receive_count = 0;
            self.consumed_count = 0;
        } else if self.receive_buffer.len() - self.receive_count < MAX_FRAME_SIZE {
            self.receive_buffer.copy_within(self.consumed_count..self.receive_count, 0);
            self.receive_count = residual;
            self.consumed_count = 0;
        }
    }

    fn fail_io(self: &mut Self, e: io::Error) -> TransportError {
        self.fail(TransportError::io(self.id, e))
    }

    /// Fatal errors close the channel and are handed back to the caller
    fn fail(self: &mut Self, e: TransportError) -> TransportError {
        if matches!(self.state, ChannelState::Closed) {
            return e;
        }
        error!("Channel {}: {e}", self.id);
        self.state = ChannelState::Closing;
        self.release_resources();
        e
    }

    /// Returns every buffer to the pool, including frames still being packed by the
    /// application, and shuts the socket down, exactly once
    fn release_resources(self: &mut Self) {
        for queue in self.queues.iter_mut() {
            queue.clear();
        }
        self.partial = None;
        self.bytes_queued = 0;
        for slot in self.packed_slots.drain(..) {
            revoke_slot(&slot);
        }
        if self.reassembly.pending() > 0 {
            warn!(
                "Channel {}: Discarding {} partly reassembled messages",
                self.id,
                self.reassembly.pending()
            );
        }
        self.reassembly.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown() {
                warn!("Channel {}: Error shutting down socket: {e}", self.id);
            }
        }
        self.state = ChannelState::Closed;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.release_resources();
            info!("Channel {}: Dropped", self.id);
        }
    }
}

/// Shared reference to a channel tracked by a protocol registry. Calls through a
/// handle are serialized, so one channel never has two writers at once.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    channel: Arc<Mutex<Channel>>,
}

impl ChannelHandle {
    pub(crate) fn new(channel: Channel) -> Self {
        Self {
            id: channel.id(),
            channel: Arc::new(Mutex::new(channel)),
        }
    }

    pub fn id(self: &Self) -> ChannelId {
        self.id
    }

    /// Exclusive access for a sequence of calls
    pub fn lock(self: &Self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(self: &Self) -> ChannelState {
        self.lock().state()
    }

    pub fn init(self: &Self) -> TransportResult<InitProgress> {
        self.lock().init()
    }

    pub fn submit(self: &Self, payload: &[u8], handle: StreamHandle, options: &SubmitOptions) -> TransportResult<usize> {
        self.lock().submit(payload, handle, options)
    }

    pub fn submit_packed(self: &Self, packed: &mut PackedBuffer, options: &SubmitOptions) -> TransportResult<usize> {
        self.lock().submit_packed(packed, options)
    }

    pub fn packed_buffer(self: &Self) -> TransportResult<PackedBuffer> {
        self.lock().packed_buffer()
    }

    pub fn flush(self: &Self) -> TransportResult<usize> {
        self.lock().flush()
    }

    pub fn read(self: &Self) -> TransportResult<Vec<InboundMessage>> {
        self.lock().read()
    }

    pub fn ping(self: &Self) -> TransportResult<usize> {
        self.lock().ping()
    }

    pub fn keep_alive(self: &Self) -> TransportResult<()> {
        self.lock().keep_alive()
    }

    pub fn close(self: &Self) -> TransportResult<()> {
        self.lock().close()
    }

    pub fn info(self: &Self) -> ChannelInfo {
        self.lock().info()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::sockets::{
        buffer_pool::PoolSpec,
        connection::memory::{self, Controls, MemoryStream},
        framing::{FRAME_DATA, FRAME_FRAGMENT},
        packed_buffer::PackState,
    };

    struct Pair {
        client: Channel,
        server: Channel,
        client_controls: Arc<Mutex<Controls>>,
        client_shutdowns: Arc<Mutex<usize>>,
        pool: Arc<BufferPool>,
    }

    fn active_pair(client_config: ChannelConfig, server_config: ChannelConfig) -> Pair {
        let (client_stream, server_stream) = memory::pair();
        let client_controls = client_stream.controls.clone();
        let client_shutdowns = client_stream.shutdowns.clone();
        let pool = BufferPool::new(PoolSpec::unbounded(client_config.max_message_size as usize));

        let mut client = Channel::client(1, "memory", client_config, Box::new(client_stream), &pool).unwrap();
        let mut server = Channel::accepted(2, 1, server_config, Box::new(server_stream), &pool).unwrap();

        assert_eq!(InitProgress::InProgress, client.init().unwrap());
        assert_eq!(InitProgress::Active, server.init().unwrap());
        assert_eq!(InitProgress::Active, client.init().unwrap());
        {
            let mut controls = client_controls.lock().unwrap();
            controls.flags_seen.clear();
            controls.write_calls = 0;
        }

        Pair {
            client,
            server,
            client_controls,
            client_shutdowns,
            pool,
        }
    }

    fn default_pair() -> Pair {
        active_pair(ChannelConfig::default(), ChannelConfig::default())
    }

    #[test]
    fn should_negotiate_smaller_message_size() {
        let client_config = ChannelConfig {
            max_message_size: 4096,
            ..Default::default()
        };
        let server_config = ChannelConfig {
            max_message_size: 2048,
            ping_timeout_secs: 30,
            ..Default::default()
        };
        let pair = active_pair(client_config, server_config);

        assert_eq!(2048, pair.client.max_message_size());
        assert_eq!(2048, pair.server.max_message_size());
        assert_eq!(30, pair.client.info().ping_timeout_secs);
    }

    #[test]
    fn should_queue_until_flush_without_direct_write() {
        let mut pair = default_pair();
        let queued = pair.client.submit(b"update", 4, &SubmitOptions::default()).unwrap();

        assert!(queued > 0);
        assert_eq!(0, pair.client_controls.lock().unwrap().write_calls);
        assert!(pair.server.read().unwrap().is_empty());

        assert_eq!(0, pair.client.flush().unwrap());
        let messages = pair.server.read().unwrap();
        assert_eq!(vec![InboundMessage { handle: 4, payload: b"update".to_vec() }], messages);
    }

    #[test]
    fn should_write_immediately_when_channel_prefers_direct_write() {
        let config = ChannelConfig {
            direct_write: true,
            ..Default::default()
        };
        let mut pair = active_pair(config, ChannelConfig::default());
        let options = SubmitOptions::with_flags(WriteFlags::DO_NOT_COMPRESS);

        assert_eq!(0, pair.client.submit(b"refresh", 1, &options).unwrap());
        assert_eq!(
            vec![WriteFlags::DIRECT_SOCKET_WRITE | WriteFlags::DO_NOT_COMPRESS],
            pair.client_controls.lock().unwrap().flags_seen
        );
        assert_eq!(1, pair.server.read().unwrap().len());
    }

    #[test]
    fn should_honour_caller_direct_write_when_channel_does_not() {
        let mut pair = default_pair();
        let options = SubmitOptions::with_flags(WriteFlags::DIRECT_SOCKET_WRITE | WriteFlags::DO_NOT_COMPRESS);

        assert_eq!(0, pair.client.submit(b"status", 1, &options).unwrap());
        assert_eq!(
            vec![WriteFlags::DIRECT_SOCKET_WRITE | WriteFlags::DO_NOT_COMPRESS],
            pair.client_controls.lock().unwrap().flags_seen
        );
    }

    #[test]
    fn should_flush_past_high_water_mark() {
        let config = ChannelConfig {
            high_water_mark: 100,
            ..Default::default()
        };
        let mut pair = active_pair(config, ChannelConfig::default());

        assert!(pair.client.submit(&[7u8; 60], 1, &SubmitOptions::default()).unwrap() > 0);
        assert_eq!(0, pair.client.submit(&[8u8; 60], 2, &SubmitOptions::default()).unwrap());
        assert_eq!(2, pair.server.read().unwrap().len());
    }

    #[test]
    fn should_deliver_packed_batch_like_single_messages() {
        let mut pair = default_pair();
        let payloads: Vec<Vec<u8>> = (0..10).map(|i| format!("update {i}").into_bytes()).collect();

        for (i, payload) in payloads.iter().enumerate() {
            pair.client.submit(payload, i as StreamHandle, &SubmitOptions::default()).unwrap();
        }
        pair.client.flush().unwrap();
        let unpacked = pair.server.read().unwrap();

        let mut packed = pair.client.packed_buffer().unwrap();
        packed.init_buffer().unwrap();
        for (i, payload) in payloads.iter().enumerate() {
            packed.add_message(payload, i as StreamHandle).unwrap();
        }
        packed.pack().unwrap();
        pair.client.submit_packed(&mut packed, &SubmitOptions::default()).unwrap();
        pair.client.flush().unwrap();
        let batched = pair.server.read().unwrap();

        assert_eq!(10, batched.len());
        assert_eq!(unpacked, batched);
        // connect request, ten single frames and one packed frame
        assert_eq!(12, pair.client.info().stats.frames_written);
        assert_eq!(20, pair.client.info().stats.messages_written);
    }

    #[test]
    fn should_resume_partial_writes() {
        let mut pair = default_pair();
        pair.client_controls.lock().unwrap().write_limit = Some(5);

        pair.client.submit(b"a longer update payload", 3, &SubmitOptions::default()).unwrap();
        let mut remaining = pair.client.flush().unwrap();
        while remaining > 0 {
            remaining = pair.client.flush().unwrap();
        }

        let messages = pair.server.read().unwrap();
        assert_eq!(b"a longer update payload".to_vec(), messages[0].payload);
    }

    #[test]
    fn should_hold_packed_buffer_in_flight_until_written() {
        let mut pair = default_pair();
        pair.client_controls.lock().unwrap().write_limit = Some(0);

        let mut packed = pair.client.packed_buffer().unwrap();
        packed.init_buffer().unwrap();
        packed.add_message(b"generic", 8).unwrap();
        packed.pack().unwrap();
        pair.client.submit_packed(&mut packed, &SubmitOptions::default()).unwrap();
        pair.client.flush().unwrap();

        assert_eq!(PackState::InFlight, packed.state());
        assert!(matches!(packed.init_buffer(), Err(TransportError::InvalidState(_))));

        pair.client_controls.lock().unwrap().write_limit = None;
        assert_eq!(0, pair.client.flush().unwrap());
        assert_eq!(PackState::Idle, packed.state());
        assert!(packed.init_buffer().is_ok());
    }

    #[test]
    fn should_reject_packed_buffer_from_another_channel() {
        let mut pair = default_pair();
        let mut packed = pair.server.packed_buffer().unwrap();
        packed.init_buffer().unwrap();
        packed.add_message(b"update", 1).unwrap();
        packed.pack().unwrap();

        let result = pair.client.submit_packed(&mut packed, &SubmitOptions::default());
        assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
        assert_eq!(PackState::Packed, packed.state());
    }

    #[test]
    fn should_flush_high_priority_first() {
        let mut pair = default_pair();
        let low = SubmitOptions { priority: WritePriority::Low, ..Default::default() };
        let medium = SubmitOptions { priority: WritePriority::Medium, ..Default::default() };
        let high = SubmitOptions { priority: WritePriority::High, ..Default::default() };

        pair.client.submit(b"low", 3, &low).unwrap();
        pair.client.submit(b"medium", 2, &medium).unwrap();
        pair.client.submit(b"high", 1, &high).unwrap();
        pair.client.flush().unwrap();

        let handles: Vec<StreamHandle> = pair.server.read().unwrap().iter().map(|m| m.handle).collect();
        assert_eq!(vec![1, 2, 3], handles);
    }

    #[test]
    fn should_close_on_io_failure_and_return_buffers() {
        let mut pair = default_pair();
        pair.client.submit(b"update", 1, &SubmitOptions::default()).unwrap();
        pair.client_controls.lock().unwrap().fail_writes = true;

        let result = pair.client.flush();
        assert!(matches!(result, Err(TransportError::IoFailure { channel_id: 1, .. })));
        assert_eq!(ChannelState::Closed, pair.client.state());
        assert_eq!(0, pair.client.bytes_queued());
        assert_eq!(1, *pair.client_shutdowns.lock().unwrap());
    }

    #[test]
    fn should_refuse_submit_on_closed_channel_without_io() {
        let mut pair = default_pair();
        pair.client.close().unwrap();
        let calls = pair.client_controls.lock().unwrap().write_calls;

        let result = pair.client.submit(b"update", 1, &SubmitOptions::default());
        assert!(matches!(
            result,
            Err(TransportError::ChannelNotActive { channel_id: 1, state: ChannelState::Closed })
        ));
        assert_eq!(calls, pair.client_controls.lock().unwrap().write_calls);
    }

    #[test]
    fn should_release_everything_once_on_close() {
        let mut pair = default_pair();
        pair.client_controls.lock().unwrap().write_limit = Some(0);
        pair.client.submit(b"stuck", 1, &SubmitOptions::default()).unwrap();
        pair.client.submit(b"stuck too", 2, &SubmitOptions::default()).unwrap();

        pair.client.close().unwrap();
        assert!(matches!(pair.client.close(), Err(TransportError::ChannelNotActive { .. })));
        drop(pair.client);

        assert_eq!(1, *pair.client_shutdowns.lock().unwrap());
        pair.server.close().unwrap();
        assert_eq!(0, pair.pool.outstanding());
    }

    #[test]
    fn should_limit_frames_waiting_for_the_socket() {
        let config = ChannelConfig {
            guaranteed_output_buffers: 0,
            max_output_buffers: 2,
            ..Default::default()
        };
        let mut pair = active_pair(config, ChannelConfig::default());
        pair.client_controls.lock().unwrap().write_limit = Some(0);

        pair.client.submit(b"one", 1, &SubmitOptions::default()).unwrap();
        pair.client.submit(b"two", 1, &SubmitOptions::default()).unwrap();
        let result = pair.client.submit(b"three", 1, &SubmitOptions::default());
        assert!(matches!(result, Err(TransportError::ResourceExhausted(_))));
    }

    #[test]
    fn should_consume_pings_silently() {
        let mut pair = default_pair();
        assert_eq!(0, pair.client.ping().unwrap());

        assert!(pair.server.read().unwrap().is_empty());
        assert_eq!(1, pair.server.info().stats.pings_received);
    }

    #[test]
    fn should_refuse_client_without_common_version() {
        let (client_stream, server_stream) = memory::pair();
        let pool = BufferPool::new(PoolSpec::unbounded(6144));
        let mut server = Channel::accepted(2, 1, ChannelConfig::default(), Box::new(server_stream), &pool).unwrap();

        let request = ConnectRequest {
            min_version: MAX_PROTOCOL_VERSION + 1,
            max_version: MAX_PROTOCOL_VERSION + 2,
            max_message_size: 6144,
            ping_timeout_secs: 60,
            compression: CompressionType::None,
        };
        client_stream.outgoing.lock().unwrap().bytes.extend(request.encode());

        assert!(matches!(server.init(), Err(TransportError::Protocol(_))));
        assert_eq!(ChannelState::Closed, server.state());

        let nak = client_stream.incoming.lock().unwrap().bytes.iter().copied().collect::<Vec<u8>>();
        assert_eq!(encode_connect_nak(), nak);
    }

    /// An active server channel whose peer is driven by hand through the returned
    /// stream
    fn scripted_server(max_message_size: MessageLength) -> (MemoryStream, Channel) {
        let (client_stream, server_stream) = memory::pair();
        let pool = BufferPool::new(PoolSpec::unbounded(6144));
        let config = ChannelConfig {
            max_message_size,
            ..Default::default()
        };
        let mut server = Channel::accepted(2, 1, config, Box::new(server_stream), &pool).unwrap();
        let request = ConnectRequest {
            min_version: 1,
            max_version: 1,
            max_message_size,
            ping_timeout_secs: 60,
            compression: CompressionType::None,
        };
        client_stream.outgoing.lock().unwrap().bytes.extend(request.encode());
        assert_eq!(InitProgress::Active, server.init().unwrap());
        (client_stream, server)
    }

    #[test]
    fn should_fail_channel_on_oversized_frame() {
        let (client_stream, mut server) = scripted_server(1024);

        let header = FrameHeader { length: 2000, flags: FRAME_DATA };
        client_stream.outgoing.lock().unwrap().bytes.extend(header.encode());

        assert!(matches!(server.read(), Err(TransportError::Protocol(_))));
        assert_eq!(ChannelState::Closed, server.state());
    }

    #[test]
    fn should_replace_config_as_a_whole() {
        let mut pair = default_pair();
        let before = pair.client.config();
        let config = ChannelConfig {
            direct_write: true,
            ..Default::default()
        };
        pair.client.set_config(config).unwrap();

        assert!(!before.direct_write);
        assert!(pair.client.config().direct_write);
        assert_eq!(0, pair.client.submit(b"now", 1, &SubmitOptions::default()).unwrap());
    }

    #[test]
    fn should_fail_channel_on_connect_nak_after_handshake() {
        let (client_stream, mut server) = scripted_server(1024);
        client_stream.outgoing.lock().unwrap().bytes.extend(encode_connect_nak());

        match server.read() {
            Err(TransportError::Protocol(message)) => assert!(message.contains("0x42"), "{message}"),
            other => panic!("expected a protocol error, got {other:?}"),
        }
        assert_eq!(ChannelState::Closed, server.state());
    }

    #[test]
    fn should_take_back_packed_frame_on_close() {
        let mut pair = default_pair();
        let mut packed = pair.client.packed_buffer().unwrap();
        packed.init_buffer().unwrap();
        packed.add_message(b"update", 1).unwrap();
        assert_eq!(1, pair.pool.outstanding());

        pair.client.close().unwrap();

        assert_eq!(0, pair.pool.outstanding());
        assert!(matches!(
            packed.add_message(b"update", 2),
            Err(TransportError::ChannelNotActive { channel_id: 1, .. })
        ));
        assert!(matches!(packed.init_buffer(), Err(TransportError::ChannelNotActive { .. })));
        assert_eq!(0, pair.pool.outstanding());
    }

    #[test]
    fn should_take_back_packed_frame_when_channel_fails() {
        let mut pair = default_pair();
        let mut packed = pair.client.packed_buffer().unwrap();
        packed.init_buffer().unwrap();
        packed.add_message(b"update", 1).unwrap();
        packed.pack().unwrap();

        pair.client.submit(b"single", 2, &SubmitOptions::default()).unwrap();
        pair.client_controls.lock().unwrap().fail_writes = true;
        assert!(pair.client.flush().is_err());

        assert_eq!(0, pair.pool.outstanding());
        assert_eq!(PackState::Idle, packed.state());
    }

    #[test]
    fn should_ping_after_third_of_timeout_without_sending() {
        let config = ChannelConfig {
            ping_timeout_secs: 1,
            ..Default::default()
        };
        let mut pair = active_pair(config.clone(), config);

        pair.client.keep_alive().unwrap();
        assert_eq!(0, pair.client.info().stats.pings_sent);

        thread::sleep(Duration::from_millis(400));
        pair.client.keep_alive().unwrap();
        assert_eq!(1, pair.client.info().stats.pings_sent);

        assert!(pair.server.read().unwrap().is_empty());
        assert_eq!(1, pair.server.info().stats.pings_received);
    }

    #[test]
    fn should_close_channel_when_peer_is_silent_for_whole_timeout() {
        let config = ChannelConfig {
            ping_timeout_secs: 1,
            ..Default::default()
        };
        let mut pair = active_pair(config.clone(), config);

        thread::sleep(Duration::from_millis(1100));
        match pair.client.keep_alive() {
            Err(TransportError::IoFailure { channel_id: 1, source }) => assert_eq!(ErrorKind::TimedOut, source.kind()),
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(ChannelState::Closed, pair.client.state());
        assert_eq!(1, *pair.client_shutdowns.lock().unwrap());
    }

    fn compressing() -> ChannelConfig {
        ChannelConfig {
            compression_type: CompressionType::Zlib,
            ..Default::default()
        }
    }

    fn repetitive(length: usize) -> Vec<u8> {
        b"IBM.N bid 100 ask 101 ".iter().copied().cycle().take(length).collect()
    }

    #[test]
    fn should_compress_large_frames_when_both_ends_agree() {
        let mut pair = active_pair(compressing(), compressing());
        assert_eq!(CompressionType::Zlib, pair.client.info().compression);
        assert_eq!(CompressionType::Zlib, pair.server.info().compression);

        let payload = repetitive(500);
        pair.client.submit(&payload, 9, &SubmitOptions::default()).unwrap();
        pair.client.flush().unwrap();

        let stats = pair.client.info().stats;
        assert_eq!(1, stats.frames_compressed);
        assert!(stats.bytes_written < 500);
        assert_eq!(vec![InboundMessage { handle: 9, payload }], pair.server.read().unwrap());
    }

    #[test]
    fn should_compress_packed_frames() {
        let mut pair = active_pair(compressing(), compressing());
        let mut packed = pair.client.packed_buffer().unwrap();
        packed.init_buffer().unwrap();
        for i in 0..10 {
            packed.add_message(&repetitive(60), i).unwrap();
        }
        packed.pack().unwrap();
        pair.client.submit_packed(&mut packed, &SubmitOptions::default()).unwrap();
        pair.client.flush().unwrap();

        assert_eq!(1, pair.client.info().stats.frames_compressed);
        let handles: Vec<StreamHandle> = pair.server.read().unwrap().iter().map(|m| m.handle).collect();
        assert_eq!((0..10).collect::<Vec<StreamHandle>>(), handles);
    }

    #[test]
    fn should_not_compress_when_submission_says_not_to() {
        let mut pair = active_pair(compressing(), compressing());
        let options = SubmitOptions::with_flags(WriteFlags::DO_NOT_COMPRESS);

        pair.client.submit(&repetitive(500), 9, &options).unwrap();
        pair.client.flush().unwrap();

        let stats = pair.client.info().stats;
        assert_eq!(0, stats.frames_compressed);
        assert!(stats.bytes_written > 500);
        assert_eq!(1, pair.server.read().unwrap().len());
    }

    #[test]
    fn should_not_compress_when_channel_disables_compression() {
        let config = ChannelConfig {
            compression_disabled: true,
            ..compressing()
        };
        let mut pair = active_pair(config, compressing());

        pair.client.submit(&repetitive(500), 9, &SubmitOptions::default()).unwrap();
        pair.client.flush().unwrap();

        assert_eq!(0, pair.client.info().stats.frames_compressed);
        assert_eq!(
            vec![WriteFlags::DO_NOT_COMPRESS],
            pair.client_controls.lock().unwrap().flags_seen
        );
    }

    #[test]
    fn should_not_compress_below_threshold() {
        let mut pair = active_pair(compressing(), compressing());
        pair.client.submit(b"tiny", 9, &SubmitOptions::default()).unwrap();
        pair.client.flush().unwrap();

        assert_eq!(0, pair.client.info().stats.frames_compressed);
        assert_eq!(1, pair.server.read().unwrap().len());
    }

    #[test]
    fn should_send_uncompressed_when_peer_did_not_ask_for_compression() {
        let mut pair = active_pair(compressing(), ChannelConfig::default());
        assert_eq!(CompressionType::None, pair.client.info().compression);

        pair.client.submit(&repetitive(500), 9, &SubmitOptions::default()).unwrap();
        pair.client.flush().unwrap();

        assert_eq!(0, pair.client.info().stats.frames_compressed);
        assert_eq!(1, pair.server.read().unwrap().len());
    }

    fn small_frames() -> ChannelConfig {
        ChannelConfig {
            max_message_size: 256,
            ..Default::default()
        }
    }

    #[test]
    fn should_fragment_message_larger_than_frame() {
        let mut pair = active_pair(small_frames(), small_frames());
        let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();

        pair.client.submit(&payload, 4, &SubmitOptions::default()).unwrap();
        pair.client.flush().unwrap();

        let stats = pair.client.info().stats;
        assert_eq!(5, stats.fragments_written);
        assert_eq!(1, stats.messages_written);
        assert_eq!(vec![InboundMessage { handle: 4, payload }], pair.server.read().unwrap());
        assert_eq!(1, pair.server.info().stats.messages_reassembled);
    }

    #[test]
    fn should_deliver_other_messages_while_fragments_arrive() {
        let mut pair = active_pair(small_frames(), small_frames());
        let low = SubmitOptions { priority: WritePriority::Low, ..Default::default() };
        let high = SubmitOptions { priority: WritePriority::High, ..Default::default() };

        pair.client.submit(&[5u8; 1000], 1, &low).unwrap();
        pair.client.submit(b"quote", 2, &high).unwrap();
        pair.client.submit(b"trade", 3, &high).unwrap();
        pair.client.flush().unwrap();

        let messages = pair.server.read().unwrap();
        let handles: Vec<StreamHandle> = messages.iter().map(|m| m.handle).collect();
        assert_eq!(vec![2, 3, 1], handles);
        assert_eq!(vec![5u8; 1000], messages[2].payload);
    }

    #[test]
    fn should_refuse_message_beyond_fragment_limit() {
        let config = ChannelConfig {
            max_fragmented_message_size: 2048,
            ..small_frames()
        };
        let mut pair = active_pair(config, small_frames());

        let result = pair.client.submit(&[0u8; 3000], 1, &SubmitOptions::default());
        assert!(matches!(result, Err(TransportError::MessageTooLarge { length: 3000, max: 2048 })));
        assert_eq!(0, pair.client.queued_frames());
    }

    #[test]
    fn should_refuse_fragments_that_exceed_output_buffers() {
        let config = ChannelConfig {
            guaranteed_output_buffers: 0,
            max_output_buffers: 3,
            ..small_frames()
        };
        let mut pair = active_pair(config, small_frames());

        let result = pair.client.submit(&[0u8; 1000], 1, &SubmitOptions::default());
        assert!(matches!(result, Err(TransportError::ResourceExhausted(_))));
        assert_eq!(0, pair.client.queued_frames());
        assert_eq!(ChannelState::Active, pair.client.state());
    }

    #[test]
    fn should_fail_channel_on_fragment_without_first() {
        let (client_stream, mut server) = scripted_server(1024);
        let header = FrameHeader {
            length: (FRAME_HEADER_SIZE + 2 + 3) as MessageLength,
            flags: FRAME_DATA | FRAME_FRAGMENT,
        };
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(&7u16.to_le_bytes());
        frame.extend_from_slice(b"abc");
        client_stream.outgoing.lock().unwrap().bytes.extend(frame);

        assert!(matches!(server.read(), Err(TransportError::Protocol(_))));
        assert_eq!(ChannelState::Closed, server.state());
    }
}
