use log::{info, warn};

#[cfg(debug_assertions)]
use log::debug;

use crate::{
    data_types::{MessageCount, StreamHandle},
    error_codes::{TransportError, TransportResult},
    sockets::{
        channel::ChannelHandle,
        packed_buffer::{PackState, PackedBuffer},
        write_flags::SubmitOptions,
    },
};

/// What a call to submit_batch() handed to the channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub frames: usize,
    pub messages: usize,
    /// Bytes still queued on the channel after the last frame was submitted
    pub bytes_queued: usize,
}

/// The application facing path into a channel. Messages either go one per frame or
/// are packed several to a frame, and both routes share the channel's flag policy.
pub struct SubmitPipeline {
    channel: ChannelHandle,
    packed: Option<PackedBuffer>,
}

impl SubmitPipeline {
    pub fn new(channel: &ChannelHandle) -> Self {
        Self {
            channel: channel.clone(),
            packed: None,
        }
    }

    pub fn channel(self: &Self) -> &ChannelHandle {
        &self.channel
    }

    /// State of the packed buffer currently in use, Idle if there is none
    pub fn pack_state(self: &Self) -> PackState {
        self.packed.as_ref().map_or(PackState::Idle, |p| p.state())
    }

    pub fn submit_message(
        self: &mut Self,
        payload: &[u8],
        handle: StreamHandle,
        options: &SubmitOptions,
    ) -> TransportResult<usize> {
        self.channel.submit(payload, handle, options)
    }

    /// Starts a new packed frame. When the previous frame has not been written yet
    /// a fresh packed buffer takes over, so the caller never waits on the socket.
    /// Messages that were added but never submitted are not thrown away: submit them
    /// with pack_and_submit() or drop them with discard_packed_buffer() first.
    pub fn init_packed_buffer(self: &mut Self) -> TransportResult<()> {
        let unsent = match &self.packed {
            Some(packed) => match packed.state() {
                PackState::Filling | PackState::Packed => packed.message_count(),
                PackState::Idle | PackState::InFlight => 0,
            },
            None => 0,
        };
        if unsent > 0 {
            return Err(TransportError::InvalidState(format!(
                "{unsent} messages in the current packed buffer have not been submitted"
            )));
        }

        let reusable = matches!(&self.packed, Some(packed) if packed.state() != PackState::InFlight);
        if !reusable {
            self.packed = Some(self.channel.packed_buffer()?);
        }
        self.packed_buffer()?.init_buffer()
    }

    pub fn add_to_packed_buffer(self: &mut Self, payload: &[u8], handle: StreamHandle) -> TransportResult<()> {
        self.packed_buffer()?.add_message(payload, handle)
    }

    /// Packs the current frame and submits it. A frame that was packed but refused
    /// by the channel is submitted again as it is. Returns the bytes still queued on
    /// the channel.
    pub fn pack_and_submit(self: &mut Self, options: &SubmitOptions) -> TransportResult<usize> {
        let Some(packed) = self.packed.as_mut() else {
            return Err(TransportError::InvalidState(
                "call init_packed_buffer() before pack_and_submit()".to_owned(),
            ));
        };
        if packed.state() != PackState::Packed {
            packed.pack()?;
        }

        #[cfg(debug_assertions)]
        debug!(
            "SubmitPipeline: Packed {} messages into {} bytes for channel {}",
            packed.message_count(),
            packed.len(),
            self.channel.id()
        );

        self.channel.submit_packed(packed, options)
    }

    /// Drops whatever the current packed buffer holds without sending it and returns
    /// the number of messages discarded
    pub fn discard_packed_buffer(self: &mut Self) -> MessageCount {
        let discarded = match self.packed.take() {
            Some(packed) if matches!(packed.state(), PackState::Filling | PackState::Packed) => packed.message_count(),
            _ => 0,
        };
        if discarded > 0 {
            warn!(
                "SubmitPipeline: Channel {} discarded {discarded} messages that were never submitted",
                self.channel.id()
            );
        }
        discarded
    }

    /// Sends messages in packed frames of at most `batch_size` messages. A message
    /// that does not fit closes the current frame and starts the next one. A message
    /// too large for an empty frame fails with BufferFull.
    ///
    /// When a failure comes after some messages were accepted the error is
    /// BatchIncomplete, which says how many messages reached the channel and how many
    /// more are held in the packed buffer. Those can be sent with pack_and_submit().
    pub fn submit_batch<I, P>(
        self: &mut Self,
        messages: I,
        batch_size: usize,
        options: &SubmitOptions,
    ) -> TransportResult<BatchSummary>
    where
        I: IntoIterator<Item = (StreamHandle, P)>,
        P: AsRef<[u8]>,
    {
        if batch_size == 0 {
            return Err(TransportError::InvalidArgument("batch size must be at least 1".to_owned()));
        }

        let mut summary = BatchSummary::default();
        let mut in_frame = 0;
        for (handle, payload) in messages {
            let payload = payload.as_ref();
            if in_frame == 0 {
                self.init_packed_buffer().map_err(|e| incomplete(&summary, 0, e))?;
            }

            match self.add_to_packed_buffer(payload, handle) {
                Ok(()) => {}
                Err(TransportError::BufferFull { .. }) if in_frame > 0 => {
                    self.submit_frame(&mut summary, &mut in_frame, options)?;
                    self.init_packed_buffer().map_err(|e| incomplete(&summary, 0, e))?;
                    self.add_to_packed_buffer(payload, handle)
                        .map_err(|e| incomplete(&summary, 0, e))?;
                }
                Err(e) => return Err(incomplete(&summary, in_frame, e)),
            }
            in_frame += 1;

            if in_frame == batch_size {
                self.submit_frame(&mut summary, &mut in_frame, options)?;
            }
        }

        if in_frame > 0 {
            self.submit_frame(&mut summary, &mut in_frame, options)?;
        }

        info!(
            "SubmitPipeline: Channel {} batch of {} messages in {} frames",
            self.channel.id(),
            summary.messages,
            summary.frames
        );
        Ok(summary)
    }

    fn submit_frame(
        self: &mut Self,
        summary: &mut BatchSummary,
        in_frame: &mut usize,
        options: &SubmitOptions,
    ) -> TransportResult<()> {
        match self.pack_and_submit(options) {
            Ok(bytes_queued) => {
                summary.bytes_queued = bytes_queued;
                summary.frames += 1;
                summary.messages += *in_frame;
                *in_frame = 0;
                Ok(())
            }
            Err(e) => Err(incomplete(summary, *in_frame, e)),
        }
    }

    fn packed_buffer(self: &mut Self) -> TransportResult<&mut PackedBuffer> {
        self.packed
            .as_mut()
            .ok_or_else(|| TransportError::InvalidState("call init_packed_buffer() first".to_owned()))
    }
}

/// Errors before anything was accepted or held are returned as they are
fn incomplete(summary: &BatchSummary, pending: usize, e: TransportError) -> TransportError {
    if summary.messages == 0 && pending == 0 {
        return e;
    }
    TransportError::BatchIncomplete {
        accepted: summary.messages,
        frames: summary.frames,
        pending,
        source: Box::new(e),
    }
}
