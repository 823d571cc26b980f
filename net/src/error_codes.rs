use std::{fmt, io};

use thiserror::Error;

use crate::{data_types::ChannelId, sockets::channel::ChannelState};

/// Numeric outcome of a transport call. Negative values are failures, matching the
/// codes that peers and log scrapers already know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TransportReturnCode {
    Success = 0,
    Failure = -1,
    NoBuffers = -4,
    InvalidState = -7,
    WriteFlushFailed = -9,
    ChannelNotActive = -11,
    BufferFull = -21,
    InvalidArgument = -22,
}

impl TransportReturnCode {
    pub fn value(self: &Self) -> i32 {
        *self as i32
    }

    pub fn is_success(self: &Self) -> bool {
        matches!(self, TransportReturnCode::Success)
    }
}

impl fmt::Display for TransportReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.value())
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Buffer full: {needed} bytes needed but only {remaining} remain")]
    BufferFull { needed: usize, remaining: usize },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Channel {channel_id} is not active, it is {state}")]
    ChannelNotActive { channel_id: ChannelId, state: ChannelState },

    #[error("I/O failure on channel {channel_id}: {source}")]
    IoFailure {
        channel_id: ChannelId,
        #[source]
        source: io::Error,
    },

    #[error("Socket error, {context}: {source}")]
    Socket {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message of {length} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { length: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A batch stopped part way through. The first `accepted` messages reached the
    /// channel and the next `pending` are still held by the pipeline.
    #[error("Batch stopped after {accepted} messages in {frames} frames, {pending} not yet submitted: {source}")]
    BatchIncomplete {
        accepted: usize,
        frames: usize,
        pending: usize,
        #[source]
        source: Box<TransportError>,
    },
}

impl TransportError {
    pub fn code(self: &Self) -> TransportReturnCode {
        match self {
            TransportError::InvalidState(_) => TransportReturnCode::InvalidState,
            TransportError::BufferFull { .. } => TransportReturnCode::BufferFull,
            TransportError::ResourceExhausted(_) => TransportReturnCode::NoBuffers,
            TransportError::ChannelNotActive { .. } => TransportReturnCode::ChannelNotActive,
            TransportError::IoFailure { .. } => TransportReturnCode::WriteFlushFailed,
            TransportError::Socket { .. } => TransportReturnCode::Failure,
            TransportError::InvalidArgument(_) => TransportReturnCode::InvalidArgument,
            TransportError::MessageTooLarge { .. } => TransportReturnCode::InvalidArgument,
            TransportError::Protocol(_) => TransportReturnCode::Failure,
            TransportError::BatchIncomplete { source, .. } => source.code(),
        }
    }

    pub(crate) fn io(channel_id: ChannelId, source: io::Error) -> Self {
        TransportError::IoFailure { channel_id, source }
    }

    pub(crate) fn socket(context: String, source: io::Error) -> Self {
        TransportError::Socket { context, source }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
