/*
Packed-message transport. Applications submit messages to channels either one per
frame or packed several to a frame, channels frame them into pooled buffers and write
them to non-blocking sockets, and a Protocol registry tracks every channel, server and
pool so that they can all be torn down together.
*/
pub mod config;
pub mod data_types;
pub mod error_codes;
pub mod protocol;
pub mod sockets;
pub mod submit;

pub use config::{AcceptOptions, BindOptions, ChannelConfig, ConnectOptions};
pub use data_types::*;
pub use error_codes::{TransportError, TransportResult, TransportReturnCode};
pub use protocol::Protocol;
pub use sockets::{
    buffer_pool::{BufferPool, PoolSpec, PooledBuffer},
    channel::{ChannelHandle, ChannelInfo, ChannelKind, ChannelState, ChannelStats, InitProgress},
    compression::CompressionType,
    connection::SocketStream,
    framing::InboundMessage,
    packed_buffer::{PackState, PackedBuffer},
    server::ServerHandle,
    write_flags::{apply_channel_config, effective_flags, SubmitOptions, WriteFlags, WritePriority},
};
pub use submit::{BatchSummary, SubmitPipeline};
