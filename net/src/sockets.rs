/*
Framing, buffering and connection management over non-blocking byte streams.
Nothing in here spawns threads, channels make progress when the application calls
into them.
*/
pub mod buffer_pool;
pub mod channel;
pub mod compression;
pub mod connection;
pub mod fragments;
pub mod framing;
pub mod packed_buffer;
pub mod server;
pub mod write_flags;

use crate::data_types::{MessageLength, StreamHandle};

/// u16 frame length followed by u8 frame flags
pub const FRAME_HEADER_SIZE: usize = size_of::<MessageLength>() + 1;

/// Stream handle that prefixes every message so that receivers can demultiplex
pub const HANDLE_SIZE: usize = size_of::<StreamHandle>();

/// Stream handle plus payload length in front of each message inside a packed frame
pub const PACKED_ENTRY_HEADER_SIZE: usize = HANDLE_SIZE + size_of::<MessageLength>();
