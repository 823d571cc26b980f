use std::{
    fmt,
    ops::{BitAnd, BitOr, BitOrAssign},
};

use serde::Deserialize;

use crate::config::ChannelConfig;

/// Low-level flags that travel with a submission down to the socket layer
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WriteFlags(u8);

impl WriteFlags {
    pub const NONE: WriteFlags = WriteFlags(0x00);

    /// Do not compress this message even when the connection compresses
    pub const DO_NOT_COMPRESS: WriteFlags = WriteFlags(0x01);

    /// Hand the bytes to the socket now instead of waiting for a flush
    pub const DIRECT_SOCKET_WRITE: WriteFlags = WriteFlags(0x02);

    /// The writer attaches a sequence number to this message
    pub const SEQ_NUM: WriteFlags = WriteFlags(0x04);

    /// This message retransmits previously sent content
    pub const RETRANSMIT: WriteFlags = WriteFlags(0x10);

    const MASK: u8 = 0x17;

    pub const fn bits(self: &Self) -> u8 {
        self.0
    }

    /// Unknown bits are discarded
    pub const fn from_bits_truncate(bits: u8) -> Self {
        WriteFlags(bits & Self::MASK)
    }

    pub const fn contains(self: &Self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self: Self, other: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | other.0)
    }

    pub fn insert(self: &mut Self, other: WriteFlags) {
        self.0 |= other.0;
    }

    pub const fn is_empty(self: &Self) -> bool {
        self.0 == 0
    }
}

impl BitOr for WriteFlags {
    type Output = WriteFlags;

    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        self.union(rhs)
    }
}

impl BitOrAssign for WriteFlags {
    fn bitor_assign(&mut self, rhs: WriteFlags) {
        self.insert(rhs);
    }
}

impl BitAnd for WriteFlags {
    type Output = WriteFlags;

    fn bitand(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for WriteFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names = [
            (WriteFlags::DO_NOT_COMPRESS, "DO_NOT_COMPRESS"),
            (WriteFlags::DIRECT_SOCKET_WRITE, "DIRECT_SOCKET_WRITE"),
            (WriteFlags::SEQ_NUM, "SEQ_NUM"),
            (WriteFlags::RETRANSMIT, "RETRANSMIT"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join(" | "))
    }
}

/// Selects the outbound queue that a submission waits in until it is flushed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePriority {
    #[default]
    High,
    Medium,
    Low,
}

impl WritePriority {
    pub(crate) fn index(self: &Self) -> usize {
        match self {
            WritePriority::High => 0,
            WritePriority::Medium => 1,
            WritePriority::Low => 2,
        }
    }
}

/// Per-call overrides layered on top of the channel configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub flags: WriteFlags,
    pub priority: WritePriority,
}

impl SubmitOptions {
    pub fn with_flags(flags: WriteFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }
}

/// Adds DIRECT_SOCKET_WRITE when the channel asks for direct writes. The channel can
/// only add to what the caller requested, it never clears a bit.
pub fn apply_channel_config(flags: WriteFlags, direct_write: bool) -> WriteFlags {
    if direct_write {
        flags | WriteFlags::DIRECT_SOCKET_WRITE
    } else {
        flags
    }
}

/// Same one-directional policy for every flag that the channel configuration
/// controls: compression_disabled can add DO_NOT_COMPRESS but never removes it.
pub fn effective_flags(flags: WriteFlags, config: &ChannelConfig) -> WriteFlags {
    let flags = apply_channel_config(flags, config.direct_write);
    if config.compression_disabled {
        flags | WriteFlags::DO_NOT_COMPRESS
    } else {
        flags
    }
}
