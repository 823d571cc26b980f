/*
Resolved option structures consumed by the transport. Parsing configuration files is
the caller's business, these types only need to deserialize from whatever the caller
merged together.
*/

use serde::Deserialize;

use crate::{
    data_types::MessageLength,
    error_codes::{TransportError, TransportResult},
    sockets::{
        compression::{CompressionType, DEFAULT_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, MIN_COMPRESSION_THRESHOLD},
        fragments::FIRST_FRAGMENT_OVERHEAD,
        write_flags::WritePriority,
    },
};

pub const DEFAULT_MAX_MESSAGE_SIZE: MessageLength = 6144;
pub const DEFAULT_HIGH_WATER_MARK: usize = 6144;
pub const DEFAULT_GUARANTEED_OUTPUT_BUFFERS: usize = 50;
pub const DEFAULT_MAX_OUTPUT_BUFFERS: usize = 100;
pub const DEFAULT_PING_TIMEOUT_SECS: u16 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_PRIORITY_FLUSH_STRATEGY: &str = "HMHLHM";
pub const DEFAULT_MAX_FRAGMENTED_MESSAGE_SIZE: usize = 256 * 1024;

/// Frames must have room for a first fragment header and at least one payload byte
pub const MIN_MAX_MESSAGE_SIZE: MessageLength = FIRST_FRAGMENT_OVERHEAD as MessageLength + 1;

/// Per-connection policy. Channels hold this behind an `Arc` and only ever replace
/// it as a whole, so a submission always sees one consistent snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ChannelConfig {
    pub direct_write: bool,

    /// Adds DO_NOT_COMPRESS to every submission on this channel
    pub compression_disabled: bool,

    /// Compression this end asks for during the handshake, only used when the other
    /// end asks for the same type
    pub compression_type: CompressionType,

    /// Frame bodies shorter than this are sent uncompressed
    pub compression_threshold: usize,
    pub compression_level: u32,
    pub max_message_size: MessageLength,

    /// Largest message that will be split into fragments or put back together from
    /// them
    pub max_fragmented_message_size: usize,
    pub high_water_mark: usize,
    pub guaranteed_output_buffers: usize,
    pub max_output_buffers: usize,
    pub ping_timeout_secs: u16,
    pub priority_flush_strategy: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            direct_write: false,
            compression_disabled: false,
            compression_type: CompressionType::None,
            compression_threshold: MIN_COMPRESSION_THRESHOLD,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_fragmented_message_size: DEFAULT_MAX_FRAGMENTED_MESSAGE_SIZE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            guaranteed_output_buffers: DEFAULT_GUARANTEED_OUTPUT_BUFFERS,
            max_output_buffers: DEFAULT_MAX_OUTPUT_BUFFERS,
            ping_timeout_secs: DEFAULT_PING_TIMEOUT_SECS,
            priority_flush_strategy: DEFAULT_PRIORITY_FLUSH_STRATEGY.to_owned(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(self: &Self) -> TransportResult<()> {
        if self.max_message_size < MIN_MAX_MESSAGE_SIZE {
            return Err(TransportError::InvalidArgument(format!(
                "max-message-size {} must be at least {MIN_MAX_MESSAGE_SIZE}",
                self.max_message_size
            )));
        }
        if self.max_fragmented_message_size < self.max_message_size as usize
            || self.max_fragmented_message_size > u32::MAX as usize
        {
            return Err(TransportError::InvalidArgument(format!(
                "max-fragmented-message-size {} must be between max-message-size {} and {}",
                self.max_fragmented_message_size,
                self.max_message_size,
                u32::MAX
            )));
        }
        if self.compression_threshold < MIN_COMPRESSION_THRESHOLD {
            return Err(TransportError::InvalidArgument(format!(
                "compression-threshold {} must be at least {MIN_COMPRESSION_THRESHOLD}",
                self.compression_threshold
            )));
        }
        if self.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(TransportError::InvalidArgument(format!(
                "compression-level {} must be between 0 and {MAX_COMPRESSION_LEVEL}",
                self.compression_level
            )));
        }
        if self.ping_timeout_secs == 0 {
            return Err(TransportError::InvalidArgument(
                "ping-timeout-secs must be at least 1".to_owned(),
            ));
        }
        if self.max_output_buffers == 0 {
            return Err(TransportError::InvalidArgument(
                "max-output-buffers must be at least 1".to_owned(),
            ));
        }
        if self.guaranteed_output_buffers > self.max_output_buffers {
            return Err(TransportError::InvalidArgument(format!(
                "guaranteed-output-buffers {} exceeds max-output-buffers {}",
                self.guaranteed_output_buffers, self.max_output_buffers
            )));
        }
        self.flush_order().map(|_| ())
    }

    /// Parses the flush strategy, for example "HMHLHM", into the order that the
    /// priority queues are visited in.
    pub fn flush_order(self: &Self) -> TransportResult<Vec<WritePriority>> {
        let strategy = &self.priority_flush_strategy;
        if strategy.is_empty() || strategy.len() > 32 {
            return Err(TransportError::InvalidArgument(format!(
                "priority-flush-strategy '{strategy}' must contain between 1 and 32 characters"
            )));
        }

        let order = strategy
            .chars()
            .map(|c| match c.to_ascii_uppercase() {
                'H' => Ok(WritePriority::High),
                'M' => Ok(WritePriority::Medium),
                'L' => Ok(WritePriority::Low),
                other => Err(TransportError::InvalidArgument(format!(
                    "priority-flush-strategy '{strategy}' contains '{other}', only H, M and L are allowed"
                ))),
            })
            .collect::<TransportResult<Vec<WritePriority>>>()?;

        if !order.contains(&WritePriority::High) || !order.contains(&WritePriority::Medium) {
            return Err(TransportError::InvalidArgument(format!(
                "priority-flush-strategy '{strategy}' must include at least one H and one M"
            )));
        }
        Ok(order)
    }
}

/// Options for an outbound connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConnectOptions {
    pub address: String,
    pub connect_timeout_ms: u64,
    pub channel: ChannelConfig,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:14002".to_owned(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            channel: ChannelConfig::default(),
        }
    }
}

impl ConnectOptions {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            ..Default::default()
        }
    }
}

/// Options applied to each connection a server accepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AcceptOptions {
    pub channel: ChannelConfig,
}

/// Options for a listening endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BindOptions {
    pub address: String,

    /// Sizes the buffers of the shared pool, accepted channels cannot negotiate
    /// anything larger
    pub max_message_size: MessageLength,

    /// Upper limit on buffers in the pool shared by every channel this server
    /// accepts. Zero lets the pool grow on demand.
    pub shared_pool_size: usize,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:14002".to_owned(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            shared_pool_size: 0,
        }
    }
}

impl BindOptions {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            ..Default::default()
        }
    }
}
