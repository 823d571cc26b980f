use std::io::{self, Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::Deserialize;

use crate::error_codes::{TransportError, TransportResult};

/// Smallest frame body worth compressing, below this zlib output is rarely smaller
pub const MIN_COMPRESSION_THRESHOLD: usize = 30;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Compression applied to data frame bodies, agreed during the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionType {
    #[default]
    None,
    Zlib,
}

impl CompressionType {
    pub fn to_wire(self: &Self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zlib => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zlib),
            _ => None,
        }
    }
}

pub fn compress(compression: CompressionType, level: u32, input: &[u8]) -> io::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(input.to_vec()),
        CompressionType::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len()), Compression::new(level));
            encoder.write_all(input)?;
            encoder.finish()
        }
    }
}

/// Inflates a frame body, refusing output larger than `limit` bytes
pub fn decompress(compression: CompressionType, input: &[u8], limit: usize) -> TransportResult<Vec<u8>> {
    match compression {
        CompressionType::None => Err(TransportError::Protocol(
            "received a compressed frame but no compression was negotiated".to_owned(),
        )),
        CompressionType::Zlib => {
            let mut output = Vec::new();
            ZlibDecoder::new(input)
                .take(limit as u64 + 1)
                .read_to_end(&mut output)
                .map_err(|e| TransportError::Protocol(format!("cannot inflate compressed frame: {e}")))?;
            if output.len() > limit {
                return Err(TransportError::Protocol(format!(
                    "compressed frame inflates past the {limit} byte limit"
                )));
            }
            Ok(output)
        }
    }
}
