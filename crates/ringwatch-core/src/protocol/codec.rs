//! Binary framing and compression helpers.
//!
//! Two encodings travel between daemons:
//! - **JSON**: the outer [`WireMessage`](super::WireMessage) (heartbeats and
//!   broadcast envelopes), so captures stay readable
//! - **Bincode**: the broadcast frame and the payloads it carries
//!
//! Broadcast frames may additionally be zlib-compressed.

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use thiserror::Error;

/// Largest payload a daemon will inflate.
///
/// Guards against a corrupt or hostile compressed frame expanding without
/// bound.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Message too large: exceeds {MAX_MESSAGE_SIZE} bytes")]
    Oversized,
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encode a value with bincode.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a bincode value.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}

/// Compress `data` when it is at least `limit` bytes long.
///
/// Returns `None` when the data is below the limit or when compression
/// would not make it smaller; callers then send the data as-is.
pub fn compress_block(data: &[u8], limit: usize) -> Option<Vec<u8>> {
    if data.len() < limit {
        return None;
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    if encoder.write_all(data).is_err() {
        return None;
    }
    let compressed = encoder.finish().ok()?;

    (compressed.len() < data.len()).then_some(compressed)
}

/// Inflate a block produced by [`compress_block`].
pub fn decompress_block(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // Read one byte past the cap so an oversized block is detectable
    ZlibDecoder::new(data)
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_end(&mut out)?;

    if out.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::Oversized);
    }
    Ok(out)
}
