//! zstd compression for segments stored on disk tiers.
//!
//! Memory tiers keep segments as-is; disk tiers configured with
//! `compress = true` run every segment through this pipeline on the way
//! down and reverse it on the way up.

use bytes::Bytes;
use thiserror::Error;

/// Default zstd level for segment files.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Decompressed {actual} bytes, segment header says {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Segment frame shorter than its header")]
    Truncated,
}

/// Segment compressor. `level == 0` disables compression.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: i32,
}

impl Compressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn disabled() -> Self {
        Self { level: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.level != 0
    }

    /// Encode a segment for storage.
    ///
    /// Compressed frames carry the raw length as an 8-byte little-endian
    /// header so decoding can verify it.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if !self.is_enabled() {
            return Ok(data.to_vec());
        }
        let compressed = zstd::encode_all(data, self.level)?;
        let mut frame = Vec::with_capacity(8 + compressed.len());
        frame.extend_from_slice(&(data.len() as u64).to_le_bytes());
        frame.extend_from_slice(&compressed);
        Ok(frame)
    }

    /// Reverse [`encode`](Self::encode).
    pub fn decode(&self, frame: &[u8]) -> Result<Bytes, CompressionError> {
        if !self.is_enabled() {
            return Ok(Bytes::copy_from_slice(frame));
        }
        if frame.len() < 8 {
            return Err(CompressionError::Truncated);
        }
        let (header, body) = frame.split_at(8);
        let mut len = [0u8; 8];
        len.copy_from_slice(header);
        let expected = u64::from_le_bytes(len) as usize;

        let data = zstd::decode_all(body)?;
        if data.len() != expected {
            return Err(CompressionError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Bytes::from(data))
    }
}
