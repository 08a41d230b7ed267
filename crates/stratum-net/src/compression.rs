//! LZ4 compression for bulk payloads such as full-state snapshots.
//!
//! Output layout: one flag byte, then either the raw bytes or an LZ4 block
//! prefixed with its uncompressed size (`u32` little-endian). Payloads below
//! the configured threshold skip compression.

use lz4_flex::{compress_prepend_size, decompress};

/// Compression flag: payload is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: payload is LZ4-compressed.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum input size (bytes) before compression is applied. Default: 256.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
    /// Largest decompressed size accepted. Default: 256 MiB.
    pub max_decompressed: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
            max_decompressed: 256 * 1024 * 1024,
        }
    }
}

impl CompressionConfig {
    /// Compress everything regardless of size (snapshots).
    pub fn always() -> Self {
        Self {
            threshold: 0,
            ..Self::default()
        }
    }
}

/// Errors that can occur during payload decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The payload was empty, with no compression flag present.
    #[error("empty payload, no compression flag")]
    EmptyPayload,
    /// The LZ4 size prefix is missing.
    #[error("LZ4 payload shorter than its size prefix")]
    MissingSizePrefix,
    /// The declared decompressed size exceeds the configured limit.
    #[error("declared size {declared} exceeds limit {limit}")]
    TooLarge {
        /// Size claimed by the prefix.
        declared: usize,
        /// Configured maximum.
        limit: usize,
    },
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// An unknown compression flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}

/// Wrap a payload with a compression flag, compressing it when it is large
/// enough.
pub fn compress_payload(data: &[u8], config: &CompressionConfig) -> Vec<u8> {
    if !config.enabled || data.len() < config.threshold {
        let mut out = Vec::with_capacity(1 + data.len());
        out.push(COMPRESSION_FLAG_NONE);
        out.extend_from_slice(data);
        out
    } else {
        let compressed = compress_prepend_size(data);
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(COMPRESSION_FLAG_LZ4);
        out.extend_from_slice(&compressed);
        out
    }
}

/// Unwrap a flagged payload, decompressing if necessary.
///
/// The size prefix is checked against `config.max_decompressed` before any
/// allocation happens.
pub fn decompress_payload(
    data: &[u8],
    config: &CompressionConfig,
) -> Result<Vec<u8>, CompressionError> {
    let (&flag, body) = data.split_first().ok_or(CompressionError::EmptyPayload)?;

    match flag {
        COMPRESSION_FLAG_NONE => Ok(body.to_vec()),
        COMPRESSION_FLAG_LZ4 => {
            if body.len() < 4 {
                return Err(CompressionError::MissingSizePrefix);
            }
            let (prefix, block) = body.split_at(4);
            let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
            if declared > config.max_decompressed {
                return Err(CompressionError::TooLarge {
                    declared,
                    limit: config.max_decompressed,
                });
            }
            decompress(block, declared).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
        }
        flag => Err(CompressionError::UnknownFlag(flag)),
    }
}
