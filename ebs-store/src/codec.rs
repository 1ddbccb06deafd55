//! Payload codec: compact JSON wrapped in LZ4 block compression.
//!
//! Patch operation lists and materialized documents are both persisted this
//! way. Object keys come out of `serde_json::Value` in sorted order, so a
//! freshly written payload is byte-for-byte deterministic.
//!
//! Wire layout of a compressed payload:
//! ```text
//! ┌──────────────────┬──────────────────────┐
//! │ original size    │ LZ4 block            │
//! │ 4 bytes LE       │ variable             │
//! └──────────────────┴──────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec errors.
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    #[error("JSON encode failed: {0}")]
    Encode(String),
    #[error("JSON decode failed: {0}")]
    Decode(String),
}

/// Compress raw bytes with a prepended size header.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Inverse of [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| CodecError::DecompressionFailed(e.to_string()))
}

/// Serialize to compact JSON and compress.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(compress(&json))
}

/// Decompress and parse JSON.
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    let json = decompress(data)?;
    serde_json::from_slice(&json).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Compression ratio (original / compressed).
pub fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if compressed == 0 {
        return 0.0;
    }
    original as f64 / compressed as f64
}
