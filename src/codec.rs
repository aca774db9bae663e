//! Compression codec
//!
//! `compress` serializes a document to JSON and deflates it with zlib at a fixed
//! level; `encode` turns the compressed bytes into the inline text form. Both are
//! deterministic: identical documents always yield identical bytes.

use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

const COMPRESSION_LEVEL: u32 = 9;

/// Serialize and compress a document.
pub fn compress<T: Serialize>(doc: &T) -> Result<Vec<u8>, PipelineError> {
    let bytes = serde_json::to_vec(doc)
        .map_err(|e| PipelineError::CorruptPayload(format!("serialize document: {}", e)))?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder
        .write_all(&bytes)
        .map_err(|e| PipelineError::CorruptPayload(format!("compress document: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| PipelineError::CorruptPayload(format!("finish compression: {}", e)))
}

/// Inflate and deserialize a document produced by [`compress`].
pub fn decompress<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PipelineError> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::CorruptPayload(format!("decompress payload: {}", e)))?;
    serde_json::from_slice(&out)
        .map_err(|e| PipelineError::CorruptPayload(format!("parse document: {}", e)))
}

/// Encode compressed bytes into the inline text form.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode the inline text form back into compressed bytes.
pub fn decode(payload: &str) -> Result<Vec<u8>, PipelineError> {
    STANDARD
        .decode(payload.trim().as_bytes())
        .map_err(|e| PipelineError::CorruptPayload(format!("decode payload: {}", e)))
}

/// Length of the inline text form of `doc`, without keeping the payload.
pub fn encoded_len<T: Serialize>(doc: &T) -> Result<usize, PipelineError> {
    Ok(base64::encoded_len(compress(doc)?.len(), true).unwrap_or(usize::MAX))
}
