//! Interchange encoding for embedding vectors.
//!
//! Layout: a little-endian `u32` dimension followed by `dimension`
//! little-endian `f32` values. Stores persist this blob as-is.

use crate::types::Embedding;
use thiserror::Error;

const HEADER_LEN: usize = 4;
const VALUE_LEN: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("embedding blob truncated: {0} bytes")]
    Truncated(usize),
    #[error("embedding blob length mismatch: header says {dim} values, payload has {payload} bytes")]
    LengthMismatch { dim: usize, payload: usize },
    #[error("embedding contains non-finite value at index {0}")]
    NonFinite(usize),
}

/// Encode an embedding into its length-prefixed byte form.
pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let values = embedding.as_slice();
    let mut out = Vec::with_capacity(HEADER_LEN + values.len() * VALUE_LEN);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a length-prefixed blob back into an embedding.
///
/// The vector is re-normalized on the way in, so blobs written by older
/// tooling that stored raw model output still compare correctly.
pub fn decode(bytes: &[u8]) -> Result<Embedding, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    let dim = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;

    if payload.len() != dim * VALUE_LEN {
        return Err(CodecError::LengthMismatch {
            dim,
            payload: payload.len(),
        });
    }

    let mut values = Vec::with_capacity(dim);
    for (i, chunk) in payload.chunks_exact(VALUE_LEN).enumerate() {
        let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !v.is_finite() {
            return Err(CodecError::NonFinite(i));
        }
        values.push(v);
    }

    Ok(Embedding::from_raw(values))
}
