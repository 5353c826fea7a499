//! Zstandard framing for compressed flat files.
//!
//! A compressed payload is an 8-byte little-endian uncompressed length followed
//! by one zstd frame. The length is checked on decode so a truncated file is
//! reported instead of silently loading fewer rows.

use std::io::Write;

use zstd::stream::Encoder;

use crate::error::TabularError;

const HEADER_LEN: usize = 8;

/// Compresses `input` at `level`, prefixed with its uncompressed length.
pub fn encode(input: &[u8], level: i32) -> Result<Vec<u8>, TabularError> {
    let mut output = Vec::with_capacity(input.len() / 2 + HEADER_LEN);
    output.extend_from_slice(&(input.len() as u64).to_le_bytes());

    let mut encoder = Encoder::new(&mut output, level)?;
    encoder.write_all(input)?;
    // `finish` closes the zstd frame.
    encoder.finish()?;
    Ok(output)
}

/// Reverses [`encode`].
pub fn decode(input: &[u8]) -> Result<Vec<u8>, TabularError> {
    if input.len() < HEADER_LEN {
        return Err(TabularError::Codec(format!(
            "payload of {} bytes is too short to hold the length header",
            input.len()
        )));
    }
    let (header, body) = input.split_at(HEADER_LEN);
    let mut len_bytes = [0u8; HEADER_LEN];
    len_bytes.copy_from_slice(header);
    let expected = u64::from_le_bytes(len_bytes) as usize;

    // The header is untrusted; reserve no more than the body could plausibly hold.
    let mut output = Vec::with_capacity(expected.min(body.len().saturating_mul(4)));
    zstd::stream::copy_decode(body, &mut output)
        .map_err(|e| TabularError::Codec(e.to_string()))?;

    if output.len() != expected {
        return Err(TabularError::Codec(format!(
            "decompressed size does not match header: expected {}, got {}",
            expected,
            output.len()
        )));
    }
    Ok(output)
}
