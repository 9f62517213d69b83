//! Length-prefixed frame encoding.
//!
//! A frame on the wire is a 4-byte little-endian unsigned length followed by
//! exactly that many payload bytes. There is no magic number and no version
//! byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Size of the length prefix in bytes
pub const HEADER_SIZE: usize = 4;

/// Encode one message as `[u32-le length][payload]`.
///
/// Fails when the payload exceeds `max_len`, which callers derive from their
/// extreme-message ceiling. Zero-length payloads are valid and encode to a
/// bare header.
pub fn encode_frame(payload: &[u8], max_len: usize) -> Result<Bytes, WireError> {
    // The header can only declare what fits in a u32, whatever the caller's
    // limit says.
    let limit = max_len.min(u32::MAX as usize);
    if payload.len() > limit {
        return Err(WireError::Extreme {
            declared: payload.len(),
            limit,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read the declared payload length from a buffered header.
///
/// `header` must hold at least [`HEADER_SIZE`] bytes.
pub fn declared_len(header: &[u8]) -> usize {
    u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize
}
