//! Framing for the internal length-prefixed RPC protocol.
//!
//! A frame on the wire is a 4-byte big-endian length followed by that many
//! body bytes. The body starts with a 4-byte big-endian call id; the rest is
//! the serialized request or response payload. The same frame shape is used
//! in both directions, so one decoder serves client and server connections.

use bytes::{BufMut, Bytes, BytesMut};

/// Width of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Width of the call-id field at the start of every frame body.
pub const CALL_ID_LEN: usize = 4;

/// Upper bound on a frame body. Anything larger is treated as corrupt.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("need more data")]
    Incomplete,
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("frame body too short for a call id")]
    TruncatedHeader,
}

/// Decode the length prefix, returning the body length that follows it.
pub fn body_len(header: &[u8]) -> Result<usize, ParseError> {
    if header.len() < LENGTH_PREFIX_LEN {
        return Err(ParseError::Incomplete);
    }
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ParseError::FrameTooLarge(len));
    }
    if len < CALL_ID_LEN {
        return Err(ParseError::TruncatedHeader);
    }
    Ok(len)
}

/// A decoded frame body: call id plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub call_id: i32,
    pub payload: Bytes,
}

impl Frame {
    /// Decode a complete frame body (everything after the length prefix).
    pub fn decode(body: Bytes) -> Result<Self, ParseError> {
        if body.len() < CALL_ID_LEN {
            return Err(ParseError::TruncatedHeader);
        }
        let call_id = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        Ok(Frame {
            call_id,
            payload: body.slice(CALL_ID_LEN..),
        })
    }
}

/// Encode the length prefix and call id for a frame carrying `payload_len`
/// payload bytes. The payload itself travels as a separate gather slice so
/// large payloads are never copied into the prefix buffer.
pub fn encode_prefix(call_id: i32, payload_len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + CALL_ID_LEN);
    buf.put_u32((CALL_ID_LEN + payload_len) as u32);
    buf.put_i32(call_id);
    buf.freeze()
}

/// Encode a whole frame into one contiguous buffer.
pub fn encode_frame(call_id: i32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + CALL_ID_LEN + payload.len());
    buf.put_u32((CALL_ID_LEN + payload.len()) as u32);
    buf.put_i32(call_id);
    buf.put_slice(payload);
    buf.freeze()
}
