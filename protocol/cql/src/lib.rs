//! Fixed-header framing for the binary SQL protocol.
//!
//! Every frame opens with a 9-byte header: version, flags, a big-endian
//! stream id, an opcode, and a big-endian body length. The version byte's
//! high bit is the direction flag (set on responses). The stream id is the
//! request/response correlation token, chosen by the client.

use bytes::{BufMut, Bytes, BytesMut};

/// Width of the frame header.
pub const HEADER_LEN: usize = 9;

/// Upper bound on a frame body.
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

/// Direction bit in the version byte; set on response frames.
pub const DIRECTION_RESPONSE: u8 = 0x80;

/// RESULT opcode, used for ordinary response frames.
pub const OPCODE_RESULT: u8 = 0x08;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("need more data")]
    Incomplete,
    #[error("frame body length {0} exceeds limit")]
    BodyTooLarge(usize),
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub stream_id: u16,
    pub opcode: u8,
    pub body_len: usize,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < HEADER_LEN {
            return Err(ParseError::Incomplete);
        }
        let body_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(ParseError::BodyTooLarge(body_len));
        }
        Ok(Header {
            version: buf[0],
            flags: buf[1],
            stream_id: u16::from_be_bytes([buf[2], buf[3]]),
            opcode: buf[4],
            body_len,
        })
    }

    /// True for response-direction frames.
    pub fn is_response(&self) -> bool {
        self.version & DIRECTION_RESPONSE != 0
    }

    /// Protocol version with the direction bit stripped.
    pub fn protocol_version(&self) -> u8 {
        self.version & !DIRECTION_RESPONSE
    }
}

/// Encode a response header for a body of `body_len` bytes. The body itself
/// travels as a separate gather slice.
pub fn encode_response_header(version: u8, stream_id: u16, opcode: u8, body_len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u8(version | DIRECTION_RESPONSE);
    buf.put_u8(0);
    buf.put_u16(stream_id);
    buf.put_u8(opcode);
    buf.put_u32(body_len as u32);
    buf.freeze()
}

/// Encode a whole request frame into one contiguous buffer.
pub fn encode_request_frame(version: u8, stream_id: u16, opcode: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(version & !DIRECTION_RESPONSE);
    buf.put_u8(0);
    buf.put_u16(stream_id);
    buf.put_u8(opcode);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let frame = encode_request_frame(4, 17, 0x07, b"query");
        let header = Header::decode(&frame).unwrap();
        assert_eq!(header.protocol_version(), 4);
        assert_eq!(header.stream_id, 17);
        assert_eq!(header.opcode, 0x07);
        assert_eq!(header.body_len, 5);
        assert!(!header.is_response());
        assert_eq!(&frame[HEADER_LEN..], b"query");
    }

    #[test]
    fn response_header_sets_direction_bit() {
        let header_bytes = encode_response_header(4, 3, OPCODE_RESULT, 10);
        let header = Header::decode(&header_bytes).unwrap();
        assert!(header.is_response());
        assert_eq!(header.protocol_version(), 4);
        assert_eq!(header.stream_id, 3);
        assert_eq!(header.body_len, 10);
    }

    #[test]
    fn short_header_is_incomplete() {
        assert!(matches!(
            Header::decode(&[4, 0, 0, 1]),
            Err(ParseError::Incomplete)
        ));
    }

    #[test]
    fn oversize_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put_u8(0);
        buf.put_u16(1);
        buf.put_u8(0x07);
        buf.put_u32(MAX_BODY_LEN as u32 + 1);
        assert!(matches!(
            Header::decode(&buf),
            Err(ParseError::BodyTooLarge(_))
        ));
    }
}
