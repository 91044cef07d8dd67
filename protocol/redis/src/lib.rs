//! Incremental framing for the Redis request protocol.
//!
//! Requests arrive either as multibulk arrays (`*<n>\r\n` followed by `n`
//! bulk strings) or as inline commands (a single `\r\n`-terminated line).
//! Because the protocol is line-based, a single read may contain a complete
//! request plus the beginning of the next one; [`check_frame`] reports where
//! the first request ends so the caller can treat the tail as excess data.

use bytes::Bytes;

/// Maximum number of arguments in a multibulk request.
pub const MAX_MULTIBULK_ARGS: usize = 1024 * 1024;

/// Maximum length of a single bulk string.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum length of an inline command line.
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// Longest run of bytes a header line may span before we call it malformed.
const MAX_HEADER_LINE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("multibulk argument count {0} exceeds limit")]
    TooManyArgs(usize),
    #[error("bulk string length {0} exceeds limit")]
    BulkTooLong(usize),
    #[error("inline command exceeds {MAX_INLINE_LEN} bytes")]
    InlineTooLong,
    #[error("empty command")]
    EmptyCommand,
}

/// Outcome of probing a buffer for a complete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// More bytes are needed.
    Incomplete,
    /// A complete request occupies the first `frame_len` bytes; anything
    /// after that belongs to the next request.
    Complete { frame_len: usize },
}

/// Probe `buf` for one complete request starting at offset zero.
pub fn check_frame(buf: &[u8]) -> Result<Check, ParseError> {
    if buf.is_empty() {
        return Ok(Check::Incomplete);
    }
    if buf[0] == b'*' {
        check_multibulk(buf)
    } else {
        check_inline(buf)
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn read_decimal(digits: &[u8], what: &'static str) -> Result<usize, ParseError> {
    if digits.is_empty() {
        return Err(ParseError::Protocol(format!("empty {what}")));
    }
    let mut n: usize = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ParseError::Protocol(format!("malformed {what}")));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add((b - b'0') as usize))
            .ok_or_else(|| ParseError::Protocol(format!("{what} overflow")))?;
    }
    Ok(n)
}

fn check_multibulk(buf: &[u8]) -> Result<Check, ParseError> {
    let Some(line_end) = find_crlf(buf, 1) else {
        if buf.len() > MAX_HEADER_LINE {
            return Err(ParseError::Protocol("malformed multibulk header".into()));
        }
        return Ok(Check::Incomplete);
    };
    let count = read_decimal(&buf[1..line_end], "multibulk count")?;
    if count == 0 {
        return Err(ParseError::EmptyCommand);
    }
    if count > MAX_MULTIBULK_ARGS {
        return Err(ParseError::TooManyArgs(count));
    }

    let mut pos = line_end + 2;
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(Check::Incomplete);
        }
        if buf[pos] != b'$' {
            return Err(ParseError::Protocol("expected bulk string".into()));
        }
        let Some(len_end) = find_crlf(buf, pos + 1) else {
            if buf.len() - pos > MAX_HEADER_LINE {
                return Err(ParseError::Protocol("malformed bulk length".into()));
            }
            return Ok(Check::Incomplete);
        };
        let len = read_decimal(&buf[pos + 1..len_end], "bulk length")?;
        if len > MAX_BULK_LEN {
            return Err(ParseError::BulkTooLong(len));
        }
        let body_start = len_end + 2;
        let body_end = body_start + len;
        if buf.len() < body_end + 2 {
            return Ok(Check::Incomplete);
        }
        if &buf[body_end..body_end + 2] != b"\r\n" {
            return Err(ParseError::Protocol("missing bulk terminator".into()));
        }
        pos = body_end + 2;
    }
    Ok(Check::Complete { frame_len: pos })
}

fn check_inline(buf: &[u8]) -> Result<Check, ParseError> {
    match find_crlf(buf, 0) {
        Some(end) => Ok(Check::Complete { frame_len: end + 2 }),
        None if buf.len() > MAX_INLINE_LEN => Err(ParseError::InlineTooLong),
        None => Ok(Check::Incomplete),
    }
}

/// A parsed request: the argument vector, with each argument sharing the
/// frame's backing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub args: Vec<Bytes>,
}

impl Request {
    /// Parse a complete frame, as delimited by [`check_frame`].
    pub fn parse(frame: &Bytes) -> Result<Self, ParseError> {
        if frame.is_empty() {
            return Err(ParseError::EmptyCommand);
        }
        if frame[0] == b'*' {
            Self::parse_multibulk(frame)
        } else {
            Self::parse_inline(frame)
        }
    }

    fn parse_multibulk(frame: &Bytes) -> Result<Self, ParseError> {
        let truncated = || ParseError::Protocol("truncated multibulk frame".into());
        let line_end = find_crlf(frame, 1).ok_or_else(truncated)?;
        let count = read_decimal(&frame[1..line_end], "multibulk count")?;
        if count == 0 {
            return Err(ParseError::EmptyCommand);
        }
        let mut args = Vec::with_capacity(count);
        let mut pos = line_end + 2;
        for _ in 0..count {
            if frame.get(pos) != Some(&b'$') {
                return Err(ParseError::Protocol("expected bulk string".into()));
            }
            let len_end = find_crlf(frame, pos + 1).ok_or_else(truncated)?;
            let len = read_decimal(&frame[pos + 1..len_end], "bulk length")?;
            let body_start = len_end + 2;
            let body_end = body_start + len;
            if frame.len() < body_end + 2 {
                return Err(truncated());
            }
            args.push(frame.slice(body_start..body_end));
            pos = body_end + 2;
        }
        Ok(Request { args })
    }

    fn parse_inline(frame: &Bytes) -> Result<Self, ParseError> {
        let line_len = frame.len().saturating_sub(2);
        let line = &frame[..line_len];
        let mut args = Vec::new();
        let mut i = 0;
        while i < line.len() {
            while i < line.len() && line[i].is_ascii_whitespace() {
                i += 1;
            }
            let start = i;
            while i < line.len() && !line[i].is_ascii_whitespace() {
                i += 1;
            }
            if start < i {
                args.push(frame.slice(start..i));
            }
        }
        if args.is_empty() {
            return Err(ParseError::EmptyCommand);
        }
        Ok(Request { args })
    }
}
