//! Wire transfers: inbound framing and outbound gather-writes.
//!
//! An inbound transfer accumulates bytes from the socket until its
//! protocol's framer reports a complete frame. An outbound transfer drains
//! an immutable list of byte slices to the socket, surviving partial kernel
//! writes via a cursor. Each outbound transfer carries a callback that fires
//! exactly once: finished when the last byte hits the wire, or aborted with
//! the shutdown status if the connection is torn down first.

use std::io::{self, IoSlice, Read, Write};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::call::OutboundCall;
use crate::connection::Protocol;
use crate::error::RpcError;

const RECV_CHUNK: usize = 16 * 1024;

enum ReadOutcome {
    Reached,
    WouldBlock,
}

/// Read from `sock` until `buf` holds `target` bytes or the socket would
/// block. `Ok(0)` from the socket is the distinguished remote-close error.
fn read_upto<R: Read>(
    sock: &mut R,
    buf: &mut BytesMut,
    target: usize,
) -> Result<ReadOutcome, RpcError> {
    let mut chunk = [0u8; RECV_CHUNK];
    while buf.len() < target {
        let want = (target - buf.len()).min(chunk.len());
        match sock.read(&mut chunk[..want]) {
            Ok(0) => return Err(RpcError::RemoteClosed),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RpcError::network(e)),
        }
    }
    Ok(ReadOutcome::Reached)
}

/// Inbound transfer for the length-prefixed RPC protocol: a fixed-width
/// length prefix, then exactly that many body bytes. Never reads past the
/// frame boundary.
pub struct YbInbound {
    buf: BytesMut,
    body_len: Option<usize>,
}

impl YbInbound {
    fn new() -> Self {
        YbInbound {
            buf: BytesMut::new(),
            body_len: None,
        }
    }

    fn receive<R: Read>(&mut self, sock: &mut R) -> Result<(), RpcError> {
        loop {
            match self.body_len {
                None => match read_upto(sock, &mut self.buf, protocol_yb::LENGTH_PREFIX_LEN)? {
                    ReadOutcome::Reached => {
                        let len = protocol_yb::body_len(&self.buf)
                            .map_err(|e| RpcError::Protocol(e.to_string()))?;
                        self.body_len = Some(len);
                    }
                    ReadOutcome::WouldBlock => return Ok(()),
                },
                Some(len) => {
                    let target = protocol_yb::LENGTH_PREFIX_LEN + len;
                    let _ = read_upto(sock, &mut self.buf, target)?;
                    return Ok(());
                }
            }
        }
    }

    fn finished(&self) -> bool {
        self.body_len
            .is_some_and(|len| self.buf.len() == protocol_yb::LENGTH_PREFIX_LEN + len)
    }

    /// The frame body, once finished.
    pub(crate) fn into_body(self) -> Bytes {
        let mut buf = self.buf;
        let _ = buf.split_to(protocol_yb::LENGTH_PREFIX_LEN.min(buf.len()));
        buf.freeze()
    }
}

/// Inbound transfer for the Redis protocol. Line-based, so reads happen in
/// chunks and a completed frame may leave excess bytes that seed the next
/// transfer.
pub struct RedisInbound {
    buf: BytesMut,
    frame_len: Option<usize>,
}

impl RedisInbound {
    fn new() -> Self {
        RedisInbound {
            buf: BytesMut::new(),
            frame_len: None,
        }
    }

    /// Build a transfer seeded with the excess bytes of its predecessor.
    /// The seed may already contain a complete frame.
    pub(crate) fn with_seed(seed: BytesMut) -> Result<Self, RpcError> {
        let mut transfer = RedisInbound {
            buf: seed,
            frame_len: None,
        };
        transfer.check()?;
        Ok(transfer)
    }

    fn check(&mut self) -> Result<(), RpcError> {
        match protocol_redis::check_frame(&self.buf)
            .map_err(|e| RpcError::Protocol(e.to_string()))?
        {
            protocol_redis::Check::Complete { frame_len } => {
                self.frame_len = Some(frame_len);
            }
            protocol_redis::Check::Incomplete => {}
        }
        Ok(())
    }

    fn receive<R: Read>(&mut self, sock: &mut R) -> Result<(), RpcError> {
        if self.frame_len.is_some() {
            return Ok(());
        }
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            match sock.read(&mut chunk) {
                Ok(0) => return Err(RpcError::RemoteClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.check()?;
                    if self.frame_len.is_some() {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RpcError::network(e)),
            }
        }
    }

    fn finished(&self) -> bool {
        self.frame_len.is_some()
    }

    /// Split into the complete frame and the excess tail.
    pub(crate) fn split(self) -> (Bytes, BytesMut) {
        let mut buf = self.buf;
        let len = self.frame_len.unwrap_or(buf.len());
        let excess = buf.split_off(len);
        (buf.freeze(), excess)
    }
}

/// Inbound transfer for the binary SQL protocol: a 9-byte header declaring
/// the body length. Never reads past the frame boundary.
pub struct CqlInbound {
    buf: BytesMut,
    header: Option<protocol_cql::Header>,
}

impl CqlInbound {
    fn new() -> Self {
        CqlInbound {
            buf: BytesMut::new(),
            header: None,
        }
    }

    fn receive<R: Read>(&mut self, sock: &mut R) -> Result<(), RpcError> {
        loop {
            match self.header {
                None => match read_upto(sock, &mut self.buf, protocol_cql::HEADER_LEN)? {
                    ReadOutcome::Reached => {
                        let header = protocol_cql::Header::decode(&self.buf)
                            .map_err(|e| RpcError::Protocol(e.to_string()))?;
                        self.header = Some(header);
                    }
                    ReadOutcome::WouldBlock => return Ok(()),
                },
                Some(header) => {
                    let target = protocol_cql::HEADER_LEN + header.body_len;
                    let _ = read_upto(sock, &mut self.buf, target)?;
                    return Ok(());
                }
            }
        }
    }

    fn finished(&self) -> bool {
        self.header
            .is_some_and(|h| self.buf.len() == protocol_cql::HEADER_LEN + h.body_len)
    }

    /// The header and frame body, once finished.
    pub(crate) fn finish(self) -> (protocol_cql::Header, Bytes) {
        let Some(header) = self.header else {
            panic!("finish called on an unfinished transfer");
        };
        (header, self.buf.freeze().slice(protocol_cql::HEADER_LEN..))
    }
}

/// A single inbound wire message under construction, framed per protocol.
pub enum InboundTransfer {
    Yb(YbInbound),
    Redis(RedisInbound),
    Cql(CqlInbound),
}

impl InboundTransfer {
    pub(crate) fn new(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Yb => InboundTransfer::Yb(YbInbound::new()),
            Protocol::Redis => InboundTransfer::Redis(RedisInbound::new()),
            Protocol::Cql => InboundTransfer::Cql(CqlInbound::new()),
        }
    }

    /// Read as much as the socket yields without blocking, stopping at the
    /// frame boundary for fixed-length protocols.
    pub(crate) fn receive<R: Read>(&mut self, sock: &mut R) -> Result<(), RpcError> {
        match self {
            InboundTransfer::Yb(t) => t.receive(sock),
            InboundTransfer::Redis(t) => t.receive(sock),
            InboundTransfer::Cql(t) => t.receive(sock),
        }
    }

    /// True once any bytes have been consumed from the socket.
    pub fn started(&self) -> bool {
        self.buffered() > 0
    }

    /// True once a complete frame is buffered.
    pub fn finished(&self) -> bool {
        match self {
            InboundTransfer::Yb(t) => t.finished(),
            InboundTransfer::Redis(t) => t.finished(),
            InboundTransfer::Cql(t) => t.finished(),
        }
    }

    /// Bytes accumulated so far.
    pub fn buffered(&self) -> usize {
        match self {
            InboundTransfer::Yb(t) => t.buf.len(),
            InboundTransfer::Redis(t) => t.buf.len(),
            InboundTransfer::Cql(t) => t.buf.len(),
        }
    }
}

/// Fired when an outbound transfer leaves the wire or is aborted. Dispatched
/// by the owning connection so response callbacks can update its tables.
pub(crate) enum TransferCallback {
    None,
    /// Client call transfer: flips the call to `Sent` on completion.
    Call { call: Arc<OutboundCall> },
    /// Server response for the RPC protocol: retires the in-flight entry.
    YbResponse { call_id: i32 },
    /// Server response for the Redis protocol: re-opens the single
    /// in-flight slot.
    RedisResponse,
    /// Server response for the SQL protocol: retires one in-flight call.
    CqlResponse,
}

/// A single outbound wire message: an immutable gather list with a cursor.
pub struct OutboundTransfer {
    slices: Vec<Bytes>,
    cur: usize,
    offset: usize,
    callback: TransferCallback,
    enqueued_at: Option<Instant>,
}

impl OutboundTransfer {
    pub(crate) fn new(mut slices: Vec<Bytes>, callback: TransferCallback) -> Self {
        slices.retain(|s| !s.is_empty());
        OutboundTransfer {
            slices,
            cur: 0,
            offset: 0,
            callback,
            enqueued_at: None,
        }
    }

    /// A transfer with no completion callback.
    pub fn raw(slices: Vec<Bytes>) -> Self {
        Self::new(slices, TransferCallback::None)
    }

    pub(crate) fn mark_enqueued(&mut self, now: Instant) {
        self.enqueued_at = Some(now);
    }

    pub(crate) fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }

    pub fn finished(&self) -> bool {
        self.cur >= self.slices.len()
    }

    pub fn total_len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    /// Write the next chunk of the gather list. Partial kernel writes
    /// advance the cursor; `WouldBlock` returns with the transfer
    /// unfinished.
    pub fn send<W: Write>(&mut self, sock: &mut W) -> Result<(), RpcError> {
        while !self.finished() {
            let result = {
                let mut iov: SmallVec<[IoSlice<'_>; 8]> = SmallVec::new();
                iov.push(IoSlice::new(&self.slices[self.cur][self.offset..]));
                for slice in &self.slices[self.cur + 1..] {
                    iov.push(IoSlice::new(slice));
                }
                sock.write_vectored(&iov)
            };
            match result {
                Ok(0) => return Err(RpcError::Network("wrote zero bytes".into())),
                Ok(n) => self.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RpcError::network(e)),
            }
        }
        Ok(())
    }

    fn advance(&mut self, mut n: usize) {
        while n > 0 && self.cur < self.slices.len() {
            let remaining = self.slices[self.cur].len() - self.offset;
            if n >= remaining {
                n -= remaining;
                self.cur += 1;
                self.offset = 0;
            } else {
                self.offset += n;
                n = 0;
            }
        }
    }

    pub(crate) fn take_callback(&mut self) -> TransferCallback {
        std::mem::replace(&mut self.callback, TransferCallback::None)
    }

    /// Abort a transfer that never reached a live connection. The connection
    /// handles its own aborts so it can update per-connection tables; this
    /// path only fires the notification edge.
    pub(crate) fn abort_detached(mut self, status: &RpcError) {
        match self.take_callback() {
            TransferCallback::None => {}
            TransferCallback::Call { call } => {
                debug!(?call, %status, "torn down before the call could be sent");
            }
            TransferCallback::YbResponse { .. }
            | TransferCallback::RedisResponse
            | TransferCallback::CqlResponse => {
                warn!(%status, "torn down before a response could be sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that yields `data` in fixed-size chunks, then WouldBlock.
    struct ChunkReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        close_at_end: bool,
    }

    impl ChunkReader {
        fn new(data: &[u8], chunk: usize) -> Self {
            ChunkReader {
                data: data.to_vec(),
                pos: 0,
                chunk,
                close_at_end: false,
            }
        }

        fn closing(data: &[u8], chunk: usize) -> Self {
            let mut r = Self::new(data, chunk);
            r.close_at_end = true;
            r
        }
    }

    impl Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                if self.close_at_end {
                    return Ok(0);
                }
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = (self.data.len() - self.pos).min(self.chunk).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Writer that accepts a limited number of bytes before WouldBlock.
    struct ThrottledWriter {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn yb_inbound_across_split_reads() {
        let frame = protocol_yb::encode_frame(9, b"hello world");
        let mut sock = ChunkReader::new(&frame, 3);
        let mut transfer = InboundTransfer::new(Protocol::Yb);
        assert!(!transfer.started());
        while !transfer.finished() {
            transfer.receive(&mut sock).unwrap();
        }
        assert!(transfer.started());
        let InboundTransfer::Yb(t) = transfer else {
            unreachable!()
        };
        let frame = protocol_yb::Frame::decode(t.into_body()).unwrap();
        assert_eq!(frame.call_id, 9);
        assert_eq!(&frame.payload[..], b"hello world");
    }

    #[test]
    fn yb_inbound_stops_at_frame_boundary() {
        let mut wire = protocol_yb::encode_frame(1, b"first").to_vec();
        wire.extend_from_slice(&protocol_yb::encode_frame(2, b"second"));
        let mut sock = ChunkReader::new(&wire, 64);
        let mut transfer = InboundTransfer::new(Protocol::Yb);
        transfer.receive(&mut sock).unwrap();
        assert!(transfer.finished());
        // The second frame must still be readable from the socket.
        let mut rest = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(n) = sock.read(&mut buf) {
            rest.extend_from_slice(&buf[..n]);
        }
        assert_eq!(rest, &protocol_yb::encode_frame(2, b"second")[..]);
    }

    #[test]
    fn yb_inbound_remote_close_is_distinguished() {
        let mut sock = ChunkReader::closing(b"", 4);
        let mut transfer = InboundTransfer::new(Protocol::Yb);
        assert_eq!(
            transfer.receive(&mut sock).unwrap_err(),
            RpcError::RemoteClosed
        );
    }

    #[test]
    fn yb_inbound_oversize_frame_is_protocol_error() {
        let header = (protocol_yb::MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let mut sock = ChunkReader::new(&header, 4);
        let mut transfer = InboundTransfer::new(Protocol::Yb);
        assert!(matches!(
            transfer.receive(&mut sock),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn redis_inbound_captures_excess() {
        let wire = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r";
        let mut sock = ChunkReader::new(wire, 64);
        let mut transfer = InboundTransfer::new(Protocol::Redis);
        transfer.receive(&mut sock).unwrap();
        assert!(transfer.finished());
        let InboundTransfer::Redis(t) = transfer else {
            unreachable!()
        };
        let (frame, excess) = t.split();
        assert_eq!(&frame[..], b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(&excess[..], b"*1\r\n$4\r");
    }

    #[test]
    fn redis_seeded_transfer_may_be_complete() {
        let seed = BytesMut::from(&b"PING\r\nGET"[..]);
        let t = RedisInbound::with_seed(seed).unwrap();
        assert!(t.finished());
        let (frame, excess) = t.split();
        assert_eq!(&frame[..], b"PING\r\n");
        assert_eq!(&excess[..], b"GET");
    }

    #[test]
    fn cql_inbound_parses_header_and_body() {
        let frame = protocol_cql::encode_request_frame(4, 21, 0x07, b"select 1");
        let mut sock = ChunkReader::new(&frame, 5);
        let mut transfer = InboundTransfer::new(Protocol::Cql);
        while !transfer.finished() {
            transfer.receive(&mut sock).unwrap();
        }
        let InboundTransfer::Cql(t) = transfer else {
            unreachable!()
        };
        let (header, body) = t.finish();
        assert_eq!(header.stream_id, 21);
        assert_eq!(&body[..], b"select 1");
    }

    #[test]
    fn outbound_preserves_slice_order_across_partial_writes() {
        let slices = vec![
            Bytes::from_static(b"one-"),
            Bytes::from_static(b"two-"),
            Bytes::from_static(b"three"),
        ];
        let mut transfer = OutboundTransfer::raw(slices);
        let mut out = Vec::new();
        while !transfer.finished() {
            let mut sock = ThrottledWriter {
                out: Vec::new(),
                budget: 3,
            };
            transfer.send(&mut sock).unwrap();
            out.extend_from_slice(&sock.out);
        }
        assert_eq!(out, b"one-two-three");
    }

    #[test]
    fn outbound_empty_slices_are_trivially_finished() {
        let transfer = OutboundTransfer::raw(vec![Bytes::new(), Bytes::new()]);
        assert!(transfer.finished());
        assert_eq!(transfer.total_len(), 0);
    }

    #[test]
    fn outbound_callback_taken_once() {
        let (call, _rx) = OutboundCall::new(Bytes::new(), None);
        let mut transfer =
            OutboundTransfer::new(vec![Bytes::from_static(b"x")], TransferCallback::Call { call });
        assert!(matches!(
            transfer.take_callback(),
            TransferCallback::Call { .. }
        ));
        assert!(matches!(transfer.take_callback(), TransferCallback::None));
    }
}
