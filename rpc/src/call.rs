//! Outbound and inbound call objects.
//!
//! An outbound call is the client side of a request/response pair: it holds
//! the serialized request, walks `Ready → Queued → Sent`, and finishes on
//! exactly one terminal edge (`Responded`, `TimedOut`, or `Failed`), which
//! fires the caller's completion channel. An inbound call is the server
//! side: the parsed request plus a responder that routes the reply back to
//! the owning reactor thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::RpcError;
use crate::reactor::{ConnId, ReactorHandle, Task};
use crate::transfer::{OutboundTransfer, TransferCallback};

/// Progress of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Constructed, not yet handed to a connection.
    Ready,
    /// Serialized and sitting in the connection's outbound queue.
    Queued,
    /// Fully transmitted, awaiting the response.
    Sent,
    /// The per-call deadline expired before a response arrived.
    TimedOut,
    /// The response was delivered to the caller.
    Responded,
    /// The connection failed before a response arrived.
    Failed,
}

impl CallState {
    /// True once a terminal edge has fired.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::TimedOut | CallState::Responded | CallState::Failed
        )
    }
}

struct CallInner {
    state: CallState,
    call_id: Option<i32>,
    tx: Option<oneshot::Sender<Result<Bytes, RpcError>>>,
}

/// The client side of a request/response pair.
pub struct OutboundCall {
    payload: Bytes,
    timeout: Option<Duration>,
    inner: Mutex<CallInner>,
}

impl OutboundCall {
    /// Create a call carrying `payload`, with an optional response deadline.
    /// The returned receiver fires exactly once with the outcome.
    pub fn new(
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Bytes, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(OutboundCall {
            payload,
            timeout,
            inner: Mutex::new(CallInner {
                state: CallState::Ready,
                call_id: None,
                tx: Some(tx),
            }),
        });
        (call, rx)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    /// The call id assigned at enqueue time, if any.
    pub fn call_id(&self) -> Option<i32> {
        self.inner.lock().call_id
    }

    /// True once a terminal edge has fired.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn set_call_id(&self, call_id: i32) {
        self.inner.lock().call_id = Some(call_id);
    }

    pub(crate) fn set_queued(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CallState::Ready {
            inner.state = CallState::Queued;
        }
    }

    /// Transition to `Sent` once the transfer leaves the wire. A call that
    /// already timed out keeps its terminal state.
    pub(crate) fn set_sent(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CallState::Queued {
            inner.state = CallState::Sent;
        }
    }

    pub(crate) fn set_timed_out(&self) {
        self.finish(CallState::TimedOut, Err(RpcError::TimedOut));
    }

    pub(crate) fn set_failed(&self, status: RpcError) {
        self.finish(CallState::Failed, Err(status));
    }

    pub(crate) fn set_response(&self, payload: Bytes) {
        self.finish(CallState::Responded, Ok(payload));
    }

    fn finish(&self, state: CallState, outcome: Result<Bytes, RpcError>) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = state;
        if let Some(tx) = inner.tx.take() {
            // The caller may have dropped the receiver; that is fine.
            let _ = tx.send(outcome);
        }
    }
}

impl std::fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OutboundCall")
            .field("call_id", &inner.call_id)
            .field("state", &inner.state)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A parsed inbound request, by protocol.
#[derive(Debug, Clone)]
pub enum InboundRequest {
    Yb {
        call_id: i32,
        payload: Bytes,
    },
    Redis {
        args: Vec<Bytes>,
    },
    Cql {
        version: u8,
        stream_id: u16,
        opcode: u8,
        body: Bytes,
    },
}

/// The server side of a request/response pair, handed to the service layer.
#[derive(Debug)]
pub struct InboundCall {
    remote: SocketAddr,
    request: InboundRequest,
    responder: Responder,
}

impl InboundCall {
    pub(crate) fn new(remote: SocketAddr, request: InboundRequest, responder: Responder) -> Self {
        InboundCall {
            remote,
            request,
            responder,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn request(&self) -> &InboundRequest {
        &self.request
    }

    /// Serialize a response and hand it to the owning reactor thread.
    ///
    /// May be invoked from any thread: the response frame is built here,
    /// referencing the payload buffer without copying it, and the actual
    /// enqueue happens as a reactor task on the connection's thread.
    pub fn respond(self, payload: Bytes) {
        let (slices, callback) = match self.request {
            InboundRequest::Yb { call_id, .. } => (
                vec![protocol_yb::encode_prefix(call_id, payload.len()), payload],
                TransferCallback::YbResponse { call_id },
            ),
            InboundRequest::Redis { .. } => (vec![payload], TransferCallback::RedisResponse),
            InboundRequest::Cql {
                version, stream_id, ..
            } => (
                vec![
                    protocol_cql::encode_response_header(
                        version,
                        stream_id,
                        protocol_cql::OPCODE_RESULT,
                        payload.len(),
                    ),
                    payload,
                ],
                TransferCallback::CqlResponse,
            ),
        };
        self.responder
            .queue(OutboundTransfer::new(slices, callback));
    }
}

/// Routes a response transfer back to the connection's reactor thread. This
/// is one of the two supported cross-thread entry points into a connection.
#[derive(Debug, Clone)]
pub(crate) struct Responder {
    handle: ReactorHandle,
    conn: ConnId,
}

impl Responder {
    pub(crate) fn new(handle: ReactorHandle, conn: ConnId) -> Self {
        Responder { handle, conn }
    }

    fn queue(self, transfer: OutboundTransfer) {
        if let Err(task) = self.handle.schedule(Task::QueueTransfer {
            conn: self.conn,
            transfer,
        }) {
            debug!("reactor gone before response could be queued");
            if let Task::QueueTransfer { transfer, .. } = task {
                transfer.abort_detached(&RpcError::Shutdown("reactor is gone".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_delivered_once() {
        let (call, rx) = OutboundCall::new(Bytes::from_static(b"req"), None);
        call.set_queued();
        call.set_sent();
        call.set_response(Bytes::from_static(b"resp"));
        assert_eq!(call.state(), CallState::Responded);

        // A late terminal edge must not overwrite the first one.
        call.set_timed_out();
        call.set_failed(RpcError::RemoteClosed);
        assert_eq!(call.state(), CallState::Responded);

        let outcome = rx.blocking_recv().unwrap();
        assert_eq!(outcome.unwrap(), Bytes::from_static(b"resp"));
    }

    #[test]
    fn timeout_wins_over_late_response() {
        let (call, rx) = OutboundCall::new(Bytes::new(), Some(Duration::from_millis(1)));
        call.set_queued();
        call.set_timed_out();
        call.set_response(Bytes::from_static(b"late"));
        assert_eq!(call.state(), CallState::TimedOut);
        assert_eq!(rx.blocking_recv().unwrap(), Err(RpcError::TimedOut));
    }

    #[test]
    fn sent_only_follows_queued() {
        let (call, _rx) = OutboundCall::new(Bytes::new(), None);
        call.set_sent();
        assert_eq!(call.state(), CallState::Ready);
        call.set_queued();
        call.set_sent();
        assert_eq!(call.state(), CallState::Sent);
    }

    #[test]
    fn sent_after_timeout_keeps_terminal_state() {
        let (call, _rx) = OutboundCall::new(Bytes::new(), None);
        call.set_queued();
        call.set_timed_out();
        call.set_sent();
        assert_eq!(call.state(), CallState::TimedOut);
    }

    #[test]
    fn dropped_receiver_does_not_wedge_failure() {
        let (call, rx) = OutboundCall::new(Bytes::new(), None);
        drop(rx);
        call.set_failed(RpcError::RemoteClosed);
        assert_eq!(call.state(), CallState::Failed);
    }
}
