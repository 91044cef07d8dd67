//! The per-socket connection state machine.
//!
//! A connection progresses `Fresh → Negotiating → Open → ShuttingDown`. It
//! owns one inbound transfer under construction, a FIFO of outbound
//! transfers, and the pending-call tables. All mutation happens on the
//! owning reactor thread; the only cross-thread entry points are the
//! scheduled tasks that queue a response transfer or complete negotiation.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use bytes::Bytes;
use crossbeam_channel::Sender;
use mio::net::TcpStream;
use mio::{Interest, Token};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::call::{CallState, InboundCall, InboundRequest, OutboundCall, Responder};
use crate::error::RpcError;
use crate::metrics::{self, CALLS_TIMED_OUT, PROTOCOL_ERRORS};
use crate::reactor::{ConnId, ReactorCtx, ReactorHandle, TimerId, TimerKind};
use crate::transfer::{InboundTransfer, OutboundTransfer, RedisInbound, TransferCallback};

/// Which side of the connection this process is. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

/// Wire protocol spoken on the connection. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Yb,
    Redis,
    Cql,
}

/// Pending-call record, pooled in a per-connection slab. A record whose
/// `call` has been cleared is a post-timeout tombstone: it stays in the map
/// to absorb a late response without a warning.
struct Car {
    call: Option<Arc<OutboundCall>>,
    timer: Option<TimerId>,
}

/// A server call that has been handed to the service layer and not yet
/// fully responded to.
struct InFlight {
    received_at: Instant,
}

/// Protocol-specific server-side bookkeeping.
enum ServerState {
    Yb {
        calls_being_handled: HashMap<i32, InFlight, RandomState>,
    },
    Redis {
        processing_call: bool,
    },
    Cql {
        calls_in_flight: usize,
    },
}

impl ServerState {
    fn new(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Yb => ServerState::Yb {
                calls_being_handled: HashMap::default(),
            },
            Protocol::Redis => ServerState::Redis {
                processing_call: false,
            },
            Protocol::Cql => ServerState::Cql { calls_in_flight: 0 },
        }
    }

    fn busy(&self) -> bool {
        match self {
            ServerState::Yb {
                calls_being_handled,
            } => !calls_being_handled.is_empty(),
            ServerState::Redis { processing_call } => *processing_call,
            ServerState::Cql { calls_in_flight } => *calls_in_flight > 0,
        }
    }

    fn in_flight(&self) -> usize {
        match self {
            ServerState::Yb {
                calls_being_handled,
            } => calls_being_handled.len(),
            ServerState::Redis { processing_call } => usize::from(*processing_call),
            ServerState::Cql { calls_in_flight } => *calls_in_flight,
        }
    }

    fn clear(&mut self) {
        match self {
            ServerState::Yb {
                calls_being_handled,
            } => calls_being_handled.clear(),
            ServerState::Redis { processing_call } => *processing_call = false,
            ServerState::Cql { calls_in_flight } => *calls_in_flight = 0,
        }
    }
}

/// Snapshot state for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    Negotiating,
    Open,
}

/// A pending client call, as seen by diagnostics.
#[derive(Debug, Clone)]
pub struct ClientCallDump {
    pub call_id: i32,
    pub state: CallState,
}

/// Point-in-time snapshot of one connection, taken on the reactor thread.
#[derive(Debug, Clone)]
pub struct ConnectionDump {
    pub remote: SocketAddr,
    pub state: DumpState,
    pub user: Option<String>,
    pub client_calls: Vec<ClientCallDump>,
    pub server_calls: usize,
}

/// The per-socket state machine.
pub struct Connection {
    id: ConnId,
    stream: TcpStream,
    remote: SocketAddr,
    direction: Direction,
    protocol: Protocol,
    last_activity: Instant,
    registered: bool,
    write_interest: bool,
    next_call_id: i32,
    negotiation_complete: bool,
    shutdown_status: Option<RpcError>,
    user: Option<String>,
    inbound: Option<InboundTransfer>,
    outbound: VecDeque<OutboundTransfer>,
    awaiting_response: HashMap<i32, usize, RandomState>,
    cars: Slab<Car>,
    server: ServerState,
    dispatcher: Sender<InboundCall>,
    handle: ReactorHandle,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnId,
        stream: TcpStream,
        remote: SocketAddr,
        direction: Direction,
        protocol: Protocol,
        dispatcher: Sender<InboundCall>,
        handle: ReactorHandle,
        now: Instant,
    ) -> Self {
        Connection {
            id,
            stream,
            remote,
            direction,
            protocol,
            last_activity: now,
            registered: false,
            write_interest: false,
            next_call_id: 1,
            negotiation_complete: false,
            shutdown_status: None,
            user: None,
            inbound: None,
            outbound: VecDeque::new(),
            awaiting_response: HashMap::default(),
            cars: Slab::new(),
            server: ServerState::new(protocol),
            dispatcher,
            handle,
        }
    }

    pub(crate) fn id(&self) -> ConnId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn set_user(&mut self, user: Option<String>) {
        self.user = user;
    }

    /// Register the socket with the reactor's poller. Write interest is
    /// deferred until negotiation completes and something is queued.
    pub(crate) fn register(&mut self, ctx: &mut ReactorCtx<'_>) -> Result<(), RpcError> {
        let mut interests = Interest::READABLE;
        if self.direction == Direction::Client
            && self.negotiation_complete
            && !self.outbound.is_empty()
        {
            interests = interests.add(Interest::WRITABLE);
            self.write_interest = true;
        }
        ctx.registry
            .register(&mut self.stream, Token(self.id.index()), interests)
            .map_err(RpcError::network)?;
        self.registered = true;
        trace!(conn = %self, "registered with the poller");
        Ok(())
    }

    /// Flip into the open state on the reactor thread. Re-registers
    /// interests so readiness that accrued during negotiation is re-armed.
    pub(crate) fn mark_negotiation_complete(
        &mut self,
        ctx: &mut ReactorCtx<'_>,
    ) -> Result<(), RpcError> {
        self.negotiation_complete = true;
        if !self.registered {
            return Ok(());
        }
        let mut interests = Interest::READABLE;
        let want_write = !self.outbound.is_empty();
        if want_write {
            interests = interests.add(Interest::WRITABLE);
        }
        ctx.registry
            .reregister(&mut self.stream, Token(self.id.index()), interests)
            .map_err(RpcError::network)?;
        self.write_interest = want_write;
        debug!(conn = %self, "negotiation complete");
        Ok(())
    }

    /// A connection is idle when nothing is in flight in either direction
    /// and negotiation has finished. Idle connections may be reclaimed.
    pub fn idle(&self) -> bool {
        if self.inbound.as_ref().is_some_and(|t| t.started()) {
            return false;
        }
        if !self.outbound.is_empty() {
            return false;
        }
        if !self.awaiting_response.is_empty() {
            return false;
        }
        if self.server.busy() {
            return false;
        }
        self.negotiation_complete
    }

    /// Terminal, idempotent tear-down: fail every pending call with
    /// `status`, abort every queued transfer, cancel timers, deregister
    /// from the poller before the socket closes.
    pub(crate) fn shutdown(&mut self, ctx: &mut ReactorCtx<'_>, status: RpcError) {
        if self.shutdown_status.is_some() {
            return;
        }
        self.shutdown_status = Some(status.clone());

        if let Some(inbound) = &self.inbound
            && inbound.started()
        {
            let idle_for = ctx.now.saturating_duration_since(self.last_activity);
            warn!(
                conn = %self,
                buffered = inbound.buffered(),
                ?idle_for,
                %status,
                "shutting down with pending inbound data"
            );
        }

        for (_, key) in self.awaiting_response.drain() {
            if let Some(car) = self.cars.try_remove(key) {
                if let Some(timer) = car.timer {
                    ctx.timers.cancel(timer);
                }
                if let Some(call) = car.call {
                    call.set_failed(status.clone());
                }
            }
        }

        while let Some(mut transfer) = self.outbound.pop_front() {
            let callback = transfer.take_callback();
            self.run_aborted(callback, &status);
        }

        self.server.clear();
        self.inbound = None;

        if self.registered {
            if let Err(e) = ctx.registry.deregister(&mut self.stream) {
                debug!(conn = %self, error = %e, "deregister failed during shutdown");
            }
            self.registered = false;
            self.write_interest = false;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn set_write_interest(&mut self, ctx: &mut ReactorCtx<'_>, on: bool) -> Result<(), RpcError> {
        if self.write_interest == on || !self.registered {
            return Ok(());
        }
        let interests = if on {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        ctx.registry
            .reregister(&mut self.stream, Token(self.id.index()), interests)
            .map_err(RpcError::network)?;
        self.write_interest = on;
        Ok(())
    }

    /// Append a transfer to the outbound queue, arming write interest on
    /// demand. On an already-shut-down connection the transfer is aborted
    /// instead of queued.
    pub(crate) fn queue_outbound(
        &mut self,
        ctx: &mut ReactorCtx<'_>,
        mut transfer: OutboundTransfer,
    ) -> Result<(), RpcError> {
        if let Some(status) = self.shutdown_status.clone() {
            let callback = transfer.take_callback();
            self.run_aborted(callback, &status);
            return Ok(());
        }
        trace!(conn = %self, len = transfer.total_len(), "queueing outbound transfer");
        transfer.mark_enqueued(ctx.now);
        self.outbound.push_back(transfer);
        if self.negotiation_complete {
            self.set_write_interest(ctx, true)?;
        }
        Ok(())
    }

    /// Enqueue a client call: assign the next call id, serialize, install a
    /// pending entry (with its one-shot timeout timer), and queue the
    /// request transfer.
    pub(crate) fn queue_outbound_call(
        &mut self,
        ctx: &mut ReactorCtx<'_>,
        call: Arc<OutboundCall>,
    ) -> Result<(), RpcError> {
        debug_assert_eq!(self.direction, Direction::Client);
        if let Some(status) = &self.shutdown_status {
            call.set_failed(status.clone());
            return Ok(());
        }

        let call_id = self.next_call_id;
        self.next_call_id += 1;
        call.set_call_id(call_id);

        let payload = call.payload().clone();
        let slices = vec![
            protocol_yb::encode_prefix(call_id, payload.len()),
            payload,
        ];

        call.set_queued();

        let mut car = Car {
            call: Some(call.clone()),
            timer: None,
        };
        if let Some(timeout) = call.timeout()
            && timeout > Duration::ZERO
        {
            car.timer = Some(ctx.timers.schedule(
                ctx.now + timeout,
                TimerKind::CallTimeout {
                    conn: self.id,
                    call_id,
                },
            ));
        }
        let key = self.cars.insert(car);
        self.awaiting_response.insert(call_id, key);

        self.queue_outbound(ctx, OutboundTransfer::new(slices, TransferCallback::Call { call }))
    }

    /// Per-call deadline fired. Marks the call timed out and clears the
    /// pending entry's call handle, leaving the entry in the map so a late
    /// response is absorbed without a warning.
    pub(crate) fn handle_call_timeout(&mut self, call_id: i32) {
        let Some(&key) = self.awaiting_response.get(&call_id) else {
            return;
        };
        let call = match self.cars.get_mut(key) {
            Some(car) => {
                car.timer = None;
                car.call.take()
            }
            None => return,
        };
        if let Some(call) = call {
            CALLS_TIMED_OUT.increment();
            debug!(conn = %self, call_id, "call timed out");
            call.set_timed_out();
        }
    }

    /// Socket became readable. Drains complete frames until the socket
    /// would block; during negotiation the driver owns the socket and
    /// events are ignored.
    pub(crate) fn read_ready(&mut self, ctx: &mut ReactorCtx<'_>) -> Result<(), RpcError> {
        if self.shutdown_status.is_some() || !self.negotiation_complete {
            return Ok(());
        }
        self.last_activity = ctx.now;
        self.drain_reads(ctx)
    }

    fn drain_reads(&mut self, ctx: &mut ReactorCtx<'_>) -> Result<(), RpcError> {
        loop {
            if self.shutdown_status.is_some() {
                return Ok(());
            }
            if self.inbound.is_none() {
                self.inbound = Some(InboundTransfer::new(self.protocol));
            }
            if let Some(inbound) = &mut self.inbound
                && !inbound.finished()
            {
                inbound.receive(&mut self.stream)?;
            }
            match self.inbound.as_ref() {
                Some(inbound) if inbound.finished() => {}
                _ => return Ok(()),
            }
            self.handle_finished_transfer(ctx)?;
            // A transfer still parked after handling means the single
            // in-flight slot is busy; stop reading until it frees up.
            if self.inbound.as_ref().is_some_and(|t| t.finished()) {
                return Ok(());
            }
        }
    }

    /// Socket became writable. Drains the outbound queue, disarming write
    /// interest once it is empty.
    pub(crate) fn write_ready(&mut self, ctx: &mut ReactorCtx<'_>) -> Result<(), RpcError> {
        if self.shutdown_status.is_some() || !self.negotiation_complete {
            return Ok(());
        }
        if self.outbound.is_empty() {
            warn!(conn = %self, "ready-to-write callback with nothing to write");
            return self.set_write_interest(ctx, false);
        }
        loop {
            let finished = {
                let Some(front) = self.outbound.front_mut() else {
                    break;
                };
                front.send(&mut self.stream)?;
                front.finished()
            };
            self.last_activity = ctx.now;
            if !finished {
                // Partial send; the write watcher stays armed.
                return Ok(());
            }
            let Some(mut transfer) = self.outbound.pop_front() else {
                break;
            };
            if let Some(enqueued_at) = transfer.enqueued_at() {
                metrics::record_outbound_transfer(ctx.now.saturating_duration_since(enqueued_at));
            }
            let callback = transfer.take_callback();
            self.run_finished(ctx, callback)?;
        }
        self.set_write_interest(ctx, false)
    }

    fn take_finished_inbound(&mut self) -> Option<InboundTransfer> {
        if self.inbound.as_ref().is_some_and(|t| t.finished()) {
            self.inbound.take()
        } else {
            None
        }
    }

    /// Dispatch one complete inbound frame by direction and protocol.
    fn handle_finished_transfer(&mut self, ctx: &mut ReactorCtx<'_>) -> Result<(), RpcError> {
        match (self.protocol, self.direction) {
            (Protocol::Yb, Direction::Client) => {
                let Some(InboundTransfer::Yb(transfer)) = self.take_finished_inbound() else {
                    return Ok(());
                };
                self.handle_call_response(ctx, transfer.into_body())
            }
            (Protocol::Yb, Direction::Server) => {
                let Some(InboundTransfer::Yb(transfer)) = self.take_finished_inbound() else {
                    return Ok(());
                };
                let frame = protocol_yb::Frame::decode(transfer.into_body()).map_err(|e| {
                    PROTOCOL_ERRORS.increment();
                    RpcError::Protocol(e.to_string())
                })?;
                let ServerState::Yb {
                    calls_being_handled,
                } = &mut self.server
                else {
                    return Ok(());
                };
                if let Some(in_flight) = calls_being_handled.get(&frame.call_id) {
                    let elapsed = ctx.now.saturating_duration_since(in_flight.received_at);
                    PROTOCOL_ERRORS.increment();
                    return Err(RpcError::Protocol(format!(
                        "received duplicate call id {} while the first is still in flight ({elapsed:?} old)",
                        frame.call_id
                    )));
                }
                calls_being_handled.insert(
                    frame.call_id,
                    InFlight {
                        received_at: ctx.now,
                    },
                );
                self.dispatch(InboundRequest::Yb {
                    call_id: frame.call_id,
                    payload: frame.payload,
                })
            }
            (Protocol::Redis, Direction::Server) => {
                if let ServerState::Redis {
                    processing_call: true,
                } = self.server
                {
                    // Single in-flight: leave the transfer parked until the
                    // current call's response completes.
                    trace!(conn = %self, "already handling a call, parking inbound transfer");
                    return Ok(());
                }
                let Some(InboundTransfer::Redis(transfer)) = self.take_finished_inbound() else {
                    return Ok(());
                };
                let (frame, excess) = transfer.split();
                let next = RedisInbound::with_seed(excess).inspect_err(|_| {
                    PROTOCOL_ERRORS.increment();
                })?;
                self.inbound = Some(InboundTransfer::Redis(next));
                let request = protocol_redis::Request::parse(&frame).map_err(|e| {
                    PROTOCOL_ERRORS.increment();
                    RpcError::Protocol(e.to_string())
                })?;
                if let ServerState::Redis { processing_call } = &mut self.server {
                    *processing_call = true;
                }
                self.dispatch(InboundRequest::Redis { args: request.args })
            }
            (Protocol::Cql, Direction::Server) => {
                let Some(InboundTransfer::Cql(transfer)) = self.take_finished_inbound() else {
                    return Ok(());
                };
                let (header, body) = transfer.finish();
                if header.is_response() {
                    PROTOCOL_ERRORS.increment();
                    return Err(RpcError::Protocol(
                        "response-direction frame received by server".into(),
                    ));
                }
                if let ServerState::Cql { calls_in_flight } = &mut self.server {
                    *calls_in_flight += 1;
                }
                self.dispatch(InboundRequest::Cql {
                    version: header.protocol_version(),
                    stream_id: header.stream_id,
                    opcode: header.opcode,
                    body,
                })
            }
            (Protocol::Redis | Protocol::Cql, Direction::Client) => {
                PROTOCOL_ERRORS.increment();
                Err(RpcError::Protocol(
                    "client direction is not supported for this protocol".into(),
                ))
            }
        }
    }

    fn dispatch(&mut self, request: InboundRequest) -> Result<(), RpcError> {
        let call = InboundCall::new(
            self.remote,
            request,
            Responder::new(self.handle.clone(), self.id),
        );
        self.dispatcher
            .send(call)
            .map_err(|_| RpcError::Shutdown("inbound call dispatcher is gone".into()))
    }

    /// Match a response frame against the pending-call table.
    pub(crate) fn handle_call_response(
        &mut self,
        ctx: &mut ReactorCtx<'_>,
        body: Bytes,
    ) -> Result<(), RpcError> {
        let frame = protocol_yb::Frame::decode(body).map_err(|e| {
            PROTOCOL_ERRORS.increment();
            RpcError::Protocol(e.to_string())
        })?;
        let Some(key) = self.awaiting_response.remove(&frame.call_id) else {
            warn!(
                conn = %self,
                call_id = frame.call_id,
                "got a response for a call id that was not pending, ignoring"
            );
            return Ok(());
        };
        let Some(car) = self.cars.try_remove(key) else {
            return Ok(());
        };
        if let Some(timer) = car.timer {
            ctx.timers.cancel(timer);
        }
        match car.call {
            Some(call) => call.set_response(frame.payload),
            None => {
                // The call already timed out; absorb the late response.
                debug!(conn = %self, call_id = frame.call_id, "response arrived after timeout");
            }
        }
        Ok(())
    }

    /// Completion edge for a transfer that reached the wire.
    fn run_finished(
        &mut self,
        ctx: &mut ReactorCtx<'_>,
        callback: TransferCallback,
    ) -> Result<(), RpcError> {
        match callback {
            TransferCallback::None => Ok(()),
            TransferCallback::Call { call } => {
                // A call that timed out while queued keeps its terminal
                // state; otherwise it is now on the wire.
                call.set_sent();
                Ok(())
            }
            TransferCallback::YbResponse { call_id } => {
                if let ServerState::Yb {
                    calls_being_handled,
                } = &mut self.server
                {
                    calls_being_handled.remove(&call_id);
                }
                Ok(())
            }
            TransferCallback::RedisResponse => {
                if let ServerState::Redis { processing_call } = &mut self.server {
                    *processing_call = false;
                }
                self.finished_handling_a_call(ctx)
            }
            TransferCallback::CqlResponse => {
                if let ServerState::Cql { calls_in_flight } = &mut self.server {
                    *calls_in_flight = calls_in_flight.saturating_sub(1);
                }
                self.finished_handling_a_call(ctx)
            }
        }
    }

    /// Abort edge for a transfer that never reached the wire.
    fn run_aborted(&mut self, callback: TransferCallback, status: &RpcError) {
        match callback {
            TransferCallback::None => {}
            TransferCallback::Call { call } => {
                // The pending-table sweep already failed the call.
                debug!(conn = %self, ?call, %status, "torn down before the call could be sent");
            }
            TransferCallback::YbResponse { call_id } => {
                warn!(conn = %self, call_id, %status, "torn down before a response could be sent");
                if let ServerState::Yb {
                    calls_being_handled,
                } = &mut self.server
                {
                    calls_being_handled.remove(&call_id);
                }
            }
            TransferCallback::RedisResponse => {
                warn!(conn = %self, %status, "torn down before a response could be sent");
                if let ServerState::Redis { processing_call } = &mut self.server {
                    *processing_call = false;
                }
            }
            TransferCallback::CqlResponse => {
                warn!(conn = %self, %status, "torn down before a response could be sent");
                if let ServerState::Cql { calls_in_flight } = &mut self.server {
                    *calls_in_flight = calls_in_flight.saturating_sub(1);
                }
            }
        }
    }

    /// A server response finished sending. Re-drives a parked inbound
    /// transfer and any bytes the kernel buffered meanwhile.
    fn finished_handling_a_call(&mut self, ctx: &mut ReactorCtx<'_>) -> Result<(), RpcError> {
        if self.shutdown_status.is_some() {
            return Ok(());
        }
        self.drain_reads(ctx)
    }

    /// Diagnostics snapshot. Credentials are only readable once negotiation
    /// has completed (they belong to the negotiation worker before that).
    pub(crate) fn dump(&self) -> ConnectionDump {
        let state = if self.negotiation_complete {
            DumpState::Open
        } else {
            DumpState::Negotiating
        };
        let user = if self.negotiation_complete {
            self.user.clone()
        } else {
            None
        };
        let mut client_calls = Vec::new();
        for (&call_id, &key) in &self.awaiting_response {
            if let Some(car) = self.cars.get(key)
                && let Some(call) = &car.call
            {
                client_calls.push(ClientCallDump {
                    call_id,
                    state: call.state(),
                });
            }
        }
        ConnectionDump {
            remote: self.remote,
            state,
            user,
            client_calls,
            server_calls: self.server.in_flight(),
        }
    }
}

impl fmt::Display for Connection {
    /// Renders only immutable fields, so it is safe from any thread.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Server => write!(f, "server connection from {}", self.remote),
            Direction::Client => write!(f, "client connection to {}", self.remote),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug_assert!(
            self.outbound.is_empty(),
            "connection dropped with queued outbound transfers"
        );
        debug_assert!(
            !self.registered,
            "connection dropped while registered with the poller"
        );
    }
}
