//! The reactor binding: one thread owning a poller, a slab of connections,
//! one-shot timers, and a task queue for cross-thread entry.
//!
//! All connection mutation happens here. Other threads reach a connection
//! only by scheduling a task on the [`ReactorHandle`]; the waker kicks the
//! poll loop so tasks run promptly. Readiness and timer events are routed
//! into connection methods, and any error return destroys the connection
//! with that status.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::call::{InboundCall, OutboundCall};
use crate::connection::{Connection, ConnectionDump, Direction, Protocol};
use crate::error::RpcError;
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE};
use crate::negotiation::{NegotiationJob, NegotiationPool, Negotiator, NoopNegotiator};
use crate::transfer::OutboundTransfer;

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

/// Stable identity of a connection on its reactor. The generation guards
/// against slab slot reuse: a task aimed at a destroyed connection whose
/// slot was recycled is dropped instead of hitting the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId {
    index: usize,
    generation: u32,
}

impl ConnId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        ConnId { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// One-shot timer identity, generation-checked like [`ConnId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerId {
    key: usize,
    generation: u32,
}

/// What to do when a timer fires.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TimerKind {
    CallTimeout { conn: ConnId, call_id: i32 },
}

struct TimerEntry {
    generation: u32,
    kind: TimerKind,
}

/// One-shot timers: a deadline heap over generation-checked slab entries.
/// Cancellation removes the entry; stale heap nodes are skipped lazily.
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, usize, u32)>>,
    entries: Slab<TimerEntry>,
    next_generation: u32,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            entries: Slab::new(),
            next_generation: 1,
        }
    }

    pub(crate) fn schedule(&mut self, deadline: Instant, kind: TimerKind) -> TimerId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let key = self.entries.insert(TimerEntry { generation, kind });
        self.heap.push(Reverse((deadline, key, generation)));
        TimerId { key, generation }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        if self
            .entries
            .get(id.key)
            .is_some_and(|e| e.generation == id.generation)
        {
            self.entries.remove(id.key);
        }
    }

    fn is_live(&self, key: usize, generation: u32) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.generation == generation)
    }

    /// Deadline of the nearest live timer, discarding stale heap nodes.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, key, generation))) = self.heap.peek().copied() {
            if self.is_live(key, generation) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop one expired timer, if any.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        loop {
            let Reverse((deadline, key, generation)) = self.heap.peek().copied()?;
            if !self.is_live(key, generation) {
                self.heap.pop();
                continue;
            }
            if deadline > now {
                return None;
            }
            self.heap.pop();
            return Some(self.entries.remove(key).kind);
        }
    }
}

/// Per-dispatch context threaded into connection methods: the poller
/// registry for interest changes, the timer wheel, and the event time.
pub(crate) struct ReactorCtx<'a> {
    pub registry: &'a Registry,
    pub timers: &'a mut TimerWheel,
    pub now: Instant,
}

/// Work submitted to the reactor thread. This channel is the only
/// cross-thread path into connection state.
pub(crate) enum Task {
    RegisterConn {
        stream: std::net::TcpStream,
        protocol: Protocol,
        direction: Direction,
        reply: oneshot::Sender<Result<ConnId, RpcError>>,
    },
    AssignOutboundCall {
        conn: ConnId,
        call: Arc<OutboundCall>,
    },
    QueueTransfer {
        conn: ConnId,
        transfer: OutboundTransfer,
    },
    CompleteNegotiation {
        conn: ConnId,
        status: Result<Option<String>, RpcError>,
    },
    Dump {
        reply: oneshot::Sender<Vec<ConnectionDump>>,
    },
    Halt,
}

/// Cloneable cross-thread handle to a reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    tx: Sender<Task>,
    waker: Arc<Waker>,
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle").finish_non_exhaustive()
    }
}

impl ReactorHandle {
    pub(crate) fn new(tx: Sender<Task>, waker: Arc<Waker>) -> Self {
        ReactorHandle { tx, waker }
    }

    /// Submit a task and kick the poll loop. On failure the task is handed
    /// back so the caller can fire its abort edge.
    pub(crate) fn schedule(&self, task: Task) -> Result<(), Task> {
        self.tx.send(task).map_err(|e| e.into_inner())?;
        let _ = self.waker.wake();
        Ok(())
    }

    /// Establish a client connection and register it with the reactor.
    /// Blocks the calling thread until registration completes; must not be
    /// called from the reactor thread itself.
    pub fn connect(&self, addr: SocketAddr) -> Result<ConnId, RpcError> {
        let stream = std::net::TcpStream::connect(addr).map_err(RpcError::network)?;
        let _ = stream.set_nodelay(true);
        stream.set_nonblocking(true).map_err(RpcError::network)?;
        let (reply, rx) = oneshot::channel();
        self.schedule(Task::RegisterConn {
            stream,
            protocol: Protocol::Yb,
            direction: Direction::Client,
            reply,
        })
        .map_err(|_| RpcError::Shutdown("reactor is gone".into()))?;
        rx.blocking_recv()
            .map_err(|_| RpcError::Shutdown("reactor is gone".into()))?
    }

    /// Hand an outbound call to the connection's reactor thread.
    pub fn assign_call(&self, conn: ConnId, call: Arc<OutboundCall>) {
        if let Err(task) = self.schedule(Task::AssignOutboundCall { conn, call }) {
            if let Task::AssignOutboundCall { call, .. } = task {
                call.set_failed(RpcError::Shutdown("reactor is gone".into()));
            }
        }
    }

    /// Convenience wrapper: build a call, assign it, return the completion
    /// receiver.
    pub fn call(
        &self,
        conn: ConnId,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Result<Bytes, RpcError>> {
        let (call, rx) = OutboundCall::new(payload, timeout);
        self.assign_call(conn, call);
        rx
    }

    /// Snapshot every connection on the reactor thread.
    pub fn dump(&self) -> Result<Vec<ConnectionDump>, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.schedule(Task::Dump { reply })
            .map_err(|_| RpcError::Shutdown("reactor is gone".into()))?;
        rx.blocking_recv()
            .map_err(|_| RpcError::Shutdown("reactor is gone".into()))
    }

    /// Request reactor tear-down. Connections are destroyed with a
    /// shutdown status; queued tasks are aborted.
    pub fn halt(&self) {
        let _ = self.schedule(Task::Halt);
    }

    pub(crate) fn complete_negotiation(
        &self,
        conn: ConnId,
        status: Result<Option<String>, RpcError>,
    ) {
        let _ = self.schedule(Task::CompleteNegotiation { conn, status });
    }
}

/// Configures and spawns a reactor thread.
pub struct ReactorBuilder {
    name: String,
    listeners: Vec<(Protocol, SocketAddr)>,
    negotiator: Arc<dyn Negotiator>,
    negotiation_timeout: Duration,
}

impl ReactorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ReactorBuilder {
            name: name.into(),
            listeners: Vec::new(),
            negotiator: Arc::new(NoopNegotiator),
            negotiation_timeout: Duration::from_secs(3),
        }
    }

    /// Build from a loaded configuration: name, listeners, and negotiation
    /// timeout.
    pub fn from_config(config: &crate::config::Config) -> Self {
        let mut builder = ReactorBuilder::new(config.name.clone());
        for listener in &config.listener {
            builder = builder.listener(listener.protocol, listener.address);
        }
        builder.negotiation_timeout(config.negotiation.timeout())
    }

    /// Accept connections speaking `protocol` on `addr`.
    pub fn listener(mut self, protocol: Protocol, addr: SocketAddr) -> Self {
        self.listeners.push((protocol, addr));
        self
    }

    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = negotiator;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Bind listeners, start the negotiation worker, and spawn the reactor
    /// thread. Parsed inbound calls are sent to `dispatcher`.
    pub fn spawn(self, dispatcher: Sender<InboundCall>) -> io::Result<ReactorClient> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, task_rx) = crossbeam_channel::unbounded();
        let handle = ReactorHandle::new(tx, waker);

        let mut listeners = Vec::with_capacity(self.listeners.len());
        let mut listen_addrs = Vec::with_capacity(self.listeners.len());
        for (i, (protocol, addr)) in self.listeners.into_iter().enumerate() {
            let std_listener = bind_listener(addr)?;
            listen_addrs.push(std_listener.local_addr()?);
            let mut listener = TcpListener::from_std(std_listener);
            poll.registry().register(
                &mut listener,
                Token(LISTENER_TOKEN_OFFSET + i),
                Interest::READABLE,
            )?;
            listeners.push((protocol, listener));
        }

        let negotiation = NegotiationPool::spawn(&self.name, self.negotiator)?;

        let reactor = Reactor {
            name: self.name.clone(),
            poll,
            events: Events::with_capacity(1024),
            conns: Slab::new(),
            next_generation: 1,
            timers: TimerWheel::new(),
            task_rx,
            handle: handle.clone(),
            listeners,
            dispatcher,
            negotiation,
            negotiation_timeout: self.negotiation_timeout,
            halting: false,
            event_buf: Vec::with_capacity(1024),
        };

        let join = thread::Builder::new()
            .name(format!("{}-reactor", self.name))
            .spawn(move || reactor.run())?;

        Ok(ReactorClient {
            handle,
            listen_addrs,
            join: Some(join),
        })
    }
}

/// Bind a non-blocking listener with address reuse.
fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Owner handle for a spawned reactor: the cross-thread handle, the bound
/// listen addresses, and the join handle. Dropping it halts the reactor.
pub struct ReactorClient {
    handle: ReactorHandle,
    listen_addrs: Vec<SocketAddr>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReactorClient {
    pub fn handle(&self) -> &ReactorHandle {
        &self.handle
    }

    /// Addresses actually bound, in listener declaration order.
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// Halt the reactor and wait for the thread to exit.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.handle.halt();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ReactorClient {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

struct Reactor {
    name: String,
    poll: Poll,
    events: Events,
    conns: Slab<Connection>,
    next_generation: u32,
    timers: TimerWheel,
    task_rx: Receiver<Task>,
    handle: ReactorHandle,
    listeners: Vec<(Protocol, TcpListener)>,
    dispatcher: Sender<InboundCall>,
    negotiation: NegotiationPool,
    negotiation_timeout: Duration,
    halting: bool,
    event_buf: Vec<(Token, bool, bool, bool, bool)>,
}

impl Reactor {
    fn run(mut self) {
        debug!(name = %self.name, "reactor running");
        loop {
            let timeout = self
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(name = %self.name, error = %e, "poll failed, stopping reactor");
                    self.halting = true;
                }
            }

            self.event_buf.clear();
            for event in self.events.iter() {
                self.event_buf.push((
                    event.token(),
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                    event.is_read_closed() || event.is_write_closed(),
                ));
            }

            for i in 0..self.event_buf.len() {
                let (token, readable, writable, is_error, closed) = self.event_buf[i];
                if token == WAKER_TOKEN {
                    continue;
                }
                if token.0 >= LISTENER_TOKEN_OFFSET {
                    self.accept_pending(token.0 - LISTENER_TOKEN_OFFSET);
                    continue;
                }
                self.conn_event(token.0, readable, writable, is_error, closed);
            }

            while let Ok(task) = self.task_rx.try_recv() {
                self.run_task(task);
            }

            let now = Instant::now();
            while let Some(kind) = self.timers.pop_expired(now) {
                self.fire_timer(kind);
            }

            if self.halting {
                self.teardown();
                return;
            }
        }
    }

    fn valid_index(&self, id: ConnId) -> Option<usize> {
        self.conns
            .get(id.index())
            .filter(|c| c.id() == id)
            .map(|_| id.index())
    }

    /// Run `f` against the connection in `index` with a fresh dispatch
    /// context; an error return destroys the connection with that status.
    fn drive<F>(&mut self, index: usize, f: F)
    where
        F: FnOnce(&mut Connection, &mut ReactorCtx<'_>) -> Result<(), RpcError>,
    {
        let err = {
            let Some(conn) = self.conns.get_mut(index) else {
                return;
            };
            let mut ctx = ReactorCtx {
                registry: self.poll.registry(),
                timers: &mut self.timers,
                now: Instant::now(),
            };
            f(conn, &mut ctx).err()
        };
        if let Some(status) = err {
            self.destroy(index, status);
        }
    }

    fn conn_event(&mut self, index: usize, readable: bool, writable: bool, is_error: bool, closed: bool) {
        self.drive(index, |conn, ctx| {
            if is_error {
                return Err(RpcError::Network(format!("{conn}: socket error event")));
            }
            if readable {
                conn.read_ready(ctx)?;
            }
            if writable {
                conn.write_ready(ctx)?;
            }
            if closed && !readable {
                return Err(RpcError::RemoteClosed);
            }
            Ok(())
        });
    }

    fn accept_pending(&mut self, listener_idx: usize) {
        loop {
            let accepted = match self.listeners.get(listener_idx) {
                Some((protocol, listener)) => (*protocol, listener.accept()),
                None => return,
            };
            match accepted {
                (protocol, Ok((stream, remote))) => {
                    let std_stream =
                        unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
                    if let Err(e) =
                        self.register_connection(std_stream, remote, Direction::Server, protocol)
                    {
                        warn!(%remote, error = %e, "failed to register accepted connection");
                    }
                }
                (_, Err(e)) if e.kind() == io::ErrorKind::WouldBlock => return,
                (_, Err(e)) => {
                    warn!(name = %self.name, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn register_connection(
        &mut self,
        stream: std::net::TcpStream,
        remote: SocketAddr,
        direction: Direction,
        protocol: Protocol,
    ) -> Result<ConnId, RpcError> {
        let _ = stream.set_nodelay(true);
        stream.set_nonblocking(true).map_err(RpcError::network)?;
        // Duplicate the socket handle for the negotiation worker before the
        // primary becomes a poller source.
        let negotiation_socket = stream.try_clone().map_err(RpcError::network)?;
        let mio_stream = mio::net::TcpStream::from_std(stream);

        let now = Instant::now();
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let entry = self.conns.vacant_entry();
        let id = ConnId::new(entry.key(), generation);
        let mut conn = Connection::new(
            id,
            mio_stream,
            remote,
            direction,
            protocol,
            self.dispatcher.clone(),
            self.handle.clone(),
            now,
        );
        {
            let mut ctx = ReactorCtx {
                registry: self.poll.registry(),
                timers: &mut self.timers,
                now,
            };
            conn.register(&mut ctx)?;
        }
        debug!(conn = %conn, ?protocol, "connection registered");
        entry.insert(conn);
        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();

        self.negotiation.submit(NegotiationJob {
            conn: id,
            socket: negotiation_socket,
            direction,
            protocol,
            deadline: now + self.negotiation_timeout,
            handle: self.handle.clone(),
        });
        Ok(id)
    }

    fn destroy(&mut self, index: usize, status: RpcError) {
        let Some(mut conn) = self.conns.try_remove(index) else {
            return;
        };
        match &status {
            RpcError::RemoteClosed => debug!(conn = %conn, "connection closed by remote end"),
            _ => warn!(conn = %conn, %status, "destroying connection"),
        }
        let mut ctx = ReactorCtx {
            registry: self.poll.registry(),
            timers: &mut self.timers,
            now: Instant::now(),
        };
        conn.shutdown(&mut ctx, status);
        CONNECTIONS_ACTIVE.decrement();
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::RegisterConn {
                stream,
                protocol,
                direction,
                reply,
            } => {
                let remote = match stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        let _ = reply.send(Err(RpcError::network(e)));
                        return;
                    }
                };
                let result = self.register_connection(stream, remote, direction, protocol);
                let _ = reply.send(result);
            }
            Task::AssignOutboundCall { conn, call } => match self.valid_index(conn) {
                Some(index) => self.drive(index, |c, ctx| c.queue_outbound_call(ctx, call)),
                None => call.set_failed(RpcError::Shutdown("connection is gone".into())),
            },
            Task::QueueTransfer { conn, transfer } => match self.valid_index(conn) {
                Some(index) => self.drive(index, |c, ctx| c.queue_outbound(ctx, transfer)),
                None => {
                    transfer.abort_detached(&RpcError::Shutdown("connection is gone".into()));
                }
            },
            Task::CompleteNegotiation { conn, status } => self.finish_negotiation(conn, status),
            Task::Dump { reply } => {
                let dumps = self.conns.iter().map(|(_, c)| c.dump()).collect();
                let _ = reply.send(dumps);
            }
            Task::Halt => self.halting = true,
        }
    }

    fn finish_negotiation(&mut self, conn: ConnId, status: Result<Option<String>, RpcError>) {
        let Some(index) = self.valid_index(conn) else {
            return;
        };
        match status {
            Ok(user) => self.drive(index, |c, ctx| {
                c.set_user(user);
                c.mark_negotiation_complete(ctx)
            }),
            Err(status) => self.destroy(index, status),
        }
    }

    fn fire_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::CallTimeout { conn, call_id } => {
                let Some(index) = self.valid_index(conn) else {
                    return;
                };
                if let Some(c) = self.conns.get_mut(index) {
                    c.handle_call_timeout(call_id);
                }
            }
        }
    }

    fn teardown(&mut self) {
        debug!(name = %self.name, "reactor tearing down");
        let status = RpcError::Shutdown("reactor shutting down".into());
        let indices: Vec<usize> = self.conns.iter().map(|(i, _)| i).collect();
        for index in indices {
            self.destroy(index, status.clone());
        }
        while let Ok(task) = self.task_rx.try_recv() {
            self.abort_task(task, &status);
        }
    }

    fn abort_task(&mut self, task: Task, status: &RpcError) {
        match task {
            Task::RegisterConn { reply, .. } => {
                let _ = reply.send(Err(status.clone()));
            }
            Task::AssignOutboundCall { call, .. } => call.set_failed(status.clone()),
            Task::QueueTransfer { transfer, .. } => transfer.abort_detached(status),
            Task::CompleteNegotiation { .. } | Task::Dump { .. } | Task::Halt => {}
        }
    }
}
