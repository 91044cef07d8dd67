//! Connection negotiation, run off the reactor thread.
//!
//! After a connection registers with its reactor, a negotiation worker
//! drives the authentication exchange directly on a duplicated socket
//! handle and reports the outcome back as a reactor task. The exchange
//! itself is opaque to the core: a [`Negotiator`] does whatever its
//! protocol requires and eventually succeeds or fails.
//!
//! The worker flips the socket to blocking mode for the duration of the
//! exchange and restores non-blocking mode before reporting. The blocking
//! flag is shared with the reactor's handle to the same socket, which is
//! safe because the reactor ignores the connection's readiness until
//! negotiation completes.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::connection::{Direction, Protocol};
use crate::error::RpcError;
use crate::reactor::{ConnId, ReactorHandle};

/// Result of a successful exchange.
#[derive(Debug, Clone, Default)]
pub struct NegotiationOutcome {
    /// Authenticated user, if the exchange established one.
    pub user: Option<String>,
}

/// An opaque negotiation driver.
pub trait Negotiator: Send + Sync {
    /// Run the handshake on `socket`, which is in blocking mode with read
    /// and write timeouts set to the remaining deadline budget.
    fn negotiate(
        &self,
        socket: &mut std::net::TcpStream,
        direction: Direction,
        protocol: Protocol,
        deadline: Instant,
    ) -> Result<NegotiationOutcome, RpcError>;
}

/// Accepts every connection without exchanging any bytes.
pub struct NoopNegotiator;

impl Negotiator for NoopNegotiator {
    fn negotiate(
        &self,
        _socket: &mut std::net::TcpStream,
        _direction: Direction,
        _protocol: Protocol,
        _deadline: Instant,
    ) -> Result<NegotiationOutcome, RpcError> {
        Ok(NegotiationOutcome::default())
    }
}

pub(crate) struct NegotiationJob {
    pub conn: ConnId,
    pub socket: std::net::TcpStream,
    pub direction: Direction,
    pub protocol: Protocol,
    pub deadline: Instant,
    pub handle: ReactorHandle,
}

/// The per-reactor negotiation worker thread.
pub(crate) struct NegotiationPool {
    tx: Sender<NegotiationJob>,
}

impl NegotiationPool {
    pub(crate) fn spawn(name: &str, negotiator: Arc<dyn Negotiator>) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name(format!("{name}-negotiator"))
            .spawn(move || worker(rx, negotiator))?;
        Ok(NegotiationPool { tx })
    }

    pub(crate) fn submit(&self, job: NegotiationJob) {
        let _ = self.tx.send(job);
    }
}

fn worker(rx: Receiver<NegotiationJob>, negotiator: Arc<dyn Negotiator>) {
    while let Ok(mut job) = rx.recv() {
        let status = run_one(&*negotiator, &mut job);
        if let Err(e) = &status {
            debug!(conn = ?job.conn, error = %e, "negotiation failed");
        }
        job.handle.complete_negotiation(job.conn, status);
    }
}

fn run_one(
    negotiator: &dyn Negotiator,
    job: &mut NegotiationJob,
) -> Result<Option<String>, RpcError> {
    let remaining = job.deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(RpcError::TimedOut);
    }
    job.socket.set_nonblocking(false).map_err(RpcError::network)?;
    job.socket
        .set_read_timeout(Some(remaining))
        .map_err(RpcError::network)?;
    job.socket
        .set_write_timeout(Some(remaining))
        .map_err(RpcError::network)?;

    let outcome = negotiator.negotiate(&mut job.socket, job.direction, job.protocol, job.deadline);

    // Restore non-blocking mode before the reactor resumes I/O on its
    // handle to the same socket.
    job.socket.set_nonblocking(true).map_err(RpcError::network)?;
    outcome.map(|o| o.user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_negotiator_accepts_without_io() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _peer = std::net::TcpStream::connect(addr).unwrap();
        let (mut local, _) = listener.accept().unwrap();
        let outcome = NoopNegotiator
            .negotiate(
                &mut local,
                Direction::Server,
                Protocol::Yb,
                Instant::now() + std::time::Duration::from_secs(1),
            )
            .unwrap();
        assert!(outcome.user.is_none());
    }
}
