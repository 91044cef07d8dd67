//! Connection-level error kinds.

/// Errors produced by the connection core.
///
/// The type is cheap to clone so one shutdown status can fan out to every
/// pending call and queued transfer on a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Socket read/write failure or an error readiness event.
    #[error("network error: {0}")]
    Network(String),
    /// The peer closed the connection. Logged quieter than other network
    /// failures but tears the connection down all the same.
    #[error("closed by remote end")]
    RemoteClosed,
    /// Frame parse failure, or a duplicate call id from the peer.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A per-call deadline expired. Local to the call; the connection stays
    /// open.
    #[error("call timed out")]
    TimedOut,
    /// Tear-down was initiated for a reason other than this connection's own
    /// I/O, e.g. the reactor is stopping.
    #[error("shut down: {0}")]
    Shutdown(String),
    /// Malformed negotiation exchange.
    #[error("corrupt negotiation: {0}")]
    Corruption(String),
}

impl RpcError {
    pub(crate) fn network(err: std::io::Error) -> Self {
        RpcError::Network(err.to_string())
    }
}
