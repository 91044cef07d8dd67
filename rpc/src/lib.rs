//! Connection core of a multi-protocol RPC runtime.
//!
//! A single process accepts and originates connections carrying three wire
//! protocols simultaneously: an internal length-prefixed RPC protocol, a
//! Redis-style request/reply protocol, and a binary SQL protocol. Each
//! connection is a per-socket state machine driven by one reactor thread:
//! it frames inbound bytes into calls, correlates client calls with their
//! responses, enforces per-call timeouts, and tears itself down cleanly on
//! any error.
//!
//! Connections are single-owner: after registration, only the owning
//! reactor thread touches them. Service workers respond to inbound calls
//! and negotiation workers report handshake results by scheduling reactor
//! tasks, never by mutating connection state directly.

pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod negotiation;
pub mod reactor;
pub mod transfer;

pub use call::{CallState, InboundCall, InboundRequest, OutboundCall};
pub use config::{Config, ConfigError, ListenerConfig, LogFormat, LoggingConfig};
pub use connection::{ClientCallDump, ConnectionDump, Direction, DumpState, Protocol};
pub use error::RpcError;
pub use negotiation::{NegotiationOutcome, Negotiator, NoopNegotiator};
pub use reactor::{ConnId, ReactorBuilder, ReactorClient, ReactorHandle};
pub use transfer::{InboundTransfer, OutboundTransfer};
