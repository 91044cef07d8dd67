//! Process-wide connection metrics.

use std::time::Duration;

use metriken::{AtomicHistogram, Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections registered"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "protocol_errors",
    description = "Total frame parse failures and duplicate call ids"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "calls_timed_out",
    description = "Total outbound calls that hit their deadline"
)]
pub static CALLS_TIMED_OUT: Counter = Counter::new();

#[metric(
    name = "outbound_transfer_latency",
    description = "Microseconds from outbound transfer enqueue to wire completion"
)]
pub static OUTBOUND_TRANSFER_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

pub(crate) fn record_outbound_transfer(elapsed: Duration) {
    let _ = OUTBOUND_TRANSFER_LATENCY.increment(elapsed.as_micros() as u64);
}
