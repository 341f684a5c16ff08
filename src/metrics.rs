//! Metric helpers for `hawser`.
//!
//! This module defines metric names and simple helper functions wrapping
//! the [`metrics`](https://docs.rs/metrics) crate. When the `metrics`
//! feature is disabled every helper compiles to a no-op so call sites stay
//! unconditional.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking active connections.
pub const CONNECTIONS_ACTIVE: &str = "hawser_connections_active";
/// Name of the counter tracking completed request/response exchanges.
pub const EXCHANGES_COMPLETED: &str = "hawser_exchanges_completed_total";
/// Name of the counter tracking bytes moved through sockets.
pub const SOCKET_BYTES: &str = "hawser_socket_bytes_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "hawser_errors_total";

/// Direction of socket traffic.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Bytes read from the peer.
    Inbound,
    /// Bytes written to the peer.
    Outbound,
}

#[cfg(feature = "metrics")]
impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
#[cfg(feature = "metrics")]
pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

/// Decrement the active connections gauge.
#[cfg(feature = "metrics")]
pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

/// Record a completed exchange.
#[cfg(feature = "metrics")]
pub fn inc_exchanges() { counter!(EXCHANGES_COMPLETED).increment(1); }

/// Record bytes moved for the given direction.
#[cfg(feature = "metrics")]
pub fn add_socket_bytes(direction: Direction, count: u64) {
    counter!(SOCKET_BYTES, "direction" => direction.as_str()).increment(count);
}

/// Record an error occurrence.
#[cfg(feature = "metrics")]
pub fn inc_errors() { counter!(ERRORS_TOTAL).increment(1); }

#[cfg(not(feature = "metrics"))]
pub fn inc_connections() {}

#[cfg(not(feature = "metrics"))]
pub fn dec_connections() {}

#[cfg(not(feature = "metrics"))]
pub fn inc_exchanges() {}

#[cfg(not(feature = "metrics"))]
pub fn add_socket_bytes(_direction: Direction, _count: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn inc_errors() {}
