//! Active connection gauge with an RAII guard.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide count of connections currently open.
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// Guard alive for exactly as long as its connection, so the gauge stays
/// correct on every exit path including panics.
pub(super) struct ActiveConnection;

impl ActiveConnection {
    pub(super) fn new() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_connections();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::dec_connections();
    }
}

/// Current number of open connections across all event loops.
#[must_use]
pub fn active_connection_count() -> u64 { ACTIVE_CONNECTIONS.load(Ordering::Relaxed) }
