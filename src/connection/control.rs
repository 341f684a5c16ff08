//! Narrow flow-control capability handed to the exchange.
//!
//! The exchange never sees the connection that owns it; it holds a
//! [`FlowControl`] trait object and asks for pause, resume, or one of the
//! end transitions. The connection driver reads the recorded state and
//! performs the actual work on the owning thread.

use std::{cell::Cell, rc::Rc};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How an exchange asks its connection to proceed once it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAction {
    /// Shut down the send direction behind queued output; intake keeps
    /// draining and the socket stays alive.
    HalfClose,
    /// Recycle the connection: a fresh exchange consumes any buffered
    /// pipelined bytes before the next read.
    KeepAlive,
    /// Tear down both directions. Safe to request repeatedly.
    Disconnect,
}

/// Capability for pausing, resuming, and ending read delivery.
pub trait FlowControl {
    /// Stop read delivery before the next region is pinned. Idempotent.
    fn pause(&self);
    /// Re-enable reads from the exact stream position where delivery
    /// stopped. Idempotent; calling it while unpaused is a no-op.
    fn resume(&self);
    /// Record an end-of-exchange transition. The first request wins except
    /// that [`EndAction::Disconnect`] always takes precedence.
    fn end(&self, action: EndAction);
}

struct ControlState {
    paused: Cell<bool>,
    resumed: Notify,
    ended: Cell<Option<EndAction>>,
    teardown: CancellationToken,
}

/// Shared flow-control state for one connection.
///
/// Clones are cheap and all refer to the same state. Not `Send`; the only
/// cross-thread part is the teardown token.
#[derive(Clone)]
pub struct ControlHandle {
    state: Rc<ControlState>,
}

impl ControlHandle {
    /// Create flow-control state wired to `teardown`.
    #[must_use]
    pub fn new(teardown: CancellationToken) -> Self {
        Self {
            state: Rc::new(ControlState {
                paused: Cell::new(false),
                resumed: Notify::new(),
                ended: Cell::new(None),
                teardown,
            }),
        }
    }

    /// Take the recorded end transition, leaving none.
    pub(crate) fn take_end(&self) -> Option<EndAction> { self.state.ended.take() }

    /// Whether read delivery is currently paused.
    pub(crate) fn is_paused(&self) -> bool { self.state.paused.get() }

    /// Whether teardown has been requested.
    pub(crate) fn is_torn_down(&self) -> bool { self.state.teardown.is_cancelled() }

    /// Wait until read delivery is unpaused or teardown is requested.
    pub(crate) async fn wait_while_paused(&self) {
        while self.state.paused.get() && !self.state.teardown.is_cancelled() {
            let resumed = self.state.resumed.notified();
            // Re-check after registering so a resume between the loop test
            // and here is not missed.
            if !self.state.paused.get() {
                break;
            }
            tokio::select! {
                biased;
                () = self.state.teardown.cancelled() => break,
                () = resumed => {}
            }
        }
    }
}

impl FlowControl for ControlHandle {
    fn pause(&self) { self.state.paused.set(true); }

    fn resume(&self) {
        if self.state.paused.replace(false) {
            self.state.resumed.notify_waiters();
        }
    }

    fn end(&self, action: EndAction) {
        match (self.state.ended.get(), action) {
            (None, _) | (Some(_), EndAction::Disconnect) => self.state.ended.set(Some(action)),
            (Some(_), _) => {}
        }
        if action == EndAction::Disconnect {
            self.state.teardown.cancel();
        }
    }
}
