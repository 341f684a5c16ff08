//! Ordered outbound queue decoupling response production from transmission.
//!
//! Producers enqueue leased byte ranges without blocking; a single writer
//! task owns the socket's send half and transmits ranges strictly in
//! submission order. Each lease is dropped only after its bytes are on the
//! wire, which is what returns the block to the pool. The queue also tracks
//! unsent bytes so intake can pause above a threshold and resume once the
//! writer drains below it.

use std::{cell::Cell, rc::Rc};

use log::{debug, warn};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::control::{EndAction, FlowControl},
    metrics,
    pool::Lease,
    registry::ConnectionId,
};

/// Errors surfaced to producers.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum OutputError {
    /// The writer task has already terminated.
    #[error("output queue closed")]
    Closed,
}

enum OutItem {
    /// Bytes to transmit; the lease is released on completion.
    Data(Lease),
    /// Shut down the send direction once everything before it is written.
    FinishSend,
}

/// Producer handle for the outbound queue.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<OutItem>,
    backlog: Rc<Cell<usize>>,
    limit: usize,
}

impl Outbound {
    /// Enqueue an owned byte range for ordered transmission.
    ///
    /// Never blocks; the cooperative backpressure contract is that the
    /// producer checks [`over_backlog`](Self::over_backlog) afterwards and
    /// pauses intake itself.
    ///
    /// # Errors
    /// [`OutputError::Closed`] when the writer task is gone; the lease is
    /// released back to the pool in that case.
    pub fn write(&self, lease: Lease) -> Result<(), OutputError> {
        self.backlog.set(self.backlog.get() + lease.len());
        self.tx
            .send(OutItem::Data(lease))
            .map_err(|_| OutputError::Closed)
    }

    /// Queue a half-close of the send direction behind pending data.
    ///
    /// # Errors
    /// [`OutputError::Closed`] when the writer task is gone.
    pub fn finish_send(&self) -> Result<(), OutputError> {
        self.tx
            .send(OutItem::FinishSend)
            .map_err(|_| OutputError::Closed)
    }

    /// Whether unsent bytes exceed the pause threshold.
    #[must_use]
    pub fn over_backlog(&self) -> bool { self.backlog.get() > self.limit }

    /// Bytes enqueued but not yet written to the socket.
    #[must_use]
    pub fn backlog_bytes(&self) -> usize { self.backlog.get() }
}

/// Consumer half; owns the socket's send direction while running.
pub(crate) struct Writer {
    rx: mpsc::UnboundedReceiver<OutItem>,
    backlog: Rc<Cell<usize>>,
    limit: usize,
}

/// Create a connected producer/writer pair.
pub(crate) fn outbound(limit: usize) -> (Outbound, Writer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Rc::new(Cell::new(0));
    (
        Outbound {
            tx,
            backlog: Rc::clone(&backlog),
            limit,
        },
        Writer {
            rx,
            backlog,
            limit,
        },
    )
}

impl Writer {
    /// Transmit queued items until the queue closes, the send direction is
    /// shut down, or the connection is torn down.
    ///
    /// Runs on the connection's owning thread. Undelivered leases are
    /// released when the queue drops.
    pub(crate) async fn run(
        mut self,
        mut socket: OwnedWriteHalf,
        control: Rc<dyn FlowControl>,
        shutdown: CancellationToken,
        id: ConnectionId,
    ) {
        loop {
            let item = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                item = self.rx.recv() => item,
            };
            match item {
                None => break,
                Some(OutItem::Data(lease)) => {
                    let was_over = self.backlog.get() > self.limit;
                    let written = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        res = socket.write_all(&lease) => res,
                    };
                    if let Err(err) = written {
                        warn!("connection write failed: id={id:?}, error={err}");
                        metrics::inc_errors();
                        control.end(EndAction::Disconnect);
                        break;
                    }
                    let len = lease.len();
                    metrics::add_socket_bytes(metrics::Direction::Outbound, len as u64);
                    self.backlog.set(self.backlog.get() - len);
                    // Completion releases the block back to the pool.
                    drop(lease);
                    if was_over && self.backlog.get() <= self.limit {
                        control.resume();
                    }
                }
                Some(OutItem::FinishSend) => {
                    // Ordered behind all queued data; only the send
                    // direction closes, intake keeps draining.
                    if let Err(err) = socket.shutdown().await {
                        debug!("send shutdown failed: id={id:?}, error={err}");
                    }
                    break;
                }
            }
        }
    }
}
