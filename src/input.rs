//! Per-connection intake store with a pin/commit write discipline.
//!
//! The read driver pins a writable region, fills it from the socket, then
//! commits however many bytes arrived; the exchange reads the committed
//! window without copying. Writer and reader both live on the connection's
//! owning thread, so no synchronisation is involved. Committed bytes may be
//! compacted to the front of the store, but only inside [`InputBuffer::pin`]
//! while no reader borrow can exist; a reader mid-parse never observes
//! relocation.

use thiserror::Error;

use crate::pool::Lease;

/// Errors raised by the intake store.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum InputError {
    /// A region was pinned after the remote end of stream was recorded.
    #[error("pin requested after end of stream")]
    PinAfterFin,
    /// A region was pinned while an earlier pin was still outstanding.
    #[error("pin requested while a region is already pinned")]
    AlreadyPinned,
    /// Bytes were committed with no outstanding pin.
    #[error("commit without a pinned region")]
    CommitWithoutPin,
    /// More bytes were committed than the pinned region holds.
    #[error("committed {committed} bytes but only {pinned} were pinned")]
    CommitOverrun { committed: usize, pinned: usize },
    /// Growing the store would exceed the per-connection cap.
    #[error("intake store needs {needed} bytes, cap is {max}")]
    CapacityExceeded { needed: usize, max: usize },
}

/// Append-only byte store shared by the read driver and the exchange.
///
/// Layout: `store[read_pos..write_pos]` is the committed, unconsumed window;
/// `store[write_pos..]` is spare tail handed out by [`pin`](Self::pin).
/// `commit(0)` latches the end-of-stream flag permanently.
pub struct InputBuffer {
    store: Lease,
    read_pos: usize,
    write_pos: usize,
    pinned: Option<usize>,
    eof: bool,
    max_capacity: usize,
}

impl InputBuffer {
    /// Wrap a pool lease as the backing store.
    ///
    /// `max_capacity` bounds the initialised store length; a connection whose
    /// intake would pass it is ended rather than allowed to grow unbounded.
    #[must_use]
    pub fn new(store: Lease, max_capacity: usize) -> Self {
        Self {
            store,
            read_pos: 0,
            write_pos: 0,
            pinned: None,
            eof: false,
            max_capacity,
        }
    }

    /// Pin a writable region of at least `min` bytes.
    ///
    /// Returns the whole spare tail, which is at least `min` bytes long.
    /// Nothing in the region is visible to the reader until committed.
    ///
    /// # Errors
    /// Fails after end of stream, while a pin is outstanding, or when growth
    /// would pass the cap.
    pub fn pin(&mut self, min: usize) -> Result<&mut [u8], InputError> {
        if self.eof {
            return Err(InputError::PinAfterFin);
        }
        if self.pinned.is_some() {
            return Err(InputError::AlreadyPinned);
        }
        // A fully drained window costs nothing to rewind.
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        if self.store.len() - self.write_pos < min {
            self.make_room(min)?;
        }
        let end = self.store.len();
        self.pinned = Some(end - self.write_pos);
        Ok(&mut self.store[self.write_pos..end])
    }

    /// Commit the first `n` bytes of the pinned region.
    ///
    /// `n == 0` records the remote end of stream; no pin is issued again for
    /// this connection.
    ///
    /// # Errors
    /// Fails when no pin is outstanding or `n` overruns the pinned length.
    pub fn commit(&mut self, n: usize) -> Result<(), InputError> {
        let Some(pinned) = self.pinned.take() else {
            return Err(InputError::CommitWithoutPin);
        };
        if n > pinned {
            self.pinned = Some(pinned);
            return Err(InputError::CommitOverrun {
                committed: n,
                pinned,
            });
        }
        if n == 0 {
            self.eof = true;
        } else {
            self.write_pos += n;
        }
        Ok(())
    }

    /// The committed, unconsumed window. Peeking never advances the cursor.
    #[must_use]
    pub fn buffered(&self) -> &[u8] { &self.store[self.read_pos..self.write_pos] }

    /// Bytes currently readable.
    #[must_use]
    pub fn available(&self) -> usize { self.write_pos - self.read_pos }

    /// Advance the read cursor past `n` bytes.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(
            n <= self.available(),
            "consume overran the committed window"
        );
        self.read_pos = (self.read_pos + n).min(self.write_pos);
    }

    /// Whether the remote end of stream has been recorded.
    #[must_use]
    pub fn is_eof(&self) -> bool { self.eof }

    /// Current initialised store length.
    #[must_use]
    pub fn store_len(&self) -> usize { self.store.len() }

    /// Compact and grow so the spare tail holds at least `min` bytes.
    fn make_room(&mut self, min: usize) -> Result<(), InputError> {
        // Compaction is safe here: pin holds &mut self, so no reader borrow
        // is alive.
        if self.read_pos > 0 {
            self.store.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        }
        let spare = self.store.len() - self.write_pos;
        if spare >= min {
            return Ok(());
        }
        let needed = self.write_pos + min;
        if needed > self.max_capacity {
            return Err(InputError::CapacityExceeded {
                needed,
                max: self.max_capacity,
            });
        }
        // Double up to the cap so growth stays amortised, never per-call.
        let target = needed.max(self.store.len() * 2).min(self.max_capacity);
        self.store.resize(target, 0);
        Ok(())
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuffer")
            .field("available", &self.available())
            .field("store_len", &self.store.len())
            .field("pinned", &self.pinned)
            .field("eof", &self.eof)
            .finish()
    }
}
