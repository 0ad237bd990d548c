//! Fixed-capacity forward buffer with a one-record in-flight discipline.
//!
//! Each direction of a connection pair owns one of these. A buffer is
//! either *empty* (ready to receive from one leg) or *pending* (holding
//! bytes that must be fully drained to the other leg before the peer is
//! read again). That single-chunk discipline is the engine's backpressure
//! primitive and preserves byte order without multi-record queues.

use crate::error::Result;
use crate::net::{IoStep, Transport};

/// Capacity of one forward buffer.
pub const FORWARD_CAPACITY: usize = 16 * 1024;

/// Outcome of a fill or drain pass over a forward buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Fill: some bytes were received. Drain: the buffer fully emptied.
    Complete,
    /// No progress possible; retry after the next readiness signal
    WouldBlock,
    /// The transport reported orderly close. After a fill, received bytes
    /// (if any) are still pending and must be flushed.
    Disconnected,
}

/// One direction's staging area between the two legs.
pub struct ForwardBuffer {
    data: Box<[u8; FORWARD_CAPACITY]>,
    size: usize,
    read_pos: usize,
}

impl ForwardBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; FORWARD_CAPACITY]),
            size: 0,
            read_pos: 0,
        }
    }

    /// Whether the buffer holds no pending bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Receive from `transport` until the buffer is full or the transport
    /// stalls.
    ///
    /// Must only be called on an empty buffer. The amount of incoming data
    /// is unknown, so a stall after any bytes at all counts as success;
    /// a stall with nothing received is `WouldBlock`. Orderly close is
    /// reported as `Disconnected` even when bytes were received first;
    /// the caller decides how to flush them.
    pub fn fill_from<T: Transport>(&mut self, transport: &mut T) -> Result<TransferStatus> {
        debug_assert!(self.read_pos == 0 && self.size == 0);

        while self.size < FORWARD_CAPACITY {
            match transport.read(&mut self.data[self.size..])? {
                IoStep::Bytes(n) => self.size += n,
                IoStep::Closed => return Ok(TransferStatus::Disconnected),
                IoStep::WouldBlock => {
                    return Ok(if self.size == 0 {
                        TransferStatus::WouldBlock
                    } else {
                        TransferStatus::Complete
                    });
                }
            }
        }

        Ok(TransferStatus::Complete)
    }

    /// Drain pending bytes into `transport`.
    ///
    /// Unlike a fill, the byte count is known: everything pending must go
    /// out before the buffer is reusable, so a stall mid-drain is
    /// `WouldBlock` with all state kept for the next writable signal. A
    /// full drain resets the buffer.
    pub fn drain_to<T: Transport>(&mut self, transport: &mut T) -> Result<TransferStatus> {
        debug_assert!(self.size > 0 && self.read_pos < self.size);

        while self.read_pos < self.size {
            match transport.write(&self.data[self.read_pos..self.size])? {
                IoStep::Bytes(n) => self.read_pos += n,
                IoStep::WouldBlock => return Ok(TransferStatus::WouldBlock),
                IoStep::Closed => return Ok(TransferStatus::Disconnected),
            }
        }

        self.read_pos = 0;
        self.size = 0;

        Ok(TransferStatus::Complete)
    }
}

impl Default for ForwardBuffer {
    fn default() -> Self {
        Self::new()
    }
}
