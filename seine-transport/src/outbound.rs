//! The per-channel outbound queue with high/low watermark accounting.

use std::collections::VecDeque;

use seine_buffer::ByteBuf;

/// Queue of messages accepted by `write` but not yet on the wire.
///
/// `flush` marks the current backlog as flushed; the transport then drains
/// flushed entries only, so writes enqueued after a flush wait for the
/// next one. Pending-byte accounting drives the channel's writability: it
/// flips to `false` when the total exceeds the high watermark and back to
/// `true` when it sinks below the low watermark, each edge exactly once.
pub(crate) struct OutboundQueue {
    entries: VecDeque<ByteBuf>,
    /// How many head entries the next transmit pass may consume.
    flushed: usize,
    pending_bytes: usize,
    high_water: usize,
    low_water: usize,
    writable: bool,
}

impl OutboundQueue {
    pub(crate) fn new(high_water: usize, low_water: usize) -> Self {
        debug_assert!(low_water <= high_water);
        OutboundQueue {
            entries: VecDeque::new(),
            flushed: 0,
            pending_bytes: 0,
            high_water,
            low_water,
            writable: true,
        }
    }

    /// Appends a message. Returns `Some(new_writability)` when this push
    /// crossed the high watermark.
    pub(crate) fn push(&mut self, buf: ByteBuf) -> Option<bool> {
        self.pending_bytes += buf.readable_bytes();
        self.entries.push_back(buf);
        if self.writable && self.pending_bytes > self.high_water {
            self.writable = false;
            return Some(false);
        }
        None
    }

    /// Marks the whole backlog as eligible for transmission.
    pub(crate) fn mark_flushed(&mut self) {
        self.flushed = self.entries.len();
    }

    pub(crate) fn has_flushed(&self) -> bool {
        self.flushed > 0
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut ByteBuf> {
        if self.flushed == 0 {
            None
        } else {
            self.entries.front_mut()
        }
    }

    /// Drops the fully transmitted head entry.
    pub(crate) fn pop_front(&mut self) {
        debug_assert!(self.flushed > 0);
        self.entries.pop_front();
        self.flushed -= 1;
    }

    /// Accounts `n` transmitted bytes. Returns `Some(new_writability)`
    /// when this recovery crossed the low watermark.
    pub(crate) fn consumed(&mut self, n: usize) -> Option<bool> {
        debug_assert!(n <= self.pending_bytes);
        self.pending_bytes -= n;
        if !self.writable && self.pending_bytes < self.low_water {
            self.writable = true;
            return Some(true);
        }
        None
    }

    /// Takes every flushed entry at once (in-process transports deliver
    /// them wholesale instead of byte-by-byte).
    pub(crate) fn take_flushed(&mut self) -> Vec<ByteBuf> {
        let mut out = Vec::with_capacity(self.flushed);
        while self.flushed > 0 {
            if let Some(buf) = self.entries.pop_front() {
                out.push(buf);
            }
            self.flushed -= 1;
        }
        out
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops everything (channel teardown). Buffers release on drop.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.flushed = 0;
        self.pending_bytes = 0;
    }
}
