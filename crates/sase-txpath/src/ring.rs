//! Per-(device, worker) TX ring
//!
//! Head and tail are free-running `u32` counters; the slot for a counter is
//! `counter % capacity`, computed only when the array is touched. Both
//! counters live in a single `AtomicU64` so that a [`BacklogProbe`] held by
//! another thread always reads a consistent pair.
//!
//! Only the owning worker mutates the ring.

use crate::buffer::BufferIndex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[inline(always)]
fn pack(head: u32, tail: u32) -> u64 {
    ((head as u64) << 32) | tail as u64
}

#[inline(always)]
fn unpack(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

/// Head/tail pair shared with probes
#[derive(Debug, Default)]
struct Counters(AtomicU64);

impl Counters {
    #[inline(always)]
    fn load(&self) -> (u32, u32) {
        unpack(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    fn store(&self, head: u32, tail: u32) {
        self.0.store(pack(head, tail), Ordering::Release);
    }
}

/// Fixed-capacity ring of device-native packet handles
pub struct TxRing {
    slots: Box<[BufferIndex]>,
    counters: Arc<Counters>,
}

impl TxRing {
    /// Create an empty ring
    pub fn new(capacity: u32) -> Self {
        assert!(capacity >= 2, "tx ring needs at least two slots");
        Self {
            slots: vec![BufferIndex::INVALID; capacity as usize].into_boxed_slice(),
            counters: Arc::new(Counters::default()),
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Next counter to fill
    #[inline(always)]
    pub fn head(&self) -> u32 {
        self.counters.load().0
    }

    /// Next counter to drain
    #[inline(always)]
    pub fn tail(&self) -> u32 {
        self.counters.load().1
    }

    /// Packets staged but not yet handed to the device
    #[inline(always)]
    pub fn backlog(&self) -> u32 {
        let (head, tail) = self.counters.load();
        head.wrapping_sub(tail)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.backlog() == 0
    }

    /// Slot index of the head counter
    #[inline(always)]
    pub fn head_index(&self) -> u32 {
        self.head() % self.capacity()
    }

    /// Slot index of the tail counter
    #[inline(always)]
    pub fn tail_index(&self) -> u32 {
        self.tail() % self.capacity()
    }

    /// Write `handle` at `offset` slots past the head, without publishing it
    #[inline(always)]
    pub fn stage(&mut self, offset: u32, handle: BufferIndex) {
        let idx = self.head().wrapping_add(offset) % self.capacity();
        self.slots[idx as usize] = handle;
    }

    /// Publish `n` staged handles
    #[inline]
    pub fn advance_head(&mut self, n: u32) {
        let (head, tail) = self.counters.load();
        let head = head.wrapping_add(n);
        debug_assert!(head.wrapping_sub(tail) < self.capacity());
        self.counters.store(head, tail);
    }

    /// Retire `n` handles from the tail
    #[inline]
    pub fn advance_tail(&mut self, n: u32) {
        let (head, tail) = self.counters.load();
        debug_assert!(n <= head.wrapping_sub(tail));
        self.counters.store(head, tail.wrapping_add(n));
    }

    /// Compact: back to an empty ring at counter 0
    #[inline]
    pub fn reset(&mut self) {
        self.counters.store(0, 0);
    }

    /// Contiguous slots starting at slot index `start`
    #[inline(always)]
    pub fn slots(&self, start: u32, len: u32) -> &[BufferIndex] {
        &self.slots[start as usize..(start + len) as usize]
    }

    /// Handle stored for the given counter
    #[inline(always)]
    pub fn at(&self, counter: u32) -> BufferIndex {
        self.slots[(counter % self.capacity()) as usize]
    }

    /// Handles from tail to head, oldest first
    pub fn pending(&self) -> impl Iterator<Item = BufferIndex> + '_ {
        let (head, tail) = self.counters.load();
        (0..head.wrapping_sub(tail)).map(move |i| self.at(tail.wrapping_add(i)))
    }

    /// Read-only view of the backlog usable from any thread
    pub fn probe(&self) -> BacklogProbe {
        BacklogProbe {
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Cross-thread backlog reader for a ring
#[derive(Clone, Debug)]
pub struct BacklogProbe {
    counters: Arc<Counters>,
}

impl BacklogProbe {
    /// Current backlog (`head - tail`)
    #[inline]
    pub fn backlog(&self) -> u32 {
        let (head, tail) = self.counters.load();
        head.wrapping_sub(tail)
    }
}
