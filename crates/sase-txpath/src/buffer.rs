//! Packet Buffer Pool
//!
//! Pre-allocated per-socket packet buffers shared by the forwarding pipeline
//! and the TX path.
//!
//! # Design
//!
//! - Pre-allocated buffer pool (no runtime allocation)
//! - Buffers are named by a [`BufferIndex`]; the pool that owns a buffer is
//!   encoded in the index, so any core can free any buffer
//! - Each buffer carries two views of the same bytes: the pipeline view
//!   (`current_data` / `current_length`) and the device-native header
//!   ([`MbufHeader`]) that drivers read. The TX path reconciles the two.
//! - Supports scatter-gather chains for jumbo frames

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes per buffer including headroom
pub const BUFFER_SIZE: usize = 2048;

/// Headroom reserved in front of packet data
pub const HEADROOM: u16 = 128;

/// Packet bytes that fit in one segment
pub const SEGMENT_DATA_SIZE: usize = BUFFER_SIZE - HEADROOM as usize;

/// Buffer has been marked for tracing by an upstream node
pub const BUFFER_IS_TRACED: u32 = 1 << 0;

/// Handle naming a buffer: pool id in the top byte, slot in the rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BufferIndex(u32);

impl BufferIndex {
    const SLOT_BITS: u32 = 24;
    const SLOT_MASK: u32 = (1 << Self::SLOT_BITS) - 1;

    /// Placeholder for empty ring slots; never handed out by a pool
    pub const INVALID: Self = Self(u32::MAX);

    #[inline(always)]
    pub fn new(pool: u8, slot: u32) -> Self {
        debug_assert!(slot <= Self::SLOT_MASK);
        Self(((pool as u32) << Self::SLOT_BITS) | slot)
    }

    #[inline(always)]
    pub fn pool(self) -> u8 {
        (self.0 >> Self::SLOT_BITS) as u8
    }

    #[inline(always)]
    pub fn slot(self) -> u32 {
        self.0 & Self::SLOT_MASK
    }

    #[inline(always)]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Device-native packet header, as handed to drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbufHeader {
    /// Offset of packet data from the start of the buffer
    pub data_off: u16,
    /// Bytes in this segment
    pub data_len: u16,
    /// Bytes in the whole packet (first segment only)
    pub pkt_len: u32,
    /// Segments in the packet (first segment only)
    pub nb_segs: u8,
    /// Input port
    pub port: u16,
}

impl Default for MbufHeader {
    fn default() -> Self {
        Self {
            data_off: HEADROOM,
            data_len: 0,
            pkt_len: 0,
            nb_segs: 1,
            port: 0,
        }
    }
}

/// Packet buffer
pub struct PacketBuffer {
    /// Own index
    index: BufferIndex,
    /// Device-native header
    pub mbuf: MbufHeader,
    /// Start of packet data relative to the end of the headroom (may be negative)
    pub current_data: i16,
    /// Bytes of packet data in this segment
    pub current_length: u16,
    /// Additional logical owners sharing this buffer
    pub clone_count: u8,
    /// BUFFER_* flags
    pub flags: u32,
    /// Interface the packet is being sent on
    pub sw_if_index_tx: u32,
    /// Next segment
    next: Option<BufferIndex>,
    /// Raw bytes, headroom included
    data: Box<[u8]>,
}

impl PacketBuffer {
    fn new(index: BufferIndex) -> Self {
        Self {
            index,
            mbuf: MbufHeader::default(),
            current_data: 0,
            current_length: 0,
            clone_count: 0,
            flags: 0,
            sw_if_index_tx: 0,
            next: None,
            data: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Reset buffer
    #[inline]
    fn reset(&mut self) {
        self.mbuf = MbufHeader::default();
        self.current_data = 0;
        self.current_length = 0;
        self.clone_count = 0;
        self.flags = 0;
        self.sw_if_index_tx = 0;
        self.next = None;
    }

    /// Get index in pool
    #[inline(always)]
    pub fn index(&self) -> BufferIndex {
        self.index
    }

    /// Next segment, if any
    #[inline(always)]
    pub fn next(&self) -> Option<BufferIndex> {
        self.next
    }

    /// Link a following segment
    #[inline]
    pub fn set_next(&mut self, next: Option<BufferIndex>) {
        self.next = next;
    }

    #[inline(always)]
    fn data_start(&self) -> usize {
        (HEADROOM as i32 + self.current_data as i32) as usize
    }

    /// Packet data as the pipeline sees it
    #[inline]
    pub fn data(&self) -> &[u8] {
        let start = self.data_start();
        &self.data[start..start + self.current_length as usize]
    }

    /// Mutable packet data as the pipeline sees it
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let start = self.data_start();
        let end = start + self.current_length as usize;
        &mut self.data[start..end]
    }

    /// Packet data as the device sees it
    #[inline]
    pub fn mbuf_data(&self) -> &[u8] {
        let start = self.mbuf.data_off as usize;
        let end = (start + self.mbuf.data_len as usize).min(BUFFER_SIZE);
        &self.data[start..end]
    }

    /// Whole backing array, headroom included
    #[inline(always)]
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the segment payload. Both views are set consistently.
    pub fn fill(&mut self, payload: &[u8]) {
        assert!(payload.len() <= SEGMENT_DATA_SIZE, "payload exceeds segment");
        let start = HEADROOM as usize;
        self.data[start..start + payload.len()].copy_from_slice(payload);
        self.current_data = 0;
        self.current_length = payload.len() as u16;
        self.mbuf.data_off = HEADROOM;
        self.mbuf.data_len = payload.len() as u16;
        self.mbuf.pkt_len = payload.len() as u32;
    }

    /// Move the start of data by `n` bytes (negative grows into headroom).
    ///
    /// Only the pipeline view changes; the native header is reconciled at TX.
    pub fn advance(&mut self, n: i16) -> bool {
        let start = self.current_data as i32 + n as i32;
        let len = self.current_length as i32 - n as i32;
        if start < -(HEADROOM as i32) || len < 0 {
            return false;
        }
        self.current_data = start as i16;
        self.current_length = len as u16;
        true
    }

    /// Drop `len` bytes from the end of the segment (pipeline view only)
    pub fn trim(&mut self, len: u16) -> bool {
        if self.current_length < len {
            return false;
        }
        self.current_length -= len;
        true
    }

    #[inline(always)]
    pub fn is_traced(&self) -> bool {
        self.flags & BUFFER_IS_TRACED != 0
    }

    #[inline(always)]
    pub fn set_traced(&mut self, traced: bool) {
        if traced {
            self.flags |= BUFFER_IS_TRACED;
        } else {
            self.flags &= !BUFFER_IS_TRACED;
        }
    }
}

/// Buffer pool for one socket
pub struct BufferPool {
    pool_id: u8,
    socket_id: u8,
    /// Pool of buffers
    slots: Box<[Mutex<PacketBuffer>]>,
    /// Free slot stack
    free_list: Mutex<Vec<u32>>,
    /// Total allocated
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Create new buffer pool
    pub fn new(pool_id: u8, socket_id: u8, size: usize) -> Self {
        let slots = (0..size)
            .map(|i| Mutex::new(PacketBuffer::new(BufferIndex::new(pool_id, i as u32))))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Reverse so that the lowest slots are handed out first
        let free_list = (0..size as u32).rev().collect();

        Self {
            pool_id,
            socket_id,
            slots,
            free_list: Mutex::new(free_list),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate a buffer
    #[inline]
    pub fn alloc(&self) -> Option<BufferIndex> {
        let slot = self.free_list.lock().pop()?;
        self.slots[slot as usize].lock().reset();
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(BufferIndex::new(self.pool_id, slot))
    }

    #[inline]
    fn release(&self, slot: u32) {
        self.free_list.lock().push(slot);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Lock a buffer owned by this pool
    #[inline]
    pub fn get(&self, bi: BufferIndex) -> MutexGuard<'_, PacketBuffer> {
        debug_assert_eq!(bi.pool(), self.pool_id);
        self.slots[bi.slot() as usize].lock()
    }

    /// Get available count
    pub fn available(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Get allocated count
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get pool size
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn socket_id(&self) -> u8 {
        self.socket_id
    }
}

/// The set of per-socket pools
pub struct BufferPools {
    pools: Vec<BufferPool>,
}

impl BufferPools {
    /// One pool of `per_socket` buffers for each socket
    pub fn new(num_sockets: usize, per_socket: usize) -> Self {
        assert!(num_sockets > 0 && num_sockets <= u8::MAX as usize);
        let pools = (0..num_sockets)
            .map(|s| BufferPool::new(s as u8, s as u8, per_socket))
            .collect();
        Self { pools }
    }

    pub fn num_sockets(&self) -> usize {
        self.pools.len()
    }

    /// Pool serving `socket`
    #[inline]
    pub fn for_socket(&self, socket: u8) -> &BufferPool {
        &self.pools[socket as usize % self.pools.len()]
    }

    /// Allocate from the pool local to `socket`
    #[inline]
    pub fn alloc(&self, socket: u8) -> Option<BufferIndex> {
        self.for_socket(socket).alloc()
    }

    /// Lock any buffer
    #[inline]
    pub fn get(&self, bi: BufferIndex) -> MutexGuard<'_, PacketBuffer> {
        self.pools[bi.pool() as usize].get(bi)
    }

    /// Free a packet (all segments).
    ///
    /// A shared packet (clone count > 0) loses one owner instead of being
    /// released.
    pub fn free(&self, bi: BufferIndex) {
        let mut next = {
            let mut head = self.get(bi);
            if head.clone_count > 0 {
                head.clone_count -= 1;
                return;
            }
            head.next.take()
        };
        self.pools[bi.pool() as usize].release(bi.slot());

        while let Some(seg) = next {
            next = self.get(seg).next.take();
            self.pools[seg.pool() as usize].release(seg.slot());
        }
    }

    /// Free a batch of packets
    pub fn free_many(&self, buffers: &[BufferIndex]) {
        for &bi in buffers {
            self.free(bi);
        }
    }

    /// Sum of `current_length` over the chain starting at `bi`
    pub fn length_in_chain(&self, bi: BufferIndex) -> u32 {
        let head = self.get(bi);
        self.length_in_chain_locked(&head)
    }

    /// Chain length for a packet whose head segment the caller already holds
    pub fn length_in_chain_locked(&self, head: &PacketBuffer) -> u32 {
        let mut total = head.current_length as u32;
        let mut cur = head.next;
        while let Some(seg) = cur {
            let b = self.get(seg);
            total += b.current_length as u32;
            cur = b.next;
        }
        total
    }

    /// Allocate a packet holding `payload`, chained across as many segments
    /// as needed. Returns `None` (and frees any partial chain) if the pool
    /// runs dry.
    pub fn alloc_packet(&self, socket: u8, payload: &[u8]) -> Option<BufferIndex> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(SEGMENT_DATA_SIZE).collect()
        };
        if chunks.len() > u8::MAX as usize {
            return None;
        }

        let mut segs = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let Some(bi) = self.alloc(socket) else {
                for &seg in &segs {
                    self.free(seg);
                }
                return None;
            };
            self.get(bi).fill(chunk);
            segs.push(bi);
        }

        for pair in segs.windows(2) {
            self.get(pair[0]).next = Some(pair[1]);
        }
        let head = segs[0];
        {
            let mut b = self.get(head);
            b.mbuf.pkt_len = payload.len() as u32;
            b.mbuf.nb_segs = segs.len() as u8;
        }
        Some(head)
    }

    /// Concatenated pipeline-view bytes of a packet
    pub fn packet_bytes(&self, bi: BufferIndex) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cur = Some(bi);
        while let Some(seg) = cur {
            let b = self.get(seg);
            out.extend_from_slice(b.data());
            cur = b.next;
        }
        out
    }

    /// Concatenated device-view bytes of a packet
    pub fn mbuf_bytes(&self, bi: BufferIndex) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cur = Some(bi);
        while let Some(seg) = cur {
            let b = self.get(seg);
            out.extend_from_slice(b.mbuf_data());
            cur = b.next;
        }
        out
    }

    /// Free buffers across all sockets
    pub fn available(&self) -> usize {
        self.pools.iter().map(|p| p.available()).sum()
    }

    /// Allocated buffers across all sockets
    pub fn allocated(&self) -> usize {
        self.pools.iter().map(|p| p.allocated()).sum()
    }
}
