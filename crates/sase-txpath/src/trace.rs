//! Transmit trace records

use crate::buffer::{BufferIndex, MbufHeader, PacketBuffer, BUFFER_SIZE, HEADROOM};
use parking_lot::Mutex;
use std::fmt;

/// Bytes of packet data kept in a trace record
pub const TRACE_PRE_DATA_SIZE: usize = 128;

/// Pipeline metadata of a traced buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMeta {
    pub current_data: i16,
    pub current_length: u16,
    pub clone_count: u8,
    pub flags: u32,
    pub sw_if_index_tx: u32,
    pub has_next: bool,
}

/// Snapshot of one packet as it was staged for transmission
#[derive(Clone)]
pub struct TxTrace {
    pub buffer_index: BufferIndex,
    pub device_index: u16,
    pub queue_index: u16,
    pub mbuf: MbufHeader,
    pub buffer: BufferMeta,
    /// Packet bytes from the start of data, zero padded
    pub pre_data: [u8; TRACE_PRE_DATA_SIZE],
}

impl TxTrace {
    pub fn capture(device_index: u16, queue_index: u16, b: &PacketBuffer) -> Self {
        let start = (HEADROOM as i32 + b.current_data as i32) as usize;
        let n = TRACE_PRE_DATA_SIZE.min(BUFFER_SIZE - start);
        let mut pre_data = [0u8; TRACE_PRE_DATA_SIZE];
        pre_data[..n].copy_from_slice(&b.raw()[start..start + n]);

        Self {
            buffer_index: b.index(),
            device_index,
            queue_index,
            mbuf: b.mbuf,
            buffer: BufferMeta {
                current_data: b.current_data,
                current_length: b.current_length,
                clone_count: b.clone_count,
                flags: b.flags,
                sw_if_index_tx: b.sw_if_index_tx,
                has_next: b.next().is_some(),
            },
            pre_data,
        }
    }
}

struct MacAddr<'a>(&'a [u8]);

impl fmt::Display for MacAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

fn ethertype_name(ty: u16) -> Option<&'static str> {
    match ty {
        0x0800 => Some("IP4"),
        0x86dd => Some("IP6"),
        0x0806 => Some("ARP"),
        0x8100 => Some("VLAN"),
        0x88a8 => Some("DOT1AD"),
        0x8847 => Some("MPLS"),
        _ => None,
    }
}

/// Ethernet header summary of up to `len` bytes
struct EthernetSummary<'a>(&'a [u8]);

impl fmt::Display for EthernetSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.0;
        if h.len() < 14 {
            return write!(f, "ethernet header truncated");
        }
        let ty = u16::from_be_bytes([h[12], h[13]]);
        match ethertype_name(ty) {
            Some(name) => write!(f, "{}", name)?,
            None => write!(f, "0x{:04x}", ty)?,
        }
        write!(f, ": {} -> {}", MacAddr(&h[6..12]), MacAddr(&h[0..6]))?;

        if (ty == 0x8100 || ty == 0x88a8) && h.len() >= 18 {
            let tci = u16::from_be_bytes([h[14], h[15]]);
            write!(f, " vlan {}", tci & 0x0fff)?;
        }
        Ok(())
    }
}

impl fmt::Display for TxTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.buffer;
        writeln!(f, "device {} tx queue {}", self.device_index, self.queue_index)?;
        writeln!(
            f,
            "  buffer 0x{:x}: current data {}, length {}, clone-count {}, flags 0x{:x}{}",
            self.buffer_index.as_u32(),
            b.current_data,
            b.current_length,
            b.clone_count,
            b.flags,
            if b.has_next { ", next-present" } else { "" }
        )?;
        writeln!(
            f,
            "  mbuf: data_off {}, data_len {}, pkt_len {}, nb_segs {}, port {}",
            self.mbuf.data_off, self.mbuf.data_len, self.mbuf.pkt_len, self.mbuf.nb_segs, self.mbuf.port
        )?;
        let len = (b.current_length as usize).min(TRACE_PRE_DATA_SIZE);
        write!(f, "  {}", EthernetSummary(&self.pre_data[..len]))
    }
}

impl fmt::Debug for TxTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxTrace")
            .field("buffer_index", &self.buffer_index)
            .field("device_index", &self.device_index)
            .field("queue_index", &self.queue_index)
            .field("mbuf", &self.mbuf)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// Consumer of trace records
pub trait TraceSink: Send + Sync {
    fn add_trace(&self, trace: TxTrace);
}

/// Bounded in-memory trace log; records past the limit are discarded
pub struct TraceLog {
    limit: usize,
    records: Mutex<Vec<TxTrace>>,
}

impl TraceLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every record
    pub fn take(&self) -> Vec<TxTrace> {
        std::mem::take(&mut *self.records.lock())
    }
}

impl TraceSink for TraceLog {
    fn add_trace(&self, trace: TxTrace) {
        let mut records = self.records.lock();
        if records.len() < self.limit {
            records.push(trace);
        }
    }
}
