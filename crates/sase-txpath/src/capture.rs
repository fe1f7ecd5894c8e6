//! Packet capture hook
//!
//! When capture is enabled every packet offered to a device is copied (up to
//! `max_bytes`) to a [`CaptureSink`] before it is staged, including packets
//! that are later dropped.

use crate::buffer::{BufferIndex, BufferPools};
use crate::config::PcapConfig;
use parking_lot::Mutex;

/// Consumer of captured packets
pub trait CaptureSink: Send + Sync {
    fn add_buffer(&self, buffer_index: BufferIndex, bytes: &[u8]);
}

/// Capture filter bound to a sink
pub struct PacketCapture {
    /// TX interface to capture, 0 for all
    sw_if_index: u32,
    max_bytes: usize,
    sink: Box<dyn CaptureSink>,
}

impl PacketCapture {
    pub fn new(config: &PcapConfig, sink: Box<dyn CaptureSink>) -> Self {
        Self {
            sw_if_index: config.sw_if_index,
            max_bytes: config.max_bytes,
            sink,
        }
    }

    #[inline]
    pub fn matches(&self, sw_if_index_tx: u32) -> bool {
        self.sw_if_index == 0 || self.sw_if_index == sw_if_index_tx
    }

    /// Hand `bi` to the sink if its TX interface passes the filter
    pub fn capture(&self, pools: &BufferPools, bi: BufferIndex) {
        if !self.matches(pools.get(bi).sw_if_index_tx) {
            return;
        }
        let mut bytes = pools.packet_bytes(bi);
        bytes.truncate(self.max_bytes);
        self.sink.add_buffer(bi, &bytes);
    }
}

/// One captured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub buffer_index: BufferIndex,
    pub bytes: Vec<u8>,
}

/// In-memory capture sink
#[derive(Debug, Default)]
pub struct CaptureLog {
    packets: Mutex<Vec<CapturedPacket>>,
}

impl CaptureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<CapturedPacket> {
        std::mem::take(&mut *self.packets.lock())
    }
}

impl CaptureSink for CaptureLog {
    fn add_buffer(&self, buffer_index: BufferIndex, bytes: &[u8]) {
        self.packets.lock().push(CapturedPacket {
            buffer_index,
            bytes: bytes.to_vec(),
        });
    }
}

impl<T: CaptureSink + ?Sized> CaptureSink for std::sync::Arc<T> {
    fn add_buffer(&self, buffer_index: BufferIndex, bytes: &[u8]) {
        (**self).add_buffer(buffer_index, bytes)
    }
}
