//! TX path configuration
//!
//! Loaded once at startup. Nothing here changes while workers are running.

use crate::error::{Result, TxError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TX ring size per (device, worker)
pub const DEFAULT_TX_RING_SIZE: u32 = 4 * 1024;

/// Default maximum batch handed to the dispatch entry point
pub const DEFAULT_FRAME_SIZE: usize = 256;

/// Default vhost-user interrupt coalescing frame count
pub const DEFAULT_VHOST_COALESCE_FRAMES: u32 = 32;

/// Default vhost-user interrupt coalescing time (microseconds)
pub const DEFAULT_VHOST_COALESCE_TIME_US: u64 = 1000;

/// Default capture snapshot length
pub const DEFAULT_PCAP_MAX_BYTES: usize = 512;

/// TX path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Slots per TX ring. Must exceed the frame size.
    pub tx_ring_size: u32,
    /// Largest batch a worker may dispatch at once
    pub frame_size: usize,
    /// Number of worker cores
    pub num_workers: usize,
    /// Frames sent to a vhost-user guest before forcing an interrupt
    pub vhost_coalesce_frames: u32,
    /// Longest a vhost-user guest waits for an interrupt (microseconds)
    pub vhost_coalesce_time_us: u64,
    /// Packet capture
    pub pcap: PcapConfig,
    /// Transmit tracing
    pub trace: TraceConfig,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            tx_ring_size: DEFAULT_TX_RING_SIZE,
            frame_size: DEFAULT_FRAME_SIZE,
            num_workers: num_cpus(),
            vhost_coalesce_frames: DEFAULT_VHOST_COALESCE_FRAMES,
            vhost_coalesce_time_us: DEFAULT_VHOST_COALESCE_TIME_US,
            pcap: PcapConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

/// Packet capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PcapConfig {
    pub enable: bool,
    /// Only capture packets leaving this interface; 0 captures everything
    pub sw_if_index: u32,
    pub max_bytes: usize,
}

impl Default for PcapConfig {
    fn default() -> Self {
        Self {
            enable: false,
            sw_if_index: 0,
            max_bytes: DEFAULT_PCAP_MAX_BYTES,
        }
    }
}

/// Transmit trace settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enable: bool,
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl TxConfig {
    /// Load from a JSON file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject sizes the TX path cannot run with.
    ///
    /// A ring must hold a full frame plus at least one slot, otherwise a
    /// single un-flow-controlled batch could fill it completely.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(TxError::Config("num_workers must be at least 1".into()));
        }
        if self.frame_size == 0 {
            return Err(TxError::Config("frame_size must be at least 1".into()));
        }
        if (self.tx_ring_size as usize) <= self.frame_size {
            return Err(TxError::Config(format!(
                "tx_ring_size {} must be larger than frame_size {}",
                self.tx_ring_size, self.frame_size
            )));
        }
        Ok(())
    }

    /// Vhost-user interrupt coalescing window
    pub fn vhost_coalesce_time(&self) -> Duration {
        Duration::from_micros(self.vhost_coalesce_time_us)
    }
}
