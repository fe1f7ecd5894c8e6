//! TX Statistics
//!
//! Lock-free per-device counters for the transmit path. Each bump is mirrored
//! to the `metrics` facade so an installed exporter sees the same numbers.

use metrics::{Counter, Unit};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const TX_ERRORS: &str = "sase_tx_errors_total";
pub const TX_PACKETS: &str = "sase_tx_packets_total";
pub const TX_INTERFACE_ERRORS: &str = "sase_tx_interface_errors_total";

static METRICS_DESCRIBED: AtomicBool = AtomicBool::new(false);

/// Register metric descriptions with the installed recorder. Later calls
/// are no-ops.
pub fn describe_metrics() {
    if METRICS_DESCRIBED.swap(true, Ordering::SeqCst) {
        return;
    }
    metrics::describe_counter!(
        TX_ERRORS,
        Unit::Count,
        "TX function errors by kind (bad_retval, ring_full, pkt_drop, repl_fail)"
    );
    metrics::describe_counter!(TX_PACKETS, Unit::Count, "Packets handed to a device");
    metrics::describe_counter!(
        TX_INTERFACE_ERRORS,
        Unit::Count,
        "Packets dropped because the device stopped accepting them"
    );
}

/// Errors counted by the TX function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxFuncError {
    /// Driver burst primitive returned a negative status
    BadRetval,
    /// Batch would have overflowed the TX ring
    RingFull,
    /// Packets the device did not accept and that were dropped
    PktDrop,
    /// Shared buffer could not be replicated
    ReplFail,
}

impl TxFuncError {
    pub const ALL: [TxFuncError; 4] = [
        TxFuncError::BadRetval,
        TxFuncError::RingFull,
        TxFuncError::PktDrop,
        TxFuncError::ReplFail,
    ];

    /// Short label
    pub fn as_str(self) -> &'static str {
        match self {
            TxFuncError::BadRetval => "bad_retval",
            TxFuncError::RingFull => "ring_full",
            TxFuncError::PktDrop => "pkt_drop",
            TxFuncError::ReplFail => "repl_fail",
        }
    }

    /// Human-readable counter description
    pub fn description(self) -> &'static str {
        match self {
            TxFuncError::BadRetval => "DPDK tx function returned an error",
            TxFuncError::RingFull => "Tx packet drops (ring full)",
            TxFuncError::PktDrop => "Tx packet drops (dpdk tx failure)",
            TxFuncError::ReplFail => "Tx packet drops (replication failure)",
        }
    }

    #[inline(always)]
    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TxFuncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Per-device TX counters (cache-line aligned)
#[repr(C, align(64))]
pub struct DeviceStats {
    errors: [AtomicU64; 4],
    tx_packets: AtomicU64,
    tx_error: AtomicU64,
    m_errors: [Counter; 4],
    m_tx_packets: Counter,
    m_tx_error: Counter,
}

impl DeviceStats {
    /// Counters for one device, labelled with its device index
    pub fn new(device_index: u16) -> Self {
        let device = device_index.to_string();
        let m_errors = TxFuncError::ALL.map(|kind| {
            metrics::counter!(
                TX_ERRORS,
                "device" => device.clone(),
                "kind" => kind.as_str()
            )
        });

        Self {
            errors: Default::default(),
            tx_packets: AtomicU64::new(0),
            tx_error: AtomicU64::new(0),
            m_errors,
            m_tx_packets: metrics::counter!(TX_PACKETS, "device" => device.clone()),
            m_tx_error: metrics::counter!(TX_INTERFACE_ERRORS, "device" => device),
        }
    }

    #[inline(always)]
    pub fn record_error(&self, kind: TxFuncError, n: u64) {
        self.errors[kind.slot()].fetch_add(n, Ordering::Relaxed);
        self.m_errors[kind.slot()].increment(n);
    }

    #[inline(always)]
    pub fn record_tx(&self, n: u64) {
        self.tx_packets.fetch_add(n, Ordering::Relaxed);
        self.m_tx_packets.increment(n);
    }

    /// Interface-level TX error counter
    #[inline(always)]
    pub fn record_tx_error(&self, n: u64) {
        self.tx_error.fetch_add(n, Ordering::Relaxed);
        self.m_tx_error.increment(n);
    }

    pub fn error(&self, kind: TxFuncError) -> u64 {
        self.errors[kind.slot()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_error: self.tx_error.load(Ordering::Relaxed),
            bad_retval: self.error(TxFuncError::BadRetval),
            ring_full: self.error(TxFuncError::RingFull),
            pkt_drop: self.error(TxFuncError::PktDrop),
            repl_fail: self.error(TxFuncError::ReplFail),
        }
    }

    /// Zero every counter
    pub fn clear(&self) {
        for c in &self.errors {
            c.store(0, Ordering::Relaxed);
        }
        self.tx_packets.store(0, Ordering::Relaxed);
        self.tx_error.store(0, Ordering::Relaxed);
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatsSnapshot {
    pub tx_packets: u64,
    pub tx_error: u64,
    pub bad_retval: u64,
    pub ring_full: u64,
    pub pkt_drop: u64,
    pub repl_fail: u64,
}

impl DeviceStatsSnapshot {
    /// Every packet the TX function discarded
    pub fn total_drops(&self) -> u64 {
        self.ring_full + self.pkt_drop + self.repl_fail
    }

    pub fn drop_rate(&self) -> f64 {
        let total = self.tx_packets + self.total_drops();
        if total == 0 {
            return 0.0;
        }
        self.total_drops() as f64 / total as f64
    }
}
