//! Error types for the TX path
//!
//! Only setup and configuration can fail with a `TxError`. The dispatch hot
//! path reports every outcome as a count plus counters.

use thiserror::Error;

/// TX path error type
#[derive(Error, Debug)]
pub enum TxError {
    /// Invalid configuration value
    #[error("config error: {0}")]
    Config(String),

    /// Device instance not registered
    #[error("unknown device instance: {0}")]
    UnknownDevice(usize),

    /// Interface not registered
    #[error("unknown interface: sw_if_index {0}")]
    UnknownInterface(u32),

    /// Worker index out of range
    #[error("worker {worker} out of range (workers: {workers})")]
    WorkerOutOfRange { worker: usize, workers: usize },

    /// Admin process could not be started
    #[error("failed to spawn admin process: {0}")]
    SpawnFailed(String),

    /// Admin process is gone
    #[error("admin process stopped")]
    AdminStopped,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for the TX path
pub type Result<T> = std::result::Result<T, TxError>;

/// Negative status returned by a driver burst primitive
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("driver returned {0}")]
pub struct DriverError(pub i32);
