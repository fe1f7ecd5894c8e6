//! OpenSASE TX Path
//!
//! Transmit side of the data plane: moves vector-processed packets from the
//! buffer pools onto device TX queues across worker cores, with bounded
//! buffering and optional flow-control backpressure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            TX PATH                                  │
//! │                                                                     │
//! │   forwarding pipeline (batch of buffer indices per device)          │
//! │         │                                                           │
//! │         ▼                                                           │
//! │  ┌───────────────┐   clone_count > 0   ┌────────────────┐          │
//! │  │ transmit_batch│ ───────────────────▶│   Replicator   │          │
//! │  │  (per core)   │ ◀───────────────────│ (socket-local) │          │
//! │  └───────┬───────┘      deep copy      └────────────────┘          │
//! │          │ stage                                                    │
//! │          ▼                                                          │
//! │  ┌───────────────┐                                                  │
//! │  │ TX ring       │  one per (device, core), head/tail counters      │
//! │  └───────┬───────┘                                                  │
//! │          │ drain                                                    │
//! │          ▼                                                          │
//! │  ┌───────────────┐   queue locks when queues < workers              │
//! │  │ Burst TX      │ ──▶ Eth / VhostUser / Kni                        │
//! │  └───────┬───────┘                                                  │
//! │          │ leftover                                                 │
//! │          ▼                                                          │
//! │   gate installed ? notify(hw_if_index, backlog) : drop + count      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Drop accounting
//!
//! | Counter | Raised when |
//! |---------|-------------|
//! | `BadRetval` | driver burst returned an error |
//! | `RingFull` | batch does not fit next to the backlog |
//! | `PktDrop` | no gate and the device stopped taking packets |
//! | `ReplFail` | a shared buffer could not be copied |

pub mod admin;
pub mod buffer;
pub mod burst;
pub mod capture;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod flowcontrol;
pub mod loopback;
pub mod replicate;
pub mod ring;
pub mod stats;
pub mod trace;

pub use admin::{AdminProcess, DeviceAdmin, InterfaceFlagsHandler, SW_INTERFACE_FLAG_ADMIN_UP};
pub use buffer::{BufferIndex, BufferPool, BufferPools, PacketBuffer};
pub use capture::{CaptureLog, CaptureSink};
pub use config::TxConfig;
pub use device::{Device, DeviceConfig, DeviceFamily, TxBurst, VhostBackend, VhostUser};
pub use dispatch::{TxMain, TxMainBuilder, TxWorker};
pub use error::{DriverError, Result, TxError};
pub use flowcontrol::FlowControlGate;
pub use ring::{BacklogProbe, TxRing};
pub use stats::{DeviceStatsSnapshot, TxFuncError};
pub use trace::{TraceLog, TraceSink, TxTrace};

/// Buffers per socket pool when none is configured
pub const DEFAULT_BUFFERS_PER_SOCKET: usize = 16 * 1024;
