//! Dispatch entry point
//!
//! [`TxMain`] holds what every worker shares: configuration, buffer pools,
//! the device table and the optional flow control gate, trace and capture
//! sinks. Each worker core owns a [`TxWorker`] with one ring per device and
//! calls [`TxWorker::transmit_batch`] once per scheduling round.

use crate::buffer::{BufferIndex, BufferPools, PacketBuffer, HEADROOM};
use crate::burst::drain;
use crate::capture::{CaptureSink, PacketCapture};
use crate::config::TxConfig;
use crate::device::{Device, DeviceConfig, DeviceFamily};
use crate::error::{Result, TxError};
use crate::flowcontrol::FlowControlGate;
use crate::replicate::replicate_packet;
use crate::ring::{BacklogProbe, TxRing};
use crate::stats::TxFuncError;
use crate::trace::{TraceSink, TxTrace};
use std::sync::Arc;

/// State shared by all TX workers
pub struct TxMain {
    config: TxConfig,
    pools: Arc<BufferPools>,
    devices: Vec<Device>,
    gate: Option<FlowControlGate>,
    trace: Option<Arc<dyn TraceSink>>,
    capture: Option<PacketCapture>,
    /// Backlog probes, `[device][worker]`
    probes: Vec<Vec<BacklogProbe>>,
}

impl TxMain {
    pub fn builder(config: TxConfig, pools: Arc<BufferPools>) -> TxMainBuilder {
        TxMainBuilder::new(config, pools)
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn pools(&self) -> &Arc<BufferPools> {
        &self.pools
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, device: usize) -> Result<&Device> {
        self.devices.get(device).ok_or(TxError::UnknownDevice(device))
    }

    pub fn device_by_sw_if_index(&self, sw_if_index: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.sw_if_index() == sw_if_index)
    }

    /// Whether a flow control gate is installed
    pub fn is_flow_controlled(&self) -> bool {
        self.gate.is_some()
    }

    /// Backlog of `worker`'s ring for `device`, readable from any thread
    pub fn pending(&self, device: usize, worker: usize) -> Result<u32> {
        Ok(self.probe(device, worker)?.backlog())
    }

    pub fn probe(&self, device: usize, worker: usize) -> Result<BacklogProbe> {
        let probes = self.probes.get(device).ok_or(TxError::UnknownDevice(device))?;
        probes.get(worker).cloned().ok_or(TxError::WorkerOutOfRange {
            worker,
            workers: probes.len(),
        })
    }
}

/// Builder for [`TxMain`] and its workers
pub struct TxMainBuilder {
    config: TxConfig,
    pools: Arc<BufferPools>,
    devices: Vec<(DeviceConfig, DeviceFamily)>,
    gate: Option<FlowControlGate>,
    trace: Option<Arc<dyn TraceSink>>,
    capture: Option<Box<dyn CaptureSink>>,
    worker_sockets: Option<Vec<u8>>,
}

impl TxMainBuilder {
    pub fn new(config: TxConfig, pools: Arc<BufferPools>) -> Self {
        Self {
            config,
            pools,
            devices: Vec::new(),
            gate: None,
            trace: None,
            capture: None,
            worker_sockets: None,
        }
    }

    /// Register a device; devices are numbered in registration order
    pub fn device(mut self, config: DeviceConfig, family: DeviceFamily) -> Self {
        self.devices.push((config, family));
        self
    }

    /// Install the flow control gate
    pub fn flow_control(mut self, gate: FlowControlGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn capture_sink(mut self, sink: Box<dyn CaptureSink>) -> Self {
        self.capture = Some(sink);
        self
    }

    /// Socket of each worker, for socket-local replication. Defaults to
    /// spreading workers across sockets round-robin.
    pub fn worker_sockets(mut self, sockets: Vec<u8>) -> Self {
        self.worker_sockets = Some(sockets);
        self
    }

    pub fn build(self) -> Result<(Arc<TxMain>, Vec<TxWorker>)> {
        self.config.validate()?;
        let workers = self.config.num_workers;
        let num_sockets = self.pools.num_sockets();

        let sockets = match self.worker_sockets {
            Some(s) if s.len() != workers => {
                return Err(TxError::Config(format!(
                    "{} worker sockets given for {} workers",
                    s.len(),
                    workers
                )))
            }
            Some(s) => s,
            None => (0..workers).map(|w| (w % num_sockets) as u8).collect(),
        };
        if let Some(&bad) = sockets.iter().find(|&&s| s as usize >= num_sockets) {
            return Err(TxError::Config(format!(
                "worker socket {} has no buffer pool ({} sockets)",
                bad, num_sockets
            )));
        }

        let devices = self
            .devices
            .into_iter()
            .map(|(config, family)| Device::new(config, family, workers))
            .collect::<Result<Vec<_>>>()?;

        let mut rings: Vec<Vec<TxRing>> = (0..workers).map(|_| Vec::with_capacity(devices.len())).collect();
        let mut probes = Vec::with_capacity(devices.len());
        for _ in &devices {
            let mut per_device = Vec::with_capacity(workers);
            for worker_rings in rings.iter_mut() {
                let ring = TxRing::new(self.config.tx_ring_size);
                per_device.push(ring.probe());
                worker_rings.push(ring);
            }
            probes.push(per_device);
        }

        let trace = if self.config.trace.enable { self.trace } else { None };
        if self.config.trace.enable && trace.is_none() {
            tracing::warn!("TX tracing enabled without a trace sink");
        }
        let capture = match (self.config.pcap.enable, self.capture) {
            (true, Some(sink)) => Some(PacketCapture::new(&self.config.pcap, sink)),
            (true, None) => {
                tracing::warn!("packet capture enabled without a capture sink");
                None
            }
            (false, _) => None,
        };

        tracing::info!(
            devices = devices.len(),
            workers,
            ring_size = self.config.tx_ring_size,
            flow_control = self.gate.is_some(),
            "TX path initialized"
        );

        let main = Arc::new(TxMain {
            config: self.config,
            pools: self.pools,
            devices,
            gate: self.gate,
            trace,
            capture,
            probes,
        });

        let workers = rings
            .into_iter()
            .zip(sockets)
            .enumerate()
            .map(|(core, (rings, socket))| TxWorker {
                core,
                socket,
                main: Arc::clone(&main),
                rings,
                recycle: Vec::new(),
            })
            .collect();

        Ok((main, workers))
    }
}

/// Per-core TX state
pub struct TxWorker {
    core: usize,
    socket: u8,
    main: Arc<TxMain>,
    /// One ring per device
    rings: Vec<TxRing>,
    /// Shared originals to release once the burst is done
    recycle: Vec<BufferIndex>,
}

impl TxWorker {
    pub fn core(&self) -> usize {
        self.core
    }

    pub fn socket(&self) -> u8 {
        self.socket
    }

    pub fn main(&self) -> &Arc<TxMain> {
        &self.main
    }

    /// Backlog of this worker's ring for `device`
    pub fn pending(&self, device: usize) -> u32 {
        self.rings[device].backlog()
    }

    pub fn probe(&self, device: usize) -> BacklogProbe {
        self.rings[device].probe()
    }

    /// This worker's ring for `device`
    pub fn ring(&self, device: usize) -> &TxRing {
        &self.rings[device]
    }

    /// Transmit a batch of packets on `device`.
    ///
    /// Ownership of every buffer in `packets` passes to the TX path. Returns
    /// how many packets left the ring during this call, backlog included.
    /// If the batch does not fit next to the existing backlog it is dropped
    /// whole and the backlog is returned.
    pub fn transmit_batch(&mut self, device: usize, packets: &[BufferIndex]) -> u32 {
        let TxWorker {
            core,
            socket,
            main,
            rings,
            recycle,
        } = self;
        let main: &TxMain = main;
        let dev = &main.devices[device];
        let ring = &mut rings[device];
        let pools = &*main.pools;
        let n = packets.len() as u32;

        assert!(
            packets.len() <= main.config.frame_size,
            "batch of {} exceeds frame size {}",
            packets.len(),
            main.config.frame_size
        );

        let backlog = ring.backlog();
        // One slot always stays free so head and tail never meet on a full ring
        if backlog + n >= ring.capacity() {
            dev.stats().record_error(TxFuncError::RingFull, n as u64);
            pools.free_many(packets);
            return backlog;
        }

        if let Some(capture) = &main.capture {
            for &bi in packets {
                capture.capture(pools, bi);
            }
        }

        let mut admitted = 0u32;
        for &bi in packets {
            if let Some(handle) = prepare(main, dev, *core, *socket, recycle, bi) {
                ring.stage(admitted, handle);
                admitted += 1;
            }
        }
        ring.advance_head(admitted);

        let on_ring = ring.backlog();
        let remaining = if on_ring == 0 {
            0
        } else {
            drain(ring, dev, *core, pools, main.gate.is_some())
        };
        let transmitted = on_ring - remaining;
        dev.stats().record_tx(transmitted as u64);

        match &main.gate {
            Some(gate) if remaining > 0 => gate.notify(dev.hw_if_index(), ring.backlog()),
            Some(_) => ring.reset(),
            None => {
                if remaining > 0 {
                    dev.stats().record_tx_error(remaining as u64);
                    dev.stats().record_error(TxFuncError::PktDrop, remaining as u64);
                    for bi in ring.pending() {
                        pools.free(bi);
                    }
                }
                ring.reset();
            }
        }

        if !recycle.is_empty() {
            pools.free_many(recycle);
            recycle.clear();
        }

        debug_assert!(ring.head().wrapping_sub(ring.tail()) < ring.capacity());
        transmitted
    }

    /// Re-drive the backlog on `device` without adding packets.
    ///
    /// Returns the packets still pending. A ring that drains completely is
    /// compacted back to counter 0.
    pub fn flush(&mut self, device: usize) -> u32 {
        let dev = &self.main.devices[device];
        let ring = &mut self.rings[device];
        if ring.is_empty() {
            return 0;
        }

        let on_ring = ring.backlog();
        let remaining = drain(ring, dev, self.core, &self.main.pools, self.main.gate.is_some());
        dev.stats().record_tx((on_ring - remaining) as u64);
        if remaining == 0 {
            ring.reset();
        }
        remaining
    }
}

/// Turn one incoming buffer into the handle to stage, or `None` if it must
/// not be sent. Shared buffers are replicated and queued for recycling.
///
/// The original stays locked from the clone check through the trace, except
/// while it is being replicated.
#[inline]
fn prepare(
    main: &TxMain,
    dev: &Device,
    core: usize,
    socket: u8,
    recycle: &mut Vec<BufferIndex>,
    bi: BufferIndex,
) -> Option<BufferIndex> {
    let pools = &*main.pools;

    let mut b = pools.get(bi);
    let handle = if b.clone_count == 0 {
        Some(bi)
    } else {
        drop(b);
        let copy = replicate_packet(pools, socket, bi);
        recycle.push(bi);
        if copy.is_none() {
            dev.stats().record_error(TxFuncError::ReplFail, 1);
        }
        b = pools.get(bi);
        copy
    };

    // Bring the native header in line with whatever the pipeline did to the
    // packet since it was received
    if let Some(handle) = handle {
        let chain_len = pools.length_in_chain_locked(&b);
        if handle == bi {
            let current_data = b.current_data;
            reconcile(&mut b, chain_len, current_data);
        } else {
            reconcile(&mut pools.get(handle), chain_len, b.current_data);
        }
    }

    if let Some(sink) = &main.trace {
        if b.is_traced() {
            sink.add_trace(TxTrace::capture(dev.device_index(), core as u16, &b));
        }
    }

    handle
}

/// Apply the chain length and pipeline offset to a native header
#[inline(always)]
fn reconcile(h: &mut PacketBuffer, chain_len: u32, current_data: i16) {
    let delta = chain_len as i64 - h.mbuf.pkt_len as i64;
    let new_data_len = (h.mbuf.data_len as i64 + delta) as u16;
    h.mbuf.data_len = new_data_len;
    h.mbuf.pkt_len = (h.mbuf.pkt_len as i64 + delta) as u32;
    h.mbuf.data_off = (HEADROOM as i32 + current_data as i32) as u16;
    h.current_length = new_data_len;
}
