//! Loopback drivers
//!
//! In-process stand-ins for the driver layer. A [`LoopbackPort`] plays a NIC
//! or kernel interface, a [`LoopbackVhost`] plays a guest. Both can be
//! scripted to accept a limited number of packets or fail a burst, and both
//! record what reached them. Used by the simulator and the tests.

use crate::buffer::{BufferIndex, BufferPools};
use crate::device::{TxBurst, VhostBackend};
use crate::error::DriverError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Scripted outcome of one burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Take at most this many packets
    Accept(usize),
    /// Fail with a negative status
    Fail(i32),
}

#[derive(Debug, Default)]
struct Script(Mutex<VecDeque<Response>>);

impl Script {
    /// How many of `offered` the next burst takes. Unscripted bursts take all.
    fn next(&self, offered: usize) -> Result<usize, DriverError> {
        match self.0.lock().pop_front() {
            None => Ok(offered),
            Some(Response::Accept(n)) => Ok(n.min(offered)),
            Some(Response::Fail(code)) => Err(DriverError(code)),
        }
    }

    fn push(&self, r: Response) {
        self.0.lock().push_back(r);
    }
}

/// One burst as seen by a loopback port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Burst {
    pub queue: u16,
    pub offered: usize,
    pub accepted: Vec<BufferIndex>,
}

/// Loopback NIC
///
/// Accepted handles stay owned by the port until [`LoopbackPort::reclaim`]
/// returns them to the pool, the way a NIC holds mbufs until TX completion.
#[derive(Debug, Default)]
pub struct LoopbackPort {
    script: Script,
    bursts: Mutex<Vec<Burst>>,
    held: Mutex<Vec<BufferIndex>>,
}

impl LoopbackPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a burst that takes at most `n` packets
    pub fn push_accept(&self, n: usize) {
        self.script.push(Response::Accept(n));
    }

    /// Queue a burst that fails with `code`
    pub fn push_error(&self, code: i32) {
        self.script.push(Response::Fail(code));
    }

    /// Every burst so far, including ones that took nothing
    pub fn bursts(&self) -> Vec<Burst> {
        self.bursts.lock().clone()
    }

    /// Handles accepted so far, in order
    pub fn accepted(&self) -> Vec<BufferIndex> {
        self.bursts
            .lock()
            .iter()
            .flat_map(|b| b.accepted.iter().copied())
            .collect()
    }

    /// Complete transmission: free every held handle
    pub fn reclaim(&self, pools: &BufferPools) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        pools.free_many(&held);
        held.len()
    }
}

impl TxBurst for LoopbackPort {
    fn tx_burst(&self, queue: u16, pkts: &[BufferIndex]) -> Result<usize, DriverError> {
        let n = self.script.next(pkts.len())?;
        let accepted = pkts[..n].to_vec();
        self.held.lock().extend_from_slice(&accepted);
        self.bursts.lock().push(Burst {
            queue,
            offered: pkts.len(),
            accepted,
        });
        Ok(n)
    }
}

/// Loopback vhost-user guest
///
/// Packet bytes are copied out on enqueue; the TX path frees the handles
/// right after.
pub struct LoopbackVhost {
    pools: Arc<BufferPools>,
    script: Script,
    want_interrupt: AtomicBool,
    interrupts: AtomicU64,
    received: Mutex<Vec<Vec<u8>>>,
    vrings: Mutex<Vec<u16>>,
}

impl LoopbackVhost {
    pub fn new(pools: Arc<BufferPools>) -> Self {
        Self {
            pools,
            script: Script::default(),
            want_interrupt: AtomicBool::new(false),
            interrupts: AtomicU64::new(0),
            received: Mutex::new(Vec::new()),
            vrings: Mutex::new(Vec::new()),
        }
    }

    pub fn push_accept(&self, n: usize) {
        self.script.push(Response::Accept(n));
    }

    pub fn push_error(&self, code: i32) {
        self.script.push(Response::Fail(code));
    }

    pub fn set_want_interrupt(&self, on: bool) {
        self.want_interrupt.store(on, Ordering::Relaxed);
    }

    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::Relaxed)
    }

    /// Frames the guest received, device view
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    /// Vring of every enqueue, in order
    pub fn vrings_used(&self) -> Vec<u16> {
        self.vrings.lock().clone()
    }
}

impl VhostBackend for LoopbackVhost {
    fn enqueue_burst(&self, vring: u16, pkts: &[BufferIndex]) -> Result<usize, DriverError> {
        let n = self.script.next(pkts.len())?;
        self.vrings.lock().push(vring);
        let mut received = self.received.lock();
        for &bi in &pkts[..n] {
            received.push(self.pools.mbuf_bytes(bi));
        }
        Ok(n)
    }

    fn want_interrupt(&self, _vring: u16) -> bool {
        self.want_interrupt.load(Ordering::Relaxed)
    }

    fn send_interrupt(&self, _vring: u16) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_order() {
        let port = LoopbackPort::new();
        port.push_accept(1);
        port.push_error(-22);

        let pkts = [BufferIndex::new(0, 1), BufferIndex::new(0, 2)];
        assert_eq!(port.tx_burst(0, &pkts), Ok(1));
        assert_eq!(port.tx_burst(0, &pkts[1..]), Err(DriverError(-22)));
        assert_eq!(port.tx_burst(0, &pkts[1..]), Ok(1));
        assert_eq!(port.accepted(), pkts.to_vec());
        assert_eq!(port.bursts().len(), 2);
    }

    #[test]
    fn test_reclaim_returns_buffers() {
        let pools = BufferPools::new(1, 4);
        let port = LoopbackPort::new();
        let bi = pools.alloc_packet(0, &[0u8; 60]).unwrap();

        port.tx_burst(0, &[bi]).unwrap();
        assert_eq!(pools.allocated(), 1);
        assert_eq!(port.reclaim(&pools), 1);
        assert_eq!(pools.allocated(), 0);
    }
}
