//! TX devices
//!
//! A device is opened with one [`DeviceFamily`] and keeps it for its whole
//! life. The family decides which burst primitive is called and what happens
//! to the handles it accepts:
//!
//! | Family | Primitive | Accepted handles |
//! |--------|-----------|------------------|
//! | `Eth` | `TxBurst` on `(port, queue)` | owned by the NIC until DMA completes |
//! | `VhostUser` | enqueue on the guest RX vring | copied, freed right here |
//! | `Kni` | `TxBurst` on the kernel port | owned by the kernel interface |
//!
//! When a device has fewer TX queues than there are workers, the queues are
//! guarded by spinlocks and a worker takes whichever queue is free.

use crate::buffer::{BufferIndex, BufferPools};
use crate::error::{DriverError, Result, TxError};
use crate::stats::DeviceStats;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Virtqueues per vhost-user queue pair
pub const VIRTIO_QNUM: u16 = 2;

/// Guest RX virtqueue within a pair (the host transmits into it)
pub const VIRTIO_RXQ: u16 = 0;

/// Burst-send primitive of a physical NIC or kernel interface
pub trait TxBurst: Send + Sync {
    /// Offer `pkts` to `queue`. Returns how many were accepted, always a
    /// prefix of `pkts`.
    fn tx_burst(&self, queue: u16, pkts: &[BufferIndex]) -> std::result::Result<usize, DriverError>;
}

/// Vhost-user guest connection
pub trait VhostBackend: Send + Sync {
    /// Copy `pkts` into the guest's `vring`. Returns how many were copied.
    fn enqueue_burst(&self, vring: u16, pkts: &[BufferIndex]) -> std::result::Result<usize, DriverError>;

    /// Guest has a call fd and has not suppressed interrupts on `vring`
    fn want_interrupt(&self, vring: u16) -> bool;

    /// Kick the guest
    fn send_interrupt(&self, vring: u16);
}

impl<T: TxBurst + ?Sized> TxBurst for std::sync::Arc<T> {
    fn tx_burst(&self, queue: u16, pkts: &[BufferIndex]) -> std::result::Result<usize, DriverError> {
        (**self).tx_burst(queue, pkts)
    }
}

impl<T: VhostBackend + ?Sized> VhostBackend for std::sync::Arc<T> {
    fn enqueue_burst(&self, vring: u16, pkts: &[BufferIndex]) -> std::result::Result<usize, DriverError> {
        (**self).enqueue_burst(vring, pkts)
    }

    fn want_interrupt(&self, vring: u16) -> bool {
        (**self).want_interrupt(vring)
    }

    fn send_interrupt(&self, vring: u16) {
        (**self).send_interrupt(vring)
    }
}

/// Interrupt coalescing state of one guest RX vring
#[derive(Debug)]
struct VringState {
    n_since_last_int: u32,
    int_deadline: Instant,
}

/// Vhost-user family state
pub struct VhostUser {
    backend: Box<dyn VhostBackend>,
    vrings: Box<[Mutex<VringState>]>,
    coalesce_frames: u32,
    coalesce_time: Duration,
}

impl VhostUser {
    pub fn new(
        backend: Box<dyn VhostBackend>,
        queue_pairs: u16,
        coalesce_frames: u32,
        coalesce_time: Duration,
    ) -> Self {
        let deadline = Instant::now() + coalesce_time;
        let vrings = (0..queue_pairs.max(1))
            .map(|_| {
                Mutex::new(VringState {
                    n_since_last_int: 0,
                    int_deadline: deadline,
                })
            })
            .collect();

        Self {
            backend,
            vrings,
            coalesce_frames,
            coalesce_time,
        }
    }

    /// Count `sent` frames against the coalescing budget of `pair` and
    /// interrupt the guest when the deadline passed or the budget is spent.
    fn coalesce(&self, pair: u16, vring: u16, sent: usize) {
        if !self.backend.want_interrupt(vring) {
            return;
        }
        let mut state = self.vrings[pair as usize].lock();
        state.n_since_last_int += sent as u32;

        let now = Instant::now();
        if state.int_deadline < now || state.n_since_last_int > self.coalesce_frames {
            self.backend.send_interrupt(vring);
            state.n_since_last_int = 0;
            state.int_deadline = now + self.coalesce_time;
        }
    }

    /// Number of virtio queue pairs
    pub fn queue_pairs(&self) -> u16 {
        self.vrings.len() as u16
    }

    /// Frames sent since the last interrupt on `pair`
    pub fn pending_interrupt_frames(&self, pair: u16) -> u32 {
        self.vrings[pair as usize].lock().n_since_last_int
    }
}

/// Class of transmit target
pub enum DeviceFamily {
    /// Physical NIC
    Eth(Box<dyn TxBurst>),
    /// Vhost-user virtual interface
    VhostUser(VhostUser),
    /// Kernel NIC interface
    Kni(Box<dyn TxBurst>),
}

impl DeviceFamily {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceFamily::Eth(_) => "eth",
            DeviceFamily::VhostUser(_) => "vhost-user",
            DeviceFamily::Kni(_) => "kni",
        }
    }
}

/// Spinlocks over a device's TX queues
pub struct QueueLocks {
    flags: Box<[CachePadded<AtomicBool>]>,
}

impl QueueLocks {
    pub fn new(queues: u16) -> Self {
        Self {
            flags: (0..queues.max(1))
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    #[inline(always)]
    fn try_lock(&self, queue: usize) -> bool {
        !self.flags[queue].swap(true, Ordering::Acquire)
    }

    /// Take the first free queue, probing round-robin from `preferred`.
    /// Never parks: a busy queue just moves the probe along.
    #[inline]
    pub fn acquire(&self, preferred: usize) -> QueueGuard<'_> {
        let n = self.flags.len();
        let mut queue = preferred % n;
        while !self.try_lock(queue) {
            queue = (queue + 1) % n;
            std::hint::spin_loop();
        }
        QueueGuard {
            flag: &self.flags[queue],
            queue: queue as u16,
        }
    }

    /// Spin until `queue` itself is free
    #[inline]
    pub fn acquire_exact(&self, queue: usize) -> QueueGuard<'_> {
        while !self.try_lock(queue) {
            std::hint::spin_loop();
        }
        QueueGuard {
            flag: &self.flags[queue],
            queue: queue as u16,
        }
    }

    pub fn is_locked(&self, queue: usize) -> bool {
        self.flags[queue].load(Ordering::Relaxed)
    }
}

/// Held queue lock; released on drop
pub struct QueueGuard<'a> {
    flag: &'a AtomicBool,
    queue: u16,
}

impl QueueGuard<'_> {
    pub fn queue(&self) -> u16 {
        self.queue
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Device identity and queue layout
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Driver port id
    pub device_index: u16,
    /// Hardware interface handed to the flow-control gate
    pub hw_if_index: u32,
    /// Software interface used for capture filtering and admin events
    pub sw_if_index: u32,
    /// TX queues (queue pairs for vhost-user)
    pub tx_queues: u16,
}

/// An open TX device
pub struct Device {
    config: DeviceConfig,
    family: DeviceFamily,
    locks: Option<QueueLocks>,
    admin_up: AtomicBool,
    stats: DeviceStats,
}

impl Device {
    /// Open a device used by `num_workers` workers
    pub fn new(config: DeviceConfig, family: DeviceFamily, num_workers: usize) -> Result<Self> {
        if config.tx_queues == 0 {
            return Err(TxError::Config(format!(
                "device {} has no tx queues",
                config.device_index
            )));
        }
        if num_workers == 0 {
            return Err(TxError::Config("num_workers must be at least 1".into()));
        }
        if let DeviceFamily::VhostUser(vu) = &family {
            if vu.queue_pairs() != config.tx_queues {
                return Err(TxError::Config(format!(
                    "device {} has {} tx queues but {} vhost queue pairs",
                    config.device_index,
                    config.tx_queues,
                    vu.queue_pairs()
                )));
            }
        }

        let shared = (config.tx_queues as usize) < num_workers;
        let locks = match (&family, shared) {
            (_, false) => None,
            // A vhost-user guest only has one vring lock
            (DeviceFamily::VhostUser(_), true) => Some(QueueLocks::new(1)),
            (_, true) => Some(QueueLocks::new(config.tx_queues)),
        };

        tracing::debug!(
            device = config.device_index,
            family = family.name(),
            tx_queues = config.tx_queues,
            locked = locks.is_some(),
            "Opened TX device"
        );

        Ok(Self {
            stats: DeviceStats::new(config.device_index),
            config,
            family,
            locks,
            admin_up: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn device_index(&self) -> u16 {
        self.config.device_index
    }

    pub fn hw_if_index(&self) -> u32 {
        self.config.hw_if_index
    }

    pub fn sw_if_index(&self) -> u32 {
        self.config.sw_if_index
    }

    pub fn family(&self) -> &DeviceFamily {
        &self.family
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Queue lock set, present when queues are shared between workers
    pub fn locks(&self) -> Option<&QueueLocks> {
        self.locks.as_ref()
    }

    pub fn is_admin_up(&self) -> bool {
        self.admin_up.load(Ordering::Acquire)
    }

    pub fn set_admin_up(&self, up: bool) {
        self.admin_up.store(up, Ordering::Release);
    }

    /// One burst-send of `pkts` on behalf of worker `core`.
    ///
    /// Takes and releases whatever queue lock the family needs. For
    /// vhost-user, accepted handles are freed and the guest may be
    /// interrupted before returning.
    #[inline]
    pub fn send(&self, core: usize, pkts: &[BufferIndex], pools: &BufferPools) -> std::result::Result<usize, DriverError> {
        debug_assert!(!pkts.is_empty());
        match &self.family {
            DeviceFamily::Eth(nic) => {
                let guard = self
                    .locks
                    .as_ref()
                    .map(|l| l.acquire(core % self.config.tx_queues as usize));
                let queue = guard.as_ref().map_or(core as u16, |g| g.queue());
                nic.tx_burst(queue, pkts)
            }
            DeviceFamily::Kni(kni) => {
                let _guard = self.locks.as_ref().map(|l| l.acquire(core));
                kni.tx_burst(0, pkts)
            }
            DeviceFamily::VhostUser(vu) => {
                let (_guard, pair) = match &self.locks {
                    Some(locks) => (Some(locks.acquire_exact(0)), 0),
                    None => (None, (core % vu.vrings.len()) as u16),
                };
                let vring = pair * VIRTIO_QNUM + VIRTIO_RXQ;

                let sent = vu.backend.enqueue_burst(vring, pkts)?;
                if sent > 0 {
                    vu.coalesce(pair, vring, sent);
                    pools.free_many(&pkts[..sent]);
                }
                Ok(sent)
            }
        }
    }
}
