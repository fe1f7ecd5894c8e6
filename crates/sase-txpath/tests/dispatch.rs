//! End-to-end TX dispatch scenarios against loopback devices

use parking_lot::Mutex;
use sase_txpath::capture::CaptureLog;
use sase_txpath::loopback::{LoopbackPort, LoopbackVhost};
use sase_txpath::{
    AdminProcess, BufferIndex, BufferPools, DeviceAdmin, DeviceConfig, DeviceFamily,
    DriverError, FlowControlGate, TxBurst, TxConfig, TxFuncError, TxMain, TxWorker, VhostUser,
    SW_INTERFACE_FLAG_ADMIN_UP,
};
use std::sync::Arc;
use std::time::Duration;

const HW_IF: u32 = 9;
const SW_IF: u32 = 4;

fn config(ring: u32, frame: usize, workers: usize) -> TxConfig {
    TxConfig {
        tx_ring_size: ring,
        frame_size: frame,
        num_workers: workers,
        ..TxConfig::default()
    }
}

fn eth(tx_queues: u16) -> DeviceConfig {
    DeviceConfig {
        device_index: 0,
        hw_if_index: HW_IF,
        sw_if_index: SW_IF,
        tx_queues,
    }
}

fn packets(pools: &BufferPools, n: usize) -> Vec<BufferIndex> {
    (0..n)
        .map(|i| {
            let bi = pools.alloc_packet(0, &[i as u8; 64]).unwrap();
            pools.get(bi).sw_if_index_tx = SW_IF;
            bi
        })
        .collect()
}

type GateCalls = Arc<Mutex<Vec<(u32, u32)>>>;

struct Harness {
    pools: Arc<BufferPools>,
    nic: Arc<LoopbackPort>,
    main: Arc<TxMain>,
    worker: TxWorker,
    gate_calls: GateCalls,
}

fn harness(ring: u32, frame: usize, gated: bool, pool_size: usize) -> Harness {
    let pools = Arc::new(BufferPools::new(1, pool_size));
    let nic = Arc::new(LoopbackPort::new());
    let gate_calls: GateCalls = Arc::new(Mutex::new(Vec::new()));

    let mut builder = TxMain::builder(config(ring, frame, 1), pools.clone())
        .device(eth(1), DeviceFamily::Eth(Box::new(nic.clone())));
    if gated {
        let calls = gate_calls.clone();
        builder = builder.flow_control(FlowControlGate::new(move |hw, n| calls.lock().push((hw, n))));
    }
    let (main, mut workers) = builder.build().unwrap();

    Harness {
        pools,
        nic,
        main,
        worker: workers.remove(0),
        gate_calls,
    }
}

#[test]
fn device_takes_everything() {
    let mut h = harness(16, 8, false, 32);
    let batch = packets(&h.pools, 5);

    assert_eq!(h.worker.transmit_batch(0, &batch), 5);

    let stats = h.main.devices()[0].stats().snapshot();
    assert_eq!(stats.tx_packets, 5);
    assert_eq!(stats.pkt_drop, 0);
    assert_eq!(stats.tx_error, 0);
    assert_eq!(h.worker.ring(0).head(), 0);
    assert_eq!(h.worker.ring(0).tail(), 0);
}

#[test]
fn packets_reach_device_in_order() {
    let mut h = harness(16, 8, false, 32);
    let batch = packets(&h.pools, 3);

    h.worker.transmit_batch(0, &batch);
    assert_eq!(h.nic.accepted(), batch);
    assert_eq!(h.nic.bursts().len(), 1);
}

#[test]
fn stalled_device_without_gate_drops_leftover() {
    let mut h = harness(16, 8, false, 32);
    h.nic.push_accept(3);
    h.nic.push_accept(0);
    let batch = packets(&h.pools, 5);

    assert_eq!(h.worker.transmit_batch(0, &batch), 3);

    let stats = h.main.devices()[0].stats().snapshot();
    assert_eq!(stats.pkt_drop, 2);
    assert_eq!(stats.tx_error, 2);
    assert_eq!(h.worker.ring(0).head(), 0);
    assert_eq!(h.worker.ring(0).tail(), 0);

    // The three sent buffers are held by the device, the two dropped are back
    assert_eq!(h.pools.allocated(), 3);
    assert_eq!(h.nic.reclaim(&h.pools), 3);
    assert_eq!(h.pools.allocated(), 0);
}

#[test]
fn gate_sees_backlog_and_full_drain_compacts() {
    let mut h = harness(16, 8, true, 32);
    h.nic.push_accept(2);
    let batch = packets(&h.pools, 5);

    assert_eq!(h.worker.transmit_batch(0, &batch), 2);
    assert_eq!(*h.gate_calls.lock(), vec![(HW_IF, 3)]);
    assert_eq!(h.worker.pending(0), 3);
    assert_eq!(h.main.pending(0, 0).unwrap(), 3);
    assert_eq!(h.main.devices()[0].stats().snapshot().pkt_drop, 0);

    // Next batch goes out together with the backlog
    let more = packets(&h.pools, 2);
    assert_eq!(h.worker.transmit_batch(0, &more), 5);
    assert_eq!(h.worker.pending(0), 0);
    assert_eq!(h.worker.ring(0).head(), 0);
    assert_eq!(h.gate_calls.lock().len(), 1);

    let mut expected = batch;
    expected.extend(more);
    assert_eq!(h.nic.accepted(), expected);
}

#[test]
fn overflowing_batch_rejected_whole() {
    let mut h = harness(16, 15, true, 64);
    h.nic.push_accept(2);
    h.worker.transmit_batch(0, &packets(&h.pools, 5));
    assert_eq!(h.worker.pending(0), 3);
    let before = h.pools.allocated();

    let big = packets(&h.pools, 14);
    assert_eq!(h.worker.transmit_batch(0, &big), 3);
    assert_eq!(h.worker.pending(0), 3);
    assert_eq!(h.main.devices()[0].stats().error(TxFuncError::RingFull), 14);
    assert_eq!(h.pools.allocated(), before);
}

#[test]
fn batch_fits_larger_ring() {
    let mut h = harness(20, 15, true, 64);
    h.nic.push_accept(2);
    h.worker.transmit_batch(0, &packets(&h.pools, 5));

    let big = packets(&h.pools, 14);
    assert_eq!(h.worker.transmit_batch(0, &big), 17);
    assert_eq!(h.worker.pending(0), 0);
    assert_eq!(h.main.devices()[0].stats().error(TxFuncError::RingFull), 0);
}

#[test]
fn shared_buffer_is_replicated_and_recycled() {
    let mut h = harness(16, 8, false, 8);
    let payload: Vec<u8> = (0..64).collect();
    let bi = h.pools.alloc_packet(0, &payload).unwrap();
    h.pools.get(bi).clone_count = 2;

    assert_eq!(h.worker.transmit_batch(0, &[bi]), 1);

    let sent = h.nic.accepted();
    assert_eq!(sent.len(), 1);
    assert_ne!(sent[0], bi);
    assert_eq!(h.pools.mbuf_bytes(sent[0]), payload);
    // One owner released after the burst, the others still hold the original
    assert_eq!(h.pools.get(bi).clone_count, 1);
    assert_eq!(h.pools.allocated(), 2);
}

/// Driver that records the clone count of a shared original on every burst
struct OwnerWatch {
    pools: Arc<BufferPools>,
    original: BufferIndex,
    seen: Mutex<Vec<u8>>,
}

impl TxBurst for OwnerWatch {
    fn tx_burst(&self, _queue: u16, pkts: &[BufferIndex]) -> Result<usize, DriverError> {
        self.seen.lock().push(self.pools.get(self.original).clone_count);
        self.pools.free_many(pkts);
        Ok(pkts.len())
    }
}

#[test]
fn original_outlives_the_burst() {
    let pools = Arc::new(BufferPools::new(1, 8));
    let original = pools.alloc_packet(0, &[7; 64]).unwrap();
    pools.get(original).clone_count = 2;
    let watch = Arc::new(OwnerWatch {
        pools: pools.clone(),
        original,
        seen: Mutex::new(Vec::new()),
    });
    let (_main, mut workers) = TxMain::builder(config(16, 8, 1), pools.clone())
        .device(eth(1), DeviceFamily::Eth(Box::new(watch.clone())))
        .build()
        .unwrap();

    assert_eq!(workers[0].transmit_batch(0, &[original]), 1);
    assert_eq!(*watch.seen.lock(), vec![2]);
    assert_eq!(pools.get(original).clone_count, 1);
    assert_eq!(pools.allocated(), 1);
}

#[test]
fn failed_replication_drops_one_packet() {
    let mut h = harness(16, 8, false, 2);
    let shared = h.pools.alloc_packet(0, &[1; 64]).unwrap();
    h.pools.get(shared).clone_count = 1;
    let plain = h.pools.alloc_packet(0, &[2; 64]).unwrap();
    assert_eq!(h.pools.available(), 0);

    assert_eq!(h.worker.transmit_batch(0, &[shared, plain]), 1);

    assert_eq!(h.nic.accepted(), vec![plain]);
    let stats = h.main.devices()[0].stats().snapshot();
    assert_eq!(stats.repl_fail, 1);
    assert_eq!(stats.pkt_drop, 0);
    // The other owner still holds the original; nothing was freed twice
    assert_eq!(h.pools.get(shared).clone_count, 0);
    assert_eq!(h.pools.allocated(), 2);
}

#[test]
fn driver_error_with_gate_keeps_packets() {
    let mut h = harness(16, 8, true, 32);
    h.nic.push_error(-105);

    assert_eq!(h.worker.transmit_batch(0, &packets(&h.pools, 4)), 0);
    assert_eq!(h.worker.pending(0), 4);
    assert_eq!(h.main.devices()[0].stats().error(TxFuncError::BadRetval), 1);
    assert_eq!(*h.gate_calls.lock(), vec![(HW_IF, 4)]);

    assert_eq!(h.worker.flush(0), 0);
    assert_eq!(h.nic.accepted().len(), 4);
}

#[test]
fn driver_error_without_gate_drops() {
    let mut h = harness(16, 8, false, 32);
    h.nic.push_error(-1);

    assert_eq!(h.worker.transmit_batch(0, &packets(&h.pools, 4)), 0);
    let stats = h.main.devices()[0].stats().snapshot();
    assert_eq!(stats.bad_retval, 1);
    assert_eq!(stats.pkt_drop, 4);
    assert_eq!(h.pools.allocated(), 0);
}

#[test]
fn vhost_device_frees_on_send() {
    let pools = Arc::new(BufferPools::new(1, 32));
    let guest = Arc::new(LoopbackVhost::new(pools.clone()));
    let vu = VhostUser::new(Box::new(guest.clone()), 1, 32, Duration::from_millis(1));
    let (_main, mut workers) = TxMain::builder(config(16, 8, 1), pools.clone())
        .device(eth(1), DeviceFamily::VhostUser(vu))
        .build()
        .unwrap();

    assert_eq!(workers[0].transmit_batch(0, &packets(&pools, 6)), 6);
    assert_eq!(guest.received().len(), 6);
    assert_eq!(guest.received()[5], vec![5u8; 64]);
    assert_eq!(pools.allocated(), 0);
}

#[test]
fn kni_device_sends_on_its_port() {
    let pools = Arc::new(BufferPools::new(1, 32));
    let kni = Arc::new(LoopbackPort::new());
    let (_main, mut workers) = TxMain::builder(config(16, 8, 1), pools.clone())
        .device(eth(1), DeviceFamily::Kni(Box::new(kni.clone())))
        .build()
        .unwrap();

    assert_eq!(workers[0].transmit_batch(0, &packets(&pools, 2)), 2);
    assert!(kni.bursts().iter().all(|b| b.queue == 0));
}

#[test]
fn capture_filters_by_interface() {
    let pools = Arc::new(BufferPools::new(1, 32));
    let log = Arc::new(CaptureLog::new());
    let mut cfg = config(16, 8, 1);
    cfg.pcap.enable = true;
    cfg.pcap.sw_if_index = SW_IF;
    let (_main, mut workers) = TxMain::builder(cfg, pools.clone())
        .device(eth(1), DeviceFamily::Eth(Box::new(LoopbackPort::new())))
        .capture_sink(Box::new(log.clone()))
        .build()
        .unwrap();

    let mut batch = packets(&pools, 3);
    pools.get(batch[1]).sw_if_index_tx = SW_IF + 1;
    workers[0].transmit_batch(0, &batch);

    let captured = log.take();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0].buffer_index, batch[0]);
    assert_eq!(captured[1].buffer_index, batch[2]);
}

#[test]
fn workers_share_scarce_queues() {
    let pools = Arc::new(BufferPools::new(1, 4096));
    let nic = Arc::new(LoopbackPort::new());
    let (main, workers) = TxMain::builder(config(64, 32, 4), pools.clone())
        .device(eth(2), DeviceFamily::Eth(Box::new(nic.clone())))
        .build()
        .unwrap();
    assert!(main.devices()[0].locks().is_some());

    let handles: Vec<_> = workers
        .into_iter()
        .map(|mut worker| {
            let pools = pools.clone();
            std::thread::spawn(move || {
                let mut sent = 0;
                for _ in 0..20 {
                    sent += worker.transmit_batch(0, &packets(&pools, 16));
                }
                sent
            })
        })
        .collect();

    let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 4 * 20 * 16);
    assert_eq!(nic.accepted().len(), total as usize);
    assert!(nic.bursts().iter().all(|b| b.queue < 2));
    assert!(!main.devices()[0].locks().unwrap().is_locked(0));
    assert!(!main.devices()[0].locks().unwrap().is_locked(1));
}

#[test]
fn admin_process_sets_device_state() {
    let h = harness(16, 8, false, 4);
    let admin = AdminProcess::spawn(DeviceAdmin::new(h.main.clone())).unwrap();
    let dev = &h.main.devices()[0];
    assert!(!dev.is_admin_up());

    admin.post_set_flags(SW_IF, SW_INTERFACE_FLAG_ADMIN_UP).unwrap();
    admin.sync().unwrap();
    assert!(dev.is_admin_up());

    // Unknown interfaces are logged and skipped
    admin.post_set_flags(SW_IF + 100, 0).unwrap();
    admin.post_set_flags(SW_IF, 0).unwrap();
    admin.sync().unwrap();
    assert!(!dev.is_admin_up());
}
