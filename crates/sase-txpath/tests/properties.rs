//! Property tests: ring bounds and packet conservation

use proptest::prelude::*;
use sase_txpath::loopback::LoopbackPort;
use sase_txpath::{
    BufferIndex, BufferPools, DeviceConfig, DeviceFamily, FlowControlGate, TxConfig, TxMain,
    TxRing, TxWorker,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum RingOp {
    Produce(u32),
    Consume(u32),
    Reset,
}

fn ring_op() -> impl Strategy<Value = RingOp> {
    prop_oneof![
        4 => (1u32..32).prop_map(RingOp::Produce),
        4 => (1u32..32).prop_map(RingOp::Consume),
        1 => Just(RingOp::Reset),
    ]
}

type Setup = (Arc<BufferPools>, Arc<LoopbackPort>, Arc<TxMain>, TxWorker);

fn setup(ring: u32, frame: usize, gated: bool, pool: usize) -> Setup {
    let pools = Arc::new(BufferPools::new(1, pool));
    let nic = Arc::new(LoopbackPort::new());
    let config = TxConfig {
        tx_ring_size: ring,
        frame_size: frame,
        num_workers: 1,
        ..TxConfig::default()
    };
    let mut builder = TxMain::builder(config, pools.clone()).device(
        DeviceConfig {
            device_index: 0,
            hw_if_index: 1,
            sw_if_index: 1,
            tx_queues: 1,
        },
        DeviceFamily::Eth(Box::new(nic.clone())),
    );
    if gated {
        builder = builder.flow_control(FlowControlGate::new(|_, _| {}));
    }
    let (main, mut workers) = builder.build().unwrap();
    (pools, nic, main, workers.remove(0))
}

proptest! {
    #[test]
    fn ring_backlog_stays_in_bounds(ops in prop::collection::vec(ring_op(), 1..200)) {
        let mut ring = TxRing::new(33);
        let mut model: Vec<u32> = Vec::new();
        let mut next = 0u32;

        for op in ops {
            match op {
                RingOp::Produce(n) => {
                    let n = n.min(ring.capacity() - 1 - ring.backlog());
                    for i in 0..n {
                        ring.stage(i, BufferIndex::new(0, next + i));
                        model.push(next + i);
                    }
                    ring.advance_head(n);
                    next += n;
                }
                RingOp::Consume(n) => {
                    let n = n.min(ring.backlog());
                    ring.advance_tail(n);
                    model.drain(..n as usize);
                }
                RingOp::Reset => {
                    ring.reset();
                    model.clear();
                }
            }
            prop_assert!(ring.backlog() < ring.capacity());
            let pending: Vec<u32> = ring.pending().map(|bi| bi.slot()).collect();
            prop_assert_eq!(&pending, &model);
        }
    }

    #[test]
    fn packets_are_conserved(
        n in 1usize..=32,
        accepts in prop::collection::vec(0usize..12, 0..6),
        shared in prop::collection::vec(any::<bool>(), 32),
        spare in 0usize..8,
        gated in any::<bool>(),
    ) {
        let (pools, nic, main, mut worker) = setup(64, 32, gated, n + spare);
        for a in &accepts {
            nic.push_accept(*a);
        }
        // Stop the retry loop once the script runs out
        nic.push_accept(0);

        let batch: Vec<BufferIndex> = (0..n)
            .map(|i| {
                let bi = pools.alloc_packet(0, &[i as u8; 60]).unwrap();
                if shared[i] {
                    pools.get(bi).clone_count = 1;
                }
                bi
            })
            .collect();

        let transmitted = worker.transmit_batch(0, &batch);
        let stats = main.devices()[0].stats().snapshot();
        let remaining = if gated { worker.pending(0) as u64 } else { stats.pkt_drop };

        prop_assert_eq!(transmitted as u64 + remaining + stats.repl_fail, n as u64);
        prop_assert_eq!(nic.accepted().len(), transmitted as usize);
        if !gated {
            prop_assert_eq!(worker.ring(0).head(), 0);
            prop_assert_eq!(worker.ring(0).tail(), 0);
        }
        prop_assert!(worker.ring(0).backlog() < worker.ring(0).capacity());
    }

    #[test]
    fn gated_rounds_keep_ring_consistent(
        rounds in prop::collection::vec((1usize..=8, 0usize..10), 1..30),
    ) {
        let (pools, nic, _main, mut worker) = setup(16, 8, true, 512);
        let mut offered = 0u64;
        let mut transmitted = 0u64;

        for (n, accept) in rounds {
            nic.push_accept(accept);
            let batch: Vec<_> = (0..n).map(|_| pools.alloc_packet(0, &[0; 60]).unwrap()).collect();
            let backlog = worker.pending(0);
            let sent = worker.transmit_batch(0, &batch) as u64;

            if backlog as usize + n >= 16 {
                prop_assert_eq!(sent, backlog as u64);
            } else {
                transmitted += sent;
                offered += n as u64;
            }
            prop_assert!(worker.pending(0) < 16);
            if worker.pending(0) == 0 {
                prop_assert_eq!(worker.ring(0).head(), 0);
            }
            nic.reclaim(&pools);
        }

        prop_assert_eq!(offered, transmitted + worker.pending(0) as u64);
        prop_assert_eq!(pools.allocated() as u64, worker.pending(0) as u64);
    }
}
