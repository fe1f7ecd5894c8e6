//! OpenSASE TX Path simulator
//!
//! Runs the TX path against loopback devices: one NIC with fewer queues than
//! workers, one vhost-user guest and one kernel interface.

use sase_txpath::loopback::{LoopbackPort, LoopbackVhost};
use sase_txpath::{
    AdminProcess, BufferIndex, BufferPools, DeviceAdmin, DeviceConfig, DeviceFamily,
    FlowControlGate, TxConfig, TxMain, TxWorker, VhostUser, DEFAULT_BUFFERS_PER_SOCKET,
    SW_INTERFACE_FLAG_ADMIN_UP,
};
use std::sync::Arc;
use std::thread;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenSASE TX simulator v{}", env!("CARGO_PKG_VERSION"));
    sase_txpath::stats::describe_metrics();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "/etc/opensase/txpath.json".into());
    let config = TxConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!(path = %config_path, error = %e, "Config not loaded, using defaults");
        TxConfig::default()
    });
    let rounds: usize = std::env::var("SIM_ROUNDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);
    let flow_control = std::env::var("SIM_FLOW_CONTROL").is_ok();

    let workers = config.num_workers;
    let frame_size = config.frame_size;
    let pools = Arc::new(BufferPools::new(1, DEFAULT_BUFFERS_PER_SOCKET));

    let nic = Arc::new(LoopbackPort::new());
    let kni = Arc::new(LoopbackPort::new());
    let guest = Arc::new(LoopbackVhost::new(pools.clone()));
    guest.set_want_interrupt(true);

    let mut builder = TxMain::builder(config.clone(), pools.clone())
        .device(
            DeviceConfig {
                device_index: 0,
                hw_if_index: 1,
                sw_if_index: 1,
                tx_queues: (workers as u16 / 2).max(1),
            },
            DeviceFamily::Eth(Box::new(nic.clone())),
        )
        .device(
            DeviceConfig {
                device_index: 1,
                hw_if_index: 2,
                sw_if_index: 2,
                tx_queues: 1,
            },
            DeviceFamily::VhostUser(VhostUser::new(
                Box::new(guest.clone()),
                1,
                config.vhost_coalesce_frames,
                config.vhost_coalesce_time(),
            )),
        )
        .device(
            DeviceConfig {
                device_index: 2,
                hw_if_index: 3,
                sw_if_index: 3,
                tx_queues: 1,
            },
            DeviceFamily::Kni(Box::new(kni.clone())),
        );
    if flow_control {
        builder = builder.flow_control(FlowControlGate::new(|hw_if_index, backlog| {
            tracing::debug!(hw_if_index, backlog, "Flow control asserted");
        }));
    }
    let (main, tx_workers) = builder.build()?;

    let admin = AdminProcess::spawn(DeviceAdmin::new(main.clone()))?;
    for dev in main.devices() {
        admin.post_set_flags(dev.sw_if_index(), SW_INTERFACE_FLAG_ADMIN_UP)?;
    }
    admin.sync()?;

    let handles = tx_workers
        .into_iter()
        .map(|worker| {
            let pools = pools.clone();
            let sinks = [nic.clone(), kni.clone()];
            thread::Builder::new()
                .name(format!("tx-worker-{}", worker.core()))
                .spawn(move || run_worker(worker, &pools, &sinks, rounds, frame_size))
        })
        .collect::<Result<Vec<_>, _>>()?;

    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("TX worker panicked");
        }
    }

    for dev in main.devices() {
        let s = dev.stats().snapshot();
        tracing::info!(
            device = dev.device_index(),
            family = dev.family().name(),
            tx_packets = s.tx_packets,
            ring_full = s.ring_full,
            pkt_drop = s.pkt_drop,
            repl_fail = s.repl_fail,
            bad_retval = s.bad_retval,
            "Device TX summary"
        );
    }
    tracing::info!(
        guest_frames = guest.received().len(),
        guest_interrupts = guest.interrupts(),
        buffers_in_use = pools.allocated(),
        "Simulation finished"
    );

    Ok(())
}

/// One worker's run-to-completion loop
fn run_worker(
    mut worker: TxWorker,
    pools: &BufferPools,
    sinks: &[Arc<LoopbackPort>],
    rounds: usize,
    frame_size: usize,
) {
    tracing::debug!("Worker {} starting", worker.core());
    let devices = worker.main().devices().len();
    let mut sent = 0u64;

    for round in 0..rounds {
        for device in 0..devices {
            let batch = make_batch(pools, worker.socket(), frame_size, round);
            sent += worker.transmit_batch(device, &batch) as u64;
            if worker.main().is_flow_controlled() {
                worker.flush(device);
            }
        }
        for sink in sinks {
            sink.reclaim(pools);
        }
    }

    tracing::debug!(core = worker.core(), sent, "Worker stopped");
}

/// A batch of synthetic IPv4 frames. Every eighth round sends one frame twice,
/// as a flood would, so the replication path is exercised.
fn make_batch(pools: &BufferPools, socket: u8, frame_size: usize, round: usize) -> Vec<BufferIndex> {
    let mut frame = [0u8; 64];
    frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

    let want = (round % frame_size) + 1;
    let mut batch = Vec::with_capacity(want);
    while batch.len() < want {
        let Some(bi) = pools.alloc_packet(socket, &frame) else {
            break;
        };
        batch.push(bi);
    }

    if round % 8 == 0 && !batch.is_empty() && batch.len() < frame_size {
        let shared = batch[0];
        pools.get(shared).clone_count += 1;
        batch.push(shared);
    }
    batch
}
