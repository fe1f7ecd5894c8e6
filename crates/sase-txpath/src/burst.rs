//! Burst transmitter
//!
//! Drains a ring into its device. A ring that has not wrapped goes out in one
//! burst; a wrapped ring is sent in two, the run up to the end of the array
//! first and the wrapped remainder only if the first run went out whole.

use crate::buffer::BufferPools;
use crate::device::Device;
use crate::ring::TxRing;
use crate::stats::TxFuncError;

/// Retry budget meaning "keep going while the device makes progress"
const NO_RETRY_LIMIT: u32 = u32::MAX;

/// Hand the ring's backlog to `device` on behalf of worker `core`.
///
/// With `gated` set the device gets a single attempt and whatever it refuses
/// stays on the ring. Otherwise the ring is scratch space and bursts repeat
/// until the device stops taking packets.
///
/// Returns the number of packets still pending.
pub fn drain(ring: &mut TxRing, device: &Device, core: usize, pools: &BufferPools, gated: bool) -> u32 {
    let capacity = ring.capacity();
    let mut n_packets = ring.backlog();
    assert!(
        n_packets > 0 && n_packets < capacity,
        "tx ring backlog {} out of range for capacity {}",
        n_packets,
        capacity
    );

    let mut n_retry = if gated { 0 } else { NO_RETRY_LIMIT };

    loop {
        let tail_index = ring.tail_index();
        let head_index = ring.head_index();
        let wrapped = head_index <= tail_index;
        let len = if wrapped {
            capacity - tail_index
        } else {
            head_index - tail_index
        };

        let sent = match device.send(core, ring.slots(tail_index, len), pools) {
            Ok(n) => {
                debug_assert!(n <= len as usize);
                n as u32
            }
            Err(err) => {
                device.stats().record_error(TxFuncError::BadRetval, 1);
                tracing::warn!(
                    device = device.device_index(),
                    core,
                    status = err.0,
                    pending = n_packets,
                    "tx burst returned an error"
                );
                return n_packets;
            }
        };

        if wrapped {
            // One more pass for the remainder, and only if this run went out whole
            n_retry = u32::from(sent == len);
        }

        ring.advance_tail(sent);
        n_packets -= sent;

        if sent == 0 || n_packets == 0 || n_retry == 0 {
            break;
        }
        if n_retry != NO_RETRY_LIMIT {
            n_retry -= 1;
        }
    }

    n_packets
}
