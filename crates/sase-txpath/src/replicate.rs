//! Buffer replication
//!
//! A buffer shared by several logical sends cannot be handed to a device,
//! which would take ownership of memory other owners still reference. The TX
//! path transmits a deep copy instead.

use crate::buffer::{BufferIndex, BufferPools, BUFFER_SIZE, HEADROOM};

/// Deep-copy the packet starting at `src` into buffers from the pool local to
/// `socket`.
///
/// Walks as many segments as the packet header declares. Returns `None` if the
/// chain is shorter than declared or the pool runs dry; whatever was
/// allocated for the copy is released first.
pub fn replicate_packet(pools: &BufferPools, socket: u8, src: BufferIndex) -> Option<BufferIndex> {
    let nb_segs = pools.get(src).mbuf.nb_segs;
    let mut first: Option<BufferIndex> = None;
    let mut prev: Option<BufferIndex> = None;
    let mut cur = Some(src);

    for seg in 0..nb_segs {
        let Some(src_seg) = cur else {
            tracing::warn!(
                nb_segs,
                found = seg,
                "missing buffer chain segment(s) during replication"
            );
            release(pools, first);
            return None;
        };

        let Some(new_seg) = pools.alloc(socket) else {
            release(pools, first);
            return None;
        };

        {
            let s = pools.get(src_seg);
            let mut d = pools.get(new_seg);

            if first.is_none() {
                d.mbuf.pkt_len = s.mbuf.pkt_len;
                d.mbuf.nb_segs = s.mbuf.nb_segs;
                d.mbuf.port = s.mbuf.port;
            }

            d.mbuf.data_off = s.mbuf.data_off;
            d.mbuf.data_len = s.mbuf.data_len;
            d.current_data = s.current_data;
            d.current_length = s.current_length;
            d.sw_if_index_tx = s.sw_if_index_tx;

            // Headroom plus data, whichever view reaches further
            let native_end = s.mbuf.data_off as usize + s.mbuf.data_len as usize;
            let pipeline_end = (HEADROOM as i32 + s.current_data as i32) as usize
                + s.current_length as usize;
            let copy_bytes = native_end.max(pipeline_end).min(BUFFER_SIZE);
            d.raw_mut()[..copy_bytes].copy_from_slice(&s.raw()[..copy_bytes]);

            cur = s.next();
        }

        match prev {
            None => first = Some(new_seg),
            Some(p) => pools.get(p).set_next(Some(new_seg)),
        }
        prev = Some(new_seg);
    }

    first
}

/// Release a partially built copy. The copy is private, so its share count is
/// always zero and `free` releases every segment.
fn release(pools: &BufferPools, first: Option<BufferIndex>) {
    if let Some(bi) = first {
        pools.free(bi);
    }
}
