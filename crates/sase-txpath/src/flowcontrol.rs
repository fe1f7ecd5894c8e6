//! Flow control gate
//!
//! With a gate installed, a ring that cannot be drained keeps its backlog and
//! the gate is told how deep it is. The traffic manager behind the gate is
//! expected to stop feeding the interface and re-drive it later with
//! [`TxWorker::flush`](crate::TxWorker::flush). Without a gate the backlog is
//! dropped at the end of every dispatch call.

use std::fmt;
use std::sync::Arc;

/// Gate callback: `(hw_if_index, backlog)`
pub type FlowControlFn = dyn Fn(u32, u32) + Send + Sync;

/// Installed flow control callback
#[derive(Clone)]
pub struct FlowControlGate {
    callback: Arc<FlowControlFn>,
}

impl FlowControlGate {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(u32, u32) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Report `backlog` packets still queued on `hw_if_index`
    #[inline]
    pub fn notify(&self, hw_if_index: u32, backlog: u32) {
        (self.callback)(hw_if_index, backlog)
    }
}

impl fmt::Debug for FlowControlGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowControlGate").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_notify_reaches_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let gate = FlowControlGate::new(move |hw, backlog| sink.lock().push((hw, backlog)));

        gate.clone().notify(3, 17);
        assert_eq!(*seen.lock(), vec![(3, 17)]);
    }
}
