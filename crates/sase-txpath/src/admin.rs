//! Admin up/down event process
//!
//! Interface flag changes requested from the TX side are posted to an event
//! queue and applied on a dedicated thread, so that the poster never waits
//! on interface state machinery.

use crate::dispatch::TxMain;
use crate::error::{Result, TxError};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Interface is administratively up
pub const SW_INTERFACE_FLAG_ADMIN_UP: u32 = 1 << 0;

/// Applies interface flag changes
pub trait InterfaceFlagsHandler: Send + 'static {
    fn set_flags(&mut self, sw_if_index: u32, flags: u32) -> Result<()>;
}

/// Sets the administrative state of devices in a [`TxMain`]
pub struct DeviceAdmin {
    main: Arc<TxMain>,
}

impl DeviceAdmin {
    pub fn new(main: Arc<TxMain>) -> Self {
        Self { main }
    }
}

impl InterfaceFlagsHandler for DeviceAdmin {
    fn set_flags(&mut self, sw_if_index: u32, flags: u32) -> Result<()> {
        let device = self
            .main
            .device_by_sw_if_index(sw_if_index)
            .ok_or(TxError::UnknownInterface(sw_if_index))?;
        let up = flags & SW_INTERFACE_FLAG_ADMIN_UP != 0;
        device.set_admin_up(up);
        tracing::info!(
            sw_if_index,
            device = device.device_index(),
            up,
            "Interface admin state changed"
        );
        Ok(())
    }
}

enum AdminEvent {
    SetFlags { sw_if_index: u32, flags: u32 },
    /// Reply once every earlier event has been applied
    Sync(Sender<()>),
}

/// Handle to the admin event thread. Stops the thread on drop.
pub struct AdminProcess {
    events: Option<Sender<AdminEvent>>,
    in_progress: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AdminProcess {
    /// Start the event thread
    pub fn spawn<H: InterfaceFlagsHandler>(handler: H) -> Result<Self> {
        let (tx, rx) = unbounded();
        let in_progress = Arc::new(AtomicBool::new(false));
        let flag = in_progress.clone();

        let thread = thread::Builder::new()
            .name("tx-admin".into())
            .spawn(move || run(handler, rx, flag))
            .map_err(|e| TxError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            events: Some(tx),
            in_progress,
            thread: Some(thread),
        })
    }

    /// Queue a flag change for `sw_if_index`
    pub fn post_set_flags(&self, sw_if_index: u32, flags: u32) -> Result<()> {
        self.send(AdminEvent::SetFlags { sw_if_index, flags })
    }

    /// True while a batch of events is being applied
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Block until every event posted so far has been applied
    pub fn sync(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.send(AdminEvent::Sync(tx))?;
        rx.recv().map_err(|_| TxError::AdminStopped)
    }

    fn send(&self, event: AdminEvent) -> Result<()> {
        self.events
            .as_ref()
            .ok_or(TxError::AdminStopped)?
            .send(event)
            .map_err(|_| TxError::AdminStopped)
    }

    /// Stop accepting events, apply what is queued and join the thread
    pub fn shutdown(&mut self) {
        self.events.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            tracing::debug!("Admin process stopped");
        }
    }
}

impl Drop for AdminProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<H: InterfaceFlagsHandler>(mut handler: H, events: Receiver<AdminEvent>, in_progress: Arc<AtomicBool>) {
    tracing::debug!("Admin process started");

    while let Ok(first) = events.recv() {
        in_progress.store(true, Ordering::Release);
        apply(&mut handler, first);
        for event in events.try_iter() {
            apply(&mut handler, event);
        }
        in_progress.store(false, Ordering::Release);
    }
}

fn apply<H: InterfaceFlagsHandler>(handler: &mut H, event: AdminEvent) {
    match event {
        AdminEvent::SetFlags { sw_if_index, flags } => {
            if let Err(e) = handler.set_flags(sw_if_index, flags) {
                tracing::error!(sw_if_index, flags, error = %e, "Failed to set interface flags");
            }
        }
        AdminEvent::Sync(reply) => {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder(Arc<Mutex<Vec<(u32, u32)>>>);

    impl InterfaceFlagsHandler for Recorder {
        fn set_flags(&mut self, sw_if_index: u32, flags: u32) -> Result<()> {
            if sw_if_index == 0 {
                return Err(TxError::UnknownInterface(0));
            }
            self.0.lock().push((sw_if_index, flags));
            Ok(())
        }
    }

    #[test]
    fn test_events_applied_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let admin = AdminProcess::spawn(Recorder(seen.clone())).unwrap();

        admin.post_set_flags(1, SW_INTERFACE_FLAG_ADMIN_UP).unwrap();
        admin.post_set_flags(0, 0).unwrap();
        admin.post_set_flags(2, 0).unwrap();
        admin.sync().unwrap();

        assert_eq!(*seen.lock(), vec![(1, 1), (2, 0)]);
    }

    #[test]
    fn test_post_after_shutdown() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut admin = AdminProcess::spawn(Recorder(seen.clone())).unwrap();
        admin.post_set_flags(4, 1).unwrap();
        admin.shutdown();

        // Queued events are drained before the thread exits
        assert_eq!(*seen.lock(), vec![(4, 1)]);
        assert!(matches!(admin.post_set_flags(4, 0), Err(TxError::AdminStopped)));
    }
}
