//! Time-driven index flush.
//!
//! One thread per mounted volume wakes on its configured period, flushes
//! buffered data and writes an index if anything changed. Shutdown is
//! cooperative: clear the keepalive flag, signal, join. A fatal sync error
//! stops the thread rather than hammering a broken drive.

use crate::error::Result;
use crate::fsops;
use crate::volume::{MountType, SyncReason, Volume};
use crossbeam::channel::{bounded, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub struct PeriodicSync {
    vol: Arc<Volume>,
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicSync {
    /// Spawn the sync thread. `period` is the wall-clock interval between
    /// sync attempts.
    pub fn start(vol: Arc<Volume>, period: Duration) -> Result<PeriodicSync> {
        let (shutdown, wakeup) = bounded::<()>(1);
        vol.periodic_keepalive.store(true, Ordering::SeqCst);

        let thread_vol = Arc::clone(&vol);
        let thread = std::thread::Builder::new()
            .name("ltfs-periodic-sync".to_string())
            .spawn(move || {
                debug!("periodic sync thread running ({:?} period)", period);
                while thread_vol.periodic_keepalive.load(Ordering::SeqCst) {
                    // A shutdown signal or channel teardown ends the wait
                    // early; a timeout is the normal tick.
                    match wakeup.recv_timeout(period) {
                        Ok(()) => break,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                    }
                    if !thread_vol.periodic_keepalive.load(Ordering::SeqCst) {
                        break;
                    }

                    // Never sync on a read-only style mount.
                    if !matches!(*thread_vol.mount_type.lock(), MountType::ReadWrite) {
                        continue;
                    }

                    debug!("periodic sync tick");
                    if let Err(e) = fsops::flush(&thread_vol, None) {
                        warn!("periodic flush failed: {}", e);
                    }
                    thread_vol.set_commit_message_reason(SyncReason::Periodic);
                    if let Err(e) = thread_vol.sync_index(SyncReason::Periodic, false) {
                        warn!("periodic index sync failed, stopping thread: {}", e);
                        thread_vol.periodic_keepalive.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                debug!("periodic sync thread exiting");
            })
            .map_err(|e| crate::error::LtfsError::Io(e))?;

        Ok(PeriodicSync {
            vol,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.vol.periodic_keepalive.load(Ordering::SeqCst)
            && self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.vol.periodic_keepalive.store(false, Ordering::SeqCst);
        let _ = self.shutdown.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PeriodicSync {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::sim::SimTape;
    use crate::tape::TapeDevice;
    use crate::volume::MountOptions;

    fn mounted() -> Arc<Volume> {
        let dev = TapeDevice::open(Box::new(SimTape::new())).unwrap();
        let mut opts = MountOptions::default();
        opts.enable_lbp = false;
        opts.sync_period = None;
        let vol = Volume::new(dev, opts);
        vol.format_volume("ABC123", 1024).unwrap();
        vol.mount(MountType::ReadWrite).unwrap();
        vol
    }

    #[test]
    fn periodic_tick_writes_dirty_index() {
        let vol = mounted();
        fsops::create(&vol, "/touched", false, false, false).unwrap();
        assert!(vol.index.read().dirty);

        let sync = PeriodicSync::start(Arc::clone(&vol), Duration::from_millis(30)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while vol.index.read().dirty && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!vol.index.read().dirty);
        assert_eq!(vol.index.read().generation, 1);
        sync.stop();
    }

    #[test]
    fn shutdown_is_cooperative() {
        let vol = mounted();
        let sync = PeriodicSync::start(Arc::clone(&vol), Duration::from_secs(3600)).unwrap();
        assert!(sync.is_running());
        sync.stop();
        assert!(!vol.periodic_keepalive.load(Ordering::SeqCst));
    }

    #[test]
    fn rollback_mount_never_syncs() {
        let vol = mounted();
        *vol.mount_type.lock() = MountType::Rollback;
        fsops::create(&vol, "/f", false, false, false).unwrap_err();
        vol.index.write().dirty = true;

        let sync = PeriodicSync::start(Arc::clone(&vol), Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        // Still dirty: the read-only mount type suppressed the sync.
        assert!(vol.index.read().dirty);
        sync.stop();
    }
}
