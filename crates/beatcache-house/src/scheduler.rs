//! Cleanup scheduling
//!
//! Cleanup requests go through a single-slot channel: a request made while
//! one is already queued is dropped. One worker thread drains the slot and
//! runs a full cleanup pass per request, so passes never overlap.

use crate::house::House;
use beatcache_common::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, error, info};

/// Handle used to request a cleanup pass
#[derive(Debug, Clone)]
pub struct CleanupTrigger {
    tx: Sender<()>,
}

impl CleanupTrigger {
    /// Request a cleanup pass. Returns false if one was already queued.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("cleanup already scheduled");
                false
            }
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

/// Create the single-slot cleanup channel
pub(crate) fn cleanup_signal() -> (CleanupTrigger, Receiver<()>) {
    let (tx, rx) = bounded(1);
    (CleanupTrigger { tx }, rx)
}

/// Background worker running cleanup passes for a [`House`]
pub struct Cleaner {
    shutdown: Arc<AtomicBool>,
    trigger: CleanupTrigger,
    handle: Option<thread::JoinHandle<()>>,
}

impl Cleaner {
    /// Spawn the cleanup worker.
    ///
    /// The worker only holds a weak reference: it exits on its own once the
    /// house is dropped and the next request arrives, or on [`Self::shutdown`].
    pub fn start(house: &Arc<House>) -> Result<Self> {
        let signal = house.cleanup_receiver();
        let weak = Arc::downgrade(house);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("house-cleaner".to_string())
            .spawn(move || run(signal, weak, stop))
            .map_err(|e| Error::internal(format!("failed to spawn cache cleaner: {e}")))?;

        Ok(Self {
            shutdown,
            trigger: house.cleanup_trigger(),
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for an in-progress pass to finish
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake the worker; a full slot wakes it just as well.
        self.trigger.request();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("cache cleaner panicked");
            }
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(signal: Receiver<()>, house: Weak<House>, shutdown: Arc<AtomicBool>) {
    info!("cache cleaner started");

    while signal.recv().is_ok() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let Some(house) = house.upgrade() else {
            break;
        };
        if let Err(e) = house.run_cleanup() {
            error!(error = %e, "cache cleanup failed");
        }
    }

    info!("cache cleaner stopped");
}
