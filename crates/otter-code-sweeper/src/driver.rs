//! Optional dedicated sweeper thread
//!
//! The sweeper itself needs no thread of its own; workers call
//! [`Sweeper::advance`] whenever they have a moment. Embedders without idle
//! workers can spawn a [`SweeperThread`] instead.

use crate::sweeper::Sweeper;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct DriverShared {
    shutdown: AtomicBool,
    /// Advance calls made so far
    ticks: AtomicU64,
    /// Wakes the thread early on shutdown
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// Background thread calling [`Sweeper::advance`] on an interval
pub struct SweeperThread {
    shared: Arc<DriverShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SweeperThread {
    /// Spawn a thread that advances `sweeper` every `interval`
    pub fn spawn(sweeper: Arc<Sweeper>, interval: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(DriverShared {
            shutdown: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("otter-code-sweeper".to_string())
            .spawn(move || run(sweeper, thread_shared, interval))?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Number of `advance` calls made by the thread
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Acquire)
    }

    /// Whether the thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.mutex.lock();
            self.shared.condvar.notify_all();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!(target: "otter::sweeper", "Sweeper thread panicked");
        }
    }
}

impl Drop for SweeperThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(sweeper: Arc<Sweeper>, shared: Arc<DriverShared>, interval: Duration) {
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Err(err) = sweeper.advance() {
            tracing::error!(
                target: "otter::sweeper",
                error = %err,
                "Sweeper thread stopping"
            );
            return;
        }
        shared.ticks.fetch_add(1, Ordering::AcqRel);

        let mut guard = shared.mutex.lock();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared.condvar.wait_for(&mut guard, interval);
    }
}
