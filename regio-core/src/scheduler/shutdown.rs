//! Halting the scheduler.
//!
//! Halting runs on its own thread so it can be requested from anywhere, tick threads included.
//! Every region is moved to `ShuttingDown` and halts on its next turn: its pending tasks retire and
//! its columns are written back. Once no region is left the global tick, the watchdog and the
//! worker pool stop. Chunk work still in flight settles, entities caught between regions are
//! written into their columns, then the storage backend is closed and the chunk I/O runtime is
//! shut down.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use super::{ControlCommand, RegionScheduler};
use crate::token::{ThreadRole, is_tick_thread, set_thread_role};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

impl RegionScheduler {
    /// Stops accepting work and halts every region. Idempotent.
    ///
    /// With `wait_for_drain`, blocks until every region has saved and every scheduler thread has
    /// exited.
    ///
    /// # Panics
    /// Panics if `wait_for_drain` is set on a tick thread, which would wait for itself.
    pub fn halt(&self, wait_for_drain: bool) {
        assert!(
            !(wait_for_drain && is_tick_thread()),
            "halt(true) called from tick thread {:?}; a tick thread cannot wait for its own halt",
            thread::current().name()
        );
        self.0.halting.store(true, Ordering::Release);

        if !self.0.halt_started.swap(true, Ordering::AcqRel) {
            log::info!("Halting the region scheduler");
            let scheduler = self.clone();
            let spawned = thread::Builder::new()
                .name("Region Shutdown Thread".to_owned())
                .spawn(move || scheduler.run_shutdown());
            if let Err(err) = spawned {
                log::error!("Failed to spawn the shutdown thread: {err}");
                if !is_tick_thread() {
                    self.run_shutdown();
                }
            }
        }

        if wait_for_drain {
            self.wait_for_halt();
        }
    }

    /// Blocks until a halt requested through [`RegionScheduler::halt`] has finished.
    pub fn wait_for_halt(&self) {
        let mut halted = self.0.halted.lock();
        while !*halted {
            self.0.halted_signal.wait(&mut halted);
        }
    }

    /// Whether a halt has fully completed.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        *self.0.halted.lock()
    }

    fn run_shutdown(&self) {
        set_thread_role(ThreadRole::Shutdown);
        let started = Instant::now();
        let _ = self.0.control.send(ControlCommand::Halt);

        {
            let mut guard = self.0.release_lock.lock();
            let mut last_log = Instant::now();
            while self.live_regions() > 0 {
                self.0
                    .release_signal
                    .wait_for(&mut guard, Duration::from_millis(50));
                if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                    log::info!(
                        "Waiting for {} regions to finish saving",
                        self.live_regions()
                    );
                    last_log = Instant::now();
                }
            }
        }

        let _ = self.0.control.send(ControlCommand::Stop);
        *self.0.watchdog_stop.lock() = true;
        self.0.watchdog_signal.notify_all();
        let threads: Vec<_> = self.0.threads.lock().drain(..).collect();
        for handle in threads {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_owned();
            if handle.join().is_err() {
                log::error!("{name} panicked while stopping");
            }
        }
        self.0.pool.stop();

        self.0.chunks.fail_pending();
        if !self.0.chunks.wait_idle(RUNTIME_SHUTDOWN_TIMEOUT) {
            log::warn!("Chunk I/O still busy after {RUNTIME_SHUTDOWN_TIMEOUT:?}; saving anyway");
        }
        self.save_stranded();
        self.0.chunks.close_storage();
        let runtime = self.0.io_runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        }
        self.discard_stranded();

        log::info!(
            "Region scheduler halted in {}ms",
            started.elapsed().as_millis()
        );
        log::logger().flush();

        *self.0.halted.lock() = true;
        self.0.halted_signal.notify_all();
    }
}
