//! Background write-back of dirty slots.

use crate::{BlockCache, BlockDevice};
use bcache_error::{CacheError, Result};
use bcache_types::DEFAULT_FLUSH_INTERVAL;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushDaemonConfig {
    /// Pause between the end of one sweep and the start of the next.
    pub interval: Duration,
}

impl Default for FlushDaemonConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Cooperative stop flag the daemon sleeps on.
#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `interval` unless stopped first. Returns true once stopped.
    fn sleep(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.wake.wait_for(&mut stopped, interval);
        }
        *stopped
    }
}

/// Handle to a running flush thread.
///
/// [`shutdown`](Self::shutdown) consumes the handle, so a daemon is stopped
/// exactly once. Dropping the handle stops it too. A sweep in progress is
/// always allowed to finish; no write-back is interrupted.
#[derive(Debug)]
pub struct FlushDaemon {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    /// Signal the thread and wait for it to exit.
    ///
    /// Once this returns the cache sees no further background mutation.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn stop_and_join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.signal.stop();
        if handle.join().is_err() {
            error!("flush daemon thread panicked");
        } else {
            info!("flush daemon stopped");
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl<D: BlockDevice + 'static> BlockCache<D> {
    /// Start the background flusher for this cache.
    ///
    /// Every `interval` the daemon walks the slot table in index order and
    /// writes back each dirty, unlocked slot, releasing the cache lock
    /// around each device write. A failed write-back leaves the slot dirty
    /// for the next sweep.
    ///
    /// A cache has at most one daemon: starting another while the first is
    /// still running fails with [`CacheError::DaemonAlreadyRunning`].
    pub fn start_flush_daemon(self: &Arc<Self>, config: FlushDaemonConfig) -> Result<FlushDaemon> {
        if config.interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "flush interval must be > 0".to_owned(),
            ));
        }
        if self
            .daemon_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CacheError::DaemonAlreadyRunning);
        }

        let signal = Arc::new(StopSignal::default());
        let cache = Arc::clone(self);
        let thread_signal = Arc::clone(&signal);

        let handle = std::thread::Builder::new()
            .name("bcache-flush".to_owned())
            .spawn(move || {
                run_flush_loop(&cache, &thread_signal, config.interval);
                cache.daemon_running.store(false, Ordering::Release);
            })
            .map_err(|err| {
                self.daemon_running.store(false, Ordering::Release);
                CacheError::DaemonSpawn(err)
            })?;

        info!(
            interval_ms = u64::try_from(config.interval.as_millis()).unwrap_or(u64::MAX),
            policy = %self.policy(),
            "flush daemon started"
        );
        Ok(FlushDaemon {
            signal,
            handle: Some(handle),
        })
    }
}

fn run_flush_loop<D: BlockDevice>(cache: &BlockCache<D>, signal: &StopSignal, interval: Duration) {
    let mut sweeps = 0_u64;
    while !signal.is_stopped() {
        let outcome = cache.sweep_dirty();
        sweeps += 1;
        if outcome.written > 0 || outcome.failed > 0 {
            debug!(
                sweep = sweeps,
                written = outcome.written,
                failed = outcome.failed,
                "flush sweep complete"
            );
        }
        if signal.sleep(interval) {
            break;
        }
    }
    debug!(sweeps, "flush loop exiting");
}
