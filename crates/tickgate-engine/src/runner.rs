//! A dedicated host thread that drives a [`SimulationHost`] through the
//! [`Driver`] once per tick.
//!
//! The loop owns the host and the driver exclusively (moved in at spawn)
//! and hands both back on [`TickLoop::shutdown`]. Each tick walks the host's
//! partitions in order:
//!
//! ```text
//! for p in host.partitions():
//!     before_step(p) == Advance  =>  host.advance(p)
//!     after_step()
//! sleep the rest of the tick budget (park_timeout, so shutdown wakes it)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tickgate_core::PartitionId;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::driver::{Driver, StepGate};
use crate::metrics::DriverMetrics;

/// The single-threaded simulation the bridge synchronizes with.
pub trait SimulationHost: Send + 'static {
    /// Partitions advanced each tick, in order. Default: one partition, 0.
    fn partitions(&self) -> Vec<PartitionId> {
        vec![PartitionId(0)]
    }

    /// Advance `partition` by one discrete step.
    fn advance(&mut self, partition: PartitionId);
}

// ── ShutdownReport ───────────────────────────────────────────────

/// Result of [`TickLoop::shutdown`].
#[derive(Debug)]
pub struct ShutdownReport<H> {
    /// The host, recovered from the loop thread. `None` if the loop thread
    /// panicked or the loop was already shut down.
    pub host: Option<H>,
    /// Ticks completed.
    pub ticks: u64,
    /// Driver counters at shutdown.
    pub metrics: DriverMetrics,
    /// Total time spent in the shutdown sequence.
    pub total_ms: u64,
    /// Whether the loop thread was joined successfully.
    pub joined: bool,
}

// ── TickLoop ─────────────────────────────────────────────────────

/// Handle to a running host thread.
pub struct TickLoop<H: SimulationHost> {
    shutdown_flag: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    thread: Option<JoinHandle<(H, Driver)>>,
}

impl<H: SimulationHost> TickLoop<H> {
    /// Spawn the host thread. The tick rate comes from the driver's
    /// [`BridgeConfig::tick_rate_hz`](crate::config::BridgeConfig::tick_rate_hz);
    /// without one, ticks run back to back.
    pub fn spawn(host: H, driver: Driver) -> Result<Self, ConfigError> {
        let budget = driver.config().tick_budget();
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let loop_shutdown = Arc::clone(&shutdown_flag);
        let loop_ticks = Arc::clone(&ticks);
        let thread = thread::Builder::new()
            .name("tickgate-host".into())
            .spawn(move || run(host, driver, &loop_shutdown, &loop_ticks, budget))
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: e.to_string(),
            })?;
        Ok(Self {
            shutdown_flag,
            ticks,
            thread: Some(thread),
        })
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Whether the loop thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop after its current tick and recover the host.
    ///
    /// Connected environments are left open; control threads blocked in
    /// `reset`/`step` fail with `HostUnavailable` once their timeouts
    /// elapse, or immediately if the caller closes them.
    pub fn shutdown(&mut self) -> ShutdownReport<H> {
        let start = Instant::now();
        let Some(handle) = self.thread.take() else {
            return ShutdownReport {
                host: None,
                ticks: self.ticks(),
                metrics: DriverMetrics::default(),
                total_ms: 0,
                joined: true,
            };
        };
        self.shutdown_flag.store(true, Ordering::Release);
        // Wake the thread if it is parked in a budget sleep.
        handle.thread().unpark();
        let (host, metrics, joined) = match handle.join() {
            Ok((host, driver)) => (Some(host), driver.metrics().clone(), true),
            Err(_) => {
                warn!("host thread panicked");
                (None, DriverMetrics::default(), false)
            }
        };
        ShutdownReport {
            host,
            ticks: self.ticks(),
            metrics,
            total_ms: start.elapsed().as_millis() as u64,
            joined,
        }
    }
}

impl<H: SimulationHost> Drop for TickLoop<H> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

impl<H: SimulationHost> fmt::Debug for TickLoop<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickLoop")
            .field("ticks", &self.ticks())
            .field("running", &self.is_running())
            .finish()
    }
}

fn run<H: SimulationHost>(
    mut host: H,
    mut driver: Driver,
    shutdown: &AtomicBool,
    ticks: &AtomicU64,
    budget: Option<Duration>,
) -> (H, Driver) {
    debug!(?budget, "host loop started");
    while !shutdown.load(Ordering::Acquire) {
        let tick_start = Instant::now();
        for partition in host.partitions() {
            if driver.before_step(partition) == StepGate::Advance {
                host.advance(partition);
            }
            driver.after_step();
        }
        ticks.fetch_add(1, Ordering::AcqRel);
        match budget {
            Some(budget) => sleep_until(tick_start + budget, shutdown),
            None => thread::yield_now(),
        }
    }
    debug!(ticks = ticks.load(Ordering::Acquire), "host loop stopped");
    (host, driver)
}

// park_timeout may wake spuriously; unpark from shutdown ends it early.
fn sleep_until(deadline: Instant, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return;
        };
        thread::park_timeout(remaining);
    }
}
