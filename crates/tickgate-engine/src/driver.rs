//! The two call sites the simulation host invokes once per discrete step.
//!
//! ```text
//! before_step(p) ─> run host queue
//!                ─> snapshot registry, keep envs in partition p
//!                ─> gather each active env (one shared deadline)
//!                ─> gather waiting first resets (non-blocking)
//!                ─> gate: Hold if AllOrNone and any active env idle
//!                ─> pre_step first resets, plus every ready env on Advance
//! host advances partition p (only on Advance)
//! after_step()   ─> post_step every env whose pre_step succeeded
//! ```
//!
//! A held cycle leaves the active group's requests parked in their
//! environments; they are reported ready without waiting on the next cycle.
//! First resets are outside the group and are serviced on held cycles too,
//! since a reset needs no host advance. A hook that panics gets its
//! environment quarantined instead of unwinding into the host.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use tickgate_core::PartitionId;
use tracing::{debug, trace, warn};

use crate::config::{BridgeConfig, ConfigError, SteppingPolicy};
use crate::environment::{DriverHooks, Gather, HookError};
use crate::metrics::DriverMetrics;
use crate::registry::Registry;

type EnvGroup = SmallVec<[Arc<dyn DriverHooks>; 8]>;

/// Whether the host may advance the partition this cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepGate {
    /// Advance the partition, then call `after_step`.
    Advance,
    /// Do not advance; still call `after_step` to close the cycle.
    Hold,
}

/// Driver adapter over a [`Registry`]. Owned by the host thread.
pub struct Driver {
    registry: Arc<Registry>,
    config: BridgeConfig,
    stepping: EnvGroup,
    in_cycle: bool,
    metrics: DriverMetrics,
}

impl Driver {
    /// Create a driver over `registry`, validating `config`.
    pub fn new(registry: Arc<Registry>, config: BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            registry,
            config,
            stepping: SmallVec::new(),
            in_cycle: false,
            metrics: DriverMetrics::default(),
        })
    }

    /// The registry this driver iterates.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The validated configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Counters since creation.
    pub fn metrics(&self) -> &DriverMetrics {
        &self.metrics
    }

    /// Number of environments whose post-step is due in `after_step`.
    pub fn stepping_count(&self) -> usize {
        self.stepping.len()
    }

    /// First half of a cycle for `partition`.
    ///
    /// Under [`SteppingPolicy::AllOrNone`] this waits up to the gather
    /// timeout for every active environment; under
    /// [`SteppingPolicy::Independent`] it never waits.
    pub fn before_step(&mut self, partition: PartitionId) -> StepGate {
        if self.in_cycle {
            warn!(%partition, "before_step without after_step; closing previous cycle");
            self.after_step();
        }
        self.in_cycle = true;
        self.metrics.cycles += 1;
        self.metrics.deferred_run += self.registry.host_queue().run_pending() as u64;

        // The gather budget starts after deferred work.
        let start = Instant::now();

        let deadline = match self.config.policy {
            SteppingPolicy::AllOrNone => start + self.config.gather_timeout,
            SteppingPolicy::Independent => start,
        };
        let mut ready = EnvGroup::new();
        let mut first_resets = EnvGroup::new();
        let mut idle = 0usize;
        for env in self.registry.snapshot() {
            if !env.is_in(partition) {
                continue;
            }
            if env.should_step() {
                match guarded(&mut self.metrics, &env, "gather", || env.gather(deadline)) {
                    Some(Gather::Ready) => ready.push(env),
                    Some(Gather::Idle) => {
                        idle += 1;
                        self.metrics.gather_timeouts += 1;
                        trace!(env = %env.id(), %partition, "no request this cycle");
                    }
                    Some(Gather::Closed) | None => {}
                }
            } else if env.awaiting_first_reset() {
                let now = Instant::now();
                if let Some(Gather::Ready) =
                    guarded(&mut self.metrics, &env, "gather", || env.gather(now))
                {
                    first_resets.push(env);
                }
            }
        }
        self.metrics.last_gather_us = start.elapsed().as_micros() as u64;

        let gate = if self.config.policy == SteppingPolicy::AllOrNone && idle > 0 {
            self.metrics.held += 1;
            trace!(%partition, idle, parked = ready.len(), "cycle held");
            ready = first_resets;
            StepGate::Hold
        } else {
            self.metrics.advanced += 1;
            ready.extend(first_resets);
            StepGate::Advance
        };

        for env in ready {
            match guarded(&mut self.metrics, &env, "pre_step", || env.pre_step()) {
                Some(Ok(())) => {
                    self.metrics.pre_tasks_run += 1;
                    self.stepping.push(env);
                }
                Some(Err(error)) => self.record_failure(&*env, "pre_step", &error),
                None => {}
            }
        }
        trace!(%partition, ?gate, stepping = self.stepping.len(), "cycle gated");
        gate
    }

    /// Second half of a cycle: run the post-tasks of every environment
    /// whose pre-task ran in `before_step`. A no-op outside a cycle.
    pub fn after_step(&mut self) {
        if !self.in_cycle {
            return;
        }
        self.in_cycle = false;
        let stepping = std::mem::take(&mut self.stepping);
        for env in stepping {
            match guarded(&mut self.metrics, &env, "post_step", || env.post_step()) {
                Some(Ok(())) => self.metrics.post_tasks_run += 1,
                Some(Err(error)) => self.record_failure(&*env, "post_step", &error),
                None => {}
            }
        }
    }

    /// `before_step`, then `advance` if the gate allows it, then `after_step`.
    /// Returns the gate.
    pub fn cycle(&mut self, partition: PartitionId, advance: impl FnOnce()) -> StepGate {
        let gate = self.before_step(partition);
        if gate == StepGate::Advance {
            advance();
        }
        self.after_step();
        gate
    }

    fn record_failure(&mut self, env: &dyn DriverHooks, hook: &'static str, error: &HookError) {
        match error {
            HookError::Task(task) => {
                self.metrics.task_failures += 1;
                warn!(env = %env.id(), kind = env.kind(), hook, error = %task, "task failed");
            }
            HookError::Closed => debug!(env = %env.id(), hook, "closed during cycle"),
            other => debug!(env = %env.id(), hook, error = %other, "hook skipped"),
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("in_cycle", &self.in_cycle)
            .field("stepping", &self.stepping.len())
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Run a hook, quarantining the environment if it panics.
fn guarded<T>(
    metrics: &mut DriverMetrics,
    env: &Arc<dyn DriverHooks>,
    hook: &'static str,
    f: impl FnOnce() -> T,
) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            metrics.quarantined += 1;
            warn!(env = %env.id(), kind = env.kind(), hook, "hook panicked");
            env.quarantine();
            None
        }
    }
}
