//! Bridge configuration, validation, and error types.
//!
//! [`BridgeConfig`] carries the timeouts shared by the control side and the
//! driver side plus the cross-environment [`SteppingPolicy`].
//! [`EnvSettings`] carries per-environment episode settings.

use std::time::Duration;

use thiserror::Error;

// ── SteppingPolicy ─────────────────────────────────────────────────

/// How the driver treats a partition whose environments are not all ready.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SteppingPolicy {
    /// The host advances a partition only if every active environment in it
    /// has a request ready. Otherwise the cycle is held: gathered requests
    /// stay parked and run on the next cycle that advances. Requires one
    /// control thread per environment; a single thread stepping several
    /// environments in sequence would hold the partition forever.
    #[default]
    AllOrNone,
    /// The host always advances. Environments with a ready request have
    /// their tasks run this cycle; the rest simply miss the tick.
    Independent,
}

// ── BridgeConfig ───────────────────────────────────────────────────

/// Timeouts and policy for environments and the driver.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// How long a control thread waits for the driver to take its request
    /// before failing with `HostUnavailable`. Default: 10 s.
    pub handoff_timeout: Duration,
    /// How long a control thread waits for a taken request to finish before
    /// failing with `HostUnavailable`. Default: 10 s.
    pub result_timeout: Duration,
    /// Budget the driver spends per cycle waiting for requests from active
    /// environments. Default: 50 ms.
    pub gather_timeout: Duration,
    /// Cross-environment readiness policy. Default: [`SteppingPolicy::AllOrNone`].
    pub policy: SteppingPolicy,
    /// Optional target cycle rate for [`TickLoop`](crate::runner::TickLoop).
    /// `None` runs cycles back to back.
    pub tick_rate_hz: Option<f64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handoff_timeout: Duration::from_secs(10),
            result_timeout: Duration::from_secs(10),
            gather_timeout: Duration::from_millis(50),
            policy: SteppingPolicy::AllOrNone,
            tick_rate_hz: None,
        }
    }
}

impl BridgeConfig {
    /// Validate all structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("handoff_timeout", self.handoff_timeout),
            ("result_timeout", self.result_timeout),
            ("gather_timeout", self.gather_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroTimeout { name });
            }
        }
        if self.gather_timeout >= self.handoff_timeout {
            return Err(ConfigError::GatherExceedsHandoff {
                gather: self.gather_timeout,
                handoff: self.handoff_timeout,
            });
        }
        if let Some(hz) = self.tick_rate_hz {
            if !hz.is_finite() || hz <= 0.0 {
                return Err(ConfigError::InvalidTickRate { value: hz });
            }
        }
        Ok(())
    }

    /// Per-cycle budget derived from `tick_rate_hz`.
    pub fn tick_budget(&self) -> Option<Duration> {
        self.tick_rate_hz
            .filter(|hz| hz.is_finite() && *hz > 0.0)
            .map(|hz| Duration::from_secs_f64(1.0 / hz))
    }
}

// ── EnvSettings ────────────────────────────────────────────────────

/// Per-environment episode settings.
///
/// `frame_stack` and `use_monitor` are not interpreted by the bridge; they
/// are surfaced to the control process, which builds its wrappers from them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvSettings {
    /// Truncate an episode after this many steps. `None` = unlimited.
    pub time_limit: Option<u32>,
    /// Number of observations the control side should stack.
    pub frame_stack: u32,
    /// Whether the control side should record episode statistics.
    pub use_monitor: bool,
}

impl EnvSettings {
    /// Validate the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_limit == Some(0) {
            return Err(ConfigError::ZeroTimeLimit);
        }
        Ok(())
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected while validating configuration or starting threads.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConfigError {
    /// A timeout was zero.
    #[error("{name} must be non-zero")]
    ZeroTimeout {
        /// Which timeout.
        name: &'static str,
    },
    /// The driver's gather budget is not shorter than the control side's
    /// handoff timeout.
    #[error("gather_timeout {gather:?} must be shorter than handoff_timeout {handoff:?}")]
    GatherExceedsHandoff {
        /// Configured gather budget.
        gather: Duration,
        /// Configured handoff timeout.
        handoff: Duration,
    },
    /// tick_rate_hz is NaN, infinite, zero, or negative.
    #[error("tick_rate_hz must be finite and positive, got {value}")]
    InvalidTickRate {
        /// The invalid value.
        value: f64,
    },
    /// `time_limit` of zero would truncate every episode before it starts.
    #[error("time_limit must be at least 1")]
    ZeroTimeLimit,
    /// The driver thread could not be spawned.
    #[error("thread spawn failed: {reason}")]
    ThreadSpawnFailed {
        /// The OS error.
        reason: String,
    },
}
