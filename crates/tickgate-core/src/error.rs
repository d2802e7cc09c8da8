//! Error types for the Tickgate bridge.
//!
//! [`EnvError`] is what the control process sees from `reset`/`step`.
//! Its variants are deliberately distinct so a training loop can decide
//! whether to retry, abandon the episode, or rebuild the environment.
//! [`TaskError`] is the failure captured inside a [`Task`](crate::Task)
//! and re-raised to whoever waits on it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::id::EnvId;

/// Why a task was completed without running its computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The owning environment was closed.
    Closed,
    /// The waiting control thread gave up on the driver.
    TimedOut,
    /// The driver excluded the environment after a channel failure.
    Quarantined,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "environment closed"),
            Self::TimedOut => write!(f, "timed out waiting for the driver"),
            Self::Quarantined => write!(f, "environment quarantined by the driver"),
        }
    }
}

/// Failure captured by a [`Task`](crate::Task).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The computation returned an error.
    #[error("computation failed: {reason}")]
    Failed {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// The computation panicked. The panic was caught on the thread that
    /// ran the task so the driver loop keeps going.
    #[error("computation panicked: {message}")]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },
    /// The pre-step half of a handoff failed, so the post-step half was
    /// never run.
    #[error("pre-step failed: {0}")]
    PreStepFailed(Box<TaskError>),
    /// The task was completed without running.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why the task was cancelled.
        reason: CancelReason,
    },
}

impl TaskError {
    /// Shorthand for [`TaskError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced to the control process by environment operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EnvError {
    /// A `reset` or `step` is already outstanding on this environment.
    /// Concurrent calls on one environment violate the caller contract.
    #[error("{env}: a reset/step request is already outstanding")]
    AlreadyPending {
        /// The environment that was called concurrently.
        env: EnvId,
    },
    /// The simulation host stopped servicing the environment (no
    /// `before_step`/`after_step` within the timeout).
    #[error("{env}: simulation host unavailable after {waited:?}")]
    HostUnavailable {
        /// The environment whose request went unserviced.
        env: EnvId,
        /// How long the caller waited.
        waited: Duration,
    },
    /// `step` was called before the first successful `reset`. Nothing was
    /// handed to the driver.
    #[error("{env}: step called before the first reset")]
    NotReset {
        /// The environment that has not been reset.
        env: EnvId,
    },
    /// The operation was attempted on, or interrupted by, a closed
    /// environment.
    #[error("{env}: environment is closed")]
    Closed {
        /// The closed environment.
        env: EnvId,
    },
    /// The environment-specific computation failed on the driver thread.
    #[error("{env}: {source}")]
    Computation {
        /// The environment whose computation failed.
        env: EnvId,
        /// The captured failure.
        #[source]
        source: TaskError,
    },
}

impl EnvError {
    /// The environment this error concerns.
    pub fn env(&self) -> EnvId {
        match self {
            Self::AlreadyPending { env }
            | Self::NotReset { env }
            | Self::HostUnavailable { env, .. }
            | Self::Closed { env }
            | Self::Computation { env, .. } => *env,
        }
    }

    /// Whether the same call may succeed once the outstanding request
    /// has returned.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AlreadyPending { .. })
    }

    /// Whether the environment should be closed and rebuilt
    /// (e.g. via `make_another`) before further use. `NotReset` only needs
    /// a `reset`.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            Self::HostUnavailable { .. } | Self::Closed { .. } | Self::Computation { .. }
        )
    }

    /// Map a task failure observed by `env` onto the control-facing
    /// taxonomy. Cancellations become `Closed` or `HostUnavailable`.
    pub fn from_task(env: EnvId, error: TaskError, waited: Duration) -> Self {
        match error {
            TaskError::Cancelled {
                reason: CancelReason::Closed,
            } => Self::Closed { env },
            TaskError::Cancelled {
                reason: CancelReason::TimedOut | CancelReason::Quarantined,
            } => Self::HostUnavailable { env, waited },
            source => Self::Computation { env, source },
        }
    }
}
