//! Injected behaviour of an [`Environment`](crate::environment::Environment).
//!
//! An environment is one generic type parameterized by a host-state binding
//! `W` (the handle through which it reaches its slice of the simulation:
//! an agent, a scene, a world id) plus five strategies. Scenario variants
//! are built by composing strategies, not by subclassing.
//!
//! All strategy methods run on the driver thread, inside a tick.
//!
//! Extra host capabilities (agent marking, damage tracking) are passed in
//! explicitly through [`Capabilities`] at construction time.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tickgate_core::{Info, ResetOptions, TaskError};

use crate::environment::Environment;

/// Prepares the host state for a new episode.
pub trait ResetStrategy<W>: Send {
    /// Reset `world` for a new episode. Returns reset diagnostics.
    fn reset(
        &mut self,
        world: &mut W,
        seed: Option<u64>,
        options: &ResetOptions,
    ) -> Result<Info, TaskError>;
}

/// Applies an action to the host state before the host advances.
pub trait ActionStrategy<W, A>: Send {
    /// Apply `action` to `world`.
    fn apply(&mut self, world: &mut W, action: A) -> Result<(), TaskError>;
}

/// Reads an observation from the host state.
pub trait ObservationStrategy<W, O>: Send {
    /// Observe `world` after the host advanced.
    fn observe(&mut self, world: &W) -> Result<O, TaskError>;

    /// Per-step diagnostics. Default: empty.
    fn info(&self, _world: &W, _observation: &O) -> Info {
        Info::new()
    }
}

/// Scores a step.
pub trait RewardStrategy<W, O>: Send {
    /// Reward for the step that produced `observation`.
    fn reward(&mut self, world: &W, observation: &O) -> f64;
}

/// Decides whether an episode is over.
pub trait TerminationStrategy<W, O>: Send {
    /// The episode reached a terminal state.
    fn terminated(&self, world: &W, observation: &O) -> bool;

    /// The episode was cut short for a non-terminal reason. Default: never.
    /// Time limits from [`EnvSettings`](crate::config::EnvSettings) are
    /// applied on top of this.
    fn truncated(&self, _world: &W, _observation: &O) -> bool {
        false
    }
}

/// The five strategies of one environment.
pub struct Strategies<W, A, O> {
    /// Episode setup.
    pub reset: Box<dyn ResetStrategy<W>>,
    /// Action application (pre-step).
    pub action: Box<dyn ActionStrategy<W, A>>,
    /// Observation extraction (post-step).
    pub observation: Box<dyn ObservationStrategy<W, O>>,
    /// Reward computation (post-step).
    pub reward: Box<dyn RewardStrategy<W, O>>,
    /// Termination and truncation (post-step).
    pub termination: Box<dyn TerminationStrategy<W, O>>,
}

impl<W, A, O> fmt::Debug for Strategies<W, A, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategies").finish_non_exhaustive()
    }
}

// ── Capabilities ───────────────────────────────────────────────────

/// Shared flag the host raises when an environment's agent is killed.
///
/// The environment consumes it on the next step: the step is reported as
/// terminated and the flag is cleared.
#[derive(Clone, Debug, Default)]
pub struct KilledSignal(Arc<AtomicBool>);

impl KilledSignal {
    /// A lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Called by the host.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Read and clear the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Read the flag without clearing it.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Host-side marking of the entity an environment controls.
pub trait AgentMarker: Send + Sync {
    /// Mark the entity as an agent. `killed` must be triggered by the host
    /// when the entity dies.
    fn mark_as_agent(&self, killed: KilledSignal);

    /// Remove the agent marking. Called once when the environment closes.
    fn unmark_as_agent(&self);
}

/// Host-side damage accounting for an environment's agent.
pub trait DamageTracker: Send + Sync {
    /// Damage dealt by the agent since the last reset.
    fn damage_dealt(&self) -> f64;

    /// Damage taken by the agent since the last reset.
    fn damage_taken(&self) -> f64;
}

/// Optional host capabilities injected at construction time.
#[derive(Clone, Default)]
pub struct Capabilities {
    /// Agent marking and kill notification.
    pub agent: Option<Arc<dyn AgentMarker>>,
    /// Damage accounting, reported in step info as `damage_dealt` and
    /// `damage_taken`.
    pub damage: Option<Arc<dyn DamageTracker>>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("agent", &self.agent.is_some())
            .field("damage", &self.damage.is_some())
            .finish()
    }
}

/// Builds a sibling of an environment with equivalent configuration.
///
/// Runs on the host thread (scheduled through the registry's
/// [`HostQueue`](crate::deferred::HostQueue)), so it may create host-side
/// state directly. The sibling is connected by the caller.
pub type EnvFactory<W, A, O> = Arc<
    dyn Fn(&Environment<W, A, O>) -> Result<Arc<Environment<W, A, O>>, TaskError> + Send + Sync,
>;
