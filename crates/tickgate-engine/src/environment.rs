//! The generic environment: control-side lifecycle plus driver-side hooks.
//!
//! A control thread calls [`Environment::reset`] or [`Environment::step`].
//! The call claims the environment's request slot, builds a pre-task (apply
//! the action) and a post-task (observe, score, decide termination),
//! publishes the pair on the environment's rendezvous channel and blocks on
//! the post-task.
//!
//! The driver thread sees the environment only through [`DriverHooks`]:
//! [`gather`](DriverHooks::gather) parks the next request,
//! [`pre_step`](DriverHooks::pre_step) runs its pre-task before the host
//! advances, and [`post_step`](DriverHooks::post_step) runs its post-task
//! afterwards, which unblocks the control thread. A post-task never runs
//! unless its pre-task completed successfully in the same cycle.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Instant;

use thiserror::Error;
use tickgate_core::{
    CancelReason, EnvError, EnvId, InfoValue, PartitionId, ResetOptions, ResetResult,
    Runnable, StepResult, Task, TaskError,
};
use tracing::{debug, trace, warn};

use crate::config::{BridgeConfig, ConfigError, EnvSettings};
use crate::handoff::{HandoffChannel, HandoffError};
use crate::registry::{Registry, RegistryError};
use crate::state::EnvState;
use crate::strategy::{Capabilities, DamageTracker, EnvFactory, KilledSignal, Strategies};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Driver-facing interface ────────────────────────────────────────

/// Outcome of [`DriverHooks::gather`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gather {
    /// A request is parked and ready for `pre_step`.
    Ready,
    /// No request arrived before the deadline.
    Idle,
    /// The environment is closed.
    Closed,
}

/// Failure of a driver-side hook.
///
/// Task failures are also delivered to the waiting control thread; the
/// driver only logs them.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HookError {
    /// `pre_step` found no request within its bounded wait.
    #[error("no request was gathered")]
    NothingGathered,
    /// `post_step` was called without a successful `pre_step` this cycle.
    #[error("post_step called without a matching pre_step")]
    OutOfOrder,
    /// The environment was closed.
    #[error("environment is closed")]
    Closed,
    /// The pre- or post-task failed.
    #[error("task failed: {0}")]
    Task(#[from] TaskError),
}

/// What the driver needs from an environment, independent of its binding,
/// action and observation types. The registry stores `Arc<dyn DriverHooks>`.
///
/// Every method except `close` and `attach` is called on the driver thread
/// only.
pub trait DriverHooks: Send + Sync {
    /// Registry key.
    fn id(&self) -> EnvId;
    /// Kind the environment was connected under (empty before connect).
    fn kind(&self) -> &str;
    /// Human-readable unique name.
    fn name(&self) -> String;
    /// `initialized && !paused && !closed`.
    fn should_step(&self) -> bool;
    /// Not yet initialized and not closed: a first `reset` may be waiting.
    fn awaiting_first_reset(&self) -> bool;
    /// Whether the environment belongs to `partition`.
    fn is_in(&self, partition: PartitionId) -> bool;
    /// Park the next request, waiting until `deadline` at most. A deadline
    /// already in the past makes this non-blocking. A request parked by an
    /// earlier held cycle is reported `Ready` without waiting.
    fn gather(&self, deadline: Instant) -> Gather;
    /// Run the parked request's pre-task. Takes a request itself (bounded
    /// by the gather timeout) if none is parked.
    fn pre_step(&self) -> Result<(), HookError>;
    /// Run the post-task of the request whose pre-task ran this cycle.
    fn post_step(&self) -> Result<(), HookError>;
    /// Close the environment after a driver-side fault. Waiting control
    /// threads see `HostUnavailable`.
    fn quarantine(&self);
    /// Close the environment. Safe from any thread.
    fn close(&self);
    /// Whether the environment is closed.
    fn is_closed(&self) -> bool;
    /// Called by [`Registry::connect`] with the registry and kind.
    fn attach(&self, registry: Weak<Registry>, kind: &str);
}

// ── Requests ───────────────────────────────────────────────────────

struct Handoff {
    pre: Option<Arc<dyn Runnable>>,
    post: Arc<dyn Runnable>,
}

impl Handoff {
    fn abort(&self, reason: CancelReason) {
        let error = TaskError::Cancelled { reason };
        self.post.abort(error.clone());
        if let Some(pre) = &self.pre {
            pre.abort(error);
        }
    }
}

#[derive(Default)]
struct InFlight {
    request: Option<Handoff>,
    pre_ran: bool,
}

// ── Episode state ──────────────────────────────────────────────────

struct EnvCore<W, A, O> {
    world: W,
    strategies: Strategies<W, A, O>,
    time_limit: Option<u32>,
    episode_steps: u32,
    episodes: u64,
    killed: KilledSignal,
    damage: Option<Arc<dyn DamageTracker>>,
}

impl<W, A, O> EnvCore<W, A, O> {
    fn reset(
        &mut self,
        seed: Option<u64>,
        options: &ResetOptions,
    ) -> Result<ResetResult<O>, TaskError> {
        let Self {
            world,
            strategies,
            episode_steps,
            episodes,
            killed,
            ..
        } = self;
        let info = strategies.reset.reset(world, seed, options)?;
        let observation = strategies.observation.observe(world)?;
        killed.take();
        *episode_steps = 0;
        *episodes += 1;
        Ok(ResetResult { observation, info })
    }

    fn apply(&mut self, action: A) -> Result<(), TaskError> {
        let Self {
            world, strategies, ..
        } = self;
        strategies.action.apply(world, action)
    }

    fn finish_step(&mut self) -> Result<StepResult<O>, TaskError> {
        let limit = self.time_limit;
        let Self {
            world,
            strategies,
            episode_steps,
            killed,
            damage,
            ..
        } = self;
        *episode_steps += 1;
        let observation = strategies.observation.observe(world)?;
        let reward = strategies.reward.reward(world, &observation);
        let terminated =
            killed.is_set() || strategies.termination.terminated(world, &observation);
        let out_of_time = limit.is_some_and(|limit| *episode_steps >= limit);
        let truncated = out_of_time || strategies.termination.truncated(world, &observation);
        let mut info = strategies.observation.info(world, &observation);
        if let Some(damage) = damage {
            info.insert(
                "damage_dealt".to_owned(),
                InfoValue::Float(damage.damage_dealt()),
            );
            info.insert(
                "damage_taken".to_owned(),
                InfoValue::Float(damage.damage_taken()),
            );
        }
        Ok(StepResult {
            observation,
            reward,
            terminated,
            truncated,
            info,
        })
    }
}

// ── Environment ────────────────────────────────────────────────────

/// One environment: a host-state binding `W` driven by actions `A`,
/// producing observations `O`.
pub struct Environment<W, A, O> {
    id: EnvId,
    kind: OnceLock<String>,
    name: Option<String>,
    partition: PartitionId,
    settings: EnvSettings,
    config: BridgeConfig,
    state: EnvState,
    channel: HandoffChannel<Handoff>,
    in_flight: Mutex<InFlight>,
    core: Arc<Mutex<EnvCore<W, A, O>>>,
    killed: KilledSignal,
    capabilities: Capabilities,
    factory: Option<EnvFactory<W, A, O>>,
    registry: Mutex<Option<Weak<Registry>>>,
}

/// Builder for [`Environment`]. Obtain one with [`Environment::builder`].
pub struct EnvBuilder<W, A, O> {
    binding: W,
    strategies: Strategies<W, A, O>,
    partition: PartitionId,
    settings: EnvSettings,
    config: BridgeConfig,
    capabilities: Capabilities,
    factory: Option<EnvFactory<W, A, O>>,
    name: Option<String>,
}

impl<W, A, O> EnvBuilder<W, A, O> {
    /// Partition the environment is advanced in. Default: `PartitionId(0)`.
    pub fn partition(mut self, partition: PartitionId) -> Self {
        self.partition = partition;
        self
    }

    /// Episode settings.
    pub fn settings(mut self, settings: EnvSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Timeouts. Should match the driver's configuration.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Host capabilities.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Enables [`Environment::make_another`].
    pub fn factory(mut self, factory: EnvFactory<W, A, O>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Overrides the default `"{kind}-{id}"` name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validate the configuration and build the environment. If an
    /// [`AgentMarker`](crate::strategy::AgentMarker) is present, the agent
    /// is marked here.
    pub fn build(self) -> Result<Arc<Environment<W, A, O>>, ConfigError> {
        self.config.validate()?;
        self.settings.validate()?;
        let killed = KilledSignal::new();
        if let Some(agent) = &self.capabilities.agent {
            agent.mark_as_agent(killed.clone());
        }
        let core = EnvCore {
            world: self.binding,
            strategies: self.strategies,
            time_limit: self.settings.time_limit,
            episode_steps: 0,
            episodes: 0,
            killed: killed.clone(),
            damage: self.capabilities.damage.clone(),
        };
        Ok(Arc::new(Environment {
            id: EnvId::next(),
            kind: OnceLock::new(),
            name: self.name,
            partition: self.partition,
            settings: self.settings,
            config: self.config,
            state: EnvState::new(),
            channel: HandoffChannel::new(),
            in_flight: Mutex::new(InFlight::default()),
            core: Arc::new(Mutex::new(core)),
            killed,
            capabilities: self.capabilities,
            factory: self.factory,
            registry: Mutex::new(None),
        }))
    }
}

impl<W, A, O> Environment<W, A, O> {
    /// Start building an environment around `binding`.
    pub fn builder(binding: W, strategies: Strategies<W, A, O>) -> EnvBuilder<W, A, O> {
        EnvBuilder {
            binding,
            strategies,
            partition: PartitionId::default(),
            settings: EnvSettings::default(),
            config: BridgeConfig::default(),
            capabilities: Capabilities::default(),
            factory: None,
            name: None,
        }
    }

    /// Unique id.
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Kind the environment was connected under, or `""` before connect.
    pub fn kind(&self) -> &str {
        self.kind.get().map_or("", String::as_str)
    }

    /// The builder-supplied name, else `"{kind}-{id}"`.
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None if self.kind().is_empty() => format!("env-{}", self.id.get()),
            None => format!("{}-{}", self.kind(), self.id.get()),
        }
    }

    /// Partition this environment is advanced in.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Episode settings.
    pub fn settings(&self) -> &EnvSettings {
        &self.settings
    }

    /// Timeouts and policy.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Host capabilities.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Lifecycle flags.
    pub fn state(&self) -> &EnvState {
        &self.state
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Completed resets so far.
    pub fn episodes(&self) -> u64 {
        lock(&self.core).episodes
    }

    /// Steps taken in the current episode.
    pub fn episode_steps(&self) -> u32 {
        lock(&self.core).episode_steps
    }

    /// Whether the host reported the agent killed since the last reset,
    /// clearing the flag.
    pub fn take_just_killed(&self) -> bool {
        self.killed.take()
    }

    /// Stop the driver from selecting this environment until the next
    /// `reset` or `step`.
    ///
    /// Call only between requests: a request already published when
    /// `pause` is called is not serviced until a later `step` or `reset`
    /// unpauses the environment, and its caller may time out first.
    pub fn pause(&self) {
        self.state.set_paused(true);
        debug!(env = %self.id, "paused");
    }

    /// Close the environment.
    ///
    /// Wakes every wait on its channel, fails any request in flight with
    /// [`EnvError::Closed`], removes it from its registry and unmarks the
    /// agent. Idempotent and safe from any thread.
    pub fn close(&self) {
        if self.shutdown(CancelReason::Closed) {
            debug!(env = %self.id, kind = self.kind(), "closed");
        }
    }

    fn shutdown(&self, reason: CancelReason) -> bool {
        if !self.state.mark_closed() {
            return false;
        }
        self.channel.close();
        let parked = std::mem::take(&mut *lock(&self.in_flight));
        if let Some(request) = parked.request {
            request.abort(reason);
        }
        if let Some(registry) = self.registry() {
            registry.remove(self.id);
        }
        if let Some(agent) = &self.capabilities.agent {
            agent.unmark_as_agent();
        }
        true
    }

    fn registry(&self) -> Option<Arc<Registry>> {
        lock(&self.registry).as_ref().and_then(Weak::upgrade)
    }

    fn has_request(&self) -> bool {
        lock(&self.in_flight).request.is_some()
    }

    fn park(&self, request: Handoff) -> Gather {
        let mut slot = lock(&self.in_flight);
        if self.state.is_closed() {
            drop(slot);
            request.abort(CancelReason::Closed);
            return Gather::Closed;
        }
        slot.request = Some(request);
        slot.pre_ran = false;
        trace!(env = %self.id, "request parked");
        Gather::Ready
    }
}

impl<W, A, O> Environment<W, A, O>
where
    W: Send + 'static,
    A: Send + 'static,
    O: Clone + Send + 'static,
{
    /// Connect to `registry` under `kind`.
    pub fn connect(
        self: &Arc<Self>,
        registry: &Arc<Registry>,
        kind: &str,
    ) -> Result<(), RegistryError> {
        registry.connect(kind, Arc::clone(self) as Arc<dyn DriverHooks>)
    }

    /// Start a new episode.
    ///
    /// Clears `paused`, runs the reset strategy on the driver thread after
    /// the next tick that services this environment, and marks the
    /// environment initialized on success.
    pub fn reset(
        &self,
        seed: Option<u64>,
        options: ResetOptions,
    ) -> Result<ResetResult<O>, EnvError> {
        let _request = self.state.begin_request(self.id)?;
        self.state.set_paused(false);
        let core = Arc::clone(&self.core);
        let post = Task::new(move || {
            let mut core = lock(&core);
            core.reset(seed, &options)
        });
        let result = self.submit(None, post)?;
        self.state.mark_initialized();
        debug!(env = %self.id, ?seed, "episode reset");
        Ok(result)
    }

    /// Apply `action` before the next tick that services this environment
    /// and return what the tick produced.
    ///
    /// Fails with [`EnvError::NotReset`] until a `reset` has succeeded;
    /// the driver only steps initialized environments.
    pub fn step(&self, action: A) -> Result<StepResult<O>, EnvError> {
        let _request = self.state.begin_request(self.id)?;
        if !self.state.is_initialized() {
            return Err(EnvError::NotReset { env: self.id });
        }
        self.state.set_paused(false);
        let core = Arc::clone(&self.core);
        let pre = Task::new(move || {
            let mut core = lock(&core);
            core.apply(action)
        });
        let core = Arc::clone(&self.core);
        let post = Task::new(move || {
            let mut core = lock(&core);
            core.finish_step()
        });
        self.submit(Some(pre), post)
    }

    fn submit<R>(&self, pre: Option<Task<()>>, post: Task<R>) -> Result<R, EnvError>
    where
        R: Clone + Send + 'static,
    {
        let started = Instant::now();
        let handoff = Handoff {
            pre: pre
                .clone()
                .map(|task| Arc::new(task) as Arc<dyn Runnable>),
            post: Arc::new(post.clone()),
        };
        match self.channel.publish(handoff, self.config.handoff_timeout) {
            Ok(()) => trace!(env = %self.id, "request handed off"),
            Err(HandoffError::Closed) => return Err(EnvError::Closed { env: self.id }),
            Err(HandoffError::TimedOut) => {
                return Err(EnvError::HostUnavailable {
                    env: self.id,
                    waited: started.elapsed(),
                })
            }
        }
        let result = match post.wait_timeout(self.config.result_timeout) {
            Some(result) => result,
            None => {
                let error = TaskError::Cancelled {
                    reason: CancelReason::TimedOut,
                };
                if post.abort(error.clone()) {
                    if let Some(pre) = &pre {
                        pre.abort(error);
                    }
                }
                // Either aborted just now or already running on the driver.
                post.wait()
            }
        };
        result.map_err(|error| EnvError::from_task(self.id, error, started.elapsed()))
    }

    /// Build a sibling with equivalent configuration.
    ///
    /// The factory runs on the host thread at the start of the next driver
    /// cycle; the sibling is then connected to the same registry under the
    /// same kind. The returned task completes with the connected sibling.
    /// Works after `close`, so a failed environment can be replaced.
    pub fn make_another(self: &Arc<Self>) -> Task<Arc<Self>> {
        let Some(factory) = self.factory.clone() else {
            return Task::from_result(Err(TaskError::failed(format!(
                "{} has no factory",
                self.id
            ))));
        };
        let Some(registry) = self.registry() else {
            return Task::from_result(Err(TaskError::failed(format!(
                "{} is not connected",
                self.id
            ))));
        };
        let template = Arc::clone(self);
        let target = Arc::clone(&registry);
        let kind = self.kind().to_owned();
        let task = Task::new(move || {
            let sibling = factory(&template)?;
            target
                .connect(&kind, Arc::clone(&sibling) as Arc<dyn DriverHooks>)
                .map_err(|error| TaskError::failed(error.to_string()))?;
            debug!(env = %template.id, sibling = %sibling.id, kind, "sibling connected");
            Ok(sibling)
        });
        registry.host_queue().schedule(Arc::new(task.clone()));
        task
    }
}

impl<W, A, O> DriverHooks for Environment<W, A, O>
where
    W: Send + 'static,
    A: Send + 'static,
    O: Clone + Send + 'static,
{
    fn id(&self) -> EnvId {
        self.id
    }

    fn kind(&self) -> &str {
        self.kind.get().map_or("", String::as_str)
    }

    fn name(&self) -> String {
        Environment::name(self)
    }

    fn should_step(&self) -> bool {
        self.state.should_step()
    }

    fn awaiting_first_reset(&self) -> bool {
        !self.state.is_initialized() && !self.state.is_closed()
    }

    fn is_in(&self, partition: PartitionId) -> bool {
        self.partition == partition
    }

    fn gather(&self, deadline: Instant) -> Gather {
        if self.state.is_closed() {
            return Gather::Closed;
        }
        {
            let mut slot = lock(&self.in_flight);
            match slot.request.as_ref().map(|request| request.post.is_done()) {
                Some(false) => return Gather::Ready,
                Some(true) => {
                    // The caller gave up on it.
                    *slot = InFlight::default();
                }
                None => {}
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let taken = if remaining.is_zero() {
            self.channel.try_take()
        } else {
            self.channel.take(remaining).map(Some)
        };
        match taken {
            Ok(Some(request)) => self.park(request),
            Ok(None) | Err(HandoffError::TimedOut) => Gather::Idle,
            Err(HandoffError::Closed) => Gather::Closed,
        }
    }

    fn pre_step(&self) -> Result<(), HookError> {
        if self.state.is_closed() {
            return Err(HookError::Closed);
        }
        if !self.has_request() {
            match self.gather(Instant::now() + self.config.gather_timeout) {
                Gather::Ready => {}
                Gather::Idle => return Err(HookError::NothingGathered),
                Gather::Closed => return Err(HookError::Closed),
            }
        }
        let pre = {
            let mut slot = lock(&self.in_flight);
            let Some(request) = slot.request.as_ref() else {
                return Err(HookError::NothingGathered);
            };
            let pre = request.pre.clone();
            slot.pre_ran = true;
            pre
        };
        let Some(pre) = pre else {
            return Ok(());
        };
        pre.run();
        let Some(error) = pre.failure() else {
            return Ok(());
        };
        let parked = std::mem::take(&mut *lock(&self.in_flight));
        if self.state.is_closed() {
            return Err(HookError::Closed);
        }
        if let Some(request) = parked.request {
            request
                .post
                .abort(TaskError::PreStepFailed(Box::new(error.clone())));
        }
        Err(HookError::Task(error))
    }

    fn post_step(&self) -> Result<(), HookError> {
        let request = {
            let mut slot = lock(&self.in_flight);
            if !slot.pre_ran {
                return Err(if self.state.is_closed() {
                    HookError::Closed
                } else {
                    HookError::OutOfOrder
                });
            }
            std::mem::take(&mut *slot).request
        };
        let Some(request) = request else {
            return Err(HookError::Closed);
        };
        request.post.run();
        match request.post.failure() {
            None => Ok(()),
            Some(TaskError::Cancelled { .. }) if self.state.is_closed() => Err(HookError::Closed),
            Some(error) => Err(HookError::Task(error)),
        }
    }

    fn quarantine(&self) {
        if self.shutdown(CancelReason::Quarantined) {
            warn!(env = %self.id, kind = self.kind(), "environment quarantined");
        }
    }

    fn close(&self) {
        Environment::close(self);
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn attach(&self, registry: Weak<Registry>, kind: &str) {
        *lock(&self.registry) = Some(registry);
        if self.kind.set(kind.to_owned()).is_err() && self.kind() != kind {
            debug!(env = %self.id, kind = self.kind(), requested = kind, "kind already set");
        }
    }
}

impl<W, A, O> fmt::Debug for Environment<W, A, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("partition", &self.partition)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// Compile-time assertion: environments are shared between control and driver threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Environment<u64, u64, u64>>();
};
