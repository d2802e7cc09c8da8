//! Test utilities for Tickgate development.
//!
//! Provides a toy single-threaded simulation host ([`LineHost`]): walkers
//! on an integer line, each driven by one environment. Actions set a
//! walker's velocity; the host moves every walker of a partition by its
//! velocity when it advances that partition. Also provides counting and
//! mock capability types, driver helpers, and tracing setup.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tickgate_core::{Info, InfoValue, PartitionId, ResetOptions, TaskError};
use tickgate_engine::{
    ActionStrategy, AgentMarker, BridgeConfig, Capabilities, DamageTracker, Driver, EnvFactory,
    EnvSettings, Environment, KilledSignal, ObservationStrategy, ResetStrategy, RewardStrategy,
    SimulationHost, StepGate, Strategies, TerminationStrategy,
};

/// Walker environments: binding, velocity action, position observation.
pub type WalkerEnv = Environment<Walker, i64, i64>;

// ── World ──────────────────────────────────────────────────────────

/// One walker's simulated state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalkerState {
    pub x: i64,
    pub velocity: i64,
    /// Position at the last reward computation.
    pub last_x: i64,
    pub partition: PartitionId,
}

/// All simulated state. Only the host thread mutates it between ticks.
#[derive(Debug, Default)]
pub struct LineWorld {
    pub walkers: Vec<WalkerState>,
    /// Per-partition advance counts, indexed by partition id.
    pub advances: Vec<u64>,
}

impl LineWorld {
    pub fn advances_of(&self, partition: PartitionId) -> u64 {
        self.advances
            .get(partition.0 as usize)
            .copied()
            .unwrap_or(0)
    }
}

/// Shared handle to a [`LineWorld`].
#[derive(Clone, Debug, Default)]
pub struct SharedWorld(Arc<Mutex<LineWorld>>);

impl SharedWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, LineWorld> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a walker at the origin and return its binding.
    pub fn spawn_walker(&self, partition: PartitionId) -> Walker {
        let mut world = self.lock();
        world.walkers.push(WalkerState {
            partition,
            ..Default::default()
        });
        Walker {
            world: self.clone(),
            index: world.walkers.len() - 1,
        }
    }

    /// Current position of walker `index`.
    pub fn x(&self, index: usize) -> i64 {
        self.lock().walkers[index].x
    }
}

/// Binding of one environment to one walker.
#[derive(Clone, Debug)]
pub struct Walker {
    world: SharedWorld,
    index: usize,
}

impl Walker {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn world(&self) -> &SharedWorld {
        &self.world
    }

    pub fn state(&self) -> WalkerState {
        self.world.lock().walkers[self.index].clone()
    }

    fn update(&self, f: impl FnOnce(&mut WalkerState)) {
        f(&mut self.world.lock().walkers[self.index]);
    }
}

/// The toy simulation host.
#[derive(Debug)]
pub struct LineHost {
    world: SharedWorld,
    partitions: Vec<PartitionId>,
}

impl LineHost {
    pub fn new(world: SharedWorld) -> Self {
        Self::with_partitions(world, vec![PartitionId(0)])
    }

    pub fn with_partitions(world: SharedWorld, partitions: Vec<PartitionId>) -> Self {
        Self { world, partitions }
    }

    pub fn world(&self) -> &SharedWorld {
        &self.world
    }
}

impl SimulationHost for LineHost {
    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.clone()
    }

    fn advance(&mut self, partition: PartitionId) {
        let mut world = self.world.lock();
        for walker in world.walkers.iter_mut().filter(|w| w.partition == partition) {
            walker.x += walker.velocity;
        }
        let slot = partition.0 as usize;
        if world.advances.len() <= slot {
            world.advances.resize(slot + 1, 0);
        }
        world.advances[slot] += 1;
    }
}

// ── Strategies ─────────────────────────────────────────────────────

/// Places the walker at a seeded position in `-spread..=spread`, at rest.
/// Reports the start position in the reset info under `"start"` when
/// `report_start` is set.
#[derive(Debug, Default)]
pub struct SeededStart {
    pub spread: i64,
    pub report_start: bool,
}

impl ResetStrategy<Walker> for SeededStart {
    fn reset(
        &mut self,
        world: &mut Walker,
        seed: Option<u64>,
        options: &ResetOptions,
    ) -> Result<Info, TaskError> {
        let x = if self.spread == 0 {
            0
        } else {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.unwrap_or(0));
            rng.gen_range(-self.spread..=self.spread)
        };
        let x = match options.get("start") {
            Some(InfoValue::Int(forced)) => *forced,
            Some(other) => return Err(TaskError::failed(format!("bad start option: {other}"))),
            None => x,
        };
        world.update(|w| {
            w.x = x;
            w.last_x = x;
            w.velocity = 0;
        });
        let mut info = Info::new();
        if self.report_start {
            info.insert("start".to_owned(), InfoValue::Int(x));
        }
        Ok(info)
    }
}

/// Sets the walker's velocity. Rejects speeds above `max_speed`.
#[derive(Debug)]
pub struct SetVelocity {
    pub max_speed: i64,
}

impl Default for SetVelocity {
    fn default() -> Self {
        Self { max_speed: 3 }
    }
}

impl ActionStrategy<Walker, i64> for SetVelocity {
    fn apply(&mut self, world: &mut Walker, action: i64) -> Result<(), TaskError> {
        if action.abs() > self.max_speed {
            return Err(TaskError::failed(format!("speed {action} too high")));
        }
        world.update(|w| w.velocity = action);
        Ok(())
    }
}

/// Observes the walker's position.
#[derive(Debug, Default)]
pub struct Position;

impl ObservationStrategy<Walker, i64> for Position {
    fn observe(&mut self, world: &Walker) -> Result<i64, TaskError> {
        Ok(world.state().x)
    }
}

/// Rewards movement in the positive direction since the last step.
#[derive(Debug, Default)]
pub struct Progress;

impl RewardStrategy<Walker, i64> for Progress {
    fn reward(&mut self, world: &Walker, observation: &i64) -> f64 {
        let last = world.state().last_x;
        world.update(|w| w.last_x = *observation);
        (observation - last) as f64
    }
}

/// Terminates once the walker is more than `limit` from the origin.
#[derive(Debug)]
pub struct OutOfBounds {
    pub limit: i64,
}

impl TerminationStrategy<Walker, i64> for OutOfBounds {
    fn terminated(&self, _world: &Walker, observation: &i64) -> bool {
        observation.abs() > self.limit
    }
}

/// The default walker strategy set.
pub fn walker_strategies() -> Strategies<Walker, i64, i64> {
    Strategies {
        reset: Box::new(SeededStart::default()),
        action: Box::new(SetVelocity::default()),
        observation: Box::new(Position),
        reward: Box::new(Progress),
        termination: Box::new(OutOfBounds { limit: 20 }),
    }
}

/// Counts how often a wrapped strategy runs.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Wraps a strategy and bumps a [`CallCounter`] on every call.
#[derive(Debug)]
pub struct Counted<S> {
    pub inner: S,
    pub calls: CallCounter,
}

impl<S> Counted<S> {
    pub fn new(inner: S, calls: CallCounter) -> Self {
        Self { inner, calls }
    }
}

impl<W, A, S: ActionStrategy<W, A>> ActionStrategy<W, A> for Counted<S> {
    fn apply(&mut self, world: &mut W, action: A) -> Result<(), TaskError> {
        self.calls.bump();
        self.inner.apply(world, action)
    }
}

impl<W, O, S: ObservationStrategy<W, O>> ObservationStrategy<W, O> for Counted<S> {
    fn observe(&mut self, world: &W) -> Result<O, TaskError> {
        self.calls.bump();
        self.inner.observe(world)
    }

    fn info(&self, world: &W, observation: &O) -> Info {
        self.inner.info(world, observation)
    }
}

/// Walker strategies whose action and observation calls are counted.
pub fn counted_walker_strategies(
    pre: CallCounter,
    post: CallCounter,
) -> Strategies<Walker, i64, i64> {
    Strategies {
        action: Box::new(Counted::new(SetVelocity::default(), pre)),
        observation: Box::new(Counted::new(Position, post)),
        ..walker_strategies()
    }
}

// ── Capabilities ───────────────────────────────────────────────────

/// Records agent marking; [`kill`](Self::kill) plays the host's part.
#[derive(Debug, Default)]
pub struct MockAgent {
    marked: AtomicBool,
    unmarks: AtomicUsize,
    signal: Mutex<Option<KilledSignal>>,
}

impl MockAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }

    pub fn unmarks(&self) -> usize {
        self.unmarks.load(Ordering::SeqCst)
    }

    /// Report the agent killed. Returns `false` if it was never marked.
    pub fn kill(&self) -> bool {
        match &*self.signal.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(signal) => {
                signal.trigger();
                true
            }
            None => false,
        }
    }
}

impl AgentMarker for MockAgent {
    fn mark_as_agent(&self, killed: KilledSignal) {
        *self.signal.lock().unwrap_or_else(PoisonError::into_inner) = Some(killed);
        self.marked.store(true, Ordering::SeqCst);
    }

    fn unmark_as_agent(&self) {
        self.marked.store(false, Ordering::SeqCst);
        self.unmarks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Constant damage figures.
#[derive(Debug, Default)]
pub struct FixedDamage {
    pub dealt: f64,
    pub taken: f64,
}

impl DamageTracker for FixedDamage {
    fn damage_dealt(&self) -> f64 {
        self.dealt
    }

    fn damage_taken(&self) -> f64 {
        self.taken
    }
}

// ── Environment helpers ────────────────────────────────────────────

/// Short timeouts for tests.
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        handoff_timeout: Duration::from_secs(5),
        result_timeout: Duration::from_secs(5),
        gather_timeout: Duration::from_millis(20),
        ..Default::default()
    }
}

/// A walker environment in `world`, not yet connected.
pub fn walker_env(world: &SharedWorld, config: BridgeConfig) -> Arc<WalkerEnv> {
    walker_env_with(world, walker_strategies(), config)
}

/// A walker environment with custom strategies, not yet connected.
pub fn walker_env_with(
    world: &SharedWorld,
    strategies: Strategies<Walker, i64, i64>,
    config: BridgeConfig,
) -> Arc<WalkerEnv> {
    let walker = world.spawn_walker(PartitionId(0));
    Environment::builder(walker, strategies)
        .config(config)
        .factory(walker_factory(world.clone()))
        .build()
        .expect("test config is valid")
}

/// Factory that spawns a fresh walker in `world`, in the template's
/// partition, with the template's settings and timeouts.
pub fn walker_factory(world: SharedWorld) -> EnvFactory<Walker, i64, i64> {
    Arc::new(move |template: &WalkerEnv| {
        let walker = world.spawn_walker(template.partition());
        Environment::builder(walker, walker_strategies())
            .partition(template.partition())
            .settings(template.settings().clone())
            .config(template.config().clone())
            .factory(walker_factory(world.clone()))
            .build()
            .map_err(|e| TaskError::failed(e.to_string()))
    })
}

/// Settings with a time limit.
pub fn limited(steps: u32) -> EnvSettings {
    EnvSettings {
        time_limit: Some(steps),
        ..Default::default()
    }
}

/// Capabilities with only an agent marker.
pub fn with_agent(agent: &Arc<MockAgent>) -> Capabilities {
    Capabilities {
        agent: Some(agent.clone()),
        damage: None,
    }
}

// ── Driver helpers ─────────────────────────────────────────────────

/// Run `n` cycles of every host partition. Returns how many advanced.
pub fn run_cycles(driver: &mut Driver, host: &mut LineHost, n: usize) -> usize {
    let mut advanced = 0;
    for _ in 0..n {
        for partition in host.partitions() {
            if driver.cycle(partition, || host.advance(partition)) == StepGate::Advance {
                advanced += 1;
            }
        }
    }
    advanced
}

/// Cycle until `done` holds. Returns the number of cycles run.
///
/// # Panics
///
/// If `done` does not hold within `timeout`.
pub fn cycle_until(
    driver: &mut Driver,
    host: &mut LineHost,
    timeout: Duration,
    done: impl Fn() -> bool,
) -> usize {
    let deadline = Instant::now() + timeout;
    let mut cycles = 0;
    while !done() {
        assert!(
            Instant::now() < deadline,
            "condition not reached after {cycles} cycles"
        );
        run_cycles(driver, host, 1);
        cycles += 1;
    }
    cycles
}

/// Install a test-friendly tracing subscriber. Honours `RUST_LOG`;
/// defaults to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
