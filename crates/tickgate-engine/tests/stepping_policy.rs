//! Integration test: group gating across several environments.
//!
//! Under `AllOrNone` the host advances only when every active environment
//! in the partition has a request in, so each step sees exactly one
//! advance. Under `Independent` the host keeps moving and environments
//! catch whatever tick comes next.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tickgate_core::{PartitionId, ResetOptions};
use tickgate_engine::{
    BridgeConfig, Driver, Registry, SimulationHost, StepGate, SteppingPolicy, TickLoop,
};
use tickgate_test_utils::{
    init_tracing, run_cycles, test_config, walker_env, walker_strategies, LineHost, SharedWorld,
    WalkerEnv,
};

const STEPS: i64 = 20;

fn config(policy: SteppingPolicy) -> BridgeConfig {
    BridgeConfig {
        policy,
        ..test_config()
    }
}

/// Run `n` walkers, each reset then stepped `STEPS` times with velocity 1
/// from its own control thread, on a free-running host thread. Returns
/// every walker's observation sequence.
///
/// Walkers reset at slightly different times, so one may finish while
/// others still have steps to go; finished walkers pause.
fn run_fleet(n: usize, policy: SteppingPolicy) -> Vec<Vec<i64>> {
    init_tracing();
    let registry = Registry::new();
    let world = SharedWorld::new();
    let envs: Vec<_> = (0..n)
        .map(|_| {
            let env = walker_env(&world, config(policy));
            env.connect(&registry, "walker").unwrap();
            env
        })
        .collect();
    let driver = Driver::new(Arc::clone(&registry), config(policy)).unwrap();
    let mut tick_loop = TickLoop::spawn(LineHost::new(world.clone()), driver).unwrap();

    let observations = thread::scope(|s| {
        let handles: Vec<_> = envs
            .iter()
            .map(|env| {
                s.spawn(move || {
                    let start = env.reset(Some(0), ResetOptions::new()).unwrap();
                    let mut seen = vec![start.observation];
                    for _ in 0..STEPS {
                        seen.push(env.step(1).unwrap().observation);
                    }
                    // Leave the group so the others are not held.
                    env.pause();
                    seen
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    registry.close_all();
    let report = tick_loop.shutdown();
    assert!(report.joined);
    assert_eq!(report.metrics.quarantined, 0);
    observations
}

#[test]
fn all_or_none_gives_each_step_exactly_one_tick() {
    for seen in run_fleet(4, SteppingPolicy::AllOrNone) {
        let expected: Vec<i64> = (0..=STEPS).collect();
        assert_eq!(seen, expected);
    }
}

#[test]
fn independent_lets_the_host_run_ahead() {
    for seen in run_fleet(4, SteppingPolicy::Independent) {
        assert_eq!(seen[0], 0);
        for (k, pair) in seen.windows(2).enumerate() {
            assert!(pair[1] > pair[0], "step {k} saw no advance: {seen:?}");
        }
        assert!(*seen.last().unwrap() >= STEPS);
    }
}

fn reset_all(driver: &mut Driver, host: &mut LineHost, envs: &[Arc<WalkerEnv>]) {
    thread::scope(|s| {
        let handles: Vec<_> = envs
            .iter()
            .map(|env| s.spawn(move || env.reset(None, ResetOptions::new())))
            .collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handles.iter().all(|h| h.is_finished()) {
            assert!(Instant::now() < deadline, "resets not serviced");
            run_cycles(driver, host, 1);
        }
        for h in handles {
            h.join().unwrap().unwrap();
        }
    });
}

#[test]
fn an_idle_env_holds_only_its_own_partition() {
    let registry = Registry::new();
    let world = SharedWorld::new();
    let cfg = config(SteppingPolicy::AllOrNone);
    let idle = walker_env(&world, cfg.clone());
    let busy = WalkerEnv::builder(world.spawn_walker(PartitionId(1)), walker_strategies())
        .partition(PartitionId(1))
        .config(cfg.clone())
        .build()
        .unwrap();
    idle.connect(&registry, "walker").unwrap();
    busy.connect(&registry, "walker").unwrap();
    let mut driver = Driver::new(Arc::clone(&registry), cfg).unwrap();
    let mut host =
        LineHost::with_partitions(world.clone(), vec![PartitionId(0), PartitionId(1)]);
    reset_all(&mut driver, &mut host, &[Arc::clone(&idle), Arc::clone(&busy)]);

    let p0 = world.lock().advances_of(PartitionId(0));
    let control = Arc::clone(&busy);
    let h = thread::spawn(move || control.step(2));
    let deadline = Instant::now() + Duration::from_secs(5);
    while !h.is_finished() {
        assert!(Instant::now() < deadline, "partition 1 never advanced");
        assert_eq!(
            driver.cycle(PartitionId(0), || host.advance(PartitionId(0))),
            StepGate::Hold
        );
        driver.cycle(PartitionId(1), || host.advance(PartitionId(1)));
    }
    assert_eq!(h.join().unwrap().unwrap().observation, 2);
    assert_eq!(world.lock().advances_of(PartitionId(0)), p0);

    // Pausing the idle env releases partition 0.
    idle.pause();
    assert_eq!(
        driver.cycle(PartitionId(0), || host.advance(PartitionId(0))),
        StepGate::Advance
    );
    assert_eq!(world.lock().advances_of(PartitionId(0)), p0 + 1);
}

#[test]
fn closing_an_env_releases_a_held_group() {
    let registry = Registry::new();
    let world = SharedWorld::new();
    let cfg = config(SteppingPolicy::AllOrNone);
    let a = walker_env(&world, cfg.clone());
    let b = walker_env(&world, cfg.clone());
    a.connect(&registry, "walker").unwrap();
    b.connect(&registry, "walker").unwrap();
    let mut driver = Driver::new(Arc::clone(&registry), cfg).unwrap();
    let mut host = LineHost::new(world.clone());
    reset_all(&mut driver, &mut host, &[Arc::clone(&a), Arc::clone(&b)]);

    let control = Arc::clone(&a);
    let h = thread::spawn(move || control.step(1));
    // `b` never steps, so `a` waits in a held group.
    let held = driver.metrics().held;
    while driver.metrics().held < held + 3 {
        run_cycles(&mut driver, &mut host, 1);
    }
    assert!(!h.is_finished());

    b.close();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !h.is_finished() {
        assert!(Instant::now() < deadline, "group stayed held after close");
        run_cycles(&mut driver, &mut host, 1);
    }
    assert_eq!(h.join().unwrap().unwrap().observation, 1);
}

#[test]
fn siblings_are_built_on_the_host_thread() {
    let registry = Registry::new();
    let world = SharedWorld::new();
    let env = walker_env(&world, test_config());
    env.connect(&registry, "walker").unwrap();
    let driver = Driver::new(Arc::clone(&registry), test_config()).unwrap();
    let mut tick_loop = TickLoop::spawn(LineHost::new(world.clone()), driver).unwrap();

    let sibling = env.make_another().wait().unwrap();
    assert_ne!(sibling.id(), env.id());
    assert_eq!(sibling.kind(), "walker");
    assert_eq!(registry.ids_of_kind("walker"), [env.id(), sibling.id()]);

    // The original can be closed and replaced again.
    env.close();
    let third = env.make_another().wait().unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(world.lock().walkers.len(), 3);

    for e in [&sibling, &third] {
        e.reset(Some(9), ResetOptions::new()).unwrap();
        assert_eq!(e.step(3).unwrap().observation, 3);
        e.pause();
    }

    let report = tick_loop.shutdown();
    assert!(report.metrics.deferred_run >= 2);
    registry.close_all();
}
