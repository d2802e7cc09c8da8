//! Integration test: one environment through its whole life, driven by a
//! hand-cranked driver on the test thread while a control thread calls
//! `reset`/`step`.
//!
//! The gather budget is long so a cycle started after a request is
//! claimed reliably waits for its handoff; that makes "serviced in exactly
//! one cycle" observable.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tickgate_core::{EnvError, InfoValue, ResetOptions};
use tickgate_engine::{
    BridgeConfig, Capabilities, Driver, Registry, SimulationHost, StepGate,
};
use tickgate_test_utils::{
    counted_walker_strategies, cycle_until, init_tracing, limited, run_cycles, walker_env,
    walker_env_with, with_agent, CallCounter, FixedDamage, LineHost, MockAgent, SharedWorld,
    WalkerEnv,
};

fn patient_config() -> BridgeConfig {
    BridgeConfig {
        gather_timeout: Duration::from_secs(2),
        ..tickgate_test_utils::test_config()
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Block until a request from `env` has been claimed and will be picked up
/// by the next cycle's gather.
fn wait_for_request(env: &WalkerEnv) {
    wait_until("request", || {
        env.state().is_pending() && env.state().should_step()
    });
}

fn reset_through(
    driver: &mut Driver,
    host: &mut LineHost,
    env: &Arc<WalkerEnv>,
    seed: u64,
) -> tickgate_core::ResetResult<i64> {
    let control = Arc::clone(env);
    let h = thread::spawn(move || control.reset(Some(seed), ResetOptions::new()));
    cycle_until(driver, host, Duration::from_secs(5), || h.is_finished());
    h.join().unwrap().unwrap()
}

#[test]
fn full_lifecycle() {
    init_tracing();
    let registry = Registry::new();
    let world = SharedWorld::new();
    let pre = CallCounter::new();
    let post = CallCounter::new();
    let env = walker_env_with(
        &world,
        counted_walker_strategies(pre.clone(), post.clone()),
        patient_config(),
    );
    assert!(!env.state().is_initialized());

    env.connect(&registry, "walker").unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(env.name(), format!("walker-{}", env.id().get()));

    let mut driver = Driver::new(Arc::clone(&registry), patient_config()).unwrap();
    let mut host = LineHost::new(world.clone());

    // Reset: the observation strategy runs once, the action strategy never.
    let reset = reset_through(&mut driver, &mut host, &env, 1);
    assert_eq!(reset.observation, 0);
    assert!(reset.info.is_empty());
    assert!(env.state().is_initialized());
    assert_eq!((pre.get(), post.get()), (0, 1));

    // Step A: serviced by exactly one cycle.
    let control = Arc::clone(&env);
    let h = thread::spawn(move || control.step(1));
    wait_for_request(&env);
    assert_eq!(run_cycles(&mut driver, &mut host, 1), 1);
    let a = h.join().unwrap().unwrap();
    assert_eq!(a.observation, 1);
    assert_eq!(a.reward, 1.0);
    assert!(!a.is_done());
    assert_eq!((pre.get(), post.get()), (1, 2));

    // Paused: three cycles advance the host without touching the env.
    env.pause();
    let before = world.lock().advances_of(tickgate_core::PartitionId(0));
    assert_eq!(run_cycles(&mut driver, &mut host, 3), 3);
    assert_eq!(
        world.lock().advances_of(tickgate_core::PartitionId(0)),
        before + 3
    );
    assert_eq!((pre.get(), post.get()), (1, 2));
    // The walker kept its velocity while the env was paused.
    assert_eq!(world.x(0), 4);

    // Step B resumes in one cycle.
    let control = Arc::clone(&env);
    let h = thread::spawn(move || control.step(2));
    wait_for_request(&env);
    assert_eq!(run_cycles(&mut driver, &mut host, 1), 1);
    let b = h.join().unwrap().unwrap();
    assert_eq!(b.observation, 6);
    assert_eq!(b.reward, 5.0);
    assert_eq!((pre.get(), post.get()), (2, 3));
    assert_eq!(env.episode_steps(), 2);

    // A step racing close fails promptly with a cancellation error.
    let control = Arc::clone(&env);
    let h = thread::spawn(move || {
        let start = Instant::now();
        (control.step(1), start.elapsed())
    });
    wait_for_request(&env);
    thread::sleep(Duration::from_millis(20));
    env.close();
    let (result, waited) = h.join().unwrap();
    assert!(
        matches!(
            result,
            Err(EnvError::Closed { .. } | EnvError::HostUnavailable { .. })
        ),
        "unexpected {result:?}"
    );
    assert!(waited < Duration::from_secs(2), "close took {waited:?}");
    assert!(registry.is_empty());
    assert_eq!(pre.get(), 2);

    // Every later call fails the same way.
    assert!(matches!(
        env.reset(None, ResetOptions::new()),
        Err(EnvError::Closed { .. })
    ));
    assert!(matches!(env.step(0), Err(EnvError::Closed { .. })));
}

#[test]
fn close_wakes_a_driver_blocked_in_gather() {
    let registry = Registry::new();
    let world = SharedWorld::new();
    let env = walker_env(&world, patient_config());
    env.connect(&registry, "walker").unwrap();
    let mut driver = Driver::new(Arc::clone(&registry), patient_config()).unwrap();
    let mut host = LineHost::new(world.clone());
    reset_through(&mut driver, &mut host, &env, 0);

    // No step is coming, so the host thread waits out its 2 s gather budget
    // unless close interrupts it.
    let timeouts = driver.metrics().gather_timeouts;
    let h = thread::spawn(move || {
        let start = Instant::now();
        let p = tickgate_core::PartitionId(0);
        let gate = driver.cycle(p, || host.advance(p));
        (gate, start.elapsed(), driver)
    });
    thread::sleep(Duration::from_millis(100));
    env.close();
    let (gate, waited, driver) = h.join().unwrap();
    assert!(waited < Duration::from_secs(1), "gather ran for {waited:?}");
    assert_eq!(gate, StepGate::Advance);
    assert_eq!(driver.metrics().gather_timeouts, timeouts);
    assert!(registry.is_empty());
}

#[test]
fn concurrent_calls_on_one_env_fail_fast() {
    let registry = Registry::new();
    let world = SharedWorld::new();
    let env = walker_env(&world, patient_config());
    env.connect(&registry, "walker").unwrap();
    let mut driver = Driver::new(Arc::clone(&registry), patient_config()).unwrap();
    let mut host = LineHost::new(world.clone());
    reset_through(&mut driver, &mut host, &env, 0);

    let control = Arc::clone(&env);
    let h = thread::spawn(move || control.step(1));
    wait_for_request(&env);
    let err = env.step(1).unwrap_err();
    assert!(matches!(err, EnvError::AlreadyPending { .. }));
    assert!(err.is_retryable());
    let err = env.reset(None, ResetOptions::new()).unwrap_err();
    assert!(matches!(err, EnvError::AlreadyPending { .. }));

    // The first call is unaffected.
    run_cycles(&mut driver, &mut host, 1);
    assert_eq!(h.join().unwrap().unwrap().observation, 1);
}

#[test]
fn unserviced_request_reports_host_unavailable() {
    let config = BridgeConfig {
        handoff_timeout: Duration::from_millis(50),
        result_timeout: Duration::from_millis(50),
        gather_timeout: Duration::from_millis(10),
        ..Default::default()
    };
    let registry = Registry::new();
    let world = SharedWorld::new();
    let env = walker_env(&world, config);
    env.connect(&registry, "walker").unwrap();

    let err = env.reset(Some(1), ResetOptions::new()).unwrap_err();
    assert!(matches!(err, EnvError::HostUnavailable { .. }));
    assert!(err.requires_rebuild());
    // The slot is free again and the env still usable once a host appears.
    assert!(!env.state().is_pending());
    assert!(!env.is_closed());
}

#[test]
fn reset_options_and_seed_reach_the_strategy() {
    let registry = Registry::new();
    let world = SharedWorld::new();
    let env = walker_env(&world, patient_config());
    env.connect(&registry, "walker").unwrap();
    let mut driver = Driver::new(Arc::clone(&registry), patient_config()).unwrap();
    let mut host = LineHost::new(world.clone());

    let control = Arc::clone(&env);
    let h = thread::spawn(move || {
        let mut options = ResetOptions::new();
        options.insert("start".into(), InfoValue::Int(-7));
        control.reset(Some(3), options)
    });
    cycle_until(&mut driver, &mut host, Duration::from_secs(5), || {
        h.is_finished()
    });
    assert_eq!(h.join().unwrap().unwrap().observation, -7);
    assert_eq!(world.x(0), -7);

    // A malformed option fails the reset without closing the env.
    let control = Arc::clone(&env);
    let h = thread::spawn(move || {
        let mut options = ResetOptions::new();
        options.insert("start".into(), InfoValue::Text("left".into()));
        control.reset(None, options)
    });
    wait_for_request(&env);
    run_cycles(&mut driver, &mut host, 1);
    let err = h.join().unwrap().unwrap_err();
    assert!(matches!(err, EnvError::Computation { .. }));
    assert!(!env.is_closed());
    assert_eq!(env.episodes(), 1);
}

#[test]
fn time_limit_truncates_and_reset_starts_over() {
    let registry = Registry::new();
    let world = SharedWorld::new();
    let env = WalkerEnv::builder(
        world.spawn_walker(tickgate_core::PartitionId(0)),
        tickgate_test_utils::walker_strategies(),
    )
    .settings(limited(3))
    .config(patient_config())
    .build()
    .unwrap();
    env.connect(&registry, "walker").unwrap();
    let mut driver = Driver::new(Arc::clone(&registry), patient_config()).unwrap();
    let mut host = LineHost::new(world.clone());

    for episode in 1..=2 {
        reset_through(&mut driver, &mut host, &env, episode);
        let mut flags = Vec::new();
        for _ in 0..3 {
            let control = Arc::clone(&env);
            let h = thread::spawn(move || control.step(0));
            wait_for_request(&env);
            run_cycles(&mut driver, &mut host, 1);
            let r = h.join().unwrap().unwrap();
            flags.push((r.terminated, r.truncated));
        }
        assert_eq!(flags, [(false, false), (false, false), (false, true)]);
        assert_eq!(env.episodes(), episode);
    }
}

#[test]
fn capabilities_feed_step_results() {
    let registry = Registry::new();
    let world = SharedWorld::new();
    let agent = MockAgent::new();
    let env = WalkerEnv::builder(
        world.spawn_walker(tickgate_core::PartitionId(0)),
        tickgate_test_utils::walker_strategies(),
    )
    .config(patient_config())
    .capabilities(Capabilities {
        damage: Some(Arc::new(FixedDamage {
            dealt: 2.5,
            taken: 0.5,
        })),
        ..with_agent(&agent)
    })
    .build()
    .unwrap();
    assert!(agent.is_marked());
    env.connect(&registry, "walker").unwrap();
    let mut driver = Driver::new(Arc::clone(&registry), patient_config()).unwrap();
    let mut host = LineHost::new(world.clone());
    reset_through(&mut driver, &mut host, &env, 0);

    let step = |driver: &mut Driver, host: &mut LineHost| {
        let control = Arc::clone(&env);
        let h = thread::spawn(move || control.step(1));
        wait_for_request(&env);
        run_cycles(driver, host, 1);
        h.join().unwrap().unwrap()
    };

    let r = step(&mut driver, &mut host);
    assert!(!r.terminated);
    assert_eq!(r.info.get("damage_dealt"), Some(&InfoValue::Float(2.5)));
    assert_eq!(r.info.get("damage_taken"), Some(&InfoValue::Float(0.5)));

    // The host kills the agent between steps.
    assert!(agent.kill());
    let r = step(&mut driver, &mut host);
    assert!(r.terminated);
    assert!(env.take_just_killed());
    assert!(!env.take_just_killed());

    env.close();
    env.close();
    assert!(!agent.is_marked());
    assert_eq!(agent.unmarks(), 1);
}
