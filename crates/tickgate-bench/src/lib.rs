//! Benchmark fixtures for the Tickgate environment bridge.
//!
//! [`BenchFleet`] connects `n` walker environments to a fresh registry and
//! runs a [`TickLoop`] over a [`LineHost`] in the background, so benchmarks
//! measure the control-side round trip of `reset`/`step`.

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;
use std::time::Duration;

use tickgate_core::ResetOptions;
use tickgate_engine::{BridgeConfig, Driver, Registry, SteppingPolicy, TickLoop};
use tickgate_test_utils::{walker_env, LineHost, SharedWorld, WalkerEnv};

/// Timeouts for benchmarks: generous on the control side, short gather.
pub fn bench_config(policy: SteppingPolicy) -> BridgeConfig {
    BridgeConfig {
        handoff_timeout: Duration::from_secs(30),
        result_timeout: Duration::from_secs(30),
        gather_timeout: Duration::from_millis(5),
        policy,
        tick_rate_hz: None,
    }
}

/// `n` reset walker environments driven by a background host thread.
pub struct BenchFleet {
    pub registry: Arc<Registry>,
    pub envs: Vec<Arc<WalkerEnv>>,
    tick_loop: TickLoop<LineHost>,
}

impl BenchFleet {
    /// Build, connect and reset `n` environments.
    pub fn new(n: usize, policy: SteppingPolicy) -> Self {
        let config = bench_config(policy);
        let registry = Registry::new();
        let world = SharedWorld::new();
        let envs: Vec<_> = (0..n)
            .map(|_| {
                let env = walker_env(&world, config.clone());
                env.connect(&registry, "bench").expect("fresh env connects");
                env
            })
            .collect();
        let driver = Driver::new(Arc::clone(&registry), config).expect("valid bench config");
        let tick_loop = TickLoop::spawn(LineHost::new(world), driver).expect("host thread spawns");
        std::thread::scope(|s| {
            for env in &envs {
                s.spawn(move || env.reset(Some(0), ResetOptions::new()).expect("reset"));
            }
        });
        Self {
            registry,
            envs,
            tick_loop,
        }
    }

    /// Ticks the host has completed.
    pub fn ticks(&self) -> u64 {
        self.tick_loop.ticks()
    }
}

impl Drop for BenchFleet {
    fn drop(&mut self) {
        self.registry.close_all();
        self.tick_loop.shutdown();
    }
}
