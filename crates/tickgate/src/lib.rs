//! Tickgate: a tick-synchronized bridge between blocking reinforcement
//! learning control threads and a single-threaded simulation host.
//!
//! This is the top-level facade crate that re-exports the public API from
//! the Tickgate sub-crates.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tickgate::prelude::*;
//! use tickgate_test_utils::{test_config, walker_env, LineHost, SharedWorld};
//!
//! // A toy host with one walker environment.
//! let registry = Registry::new();
//! let world = SharedWorld::new();
//! let env = walker_env(&world, test_config());
//! env.connect(&registry, "walker").unwrap();
//!
//! // The host thread calls before_step / advance / after_step every tick.
//! let driver = Driver::new(Arc::clone(&registry), test_config()).unwrap();
//! let mut host = TickLoop::spawn(LineHost::new(world.clone()), driver).unwrap();
//!
//! // The control side blocks until the host has serviced each request.
//! let reset = env.reset(Some(1), ResetOptions::new()).unwrap();
//! let step = env.step(1).unwrap();
//! assert_eq!(step.observation, reset.observation + 1);
//!
//! env.close();
//! assert!(registry.is_empty());
//! host.shutdown();
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `tickgate-core` | IDs, errors, `Task`, cancel tokens, result types |
//! | [`engine`] | `tickgate-engine` | Handoff channel, environments, registry, driver, host loop |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types and primitives (`tickgate-core`).
///
/// Contains [`types::Task`], [`types::CancelToken`], the error taxonomy
/// ([`types::EnvError`], [`types::TaskError`]) and the step/reset result
/// value types.
pub use tickgate_core as types;

/// The bridge itself (`tickgate-engine`).
///
/// [`engine::Environment`] for the control side, [`engine::Driver`] and
/// [`engine::TickLoop`] for the host side, [`engine::Registry`] between
/// them.
pub use tickgate_engine as engine;

/// Common imports for typical Tickgate usage.
///
/// ```rust
/// use tickgate::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use tickgate_core::{
        EnvId, Info, InfoValue, PartitionId, ResetOptions, ResetResult, StepResult, Task,
    };

    // Errors
    pub use tickgate_core::{EnvError, TaskError};
    pub use tickgate_engine::{ConfigError, RegistryError};

    // Configuration
    pub use tickgate_engine::{BridgeConfig, EnvSettings, SteppingPolicy};

    // Environments and strategies
    pub use tickgate_engine::{
        ActionStrategy, Capabilities, Environment, ObservationStrategy, ResetStrategy,
        RewardStrategy, Strategies, TerminationStrategy,
    };

    // Host side
    pub use tickgate_engine::{Driver, Registry, SimulationHost, StepGate, TickLoop};
}
