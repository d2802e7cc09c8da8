//! Tick-synchronized environment bridge.
//!
//! A control process (an RL trainer) calls blocking [`Environment::reset`]
//! and [`Environment::step`] whenever it likes. A single-threaded
//! simulation host advances every environment together, once per tick, on
//! its own thread. This crate reconciles the two:
//!
//! ```text
//! Control thread(s)                 Driver (host) thread
//!     |                                   |
//!     |--step(action)                     | before_step(partition)
//!     |   build (pre, post) tasks         |   host_queue.run_pending()
//!     |   publish ─────[bounded(0)]──────>|   gather(): take each request
//!     |   blocks on post.wait()           |   all ready? run every pre-task
//!     |                                   | host.advance(partition)
//!     |                                   | after_step()
//!     |<──────────────── post.run() ──────|   run every post-task
//!     |   returns StepResult              |
//! ```
//!
//! The handoff channel has capacity zero, so a request is never queued
//! behind the driver: it is executed on the very next cycle that services
//! its environment. [`Environment::close`] cancels every wait on the
//! environment's channel immediately.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod deferred;
pub mod driver;
pub mod environment;
pub mod handoff;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod state;
pub mod strategy;

pub use config::{BridgeConfig, ConfigError, EnvSettings, SteppingPolicy};
pub use deferred::HostQueue;
pub use driver::{Driver, StepGate};
pub use environment::{DriverHooks, EnvBuilder, Environment, Gather, HookError};
pub use handoff::{HandoffChannel, HandoffError};
pub use metrics::DriverMetrics;
pub use registry::{Registry, RegistryError};
pub use runner::{ShutdownReport, SimulationHost, TickLoop};
pub use state::EnvState;
pub use strategy::{
    ActionStrategy, AgentMarker, Capabilities, DamageTracker, EnvFactory, KilledSignal,
    ObservationStrategy, ResetStrategy, RewardStrategy, Strategies, TerminationStrategy,
};
