//! Core types and primitives for the Tickgate environment bridge.
//!
//! This is the leaf crate with zero internal dependencies. It defines the
//! pieces shared by the control side (a training loop calling `reset` and
//! `step`) and the driver side (the simulation host's tick thread):
//! identifiers, the error taxonomy, the single-shot [`Task`], the
//! [`CancelToken`] used to wake blocked waits, and the result value types.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod cancel;
pub mod error;
pub mod id;
pub mod task;
pub mod types;

pub use cancel::CancelToken;
pub use error::{CancelReason, EnvError, TaskError};
pub use id::{EnvId, PartitionId};
pub use task::{Runnable, Task};
pub use types::{Info, InfoValue, ResetOptions, ResetResult, StepResult};
