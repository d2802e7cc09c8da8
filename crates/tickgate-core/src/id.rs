//! Strongly-typed identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for unique [`EnvId`] allocation.
static ENV_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one environment.
///
/// Allocated from a monotonic atomic counter via [`EnvId::next`], so two
/// environments never share an id within a process, even if one was closed
/// and another built with identical configuration. The registry indexes
/// environments by this id rather than by reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(u64);

impl EnvId {
    /// Allocate a fresh, unique environment id. Thread-safe.
    pub fn next() -> Self {
        Self(ENV_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env#{}", self.0)
    }
}

/// Identifies a partition: the set of environments the simulation host
/// advances together in one step (one world, one scene, one shard).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}
