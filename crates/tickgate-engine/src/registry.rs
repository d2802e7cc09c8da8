//! Process-wide collection of connected environments.
//!
//! The registry is the only shared mutable structure in the bridge. Control
//! threads connect and remove environments; the driver thread iterates. The
//! driver never iterates under the lock: it takes a [`snapshot`] (cheap
//! `Arc` clones) and walks that, so a concurrent `close` can never be
//! observed half-applied.
//!
//! [`snapshot`]: Registry::snapshot

use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use thiserror::Error;
use tickgate_core::EnvId;
use tracing::debug;

use crate::deferred::HostQueue;
use crate::environment::DriverHooks;

/// Failure to connect an environment.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An environment with this id is already connected.
    #[error("{env} is already connected")]
    AlreadyConnected {
        /// The duplicate id.
        env: EnvId,
    },
    /// The environment was closed before it could be connected.
    #[error("{env} is closed")]
    Closed {
        /// The closed environment.
        env: EnvId,
    },
}

struct Entry {
    kind: String,
    env: Arc<dyn DriverHooks>,
}

/// Arena of connected environments, keyed by [`EnvId`].
#[derive(Default)]
pub struct Registry {
    entries: RwLock<IndexMap<EnvId, Entry>>,
    host_queue: HostQueue,
}

// Compile-time assertion: Registry is shared between control and driver threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Registry>();
};

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    /// An empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide registry.
    pub fn global() -> &'static Arc<Registry> {
        GLOBAL.get_or_init(Registry::new)
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexMap<EnvId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<EnvId, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `env` under `kind` and attach it to this registry so that
    /// closing it removes it again.
    pub fn connect(
        self: &Arc<Self>,
        kind: &str,
        env: Arc<dyn DriverHooks>,
    ) -> Result<(), RegistryError> {
        let id = env.id();
        if env.is_closed() {
            return Err(RegistryError::Closed { env: id });
        }
        {
            let mut entries = self.write();
            if entries.contains_key(&id) {
                return Err(RegistryError::AlreadyConnected { env: id });
            }
            env.attach(Arc::downgrade(self), kind);
            entries.insert(
                id,
                Entry {
                    kind: kind.to_owned(),
                    env: Arc::clone(&env),
                },
            );
        }
        // A close racing with connect may have run before attach; undo.
        if env.is_closed() {
            self.remove(id);
            return Err(RegistryError::Closed { env: id });
        }
        debug!(env = %id, kind, "environment connected");
        Ok(())
    }

    /// Remove `id`. Returns the removed environment, if it was connected.
    pub fn remove(&self, id: EnvId) -> Option<Arc<dyn DriverHooks>> {
        let removed = self.write().shift_remove(&id).map(|entry| entry.env);
        if removed.is_some() {
            debug!(env = %id, "environment removed");
        }
        removed
    }

    /// The environment connected under `id`.
    pub fn get(&self, id: EnvId) -> Option<Arc<dyn DriverHooks>> {
        self.read().get(&id).map(|entry| Arc::clone(&entry.env))
    }

    /// Every connected environment, in connection order. The lock is
    /// released before this returns.
    pub fn snapshot(&self) -> Vec<Arc<dyn DriverHooks>> {
        self.read()
            .values()
            .map(|entry| Arc::clone(&entry.env))
            .collect()
    }

    /// Number of connected environments.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no environment is connected.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Distinct kinds currently connected, in first-connection order.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = Vec::new();
        for entry in self.read().values() {
            if !kinds.contains(&entry.kind) {
                kinds.push(entry.kind.clone());
            }
        }
        kinds
    }

    /// Ids of connected environments of `kind`.
    pub fn ids_of_kind(&self, kind: &str) -> Vec<EnvId> {
        self.read()
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Close every connected environment. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let envs = self.snapshot();
        for env in &envs {
            env.close();
        }
        envs.len()
    }

    /// Queue of closures the driver runs at the start of each cycle.
    pub fn host_queue(&self) -> &HostQueue {
        &self.host_queue
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.len())
            .field("host_queue", &self.host_queue)
            .finish()
    }
}
