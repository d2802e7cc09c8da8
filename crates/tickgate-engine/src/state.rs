//! Per-environment lifecycle flags and the outstanding-request slot.
//!
//! ```text
//! Created ──reset ok──> Initialized ──close──> Closed (terminal)
//!                         │    ▲
//!                   pause │    │ reset / step
//!                         ▼    │
//!                        Paused
//! ```
//!
//! Each flag is an independent atomic, so unrelated environments never
//! contend on a shared lock. `pending` is the single outstanding-request
//! slot: a control thread claims it with a compare-exchange before
//! publishing and releases it when its call returns, so a second
//! concurrent `reset`/`step` fails fast instead of interleaving.

use std::sync::atomic::{AtomicBool, Ordering};

use tickgate_core::{EnvError, EnvId};

/// Lifecycle flags of one environment.
#[derive(Debug, Default)]
pub struct EnvState {
    initialized: AtomicBool,
    paused: AtomicBool,
    closed: AtomicBool,
    pending: AtomicBool,
}

// Compile-time assertion: EnvState must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<EnvState>();
};

impl EnvState {
    /// Fresh state: `Created`, not paused, not closed, nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the outstanding-request slot for `env`.
    ///
    /// Fails with [`EnvError::Closed`] after close and with
    /// [`EnvError::AlreadyPending`] while another call holds the slot.
    /// The slot is released when the returned guard drops.
    pub fn begin_request(&self, env: EnvId) -> Result<RequestGuard<'_>, EnvError> {
        if self.is_closed() {
            return Err(EnvError::Closed { env });
        }
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EnvError::AlreadyPending { env })?;
        Ok(RequestGuard { state: self })
    }

    /// Whether a control thread currently holds the request slot.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether a `reset` has completed at least once.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Record a successful `reset`.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Whether the driver should skip this environment.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Set or clear the paused flag.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Whether the environment is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Returns `true` on the first call only.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// `initialized && !paused && !closed`.
    pub fn should_step(&self) -> bool {
        self.is_initialized() && !self.is_paused() && !self.is_closed()
    }
}

/// Holds the outstanding-request slot; releases it on drop.
#[derive(Debug)]
pub struct RequestGuard<'a> {
    state: &'a EnvState,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.state.pending.store(false, Ordering::Release);
    }
}
