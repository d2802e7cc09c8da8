//! Broadcast cancellation for blocking waits.
//!
//! A [`CancelToken`] owns the only sender of a zero-capacity channel and
//! never sends on it. Cancelling drops that sender, which disconnects the
//! channel: every thread blocked in a `select!` on
//! [`signal()`](CancelToken::signal) wakes at once, and every later select
//! returns immediately. This replaces long-timeout polling with a
//! deterministic wakeup.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender};

/// One-way, idempotent cancellation signal.
pub struct CancelToken {
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create an untriggered token.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            trigger: Mutex::new(Some(tx)),
            signal: rx,
        }
    }

    /// Trigger cancellation. Returns `true` on the first call only.
    pub fn cancel(&self) -> bool {
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Receiver to select on. Becomes ready (disconnected) on cancel and
    /// never yields a message before that.
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
