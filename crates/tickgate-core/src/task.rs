//! Deferred, single-shot computations with a shared result slot.
//!
//! A [`Task`] is built on one thread (a control thread constructing a
//! request), run on another (the driver thread, inside a tick), and waited
//! on by any number of threads. The computation runs at most once; every
//! waiter observes the same value or the same captured error.
//!
//! ```text
//!   Pending(f) ──run()──> Running ──> Done(Ok | Err)
//!        │
//!        └──abort(e)───────────────> Done(Err(e))
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::TaskError;

type Computation<T> = Box<dyn FnOnce() -> Result<T, TaskError> + Send>;

enum Slot<T> {
    Pending(Computation<T>),
    Running,
    Done(Result<T, TaskError>),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    // The computation never runs under this lock, so a poisoned mutex
    // still holds a consistent slot.
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, result: Result<T, TaskError>) {
        *self.lock() = Slot::Done(result);
        self.ready.notify_all();
    }
}

/// A single-shot computation whose result can be awaited from any thread.
///
/// Cloning a `Task` yields another handle to the same computation.
pub struct Task<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

// Compile-time assertion: a Task of a Send value can cross threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Task<u64>>();
};

impl<T: Send + 'static> Task<T> {
    /// Schedule `computation` without running it.
    pub fn new<F>(computation: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending(Box::new(computation))),
                ready: Condvar::new(),
            }),
        }
    }

    /// A task that is already complete with `result`.
    pub fn from_result(result: Result<T, TaskError>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Done(result)),
                ready: Condvar::new(),
            }),
        }
    }
}

impl<T> Task<T> {
    /// Execute the computation on the calling thread.
    ///
    /// Returns `true` if this call ran it. Every later call (and any call
    /// after [`abort`](Self::abort)) is a no-op returning `false`. A panic
    /// inside the computation is captured as [`TaskError::Panicked`].
    pub fn run(&self) -> bool {
        let computation = {
            let mut slot = self.shared.lock();
            if !matches!(*slot, Slot::Pending(_)) {
                return false;
            }
            let Slot::Pending(f) = std::mem::replace(&mut *slot, Slot::Running) else {
                return false;
            };
            f
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(computation)) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        };
        self.shared.complete(result);
        true
    }

    /// Complete the task with `error` if it has not started running.
    ///
    /// Returns `true` if the task was aborted. The computation is dropped
    /// without being called.
    pub fn abort(&self, error: TaskError) -> bool {
        {
            let mut slot = self.shared.lock();
            if !matches!(*slot, Slot::Pending(_)) {
                return false;
            }
            *slot = Slot::Done(Err(error));
        }
        self.shared.ready.notify_all();
        true
    }

    /// Whether a result (value or error) is available.
    pub fn is_done(&self) -> bool {
        matches!(*self.shared.lock(), Slot::Done(_))
    }

    /// Whether the computation has neither started nor been aborted.
    pub fn is_pending(&self) -> bool {
        matches!(*self.shared.lock(), Slot::Pending(_))
    }
}

impl<T: Clone> Task<T> {
    /// Block until the task has completed, then return its result.
    pub fn wait(&self) -> Result<T, TaskError> {
        let mut slot = self.shared.lock();
        loop {
            if let Slot::Done(result) = &*slot {
                return result.clone();
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`. Returns `None` if the task is still
    /// incomplete when the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.lock();
        loop {
            if let Slot::Done(result) = &*slot {
                return Some(result.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            slot = self
                .shared
                .ready
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Type-erased view of a [`Task`] for code that only runs or aborts it.
///
/// The driver thread executes pre/post halves of requests whose result
/// types differ per environment; it holds them as `Arc<dyn Runnable>`.
pub trait Runnable: Send + Sync {
    /// See [`Task::run`].
    fn run(&self) -> bool;
    /// See [`Task::abort`].
    fn abort(&self, error: TaskError) -> bool;
    /// See [`Task::is_done`].
    fn is_done(&self) -> bool;
    /// The captured error, if the task completed unsuccessfully.
    fn failure(&self) -> Option<TaskError>;
}

impl<T: Send> Runnable for Task<T> {
    fn run(&self) -> bool {
        Task::run(self)
    }

    fn abort(&self, error: TaskError) -> bool {
        Task::abort(self, error)
    }

    fn is_done(&self) -> bool {
        Task::is_done(self)
    }

    fn failure(&self) -> Option<TaskError> {
        match &*self.shared.lock() {
            Slot::Done(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.lock() {
            Slot::Pending(_) => "pending",
            Slot::Running => "running",
            Slot::Done(Ok(_)) => "done",
            Slot::Done(Err(_)) => "failed",
        };
        f.debug_struct("Task").field("state", &state).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
