//! Closures scheduled to run on the host thread before the next tick.
//!
//! Some work can only be done by the simulation host (building a world for
//! a replacement environment, for example). Any thread may
//! [`schedule`](HostQueue::schedule) a [`Task`](tickgate_core::Task); the
//! driver drains the queue at the start of every `before_step`.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tickgate_core::Runnable;

/// Run-before-next-tick queue.
#[derive(Default)]
pub struct HostQueue {
    pending: Mutex<Vec<Arc<dyn Runnable>>>,
}

impl HostQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` for the host thread.
    pub fn schedule(&self, task: Arc<dyn Runnable>) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every task queued so far, in scheduling order, on the calling
    /// thread. Tasks scheduled while draining wait for the next call.
    /// Returns the number of tasks that ran.
    pub fn run_pending(&self) -> usize {
        let batch = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        batch.iter().filter(|task| task.run()).count()
    }
}

impl fmt::Debug for HostQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostQueue")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tickgate_core::{Task, TaskError};

    #[test]
    fn drains_in_order_and_only_once() {
        let queue = HostQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<Task<()>> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                Task::new(move || {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            })
            .collect();
        for t in &tasks {
            queue.schedule(Arc::new(t.clone()));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.run_pending(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.run_pending(), 0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(tasks.iter().all(|t| t.is_done()));
    }

    #[test]
    fn aborted_task_is_skipped() {
        let queue = HostQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let task: Task<()> = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.schedule(Arc::new(task.clone()));
        task.abort(TaskError::failed("gone"));
        assert_eq!(queue.run_pending(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tasks_scheduled_while_draining_wait_for_next_drain() {
        let queue = Arc::new(HostQueue::new());
        let inner = Arc::new(Task::new(|| Ok(())));
        let q = Arc::clone(&queue);
        let follow_up = Arc::clone(&inner);
        let outer: Task<()> = Task::new(move || {
            q.schedule(follow_up);
            Ok(())
        });
        queue.schedule(Arc::new(outer));
        assert_eq!(queue.run_pending(), 1);
        assert!(!inner.is_done());
        assert_eq!(queue.run_pending(), 1);
        assert!(inner.is_done());
    }
}
