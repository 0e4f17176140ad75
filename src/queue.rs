//! Per-key task serialization: unbounded FIFO plus a single-drainer token.
//!
//! The execution token is a compare-and-swap flag, not a mutex: no caller
//! ever blocks waiting for it. A caller that loses the token returns
//! immediately, because the current drainer is guaranteed to observe the
//! task it just appended — the drain loop re-checks the queue after every
//! pop, and again after releasing the token.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::error;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Unbounded FIFO of deferred work for one logical key, with a
/// non-reentrant single-drainer guarantee.
///
/// Tasks enqueued for the same queue run in enqueue order and never
/// overlap. A task that panics is caught and logged; the drain proceeds to
/// the next task and the token is not released early. Tasks are
/// best-effort at-most-once — there is no persistence and no cancellation.
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Append a task without attempting to drain.
    ///
    /// Appending is cheap (a push under a short-lived mutex) and safe on
    /// any thread; pair it with [`drain`](TaskQueue::drain) on a
    /// blocking-capable thread.
    pub fn push<F: FnOnce() + Send + 'static>(&self, task: F) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push_back(Box::new(task)),
            Err(_) => error!("task queue poisoned; task dropped"),
        }
    }

    /// Append a task and drain if nobody else is draining.
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.push(task);
        self.drain();
    }

    /// Run queued tasks until empty, if the execution token is free.
    ///
    /// Never blocks: when another caller holds the token, it returns
    /// immediately and that drainer picks up the remaining tasks.
    pub fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Someone else is draining; they will see our tasks.
                return;
            }

            loop {
                let task = match self.tasks.lock() {
                    Ok(mut tasks) => tasks.pop_front(),
                    Err(_) => {
                        error!("task queue poisoned; drain aborted");
                        None
                    }
                };
                match task {
                    Some(task) => {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!("queued task panicked; continuing drain");
                        }
                    }
                    None => break,
                }
            }

            self.draining.store(false, Ordering::Release);

            // An append may have raced the release; if the queue is still
            // empty we are done, otherwise try to take the token again.
            let raced = self.tasks.lock().map(|tasks| !tasks.is_empty()).unwrap_or(false);
            if !raced {
                return;
            }
        }
    }

    /// Number of tasks waiting (not counting one currently running).
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
