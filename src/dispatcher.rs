//! Blocking task dispatcher: per-key serialized execution on a worker pool.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::pool::WorkerPool;
use crate::queue::TaskQueue;

/// Routes deferred work to a per-key [`TaskQueue`] and offloads execution
/// onto a worker pool sized for blocking operations.
///
/// Tasks sharing a key run in the order `execute_for_key` was called and
/// never overlap; tasks for different keys may run concurrently. Queues
/// are created lazily and kept for the process lifetime — keys are few and
/// an empty queue is inert.
pub struct TaskDispatcher<K> {
    pool: Arc<WorkerPool>,
    queues: Mutex<HashMap<K, Arc<TaskQueue>>>,
}

impl<K> TaskDispatcher<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create a dispatcher over an existing pool.
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        TaskDispatcher {
            pool,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Create a dispatcher with its own pool of `workers` threads.
    pub fn with_workers(workers: usize) -> Self {
        Self::new(Arc::new(WorkerPool::new(workers)))
    }

    /// Enqueue `task` for `key` and schedule a drain on the worker pool.
    ///
    /// The append happens on the calling thread (a cheap queue push), which
    /// pins the task's position in the key's FIFO to this call's order; only
    /// the drain — where the task actually runs and may block — is
    /// offloaded. Fire-and-forget: failures inside the task are logged by
    /// the queue and never reach the caller.
    pub fn execute_for_key<F: FnOnce() + Send + 'static>(&self, key: K, task: F) {
        let queue = match self.queue_for(key) {
            Some(queue) => queue,
            None => return,
        };
        queue.push(task);
        self.pool.execute(move || queue.drain());
    }

    fn queue_for(&self, key: K) -> Option<Arc<TaskQueue>> {
        match self.queues.lock() {
            Ok(mut queues) => Some(Arc::clone(
                queues.entry(key).or_insert_with(|| Arc::new(TaskQueue::new())),
            )),
            Err(_) => {
                error!("dispatcher queue map poisoned; task dropped");
                None
            }
        }
    }
}
