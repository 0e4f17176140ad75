//! Worker pool for blocking operations.
//!
//! Message handlers and dispatched tasks may block freely, so they never
//! run on the delivery thread; the bus and the task dispatcher offload
//! them here. Fixed-size pool of OS threads over an mpsc channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool of worker threads for blocking jobs.
///
/// Jobs are panic-isolated: a panicking job is logged and the worker moves
/// on to the next one. Dropping the pool closes the channel and joins all
/// workers after they finish the jobs already queued.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn a pool with `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let receiver = Arc::clone(&receiver);
            workers.push(thread::spawn(move || Self::work(receiver)));
        }

        WorkerPool {
            sender: Some(sender),
            workers,
        }
    }

    /// Submit a job. Silently dropped if the pool is shutting down.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(job)).is_err() {
                error!("worker pool is shut down; job dropped");
            }
        }
    }

    /// Close the queue and wait for the workers to drain it.
    pub fn shutdown(mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn work(receiver: Arc<Mutex<Receiver<Job>>>) {
        loop {
            let job = {
                let receiver = match receiver.lock() {
                    Ok(receiver) => receiver,
                    Err(_) => return,
                };
                receiver.recv()
            };
            match job {
                Ok(job) => {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("worker job panicked");
                    }
                }
                // Channel closed: pool is shutting down.
                Err(_) => return,
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
