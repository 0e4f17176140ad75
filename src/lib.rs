//! durabus — the durable event-dispatch core of a result-tracking service.
//!
//! Two mechanisms, both process-local in execution but durable in intent:
//!
//! - A transactional **message bus**: `publish` is a side effect of a
//!   data-mutating transaction, delivery happens after commit, and each
//!   subscribing component consumes each durable message at least once.
//!   A persisted pending mask tracks which components still owe
//!   consumption; a retry scheduler redelivers stale rows.
//! - A **blocking task dispatcher**: deferred work sharing a logical key
//!   runs in FIFO order with no overlap, through a non-blocking
//!   drain-or-defer handoff on a worker pool.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use durabus::{
//!     LocalBus, MemoryStore, MessageBus, SubscriptionRegistry, Transaction, WorkerPool,
//! };
//!
//! let store = MemoryStore::new();
//! let registry = Arc::new(SubscriptionRegistry::new(Arc::new(store.clone())));
//! let bus = MessageBus::new(
//!     Arc::new(store),
//!     registry,
//!     Arc::new(LocalBus::new()),
//!     Arc::new(WorkerPool::new(2)),
//! );
//!
//! let _subscription = bus
//!     .subscribe("run/new", "reporting", |run_id: u64| {
//!         println!("new run: {}", run_id);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let tx = Transaction::begin();
//! bus.publish(&tx, "run/new", &42u64).unwrap();
//! tx.commit(); // delivery happens here
//! ```

mod bus;
mod dispatcher;
mod envelope;
mod identity;
mod local;
mod memory;
mod pool;
mod queue;
mod registry;
mod report;
mod retry;
mod store;
mod tx;

pub use bus::{HandlerError, MessageBus, PublishError, Subscription};
pub use dispatcher::TaskDispatcher;
pub use envelope::{decode_payload, encode_payload, CodecError, Envelope, EPHEMERAL_ID};
pub use identity::{Identity, IdentityGuard};
pub use local::LocalBus;
pub use memory::MemoryStore;
pub use pool::WorkerPool;
pub use queue::TaskQueue;
pub use registry::{RegisterError, SubscriptionRegistry, MAX_SUBSCRIBERS};
pub use report::{BufferReporter, ErrorReporter, LogReporter};
pub use retry::{RetryHandle, RetryScheduler, ScanStats, DEFAULT_INTERVAL, DEFAULT_STALENESS};
pub use store::{MessageRecord, MessageStore, StoreError, SubscriptionStore};
pub use tx::{Transaction, TxError, TxStatus};
