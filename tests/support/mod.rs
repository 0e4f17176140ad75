//! Shared helpers for the integration suites.
#![allow(dead_code)] // not every suite uses every helper

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use durabus::{LocalBus, MemoryStore, MessageBus, SubscriptionRegistry, WorkerPool};

static TRACING: Once = Once::new();

/// Install a test log subscriber once; `RUST_LOG` controls verbosity.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `predicate` until it holds or the deadline passes. Returns the
/// final evaluation, so callers can `assert!` on it directly.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// Default bound for "happens soon" assertions.
pub fn soon() -> Duration {
    Duration::from_secs(5)
}

pub struct Fixture {
    pub store: MemoryStore,
    pub registry: Arc<SubscriptionRegistry>,
    pub local: Arc<LocalBus>,
    pub bus: MessageBus,
}

/// A bus over a fresh in-memory store with a small worker pool.
pub fn fixture() -> Fixture {
    init_tracing();
    let store = MemoryStore::new();
    let registry = Arc::new(SubscriptionRegistry::new(Arc::new(store.clone())));
    let local = Arc::new(LocalBus::new());
    let bus = MessageBus::new(
        Arc::new(store.clone()),
        Arc::clone(&registry),
        Arc::clone(&local),
        Arc::new(WorkerPool::new(4)),
    );
    Fixture {
        store,
        registry,
        local,
        bus,
    }
}
