//! Staleness-based redelivery of messages with surviving pending bits.
//!
//! Staleness is row-global, not per-consumer: once a row is older than the
//! window, every component whose bit is still set gets redelivered
//! together, even if only one of them actually failed. A slow-but-healthy
//! component may therefore see a spurious duplicate — consumers must be
//! idempotent, which at-least-once delivery demands anyway.

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::local::LocalBus;
use crate::registry::SubscriptionRegistry;
use crate::store::MessageStore;

/// Default time between scans.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
/// Default age past which a row with pending bits counts as stale.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(300);

/// Statistics from retry scans.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Stale rows republished on the local bus.
    pub republished: usize,
    /// Stale rows skipped because no codec is registered for the channel.
    pub skipped: usize,
    /// Scans performed.
    pub scans: usize,
}

/// Periodic job that re-publishes stale message rows on the local bus.
///
/// Re-publication reuses the row's id and remaining mask — no new
/// transaction, no new row. Rows on channels without a registered payload
/// codec are skipped (nothing in this process could decode them yet) and
/// stay stale for a later scan.
pub struct RetryScheduler {
    messages: Arc<dyn MessageStore>,
    registry: Arc<SubscriptionRegistry>,
    local: Arc<LocalBus>,
    interval: Duration,
    staleness: Duration,
}

impl RetryScheduler {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        registry: Arc<SubscriptionRegistry>,
        local: Arc<LocalBus>,
    ) -> Self {
        RetryScheduler {
            messages,
            registry,
            local,
            interval: DEFAULT_INTERVAL,
            staleness: DEFAULT_STALENESS,
        }
    }

    /// Set the time between scans.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the staleness window.
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Run a single scan synchronously and return what it did.
    pub fn scan_once(&self) -> ScanStats {
        let mut stats = ScanStats {
            scans: 1,
            ..ScanStats::default()
        };
        let cutoff = match SystemTime::now().checked_sub(self.staleness) {
            Some(cutoff) => cutoff,
            None => return stats,
        };

        let rows = match self.messages.stale(cutoff) {
            Ok(rows) => rows,
            Err(err) => {
                warn!("stale-row scan failed: {}", err);
                return stats;
            }
        };

        for row in rows {
            if !self.registry.has_codec(&row.channel) {
                debug!(
                    channel = %row.channel,
                    id = row.id,
                    "no codec registered; stale message skipped"
                );
                stats.skipped += 1;
                continue;
            }
            let envelope = Envelope::new(row.id, row.pending_mask, row.payload);
            self.local.publish(&row.channel, envelope);
            stats.republished += 1;
        }
        stats
    }

    /// Run scans on a background thread every `interval` until stopped.
    pub fn spawn(self) -> RetryHandle {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut total = ScanStats::default();
            loop {
                match stop_rx.recv_timeout(self.interval) {
                    Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                }

                let stats = self.scan_once();
                total.republished += stats.republished;
                total.skipped += stats.skipped;
                total.scans += stats.scans;
            }
            total
        });

        RetryHandle {
            stop_tx,
            handle: Some(handle),
        }
    }
}

/// Handle for a running [`RetryScheduler`] thread.
pub struct RetryHandle {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<ScanStats>>,
}

impl RetryHandle {
    /// Signal the scheduler to stop and wait for it; returns cumulative
    /// scan statistics.
    pub fn stop(mut self) -> ScanStats {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap_or_default()
        } else {
            ScanStats::default()
        }
    }
}

impl Drop for RetryHandle {
    fn drop(&mut self) {
        // Signal without joining; the thread winds down on its own.
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::SubscriptionStore;
    use std::sync::Mutex;

    fn fixture() -> (MemoryStore, Arc<SubscriptionRegistry>, Arc<LocalBus>) {
        let store = MemoryStore::new();
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(store.clone())));
        (store, registry, Arc::new(LocalBus::new()))
    }

    #[test]
    fn scheduler_builder() {
        let (store, registry, local) = fixture();
        let scheduler = RetryScheduler::new(Arc::new(store), registry, local)
            .with_interval(Duration::from_millis(10))
            .with_staleness(Duration::from_secs(1));
        assert_eq!(scheduler.interval, Duration::from_millis(10));
        assert_eq!(scheduler.staleness, Duration::from_secs(1));
    }

    #[test]
    fn stale_rows_are_republished_with_same_id_and_mask() {
        let (store, registry, local) = fixture();
        registry.register_codec::<String>("run/new").unwrap();

        let payload = serde_json::to_vec("foo").unwrap();
        let id = store
            .insert("run/new", &payload, 0b10, SystemTime::now())
            .unwrap();
        store.backdate(id, Duration::from_secs(600)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        local.subscribe("run/new", move |envelope: Envelope| {
            sink.lock().unwrap().push(envelope);
        });

        let scheduler = RetryScheduler::new(Arc::new(store), registry, local)
            .with_staleness(Duration::from_secs(60));
        let stats = scheduler.scan_once();
        assert_eq!(stats.republished, 1);
        assert_eq!(stats.skipped, 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, id);
        assert_eq!(seen[0].pending_mask, 0b10);
    }

    #[test]
    fn fresh_rows_are_left_alone() {
        let (store, registry, local) = fixture();
        registry.register_codec::<String>("run/new").unwrap();
        store
            .insert("run/new", b"\"foo\"", 0b1, SystemTime::now())
            .unwrap();

        let scheduler = RetryScheduler::new(Arc::new(store), registry, local)
            .with_staleness(Duration::from_secs(60));
        let stats = scheduler.scan_once();
        assert_eq!(stats.republished, 0);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn unknown_channel_type_is_skipped_and_stays_stale() {
        let (store, registry, local) = fixture();
        let id = store
            .insert("unknown/channel", b"\"foo\"", 0b1, SystemTime::now())
            .unwrap();
        store.backdate(id, Duration::from_secs(600)).unwrap();

        let scheduler = RetryScheduler::new(Arc::new(store.clone()), registry, local)
            .with_staleness(Duration::from_secs(60));

        let stats = scheduler.scan_once();
        assert_eq!(stats.republished, 0);
        assert_eq!(stats.skipped, 1);
        // Still stale for the next scan.
        let stats = scheduler.scan_once();
        assert_eq!(stats.skipped, 1);
        assert_eq!(store.message(id).unwrap().pending_mask, 0b1);
    }

    #[test]
    fn spawned_scheduler_stops_cleanly() {
        let (store, registry, local) = fixture();
        // Unused subscription row just to exercise the trait object.
        store.insert_index("ch", "svc", 0).unwrap();

        let handle = RetryScheduler::new(Arc::new(store), registry, local)
            .with_interval(Duration::from_millis(5))
            .spawn();
        thread::sleep(Duration::from_millis(40));
        let stats = handle.stop();
        assert!(stats.scans >= 1);
    }
}
