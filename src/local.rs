//! Local bus primitive: cheap in-process fan-out, no durability.
//!
//! Wraps an [`EventEmitter`] so the message bus and the retry scheduler
//! share one delivery path. Listeners receive the raw [`Envelope`]; typed
//! decoding and worker-pool offload happen in the subscriber wiring, so a
//! listener itself must stay cheap and must not publish back into the bus
//! from the delivery thread.

use std::sync::Mutex;

use event_emitter_rs::EventEmitter;
use tracing::warn;

use crate::envelope::Envelope;

/// In-process publish/subscribe channel abstraction.
pub struct LocalBus {
    emitter: Mutex<EventEmitter>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        LocalBus {
            emitter: Mutex::new(EventEmitter::new()),
        }
    }

    /// Deliver an envelope to every listener currently registered on
    /// `channel`. No-op when nobody listens.
    pub fn publish(&self, channel: &str, envelope: Envelope) {
        match self.emitter.lock() {
            Ok(mut emitter) => {
                emitter.emit(channel, envelope);
            }
            Err(_) => warn!(channel, "local bus emitter poisoned; delivery dropped"),
        }
    }

    /// Register a listener for `channel`. Returns the listener id used to
    /// unsubscribe.
    pub fn subscribe<F>(&self, channel: &str, listener: F) -> String
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        match self.emitter.lock() {
            Ok(mut emitter) => emitter.on(channel, listener),
            Err(_) => {
                warn!(channel, "local bus emitter poisoned; listener not registered");
                String::new()
            }
        }
    }

    /// Remove a previously registered listener.
    pub fn unsubscribe(&self, listener_id: &str) {
        if let Ok(mut emitter) = self.emitter.lock() {
            emitter.remove_listener(listener_id);
        }
    }
}
