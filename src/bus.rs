//! The message bus: transactional publish, durable consumption tracking,
//! typed subscription.
//!
//! Publication is a side effect of a data-mutating transaction: the event
//! becomes visible to subscribers if and only if that transaction commits.
//! When at least one live subscriber exists, the publish persists a row
//! whose pending mask records which components still owe consumption;
//! each component's bit is cleared when its handler succeeds, and rows
//! with surviving bits are redelivered by the
//! [`RetryScheduler`](crate::RetryScheduler). Delivery is therefore
//! at-least-once per component, and handlers must be idempotent.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::envelope::{decode_payload, encode_payload, CodecError, Envelope, EPHEMERAL_ID};
use crate::identity::Identity;
use crate::local::LocalBus;
use crate::pool::WorkerPool;
use crate::registry::{RegisterError, SubscriptionRegistry};
use crate::report::{ErrorReporter, LogReporter};
use crate::store::{MessageStore, StoreError};
use crate::tx::{Transaction, TxStatus};

/// Error type for publish operations.
#[derive(Debug)]
pub enum PublishError {
    /// Publication requires an enclosing transaction.
    NoActiveTransaction(TxStatus),
    /// The payload could not be serialized.
    Codec(CodecError),
    /// The message row could not be persisted.
    Store(StoreError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NoActiveTransaction(status) => {
                write!(f, "publish requires an active transaction (status {:?})", status)
            }
            PublishError::Codec(err) => write!(f, "publish failed: {}", err),
            PublishError::Store(err) => write!(f, "publish failed: {}", err),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<CodecError> for PublishError {
    fn from(err: CodecError) -> Self {
        PublishError::Codec(err)
    }
}

impl From<StoreError> for PublishError {
    fn from(err: StoreError) -> Self {
        PublishError::Store(err)
    }
}

/// Error returned by a message handler to signal a failed consumption.
///
/// The failure is reported and the message stays pending for retry; it
/// never propagates to other consumers or to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

/// Handle returned by [`MessageBus::subscribe`].
///
/// Closing removes the local listener, deletes the persisted subscription
/// row and clears the live bit — a test/shutdown path. There is no `Drop`
/// impl on purpose: dropping a handle must not silently mutate durable
/// state.
pub struct Subscription {
    channel: String,
    component: String,
    index: u8,
    listener_id: String,
    local: Arc<LocalBus>,
    registry: Arc<SubscriptionRegistry>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("component", &self.component)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// The subscriber index allocated for this `(channel, component)`.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Stop local delivery and unregister the persisted subscription.
    ///
    /// Does not retroactively touch already-published rows: their pending
    /// bits for this component stay set.
    pub fn close(self) -> Result<(), RegisterError> {
        self.local.unsubscribe(&self.listener_id);
        self.registry.unregister(&self.channel, &self.component)
    }
}

/// Transactional publish/subscribe over a durable message log.
pub struct MessageBus {
    messages: Arc<dyn MessageStore>,
    registry: Arc<SubscriptionRegistry>,
    local: Arc<LocalBus>,
    pool: Arc<WorkerPool>,
    reporter: Arc<dyn ErrorReporter>,
}

impl MessageBus {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        registry: Arc<SubscriptionRegistry>,
        local: Arc<LocalBus>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        MessageBus {
            messages,
            registry,
            local,
            pool,
            reporter: Arc::new(LogReporter::new()),
        }
    }

    /// Replace the default log-based error reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Publish `payload` on `channel` as a side effect of `tx`.
    ///
    /// Mandatory-transactional: fails fast when `tx` has already completed.
    /// A rollback-only transaction silently drops the publish (from the
    /// observers' point of view it never happened), and an undeterminable
    /// status is logged but never surfaced — publication must not crash
    /// the caller's business transaction.
    ///
    /// When the channel's live mask is non-zero a row is persisted with
    /// that mask; either way, delivery happens on the local bus only after
    /// `tx` commits.
    pub fn publish<T: Serialize>(
        &self,
        tx: &Transaction,
        channel: &str,
        payload: &T,
    ) -> Result<(), PublishError> {
        match tx.status() {
            TxStatus::Active => {}
            TxStatus::RollbackOnly => {
                debug!(channel, "publish on rollback-only transaction dropped");
                return Ok(());
            }
            TxStatus::Unknown => {
                warn!(channel, "transaction status unknown; publish dropped");
                return Ok(());
            }
            status => return Err(PublishError::NoActiveTransaction(status)),
        }

        let payload = encode_payload(payload)?;
        let live_mask = self.registry.live_mask(channel);

        let id = if live_mask == 0 {
            EPHEMERAL_ID
        } else {
            let id = self
                .messages
                .insert(channel, &payload, live_mask, std::time::SystemTime::now())?;
            // The row is staged: it must not survive a rolled-back publish.
            let messages = Arc::clone(&self.messages);
            let staged_channel = channel.to_string();
            let hook = tx.after_rollback(move || {
                if let Err(err) = messages.delete(id) {
                    warn!(channel = %staged_channel, id, "failed to delete staged row: {}", err);
                }
            });
            if hook.is_err() {
                warn!(channel, "transaction state lost; publish dropped");
                let _ = self.messages.delete(id);
                return Ok(());
            }
            id
        };

        let local = Arc::clone(&self.local);
        let delivery_channel = channel.to_string();
        let envelope = Envelope::new(id, live_mask, payload);
        let hook = tx.after_commit(move || local.publish(&delivery_channel, envelope));
        if hook.is_err() {
            warn!(channel, "transaction state lost; publish dropped");
            if id != EPHEMERAL_ID {
                let _ = self.messages.delete(id);
            }
        }
        Ok(())
    }

    /// Subscribe `component` to `channel` with a typed handler.
    ///
    /// Validates the channel's payload type (all subscribers to one channel
    /// must agree on it), registers the component's stable index, and
    /// wires local delivery. The handler runs on the worker pool under the
    /// system identity, inside its own consumption cycle: success clears
    /// this component's pending bit, failure is reported and leaves the
    /// bit set for retry. Failures are isolated per component.
    pub fn subscribe<T, F>(
        &self,
        channel: &str,
        component: &str,
        handler: F,
    ) -> Result<Subscription, RegisterError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        // Codec first: a rejected payload type must not touch registration
        // state — the component may already be subscribed with the right one.
        self.registry.register_codec::<T>(channel)?;
        let index = self.registry.register(channel, component)?;

        let handler = Arc::new(handler);
        let listener = {
            let messages = Arc::clone(&self.messages);
            let reporter = Arc::clone(&self.reporter);
            let pool = Arc::clone(&self.pool);
            let channel = channel.to_string();
            move |envelope: Envelope| {
                // Not ours: predates this subscription or already consumed.
                if !envelope.is_pending_for(index) {
                    return;
                }
                let messages = Arc::clone(&messages);
                let reporter = Arc::clone(&reporter);
                let handler = Arc::clone(&handler);
                let channel = channel.clone();
                pool.execute(move || {
                    consume::<T, F>(messages, &*reporter, &*handler, &channel, index, envelope);
                });
            }
        };
        let listener_id = self.local.subscribe(channel, listener);

        Ok(Subscription {
            channel: channel.to_string(),
            component: component.to_string(),
            index,
            listener_id,
            local: Arc::clone(&self.local),
            registry: Arc::clone(&self.registry),
        })
    }
}

/// One consumption cycle: decode, invoke under the system identity, then
/// either clear the pending bit (success, inside a fresh transaction) or
/// report and leave the message pending (failure).
fn consume<T, F>(
    messages: Arc<dyn MessageStore>,
    reporter: &dyn ErrorReporter,
    handler: &F,
    channel: &str,
    index: u8,
    envelope: Envelope,
) where
    T: DeserializeOwned,
    F: Fn(T) -> Result<(), HandlerError>,
{
    let _identity = Identity::System.enter();

    let payload = match decode_payload::<T>(&envelope.payload) {
        Ok(payload) => payload,
        Err(err) => {
            reporter.report(&err, channel, &payload_context(&envelope));
            return;
        }
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| handler(payload)))
        .unwrap_or_else(|_| Err(HandlerError::new("handler panicked")));

    match outcome {
        Ok(()) => {
            if !envelope.is_durable() {
                return;
            }
            // Clear our bit inside a fresh transaction. If the hook cannot
            // be registered the clear is skipped, the bit stays set, and
            // the retry scheduler will redeliver.
            let tx = Transaction::begin();
            let id = envelope.id;
            let cleared_channel = channel.to_string();
            let hook = tx.after_commit(move || {
                if let Err(err) = messages.clear_bit(id, index) {
                    warn!(channel = %cleared_channel, id, index, "pending bit not cleared: {}", err);
                }
            });
            match hook {
                Ok(()) => {
                    tx.commit();
                }
                Err(err) => {
                    debug!(channel, id, "clear skipped ({}); message stays pending", err);
                }
            }
        }
        Err(err) => {
            reporter.report(&err, channel, &payload_context(&envelope));
        }
    }
}

fn payload_context(envelope: &Envelope) -> String {
    format!(
        "id={} payload={}",
        envelope.id,
        String::from_utf8_lossy(&envelope.payload)
    )
}
