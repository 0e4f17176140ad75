//! Store seams for the durable message log and subscription index.
//!
//! The bus owns the lifecycle of these rows but not their storage: any
//! relational (or in-memory) backend can implement the two traits. All
//! mutation is single-row — a conditional bit clear or an
//! insert-guarded-by-uniqueness — so no backend needs multi-row
//! transactions on behalf of the bus.

use std::fmt;
use std::time::SystemTime;

/// A persisted message row.
///
/// Created only when a publish needs durability (at least one live
/// subscriber). `pending_mask` monotonically loses bits until it reaches
/// zero, after which the row is dead weight for an external cleanup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    /// Generated id, monotonically increasing, never zero.
    pub id: u64,
    /// Topic the message was published on.
    pub channel: String,
    /// Serialized payload (JSON).
    pub payload: Vec<u8>,
    /// Bitmask of subscriber indices that have not yet consumed the message.
    pub pending_mask: u32,
    /// Creation time, used by the retry scheduler to detect staleness.
    pub created_at: SystemTime,
}

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An insert lost to a uniqueness constraint.
    Conflict,
    /// The referenced row does not exist.
    NotFound(u64),
    /// An internal lock was poisoned.
    LockPoisoned(&'static str),
    /// Backend-specific failure.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "insert conflicted with an existing row"),
            StoreError::NotFound(id) => write!(f, "message {} not found", id),
            StoreError::LockPoisoned(operation) => {
                write!(f, "store lock poisoned during {}", operation)
            }
            StoreError::Backend(msg) => write!(f, "store backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Row-level access to the message log.
pub trait MessageStore: Send + Sync {
    /// Insert a new message row and return its generated id (never zero).
    fn insert(
        &self,
        channel: &str,
        payload: &[u8],
        pending_mask: u32,
        created_at: SystemTime,
    ) -> Result<u64, StoreError>;

    /// Physically delete a row. Used to undo a staged insert when the
    /// publishing transaction rolls back.
    fn delete(&self, id: u64) -> Result<(), StoreError>;

    /// Clear one component's bit in a row's pending mask.
    ///
    /// A single conditional update by id and bit position. Returns the mask
    /// remaining after the clear. Clearing a bit that is already clear is a
    /// no-op (retries make that normal).
    fn clear_bit(&self, id: u64, index: u8) -> Result<u32, StoreError>;

    /// All rows with a non-zero pending mask created at or before `cutoff`.
    fn stale(&self, cutoff: SystemTime) -> Result<Vec<MessageRecord>, StoreError>;
}

/// Row-level access to the subscription index.
pub trait SubscriptionStore: Send + Sync {
    /// The persisted index for `(channel, component)`, if any.
    fn index_of(&self, channel: &str, component: &str) -> Result<Option<u8>, StoreError>;

    /// The highest index allocated on `channel`, if any.
    fn max_index(&self, channel: &str) -> Result<Option<u8>, StoreError>;

    /// Insert a `(channel, component) -> index` row.
    ///
    /// Must enforce uniqueness of both `(channel, component)` and
    /// `(channel, index)`, returning [`StoreError::Conflict`] when either
    /// already exists — the registry's optimistic allocation loop depends
    /// on it.
    fn insert_index(&self, channel: &str, component: &str, index: u8) -> Result<(), StoreError>;

    /// Delete the `(channel, component)` row. Test/shutdown path only.
    fn remove_index(&self, channel: &str, component: &str) -> Result<(), StoreError>;
}
