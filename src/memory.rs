//! In-memory store for testing and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use crate::store::{MessageRecord, MessageStore, StoreError, SubscriptionStore};

/// In-memory implementation of both [`MessageStore`] and
/// [`SubscriptionStore`].
///
/// Thread-safe and cheap to clone (clones share the same storage), in the
/// same way several handles to one database pool would.
#[derive(Clone)]
pub struct MemoryStore {
    messages: Arc<RwLock<HashMap<u64, MessageRecord>>>,
    subscriptions: Arc<RwLock<HashMap<(String, String), u8>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store. Ids start at 1; 0 is the ephemeral sentinel.
    pub fn new() -> Self {
        MemoryStore {
            messages: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Fetch a message row by id.
    pub fn message(&self, id: u64) -> Option<MessageRecord> {
        self.messages.read().ok()?.get(&id).cloned()
    }

    /// Number of message rows currently held.
    pub fn message_count(&self) -> usize {
        self.messages.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Move a row's creation time into the past.
    ///
    /// Lets tests age a message beyond the retry staleness window without
    /// sleeping through it.
    pub fn backdate(&self, id: u64, by: Duration) -> Result<(), StoreError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|_| StoreError::LockPoisoned("backdate"))?;
        let record = messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.created_at = record
            .created_at
            .checked_sub(by)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(())
    }
}

impl MessageStore for MemoryStore {
    fn insert(
        &self,
        channel: &str,
        payload: &[u8],
        pending_mask: u32,
        created_at: SystemTime,
    ) -> Result<u64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = MessageRecord {
            id,
            channel: channel.to_string(),
            payload: payload.to_vec(),
            pending_mask,
            created_at,
        };
        let mut messages = self
            .messages
            .write()
            .map_err(|_| StoreError::LockPoisoned("insert"))?;
        messages.insert(id, record);
        Ok(id)
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|_| StoreError::LockPoisoned("delete"))?;
        messages.remove(&id);
        Ok(())
    }

    fn clear_bit(&self, id: u64, index: u8) -> Result<u32, StoreError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|_| StoreError::LockPoisoned("clear_bit"))?;
        let record = messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.pending_mask &= !(1u32 << index);
        Ok(record.pending_mask)
    }

    fn stale(&self, cutoff: SystemTime) -> Result<Vec<MessageRecord>, StoreError> {
        let messages = self
            .messages
            .read()
            .map_err(|_| StoreError::LockPoisoned("stale"))?;
        let mut rows: Vec<MessageRecord> = messages
            .values()
            .filter(|r| r.pending_mask != 0 && r.created_at <= cutoff)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }
}

impl SubscriptionStore for MemoryStore {
    fn index_of(&self, channel: &str, component: &str) -> Result<Option<u8>, StoreError> {
        let subscriptions = self
            .subscriptions
            .read()
            .map_err(|_| StoreError::LockPoisoned("index_of"))?;
        Ok(subscriptions
            .get(&(channel.to_string(), component.to_string()))
            .copied())
    }

    fn max_index(&self, channel: &str) -> Result<Option<u8>, StoreError> {
        let subscriptions = self
            .subscriptions
            .read()
            .map_err(|_| StoreError::LockPoisoned("max_index"))?;
        Ok(subscriptions
            .iter()
            .filter(|((ch, _), _)| ch == channel)
            .map(|(_, index)| *index)
            .max())
    }

    fn insert_index(&self, channel: &str, component: &str, index: u8) -> Result<(), StoreError> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .map_err(|_| StoreError::LockPoisoned("insert_index"))?;
        let key = (channel.to_string(), component.to_string());
        if subscriptions.contains_key(&key) {
            return Err(StoreError::Conflict);
        }
        let index_taken = subscriptions
            .iter()
            .any(|((ch, _), existing)| ch == channel && *existing == index);
        if index_taken {
            return Err(StoreError::Conflict);
        }
        subscriptions.insert(key, index);
        Ok(())
    }

    fn remove_index(&self, channel: &str, component: &str) -> Result<(), StoreError> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .map_err(|_| StoreError::LockPoisoned("remove_index"))?;
        subscriptions.remove(&(channel.to_string(), component.to_string()));
        Ok(())
    }
}
