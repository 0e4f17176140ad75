//! Subscription registry: persisted index allocation plus the live
//! per-process subscriber table.
//!
//! Every `(channel, component)` pair gets a small integer index, assigned
//! once and stable across process restarts. The index doubles as a bit
//! position in a message row's pending mask, so allocation is bounded by
//! the mask width and rejected beyond it instead of silently aliasing an
//! existing subscriber's bit.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::thread;

use tracing::trace;

use crate::store::{StoreError, SubscriptionStore};

/// Upper bound on subscriber indices per channel, fixed by the pending
/// mask's width.
pub const MAX_SUBSCRIBERS: u8 = 32;

/// Error type for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The channel already carries [`MAX_SUBSCRIBERS`] indices (or a
    /// persisted row holds an out-of-range index).
    ChannelFull { channel: String, index: u8 },
    /// A second payload type was registered for an already-typed channel.
    TypeMismatch {
        channel: String,
        registered: &'static str,
        offered: &'static str,
    },
    /// The subscription store failed.
    Store(StoreError),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::ChannelFull { channel, index } => write!(
                f,
                "channel {} cannot hold subscriber index {} (mask width is {})",
                channel, index, MAX_SUBSCRIBERS
            ),
            RegisterError::TypeMismatch {
                channel,
                registered,
                offered,
            } => write!(
                f,
                "channel {} already expects payload type {}, not {}",
                channel, registered, offered
            ),
            RegisterError::Store(err) => write!(f, "subscription store error: {}", err),
        }
    }
}

impl std::error::Error for RegisterError {}

impl From<StoreError> for RegisterError {
    fn from(err: StoreError) -> Self {
        RegisterError::Store(err)
    }
}

/// Per-channel live state: which local subscriber bits are wired up, and
/// which payload type the channel carries.
struct ChannelState {
    live_mask: u32,
    codec: Option<Codec>,
}

#[derive(Clone, Copy)]
struct Codec {
    type_id: TypeId,
    type_name: &'static str,
}

/// Registry of persisted subscription indices and live local subscribers.
pub struct SubscriptionRegistry {
    store: Arc<dyn SubscriptionStore>,
    channels: RwLock<HashMap<String, ChannelState>>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        SubscriptionRegistry {
            store,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register `(channel, component)` and return its stable index.
    ///
    /// Reads the persisted index if one exists; otherwise allocates
    /// `max(existing) + 1` guarded by the store's uniqueness constraints.
    /// Losing the insert race to a concurrent registrar is not an error —
    /// the read-then-insert cycle just retries. Registration happens once
    /// at startup, so unbounded retries under pathological contention are
    /// acceptable.
    pub fn register(&self, channel: &str, component: &str) -> Result<u8, RegisterError> {
        loop {
            if let Some(index) = self.store.index_of(channel, component)? {
                self.check_bound(channel, index)?;
                self.set_live_bit(channel, index);
                return Ok(index);
            }

            let next = self
                .store
                .max_index(channel)?
                .map_or(0, |max| max.saturating_add(1));
            self.check_bound(channel, next)?;

            match self.store.insert_index(channel, component, next) {
                Ok(()) => {
                    self.set_live_bit(channel, next);
                    return Ok(next);
                }
                Err(StoreError::Conflict) => {
                    trace!(channel, component, "lost index allocation race; retrying");
                    thread::yield_now();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Remove the persisted row and clear the live bit. Test/shutdown path
    /// only; already-published rows keep their pending bits.
    pub fn unregister(&self, channel: &str, component: &str) -> Result<(), RegisterError> {
        if let Some(index) = self.store.index_of(channel, component)? {
            // Same guard register applies to store-read indices: a corrupt
            // row must not overflow the mask shift.
            self.check_bound(channel, index)?;
            self.store.remove_index(channel, component)?;
            if let Ok(mut channels) = self.channels.write() {
                if let Some(state) = channels.get_mut(channel) {
                    state.live_mask &= !(1u32 << index);
                }
            }
        }
        Ok(())
    }

    /// Record the payload type a channel carries. All subscribers to one
    /// channel must agree on it.
    pub fn register_codec<T: 'static>(&self, channel: &str) -> Result<(), RegisterError> {
        let offered = Codec {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        };
        let mut channels = self
            .channels
            .write()
            .map_err(|_| StoreError::LockPoisoned("register_codec"))?;
        let state = channels.entry(channel.to_string()).or_insert(ChannelState {
            live_mask: 0,
            codec: None,
        });
        match state.codec {
            None => {
                state.codec = Some(offered);
                Ok(())
            }
            Some(existing) if existing.type_id == offered.type_id => Ok(()),
            Some(existing) => Err(RegisterError::TypeMismatch {
                channel: channel.to_string(),
                registered: existing.type_name,
                offered: offered.type_name,
            }),
        }
    }

    /// Whether a payload codec has been registered for `channel`.
    ///
    /// The retry scan fails closed on channels nobody in this process can
    /// decode yet.
    pub fn has_codec(&self, channel: &str) -> bool {
        self.channels
            .read()
            .map(|channels| {
                channels
                    .get(channel)
                    .map(|state| state.codec.is_some())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// OR of the bits of all currently-registered local subscribers.
    ///
    /// This is what a fresh publish stamps into a new row's pending mask;
    /// it is not necessarily the full persisted subscription set.
    pub fn live_mask(&self, channel: &str) -> u32 {
        self.channels
            .read()
            .map(|channels| {
                channels
                    .get(channel)
                    .map(|state| state.live_mask)
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn set_live_bit(&self, channel: &str, index: u8) {
        if let Ok(mut channels) = self.channels.write() {
            let state = channels.entry(channel.to_string()).or_insert(ChannelState {
                live_mask: 0,
                codec: None,
            });
            state.live_mask |= 1u32 << index;
        }
    }

    fn check_bound(&self, channel: &str, index: u8) -> Result<(), RegisterError> {
        if index >= MAX_SUBSCRIBERS {
            return Err(RegisterError::ChannelFull {
                channel: channel.to_string(),
                index,
            });
        }
        Ok(())
    }
}
