//! Explicit transaction context.
//!
//! The original service published events as a side effect of data-mutating
//! database transactions. This crate models that context as an explicit
//! value: callers begin a [`Transaction`], hand it to
//! [`MessageBus::publish`](crate::MessageBus::publish), and the bus defers
//! delivery to an after-commit hook. Rolling back drops the hooks, so an
//! event is visible to subscribers if and only if the transaction that
//! published it commits.

use std::fmt;
use std::sync::Mutex;

/// Observable state of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    /// Begun and neither committed nor rolled back.
    Active,
    /// Still open, but guaranteed to roll back.
    RollbackOnly,
    /// Committed; after-commit hooks have run.
    Committed,
    /// Rolled back; after-commit hooks were dropped.
    RolledBack,
    /// The state could not be determined (internal lock poisoned by a
    /// panicking hook registrar). Treated as an anomaly, never an error.
    Unknown,
}

/// Error type for hook registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// The transaction has already completed.
    NotActive(TxStatus),
    /// Internal lock poisoned.
    Poisoned,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::NotActive(status) => {
                write!(f, "transaction is not active (status {:?})", status)
            }
            TxError::Poisoned => write!(f, "transaction state lock poisoned"),
        }
    }
}

impl std::error::Error for TxError {}

type Hook = Box<dyn FnOnce() + Send>;

struct TxInner {
    status: TxStatus,
    after_commit: Vec<Hook>,
    after_rollback: Vec<Hook>,
}

/// A unit of work with deferred hooks.
///
/// `after_commit` hooks run, in registration order, only when [`commit`]
/// actually commits. `after_rollback` hooks run when the transaction rolls
/// back, whether via [`rollback`] or via [`commit`] on a transaction marked
/// rollback-only; they exist so work staged during the transaction (like a
/// durable message row) can be undone.
///
/// [`commit`]: Transaction::commit
/// [`rollback`]: Transaction::rollback
pub struct Transaction {
    inner: Mutex<TxInner>,
}

impl Transaction {
    /// Begin a new transaction.
    pub fn begin() -> Self {
        Transaction {
            inner: Mutex::new(TxInner {
                status: TxStatus::Active,
                after_commit: Vec::new(),
                after_rollback: Vec::new(),
            }),
        }
    }

    /// Current status. Returns [`TxStatus::Unknown`] when the state cannot
    /// be determined.
    pub fn status(&self) -> TxStatus {
        match self.inner.lock() {
            Ok(inner) => inner.status,
            Err(_) => TxStatus::Unknown,
        }
    }

    /// Mark this transaction so that it can only roll back.
    pub fn mark_rollback_only(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.status == TxStatus::Active {
                inner.status = TxStatus::RollbackOnly;
            }
        }
    }

    /// Register a hook to run after a successful commit.
    pub fn after_commit<F: FnOnce() + Send + 'static>(&self, hook: F) -> Result<(), TxError> {
        let mut inner = self.inner.lock().map_err(|_| TxError::Poisoned)?;
        match inner.status {
            TxStatus::Active | TxStatus::RollbackOnly => {
                inner.after_commit.push(Box::new(hook));
                Ok(())
            }
            status => Err(TxError::NotActive(status)),
        }
    }

    /// Register a hook to run when the transaction rolls back.
    pub fn after_rollback<F: FnOnce() + Send + 'static>(&self, hook: F) -> Result<(), TxError> {
        let mut inner = self.inner.lock().map_err(|_| TxError::Poisoned)?;
        match inner.status {
            TxStatus::Active | TxStatus::RollbackOnly => {
                inner.after_rollback.push(Box::new(hook));
                Ok(())
            }
            status => Err(TxError::NotActive(status)),
        }
    }

    /// Commit the transaction and run the after-commit hooks.
    ///
    /// A transaction marked rollback-only rolls back instead. Completing
    /// an already-completed transaction is a no-op. Returns the final
    /// status.
    pub fn commit(&self) -> TxStatus {
        let (status, hooks) = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return TxStatus::Unknown,
            };
            match inner.status {
                TxStatus::Active => {
                    inner.status = TxStatus::Committed;
                    inner.after_rollback.clear();
                    (TxStatus::Committed, std::mem::take(&mut inner.after_commit))
                }
                TxStatus::RollbackOnly => {
                    inner.status = TxStatus::RolledBack;
                    inner.after_commit.clear();
                    (TxStatus::RolledBack, std::mem::take(&mut inner.after_rollback))
                }
                status => (status, Vec::new()),
            }
        };
        // Hooks run outside the state lock; they may inspect the status.
        for hook in hooks {
            hook();
        }
        status
    }

    /// Poison the state lock so the status reads as [`TxStatus::Unknown`].
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.inner.lock();
            panic!("poisoned");
        }));
    }

    /// Roll back the transaction, dropping the after-commit hooks and
    /// running the after-rollback hooks.
    pub fn rollback(&self) -> TxStatus {
        let (status, hooks) = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return TxStatus::Unknown,
            };
            match inner.status {
                TxStatus::Active | TxStatus::RollbackOnly => {
                    inner.status = TxStatus::RolledBack;
                    inner.after_commit.clear();
                    (TxStatus::RolledBack, std::mem::take(&mut inner.after_rollback))
                }
                status => (status, Vec::new()),
            }
        };
        for hook in hooks {
            hook();
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn commit_runs_hooks_in_order() {
        let tx = Transaction::begin();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        tx.after_commit(move || o1.lock().unwrap().push(1)).unwrap();
        let o2 = order.clone();
        tx.after_commit(move || o2.lock().unwrap().push(2)).unwrap();

        assert_eq!(tx.commit(), TxStatus::Committed);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn rollback_drops_commit_hooks() {
        let tx = Transaction::begin();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        tx.after_commit(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(tx.rollback(), TxStatus::RolledBack);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rollback_only_commit_rolls_back() {
        let tx = Transaction::begin();
        let committed = Arc::new(AtomicUsize::new(0));
        let rolled_back = Arc::new(AtomicUsize::new(0));

        let c = committed.clone();
        tx.after_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let r = rolled_back.clone();
        tx.after_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tx.mark_rollback_only();
        assert_eq!(tx.status(), TxStatus::RollbackOnly);
        assert_eq!(tx.commit(), TxStatus::RolledBack);
        assert_eq!(committed.load(Ordering::SeqCst), 0);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn begin_is_active() {
        let tx = Transaction::begin();
        assert_eq!(tx.status(), TxStatus::Active);
    }

    #[test]
    fn poisoned_state_reads_as_unknown() {
        let tx = Transaction::begin();
        tx.poison();
        assert_eq!(tx.status(), TxStatus::Unknown);
        // Completion is a no-op rather than a panic.
        assert_eq!(tx.commit(), TxStatus::Unknown);
    }
}
