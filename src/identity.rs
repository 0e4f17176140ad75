//! Scoped identity propagation for handler execution.
//!
//! Message handlers run on worker threads, outside any end-user request
//! context, so the bus enters a system identity around each handler call.
//! The scope is an RAII guard: the previous identity is restored on drop,
//! which runs on every exit path including panics.

use std::cell::RefCell;

thread_local! {
    static CURRENT: RefCell<Option<Identity>> = const { RefCell::new(None) };
}

/// The identity ambient to the current thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    /// Internal bus machinery acting on its own behalf.
    System,
    /// A named principal (e.g. a service account).
    Principal(String),
}

impl Identity {
    /// The identity currently in scope on this thread, if any.
    pub fn current() -> Option<Identity> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// Enter this identity for the current scope.
    ///
    /// The returned guard restores whatever was in scope before, so nested
    /// scopes compose and nothing leaks across worker-pool jobs.
    pub fn enter(self) -> IdentityGuard {
        let previous = CURRENT.with(|cell| cell.borrow_mut().replace(self));
        IdentityGuard { previous }
    }
}

/// Guard returned by [`Identity::enter`]; restores the previous identity
/// when dropped.
pub struct IdentityGuard {
    previous: Option<Identity>,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| *cell.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_identity_by_default() {
        assert_eq!(Identity::current(), None);
    }

    #[test]
    fn enter_and_restore() {
        {
            let _guard = Identity::System.enter();
            assert_eq!(Identity::current(), Some(Identity::System));
        }
        assert_eq!(Identity::current(), None);
    }

    #[test]
    fn nested_scopes_restore_outer() {
        let _outer = Identity::Principal("svc".to_string()).enter();
        {
            let _inner = Identity::System.enter();
            assert_eq!(Identity::current(), Some(Identity::System));
        }
        assert_eq!(
            Identity::current(),
            Some(Identity::Principal("svc".to_string()))
        );
    }

    #[test]
    fn cleared_after_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = Identity::System.enter();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(Identity::current(), None);
    }
}
