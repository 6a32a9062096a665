//! Shared cancellation signal.
//!
//! Every suspension point in the core (subscription waits, fixed sleeps, the
//! PID loop's variable sleep) goes through a [`CancelToken`], so a cancel
//! request wakes any of them immediately instead of at the next loop boundary.

use crate::error::Cancelled;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    children: Vec<Weak<TokenInner>>,
}

#[derive(Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    wake: Condvar,
}

impl TokenInner {
    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.children)
        };
        self.wake.notify_all();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled whenever `self` is, but can also be cancelled
    /// on its own without affecting `self`.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let mut state = self.inner.lock();
        if state.cancelled {
            drop(state);
            child.cancel();
        } else {
            state.children.retain(|w| w.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `Err(Cancelled)` as soon as the token is cancelled, including
    /// when it already was on entry.
    /// A duration too large to represent as a deadline sleeps until cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let mut state = self.inner.lock();
        if state.cancelled {
            return Err(Cancelled);
        }
        let Some(deadline) = Instant::now().checked_add(duration) else {
            while !state.cancelled {
                state = self
                    .inner
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            return Err(Cancelled);
        };
        loop {
            if state.cancelled {
                return Err(Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .inner
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
