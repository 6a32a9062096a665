//! Collapses bursts of trigger requests into one delayed action.
//!
//! The countdown runs on a timer thread owned by the [`Debouncer`]. The thread
//! is spawned by the first `debounce` call and stopped by `dispose` or drop.

use crate::error::{CoreError, RangeError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error};

type Action = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct DebounceState {
    pending: Option<Action>,
    remaining: Duration,
    tick: Duration,
    disposed: bool,
    fired: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<DebounceState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct Debouncer {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `action` to run once `delay` has passed without another call.
    /// Replaces any action still pending.
    pub fn debounce<F>(&self, action: F, delay: Duration, tick: Duration) -> Result<(), CoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        if tick.is_zero() {
            return Err(RangeError::ZeroDuration { name: "debounce tick" }.into());
        }

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.shared.lock();
            if state.disposed {
                return Err(CoreError::Disposed);
            }
            if state.pending.is_some() {
                debug!("replacing pending debounced action");
            }
            state.pending = Some(Box::new(action));
            state.remaining = delay;
            state.tick = tick;
        }
        self.shared.wake.notify_all();

        if timer.is_none() {
            let shared = Arc::clone(&self.shared);
            *timer = Some(
                thread::Builder::new()
                    .name("debounce-timer".into())
                    .spawn(move || run_timer(&shared))
                    .map_err(|e| CoreError::Spawn(e.to_string()))?,
            );
        }
        Ok(())
    }

    /// Number of actions that have fired so far.
    pub fn fired(&self) -> u64 {
        self.shared.lock().fired
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    /// Stops the timer for good and drops any pending action. Idempotent.
    pub fn dispose(&self) {
        {
            let mut state = self.shared.lock();
            state.disposed = true;
            state.pending = None;
        }
        self.shared.wake.notify_all();

        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // An action may dispose its own debouncer; the timer exits on its own then.
            if handle.thread().id() != current_thread() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn current_thread() -> ThreadId {
    thread::current().id()
}

fn run_timer(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if state.disposed {
            return;
        }
        if state.pending.is_none() {
            state = shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        let tick = state.tick;
        let (guard, timeout) = shared
            .wake
            .wait_timeout(state, tick)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
        // Woken early means a new call reset the countdown, or dispose.
        if !timeout.timed_out() || state.disposed {
            continue;
        }

        state.remaining = state.remaining.saturating_sub(tick);
        if !state.remaining.is_zero() {
            continue;
        }
        let Some(action) = state.pending.take() else {
            continue;
        };
        state.fired += 1;
        drop(state);

        if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
            error!("debounced action panicked");
        }
        state = shared.lock();
    }
}
