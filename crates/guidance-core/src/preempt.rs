//! Runs a worker while a monitor watches a telemetry condition, preempting
//! the worker as soon as the condition holds.
//!
//! # Preemption semantics
//!
//! Threads cannot be killed safely at an arbitrary instruction, so preemption
//! here means: the worker's [`CancelToken`] is cancelled, and every blocking
//! call the worker makes through the core (subscription waits, sleeps, burns)
//! observes it within one poll interval and unwinds with
//! [`Cancelled`](crate::error::Cancelled). A worker that blocks outside those
//! calls is only preempted once it reaches the next checkpoint. The task's
//! outcome is decided at the moment of abort regardless, so a result the
//! worker produces afterwards is discarded.

use crate::cancel::CancelToken;
use crate::error::CoreError;
use crate::telemetry::{Subscription, TelemetrySource, DEFAULT_POLL_INTERVAL};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const ABORTED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Aborted,
}

impl TaskState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => TaskState::Idle,
            RUNNING => TaskState::Running,
            COMPLETED => TaskState::Completed,
            _ => TaskState::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<R> {
    Completed(R),
    Aborted,
}

impl<R> TaskOutcome<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            TaskOutcome::Aborted => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskOutcome::Aborted)
    }
}

type AbortPredicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type AbortHook = Box<dyn Fn() + Send + Sync>;

pub struct PreemptibleTask<T> {
    source: Arc<dyn TelemetrySource<T>>,
    predicate: AbortPredicate<T>,
    poll_interval: Duration,
    on_abort: Option<AbortHook>,
    state: AtomicU8,
    worker_cancel: CancelToken,
    monitor_error: Mutex<Option<CoreError>>,
}

impl<T: Send + 'static> PreemptibleTask<T> {
    /// Task that aborts its worker once `predicate` holds for a value of
    /// `source`.
    pub fn new<P>(source: Arc<dyn TelemetrySource<T>>, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            source,
            predicate: Box::new(predicate),
            poll_interval: DEFAULT_POLL_INTERVAL,
            on_abort: None,
            state: AtomicU8::new(IDLE),
            worker_cancel: CancelToken::new(),
            monitor_error: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn on_abort<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_abort = Some(Box::new(hook));
        self
    }

    /// Worker token becomes a child of `parent`: cancelling `parent` reaches
    /// the worker without marking the task aborted.
    pub fn linked_to(mut self, parent: &CancelToken) -> Self {
        self.worker_cancel = parent.child();
        self
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn was_aborted(&self) -> bool {
        self.state() == TaskState::Aborted
    }

    /// Runs `worker` on the calling thread under supervision of the monitor.
    ///
    /// Returns once both activities have stopped; the monitor's subscription
    /// is released by then. Errors from the worker are returned when the
    /// worker finished first. A monitor telemetry failure aborts the worker
    /// and is returned as the error. If the monitor cannot be spawned the
    /// worker is not run and the task stays startable.
    pub fn start<R, F>(&self, worker: F) -> Result<TaskOutcome<R>, CoreError>
    where
        F: FnOnce(&CancelToken) -> Result<R, CoreError>,
    {
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(ABORTED) => {
                info!("task aborted before start, worker not run");
                return Ok(TaskOutcome::Aborted);
            }
            Err(_) => return Err(CoreError::AlreadyStarted),
        }

        let monitor_cancel = CancelToken::new();
        let worker_result = thread::scope(|scope| {
            let monitor = thread::Builder::new()
                .name("preempt-monitor".into())
                .spawn_scoped(scope, || self.monitor(&monitor_cancel));
            if let Err(e) = monitor {
                return Err(self.monitor_spawn_failed(e));
            }
            // Stops the monitor even if the worker panics.
            let _stop_monitor = CancelOnDrop(&monitor_cancel);
            let result = worker(&self.worker_cancel);
            if self
                .state
                .compare_exchange(RUNNING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!("worker finished before monitor");
            }
            result
        });

        if self.was_aborted() {
            if let Err(e) = &worker_result {
                if !e.is_cancelled() {
                    debug!(error = %e, "worker error after abort discarded");
                }
            }
            let monitor_error = self
                .monitor_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            return match monitor_error {
                Some(e) => Err(e),
                None => Ok(TaskOutcome::Aborted),
            };
        }
        worker_result.map(TaskOutcome::Completed)
    }

    /// The worker never ran, so the task goes back to idle and may be
    /// started again. An abort that raced in stays latched.
    fn monitor_spawn_failed(&self, error: std::io::Error) -> CoreError {
        let _ = self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire);
        warn!(error = %error, "failed to spawn monitor thread");
        CoreError::Spawn(error.to_string())
    }

    /// Preempts the worker. No effect once the task has completed.
    pub fn abort(&self) {
        let previous = self
            .state
            .compare_exchange(RUNNING, ABORTED, Ordering::AcqRel, Ordering::Acquire)
            .or_else(|_| {
                self.state
                    .compare_exchange(IDLE, ABORTED, Ordering::AcqRel, Ordering::Acquire)
            });
        if previous.is_err() {
            return;
        }
        warn!("preempting worker");
        self.worker_cancel.cancel();
        if let Some(hook) = &self.on_abort {
            hook();
        }
    }

    fn monitor(&self, stop: &CancelToken) {
        let watched = Subscription::open(self.source.as_ref())
            .map_err(CoreError::from)
            .and_then(|mut sub| {
                sub.block_until_predicate(|v| (self.predicate)(v), stop, self.poll_interval)
            });
        match watched {
            Ok(_) => {
                info!("abort condition met");
                self.abort();
            }
            Err(e) if e.is_cancelled() => debug!("monitor stopped"),
            Err(e) => {
                warn!(error = %e, "monitor lost telemetry, preempting worker");
                *self
                    .monitor_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(e);
                self.abort();
            }
        }
    }
}

struct CancelOnDrop<'a>(&'a CancelToken);

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::hal_sim::SimChannel;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn task_over(channel: &SimChannel<f64>, threshold: f64) -> PreemptibleTask<f64> {
        let source: Arc<dyn TelemetrySource<f64>> = Arc::new(channel.clone());
        PreemptibleTask::new(source, move |v: &f64| *v >= threshold)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn worker_result_returned_when_condition_never_holds() {
        let channel = SimChannel::new(0.0);
        let task = task_over(&channel, 100.0);

        let outcome = task.start(|_| Ok(42)).unwrap();
        assert_eq!(outcome, TaskOutcome::Completed(42));
        assert!(!task.was_aborted());
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(channel.open_subscriptions(), 0);
    }

    #[test]
    fn condition_preempts_blocked_worker() {
        let channel = SimChannel::new(0.0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let task = task_over(&channel, 1.0).on_abort(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let writer = channel.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.set(5.0);
        });

        let start = Instant::now();
        let outcome = task
            .start(|cancel| {
                cancel.sleep(Duration::from_secs(30))?;
                Ok("finished")
            })
            .unwrap();

        assert_eq!(outcome, TaskOutcome::Aborted);
        assert!(task.was_aborted());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(channel.open_subscriptions(), 0);
        assert!(start.elapsed() < Duration::from_secs(5));
        trigger.join().unwrap();
    }

    #[test]
    fn result_after_abort_is_discarded() {
        let channel = SimChannel::new(10.0);
        let task = task_over(&channel, 1.0);

        // Ignores its token entirely; the monitor still wins.
        let outcome = task
            .start(|_| {
                thread::sleep(Duration::from_millis(100));
                Ok(7)
            })
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Aborted);
    }

    #[test]
    fn completed_task_ignores_late_abort() {
        let channel = SimChannel::new(0.0);
        let task = task_over(&channel, 1.0);
        assert_eq!(task.start(|_| Ok(())).unwrap(), TaskOutcome::Completed(()));
        task.abort();
        channel.set(5.0);
        assert!(!task.was_aborted());
    }

    #[test]
    fn abort_before_start_skips_worker() {
        let channel = SimChannel::new(0.0);
        let task = task_over(&channel, 1.0);
        task.abort();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let outcome = task
            .start(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(outcome.is_aborted());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn monitor_spawn_failure_leaves_task_startable() {
        let channel = SimChannel::new(0.0);
        let task = task_over(&channel, 1.0);
        task.state.store(RUNNING, Ordering::Release);

        let err = task.monitor_spawn_failed(std::io::Error::other("no threads left"));
        assert!(matches!(err, CoreError::Spawn(_)));
        assert_eq!(task.state(), TaskState::Idle);
        assert_eq!(task.start(|_| Ok(1)).unwrap(), TaskOutcome::Completed(1));
    }

    #[test]
    fn abort_racing_a_spawn_failure_stays_latched() {
        let channel = SimChannel::new(0.0);
        let task = task_over(&channel, 1.0);
        task.state.store(RUNNING, Ordering::Release);
        task.abort();

        task.monitor_spawn_failed(std::io::Error::other("no threads left"));
        assert!(task.was_aborted());
    }

    #[test]
    fn second_start_is_rejected() {
        let channel = SimChannel::new(0.0);
        let task = task_over(&channel, 1.0);
        task.start(|_| Ok(())).unwrap();
        assert!(matches!(task.start(|_| Ok(())), Err(CoreError::AlreadyStarted)));
    }

    #[test]
    fn worker_error_propagates_when_not_aborted() {
        let channel = SimChannel::new(0.0);
        let task = task_over(&channel, 1.0);
        let res: Result<TaskOutcome<()>, _> = task.start(|_| Err(CoreError::ActuatorBusy));
        assert!(matches!(res, Err(CoreError::ActuatorBusy)));
        assert!(!task.was_aborted());
    }

    #[test]
    fn monitor_link_loss_preempts_and_reports() {
        let channel = SimChannel::new(0.0);
        let task = task_over(&channel, 1.0);
        let breaker = channel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            breaker.set_link_lost(true);
        });

        let res = task.start(|cancel| {
            cancel.sleep(Duration::from_secs(30))?;
            Ok(())
        });
        assert!(matches!(res, Err(CoreError::Telemetry(_))));
        assert!(task.was_aborted());
        handle.join().unwrap();
    }

    #[test]
    fn parent_cancel_reaches_worker_without_abort() {
        let channel = SimChannel::new(0.0);
        let parent = CancelToken::new();
        let task = task_over(&channel, 1.0).linked_to(&parent);
        let remote = parent.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let res: Result<TaskOutcome<()>, _> = task.start(|cancel| {
            cancel.sleep(Duration::from_secs(30))?;
            Ok(())
        });
        assert!(matches!(res, Err(CoreError::Cancelled(_))));
        assert!(!task.was_aborted());
        handle.join().unwrap();
    }
}
