//! Contract for the remote telemetry service and the owned subscription
//! wrapper the rest of the core works with.

use crate::cancel::CancelToken;
use crate::error::{CoreError, TelemetryError};
use std::time::Duration;

/// Poll interval used while blocked on a subscription so cancellation is
/// observed with bounded latency.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One remote value channel. Implemented by the external client.
pub trait TelemetrySource<T>: Send + Sync {
    fn subscribe(&self) -> Result<Box<dyn TelemetryStream<T>>, TelemetryError>;
}

/// Raw subscription handle handed out by a [`TelemetrySource`].
pub trait TelemetryStream<T>: Send {
    /// Latest known value. Never blocks.
    fn get(&mut self) -> Result<T, TelemetryError>;

    /// Blocks until the remote value is updated or `timeout` elapses.
    /// Returns `true` when an update was observed.
    fn block_until_changed(&mut self, timeout: Duration) -> Result<bool, TelemetryError>;

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), TelemetryError>;

    /// Releases the remote subscription. Must tolerate repeated calls.
    fn release(&mut self);
}

/// Exclusively owned subscription. Released on drop, so it cannot leak on
/// early returns, errors, or preemption of the owning worker.
pub struct Subscription<T> {
    stream: Option<Box<dyn TelemetryStream<T>>>,
}

impl<T> Subscription<T> {
    pub fn open(source: &dyn TelemetrySource<T>) -> Result<Self, TelemetryError> {
        Ok(Self {
            stream: Some(source.subscribe()?),
        })
    }

    fn stream(&mut self) -> Result<&mut Box<dyn TelemetryStream<T>>, TelemetryError> {
        self.stream.as_mut().ok_or(TelemetryError::Released)
    }

    pub fn get(&mut self) -> Result<T, TelemetryError> {
        self.stream()?.get()
    }

    pub fn block_until_changed(&mut self, timeout: Duration) -> Result<bool, TelemetryError> {
        self.stream()?.block_until_changed(timeout)
    }

    pub fn set_sample_rate(&mut self, hz: u32) -> Result<(), TelemetryError> {
        self.stream()?.set_sample_rate(hz)
    }

    /// Waits until `predicate` holds for the current value and returns that
    /// value. The underlying blocking wait is sliced into `poll` intervals and
    /// `cancel` is checked between slices.
    pub fn block_until_predicate<P>(
        &mut self,
        mut predicate: P,
        cancel: &CancelToken,
        poll: Duration,
    ) -> Result<T, CoreError>
    where
        P: FnMut(&T) -> bool,
    {
        loop {
            let value = self.get()?;
            if predicate(&value) {
                return Ok(value);
            }
            cancel.check()?;
            self.block_until_changed(poll)?;
            cancel.check()?;
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.release();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// How a sample is compared against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    AtOrAbove,
    AtOrBelow,
}

impl Comparator {
    pub fn reached(self, value: f64, target: f64) -> bool {
        match self {
            Comparator::AtOrAbove => value >= target,
            Comparator::AtOrBelow => value <= target,
        }
    }
}
