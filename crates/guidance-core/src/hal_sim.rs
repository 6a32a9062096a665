//! In-memory telemetry, actuator and plant doubles.

use crate::cancel::CancelToken;
use crate::error::TelemetryError;
use crate::hal::Actuator;
use crate::telemetry::{TelemetrySource, TelemetryStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

struct ChannelState<T> {
    value: T,
    version: u64,
    open_subscriptions: usize,
    sample_rate_hz: Option<u32>,
    link_lost: bool,
}

struct ChannelInner<T> {
    state: Mutex<ChannelState<T>>,
    changed: Condvar,
}

/// A telemetry value fed locally. Clones share the same value.
pub struct SimChannel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for SimChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> SimChannel<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState {
                    value: initial,
                    version: 0,
                    open_subscriptions: 0,
                    sample_rate_hz: None,
                    link_lost: false,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, value: T) {
        let mut state = self.lock();
        state.value = value;
        state.version += 1;
        drop(state);
        self.inner.changed.notify_all();
    }

    pub fn value(&self) -> T {
        self.lock().value.clone()
    }

    pub fn open_subscriptions(&self) -> usize {
        self.lock().open_subscriptions
    }

    /// Sample rate most recently requested by a subscriber.
    pub fn sample_rate_hz(&self) -> Option<u32> {
        self.lock().sample_rate_hz
    }

    /// Makes every subsequent read fail, simulating a dropped connection.
    pub fn set_link_lost(&self, lost: bool) {
        self.lock().link_lost = lost;
        self.inner.changed.notify_all();
    }
}

impl<T: Clone + Send + 'static> TelemetrySource<T> for SimChannel<T> {
    fn subscribe(&self) -> Result<Box<dyn TelemetryStream<T>>, TelemetryError> {
        let mut state = self.lock();
        if state.link_lost {
            return Err(TelemetryError::LinkLost("simulated link down".into()));
        }
        state.open_subscriptions += 1;
        let seen_version = state.version;
        drop(state);
        Ok(Box::new(SimStream {
            channel: self.clone(),
            seen_version,
            released: false,
        }))
    }
}

struct SimStream<T> {
    channel: SimChannel<T>,
    seen_version: u64,
    released: bool,
}

impl<T: Clone + Send + 'static> TelemetryStream<T> for SimStream<T> {
    fn get(&mut self) -> Result<T, TelemetryError> {
        if self.released {
            return Err(TelemetryError::Released);
        }
        let state = self.channel.lock();
        if state.link_lost {
            return Err(TelemetryError::LinkLost("simulated link down".into()));
        }
        self.seen_version = state.version;
        Ok(state.value.clone())
    }

    fn block_until_changed(&mut self, timeout: Duration) -> Result<bool, TelemetryError> {
        if self.released {
            return Err(TelemetryError::Released);
        }
        let seen = self.seen_version;
        let (state, result) = self
            .channel
            .inner
            .changed
            .wait_timeout_while(self.channel.lock(), timeout, |s| {
                s.version == seen && !s.link_lost
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.link_lost {
            return Err(TelemetryError::LinkLost("simulated link down".into()));
        }
        Ok(!result.timed_out())
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), TelemetryError> {
        if self.released {
            return Err(TelemetryError::Released);
        }
        self.channel.lock().sample_rate_hz = Some(hz);
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.channel.lock();
        state.open_subscriptions = state.open_subscriptions.saturating_sub(1);
    }
}

impl<T> Drop for SimStream<T> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let mut state = self
                .channel
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.open_subscriptions = state.open_subscriptions.saturating_sub(1);
        }
    }
}

#[derive(Default)]
struct ActuatorLog {
    writes: Vec<f64>,
    current: f64,
    reject_writes: bool,
}

/// Records every write. Clones share the same log.
#[derive(Clone, Default)]
pub struct SimActuator {
    log: Arc<Mutex<ActuatorLog>>,
}

impl SimActuator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ActuatorLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn writes(&self) -> Vec<f64> {
        self.lock().writes.clone()
    }

    pub fn current(&self) -> f64 {
        self.lock().current
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.lock().reject_writes = reject;
    }
}

impl Actuator for SimActuator {
    fn write(&mut self, value: f64) -> Result<(), TelemetryError> {
        let mut log = self.lock();
        if log.reject_writes {
            return Err(TelemetryError::WriteRejected("simulated actuator fault".into()));
        }
        log.writes.push(value);
        log.current = value;
        Ok(())
    }
}

/// Plant whose controlled value falls at
/// `descent_rate + throttle_gain * throttle` units per second.
#[derive(Debug, Clone, Copy)]
pub struct PlantParams {
    pub initial: f64,
    pub descent_rate: f64,
    pub throttle_gain: f64,
    pub floor: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            initial: 2000.0,
            descent_rate: 200.0,
            throttle_gain: 1500.0,
            floor: 0.0,
        }
    }
}

pub struct SimulatedPlant {
    params: PlantParams,
    value: f64,
    channel: SimChannel<f64>,
    actuator: SimActuator,
}

impl SimulatedPlant {
    pub fn new(params: PlantParams) -> Self {
        Self {
            params,
            value: params.initial,
            channel: SimChannel::new(params.initial),
            actuator: SimActuator::new(),
        }
    }

    pub fn channel(&self) -> SimChannel<f64> {
        self.channel.clone()
    }

    pub fn actuator(&self) -> SimActuator {
        self.actuator.clone()
    }

    pub fn step(&mut self, dt_s: f64) {
        let throttle = self.actuator.current();
        let rate = self.params.descent_rate + self.params.throttle_gain * throttle;
        self.value = (self.value - rate * dt_s).max(self.params.floor);
        self.channel.set(self.value);
    }

    /// Steps the plant every `period` until `stop` is cancelled.
    pub fn spawn(mut self, period: Duration, stop: CancelToken) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut last = Instant::now();
            while stop.sleep(period).is_ok() {
                let now = Instant::now();
                self.step(now.duration_since(last).as_secs_f64());
                last = now;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plant_falls_faster_under_throttle() {
        let mut idle = SimulatedPlant::new(PlantParams::default());
        idle.step(0.1);

        let mut burning = SimulatedPlant::new(PlantParams::default());
        burning.actuator().write(1.0).unwrap();
        burning.step(0.1);

        assert!(burning.channel().value() < idle.channel().value());
        assert!((idle.channel().value() - 1980.0).abs() < 1e-9);
    }

    #[test]
    fn plant_stops_at_floor() {
        let mut plant = SimulatedPlant::new(PlantParams {
            initial: 10.0,
            floor: 5.0,
            ..Default::default()
        });
        plant.step(10.0);
        assert_eq!(plant.channel().value(), 5.0);
    }

    #[test]
    fn lost_link_fails_reads() {
        let channel = SimChannel::new(3.0);
        let mut stream = channel.subscribe().unwrap();
        channel.set_link_lost(true);
        assert!(matches!(stream.get(), Err(TelemetryError::LinkLost(_))));
        assert!(channel.subscribe().is_err());
    }
}
