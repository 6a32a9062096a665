use crate::cancel::CancelToken;
use crate::error::{CoreError, RangeError};
use crate::hal::{Actuator, ActuatorLease, ActuatorSlot};
use crate::limits::{Throttle, ThrottleBounds};
use crate::pid::{PidController, PidGains};
use crate::telemetry::{Comparator, Subscription, TelemetrySource};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BurnConfig {
    pub throttle: ThrottleBounds,
    /// Sleep between proportional-taper iterations.
    pub taper_interval: Duration,
    pub gains: PidGains,
    pub integral_limit: Option<f64>,
    pub sample_period: Duration,
    /// Subscription rate requested for PID sessions.
    pub sample_rate_hz: u32,
    /// Wait after raising the sample rate so delivery is steady.
    pub settle_time: Duration,
    /// Minimum change before a new PID output is written.
    pub hysteresis: f64,
}

impl Default for BurnConfig {
    fn default() -> Self {
        Self {
            throttle: ThrottleBounds::default(),
            taper_interval: Duration::from_millis(50),
            gains: PidGains::default(),
            integral_limit: None,
            sample_period: Duration::from_millis(50),
            sample_rate_hz: 100,
            settle_time: Duration::from_millis(100),
            hysteresis: 0.05,
        }
    }
}

impl BurnConfig {
    pub fn validate(&self) -> Result<(), RangeError> {
        self.throttle.validate()?;
        self.gains.validate()?;
        if let Some(limit) = self.integral_limit {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(RangeError::IntegralLimit(limit));
            }
        }
        if self.taper_interval.is_zero() {
            return Err(RangeError::ZeroDuration {
                name: "taper interval",
            });
        }
        if self.sample_period.is_zero() {
            return Err(RangeError::ZeroDuration {
                name: "sample period",
            });
        }
        if self.sample_rate_hz == 0 {
            return Err(RangeError::ZeroSampleRate);
        }
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return Err(RangeError::Hysteresis(self.hysteresis));
        }
        Ok(())
    }

    fn controller(&self) -> Result<PidController, RangeError> {
        let pid = PidController::new(self.gains, self.throttle.min(), self.throttle.max())?;
        match self.integral_limit {
            Some(limit) => pid.with_integral_limit(limit),
            None => Ok(pid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnMode {
    Taper,
    Pid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnOutcome {
    Reached,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurnReport {
    pub mode: BurnMode,
    pub outcome: BurnOutcome,
    pub target: f64,
    pub iterations: u64,
    pub actuator_writes: u64,
    pub last_command: Option<f64>,
    pub last_sample: Option<f64>,
    pub max_overrun_us: u64,
}

impl BurnReport {
    fn new(mode: BurnMode, target: f64) -> Self {
        Self {
            mode,
            outcome: BurnOutcome::Cancelled,
            target,
            iterations: 0,
            actuator_writes: 0,
            last_command: None,
            last_sample: None,
            max_overrun_us: 0,
        }
    }
}

/// Closed-loop actuation of one telemetry value through one actuator.
///
/// Every session holds the actuator lease and its own subscription for its
/// whole lifetime; both are returned to neutral/released on all exit paths.
pub struct Burn<'a, A: Actuator> {
    source: &'a dyn TelemetrySource<f64>,
    actuator: &'a ActuatorSlot<A>,
    config: BurnConfig,
}

impl<'a, A: Actuator> Burn<'a, A> {
    pub fn new(
        source: &'a dyn TelemetrySource<f64>,
        actuator: &'a ActuatorSlot<A>,
        config: BurnConfig,
    ) -> Result<Self, RangeError> {
        config.validate()?;
        Ok(Self {
            source,
            actuator,
            config,
        })
    }

    pub fn config(&self) -> &BurnConfig {
        &self.config
    }

    /// Proportional taper: throttle follows the remaining fraction of the
    /// initial distance to `target` until `predicate` holds for a sample.
    pub fn until<P>(
        &self,
        target: f64,
        mut predicate: P,
        cancel: &CancelToken,
    ) -> Result<BurnReport, CoreError>
    where
        P: FnMut(f64) -> bool,
    {
        let mut lease = self.actuator.acquire()?;
        let mut sub = Subscription::open(self.source)?;
        let mut report = BurnReport::new(BurnMode::Taper, target);

        let initial = sub.get()?;
        let initial_delta = (target - initial).abs();
        report.last_sample = Some(initial);
        info!(target, initial, "taper burn started");

        if initial_delta == 0.0 {
            report.outcome = BurnOutcome::Reached;
        } else {
            report.outcome = self.taper_loop(
                target,
                initial_delta,
                &mut predicate,
                cancel,
                &mut sub,
                &mut lease,
                &mut report,
            )?;
        }

        sub.close();
        finish(lease, report)
    }

    #[allow(clippy::too_many_arguments)]
    fn taper_loop<P>(
        &self,
        target: f64,
        initial_delta: f64,
        predicate: &mut P,
        cancel: &CancelToken,
        sub: &mut Subscription<f64>,
        lease: &mut ActuatorLease<'_, A>,
        report: &mut BurnReport,
    ) -> Result<BurnOutcome, CoreError>
    where
        P: FnMut(f64) -> bool,
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(BurnOutcome::Cancelled);
            }
            let current = sub.get()?;
            report.last_sample = Some(current);
            if predicate(current) {
                return Ok(BurnOutcome::Reached);
            }

            let diff = (target - current).abs();
            let command = Throttle::new(diff / initial_delta).clamp_into(&self.config.throttle)?;
            lease.write(command)?;
            report.iterations += 1;
            report.actuator_writes += 1;
            report.last_command = Some(command.value());

            if cancel.sleep(self.config.taper_interval).is_err() {
                return Ok(BurnOutcome::Cancelled);
            }
        }
    }

    /// PID burn sampled at a fixed period until `predicate` holds.
    pub fn until_pid<P>(
        &self,
        target: f64,
        mut predicate: P,
        cancel: &CancelToken,
    ) -> Result<BurnReport, CoreError>
    where
        P: FnMut(f64) -> bool,
    {
        let mut lease = self.actuator.acquire()?;
        let mut sub = Subscription::open(self.source)?;
        let mut pid = self.config.controller()?;
        let mut report = BurnReport::new(BurnMode::Pid, target);

        sub.set_sample_rate(self.config.sample_rate_hz)?;
        info!(
            target,
            sample_rate_hz = self.config.sample_rate_hz,
            kp = self.config.gains.kp,
            ki = self.config.gains.ki,
            kd = self.config.gains.kd,
            "pid burn started"
        );

        report.outcome = if cancel.sleep(self.config.settle_time).is_err() {
            BurnOutcome::Cancelled
        } else {
            self.pid_loop(target, &mut predicate, cancel, &mut sub, &mut lease, &mut pid, &mut report)?
        };

        sub.close();
        finish(lease, report)
    }

    #[allow(clippy::too_many_arguments)]
    fn pid_loop<P>(
        &self,
        target: f64,
        predicate: &mut P,
        cancel: &CancelToken,
        sub: &mut Subscription<f64>,
        lease: &mut ActuatorLease<'_, A>,
        pid: &mut PidController,
        report: &mut BurnReport,
    ) -> Result<BurnOutcome, CoreError>
    where
        P: FnMut(f64) -> bool,
    {
        let period = self.config.sample_period;
        let mut last_iteration: Option<Instant> = None;
        // The actuator is assumed neutral when the session starts.
        let mut last_written = 0.0;

        loop {
            if cancel.is_cancelled() {
                return Ok(BurnOutcome::Cancelled);
            }
            let iteration_start = Instant::now();
            let current = sub.get()?;
            report.last_sample = Some(current);
            if predicate(current) {
                return Ok(BurnOutcome::Reached);
            }

            let elapsed = match last_iteration {
                Some(prev) => iteration_start.duration_since(prev),
                None => period,
            };
            last_iteration = Some(iteration_start);

            if !elapsed.is_zero() {
                let output = pid.step(target, current, elapsed);
                if (output - last_written).abs() > self.config.hysteresis {
                    let command = Throttle::new(output).clamp_into(&self.config.throttle)?;
                    lease.write(command)?;
                    last_written = command.value();
                    report.actuator_writes += 1;
                    report.last_command = Some(last_written);
                } else {
                    debug!(output, last_written, "output within hysteresis, not written");
                }
            }
            report.iterations += 1;

            let spent = iteration_start.elapsed();
            if spent > period {
                let overrun_us = (spent - period).as_micros() as u64;
                report.max_overrun_us = report.max_overrun_us.max(overrun_us);
            }
            if cancel.sleep(period.saturating_sub(spent)).is_err() {
                return Ok(BurnOutcome::Cancelled);
            }
        }
    }

    pub fn until_reached(
        &self,
        target: f64,
        comparator: Comparator,
        cancel: &CancelToken,
    ) -> Result<BurnReport, CoreError> {
        self.until(target, |v| comparator.reached(v, target), cancel)
    }

    pub fn until_pid_reached(
        &self,
        target: f64,
        comparator: Comparator,
        cancel: &CancelToken,
    ) -> Result<BurnReport, CoreError> {
        self.until_pid(target, |v| comparator.reached(v, target), cancel)
    }
}

fn finish<A: Actuator>(
    lease: ActuatorLease<'_, A>,
    mut report: BurnReport,
) -> Result<BurnReport, CoreError> {
    lease.release()?;
    report.last_command = Some(0.0);
    info!(
        outcome = ?report.outcome,
        iterations = report.iterations,
        writes = report.actuator_writes,
        "burn finished, actuator neutral"
    );
    Ok(report)
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::hal_sim::{SimActuator, SimChannel};
    use std::thread;

    fn fast_config() -> BurnConfig {
        BurnConfig {
            taper_interval: Duration::from_millis(5),
            sample_period: Duration::from_millis(5),
            settle_time: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn construction_validates_config() {
        let channel = SimChannel::new(0.0);
        let slot = ActuatorSlot::new(SimActuator::new());
        let mut config = BurnConfig::default();
        assert!(Burn::new(&channel, &slot, config.clone()).is_ok());

        config.hysteresis = -1.0;
        assert!(matches!(
            Burn::new(&channel, &slot, config.clone()),
            Err(RangeError::Hysteresis(_))
        ));

        config.hysteresis = 0.05;
        config.sample_period = Duration::ZERO;
        assert!(matches!(
            Burn::new(&channel, &slot, config),
            Err(RangeError::ZeroDuration { .. })
        ));
    }

    #[test]
    fn zero_initial_delta_ends_immediately() {
        let channel = SimChannel::new(1000.0);
        let actuator = SimActuator::new();
        let slot = ActuatorSlot::new(actuator.clone());
        let burn = Burn::new(&channel, &slot, fast_config()).unwrap();

        let report = burn.until(1000.0, |_| false, &CancelToken::new()).unwrap();
        assert_eq!(report.outcome, BurnOutcome::Reached);
        assert_eq!(report.iterations, 0);
        assert_eq!(actuator.writes(), vec![0.0]);
        assert_eq!(channel.open_subscriptions(), 0);
    }

    #[test]
    fn pid_breaks_before_touching_actuator_when_already_satisfied() {
        let channel = SimChannel::new(500.0);
        let actuator = SimActuator::new();
        let slot = ActuatorSlot::new(actuator.clone());
        let burn = Burn::new(&channel, &slot, fast_config()).unwrap();

        let report = burn
            .until_pid_reached(1000.0, Comparator::AtOrBelow, &CancelToken::new())
            .unwrap();
        assert_eq!(report.outcome, BurnOutcome::Reached);
        assert_eq!(report.actuator_writes, 0);
        assert_eq!(actuator.writes(), vec![0.0]);
        assert_eq!(channel.sample_rate_hz(), Some(100));
    }

    #[test]
    fn pid_hysteresis_suppresses_small_changes() {
        let channel = SimChannel::new(0.0);
        let actuator = SimActuator::new();
        let slot = ActuatorSlot::new(actuator.clone());
        let mut config = fast_config();
        config.gains = PidGains {
            kp: 0.001,
            ki: 0.0,
            kd: 0.0,
        };
        let burn = Burn::new(&channel, &slot, config).unwrap();

        let mut iterations = 0;
        let report = burn
            .until_pid(
                10.0,
                |_| {
                    iterations += 1;
                    iterations > 20
                },
                &CancelToken::new(),
            )
            .unwrap();
        // kp * error = 0.01 never clears the 0.05 threshold.
        assert_eq!(report.actuator_writes, 0);
        assert_eq!(report.iterations, 20);
        assert_eq!(actuator.writes(), vec![0.0]);
    }

    #[test]
    fn second_session_on_same_actuator_is_refused() {
        let channel = SimChannel::new(2000.0);
        let slot = ActuatorSlot::new(SimActuator::new());
        let burn = Burn::new(&channel, &slot, fast_config()).unwrap();
        let _held = slot.acquire().unwrap();
        assert!(matches!(
            burn.until(1000.0, |_| false, &CancelToken::new()),
            Err(CoreError::ActuatorBusy)
        ));
    }

    #[test]
    fn unbounded_taper_interval_is_cancellable() {
        let channel = SimChannel::new(2000.0);
        let actuator = SimActuator::new();
        let slot = ActuatorSlot::new(actuator.clone());
        let config = BurnConfig {
            taper_interval: Duration::MAX,
            ..fast_config()
        };
        let burn = Burn::new(&channel, &slot, config).unwrap();

        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });
        let report = burn.until(1000.0, |_| false, &cancel).unwrap();
        handle.join().unwrap();

        assert_eq!(report.outcome, BurnOutcome::Cancelled);
        assert_eq!(actuator.writes(), vec![1.0, 0.0]);
        assert_eq!(channel.open_subscriptions(), 0);
    }

    #[test]
    fn unbounded_settle_time_on_cancelled_token_returns() {
        let channel = SimChannel::new(2000.0);
        let actuator = SimActuator::new();
        let slot = ActuatorSlot::new(actuator.clone());
        let config = BurnConfig {
            settle_time: Duration::MAX,
            sample_period: Duration::MAX,
            ..fast_config()
        };
        let burn = Burn::new(&channel, &slot, config).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = burn.until_pid(1000.0, |_| false, &cancel).unwrap();
        assert_eq!(report.outcome, BurnOutcome::Cancelled);
        assert_eq!(actuator.current(), 0.0);
    }

    #[test]
    fn write_fault_still_releases_subscription() {
        let channel = SimChannel::new(2000.0);
        let actuator = SimActuator::new();
        actuator.set_reject_writes(true);
        let slot = ActuatorSlot::new(actuator.clone());
        let burn = Burn::new(&channel, &slot, fast_config()).unwrap();

        let res = burn.until(1000.0, |_| false, &CancelToken::new());
        assert!(matches!(res, Err(CoreError::Telemetry(_))));
        assert_eq!(channel.open_subscriptions(), 0);
    }

    #[test]
    fn telemetry_fault_zeroes_actuator() {
        let channel = SimChannel::new(2000.0);
        let actuator = SimActuator::new();
        let slot = ActuatorSlot::new(actuator.clone());
        let burn = Burn::new(&channel, &slot, fast_config()).unwrap();

        let breaker = channel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            breaker.set_link_lost(true);
        });
        let res = burn.until(1000.0, |_| false, &CancelToken::new());
        handle.join().unwrap();

        assert!(matches!(res, Err(CoreError::Telemetry(_))));
        assert_eq!(actuator.writes().last(), Some(&0.0));
        assert_eq!(actuator.current(), 0.0);
    }
}
