//! Discrete-time PID controller.
//!
//! The integral term is unclamped unless [`PidController::with_integral_limit`]
//! is used, so long saturation can overshoot on recovery.

use crate::error::RangeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn validate(&self) -> Result<(), RangeError> {
        for (name, value) in [("kp", self.kp), ("ki", self.ki), ("kd", self.kd)] {
            if !value.is_finite() {
                return Err(RangeError::NonFiniteGain { name, value });
            }
        }
        Ok(())
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    min: f64,
    max: f64,
    integral_limit: Option<f64>,

    integral: f64,
    last_error: Option<f64>,
    last_output: f64,
}

impl PidController {
    pub fn new(gains: PidGains, min: f64, max: f64) -> Result<Self, RangeError> {
        gains.validate()?;
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(RangeError::OutputBounds { min, max });
        }
        Ok(Self {
            gains,
            min,
            max,
            integral_limit: None,
            integral: 0.0,
            last_error: None,
            last_output: 0.0_f64.clamp(min, max),
        })
    }

    /// Clamps the accumulated integral to `[-limit, limit]`.
    pub fn with_integral_limit(mut self, limit: f64) -> Result<Self, RangeError> {
        if !limit.is_finite() || limit <= 0.0 {
            return Err(RangeError::IntegralLimit(limit));
        }
        self.integral_limit = Some(limit);
        Ok(self)
    }

    /// Advances the controller by one sample and returns the clamped output.
    ///
    /// A zero `elapsed` leaves the state untouched and returns the previous
    /// output. The derivative term is zero on the first call after
    /// construction or [`reset`](Self::reset).
    pub fn step(&mut self, target: f64, measured: f64, elapsed: Duration) -> f64 {
        let dt = elapsed.as_secs_f64();
        if dt <= 0.0 {
            return self.last_output;
        }

        let error = target - measured;
        let mut integral = self.integral + error * dt;
        if let Some(limit) = self.integral_limit {
            integral = integral.clamp(-limit, limit);
        }
        let derivative = match self.last_error {
            Some(prev) => (error - prev) / dt,
            None => 0.0,
        };

        let raw = self.gains.kp * error + self.gains.ki * integral + self.gains.kd * derivative;
        if raw.is_nan() {
            return self.last_output;
        }

        self.integral = integral;
        self.last_error = Some(error);
        self.last_output = raw.clamp(self.min, self.max);
        self.last_output
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.last_output = 0.0_f64.clamp(self.min, self.max);
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }
}
