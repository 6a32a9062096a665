//! Error taxonomy for the guidance core.

use thiserror::Error;

/// Parameter outside its valid domain, rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RangeError {
    #[error("throttle bounds must satisfy 0 <= min <= max <= 1 (min: {min}, max: {max})")]
    ThrottleBounds { min: f64, max: f64 },

    #[error("output bounds must be finite with min <= max (min: {min}, max: {max})")]
    OutputBounds { min: f64, max: f64 },

    #[error("{name} gain must be finite (got {value})")]
    NonFiniteGain { name: &'static str, value: f64 },

    #[error("integral limit must be finite and positive (got {0})")]
    IntegralLimit(f64),

    #[error("hysteresis must be finite and non-negative (got {0})")]
    Hysteresis(f64),

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("sample rate must be greater than zero")]
    ZeroSampleRate,

    #[error("throttle command is not finite (got {0})")]
    NonFiniteCommand(f64),
}

/// Failure talking to the remote telemetry/actuation service.
///
/// Never retried inside the core; the caller of the current loop decides.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    #[error("telemetry link lost: {0}")]
    LinkLost(String),

    #[error("subscription has already been released")]
    Released,

    #[error("actuator write rejected: {0}")]
    WriteRejected(String),
}

/// A cancellation request was observed. Not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("actuator is already driven by another session")]
    ActuatorBusy,

    #[error("task has already been started")]
    AlreadyStarted,

    #[error("debouncer has been disposed")]
    Disposed,

    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

impl CoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
