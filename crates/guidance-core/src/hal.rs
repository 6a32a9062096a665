use crate::error::{CoreError, TelemetryError};
use crate::limits::{Throttle, Validated};
use std::sync::{Mutex, MutexGuard, TryLockError};
use tracing::{debug, warn};

/// The single continuous output a burn drives, e.g. main throttle.
pub trait Actuator: Send {
    /// Writes a value in `[0, 1]`.
    fn write(&mut self, value: f64) -> Result<(), TelemetryError>;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn write(&mut self, value: f64) -> Result<(), TelemetryError> {
        (**self).write(value)
    }
}

/// Shared home of an actuator. At most one session holds its lease.
pub struct ActuatorSlot<A: Actuator> {
    actuator: Mutex<A>,
}

impl<A: Actuator> ActuatorSlot<A> {
    pub fn new(actuator: A) -> Self {
        Self {
            actuator: Mutex::new(actuator),
        }
    }

    /// Takes exclusive write access, or fails with
    /// [`CoreError::ActuatorBusy`] when another session already holds it.
    pub fn acquire(&self) -> Result<ActuatorLease<'_, A>, CoreError> {
        let guard = match self.actuator.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(CoreError::ActuatorBusy),
            // A session panicked mid-write; its lease already tried to zero the output.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        Ok(ActuatorLease {
            actuator: guard,
            last_written: None,
            writes: 0,
            neutralized: false,
        })
    }

    pub fn into_inner(self) -> A {
        self.actuator
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Write access for one session. Writes the neutral value exactly once,
/// either through [`ActuatorLease::release`] or on drop.
pub struct ActuatorLease<'a, A: Actuator> {
    actuator: MutexGuard<'a, A>,
    last_written: Option<f64>,
    writes: u64,
    neutralized: bool,
}

impl<A: Actuator> ActuatorLease<'_, A> {
    pub fn write(&mut self, command: Throttle<Validated>) -> Result<(), TelemetryError> {
        let value = command.value();
        self.actuator.write(value)?;
        self.last_written = Some(value);
        self.writes += 1;
        debug!(value, "actuator write");
        Ok(())
    }

    pub fn last_written(&self) -> Option<f64> {
        self.last_written
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Zeroes the actuator and surrenders the lease.
    pub fn release(mut self) -> Result<(), TelemetryError> {
        self.neutralize()
    }

    fn neutralize(&mut self) -> Result<(), TelemetryError> {
        if self.neutralized {
            return Ok(());
        }
        self.neutralized = true;
        let neutral = Throttle::<Validated>::neutral().value();
        self.actuator.write(neutral)?;
        self.last_written = Some(neutral);
        Ok(())
    }
}

impl<A: Actuator> Drop for ActuatorLease<'_, A> {
    fn drop(&mut self) {
        if let Err(e) = self.neutralize() {
            warn!(error = %e, "failed to return actuator to neutral");
        }
    }
}
