use crate::error::RangeError;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy)]
pub struct Unvalidated;

#[derive(Debug, Clone, Copy)]
pub struct Validated;

/// Actuator command. Only `Throttle<Validated>` can be written.
#[derive(Debug, Clone, Copy)]
pub struct Throttle<State = Unvalidated> {
    value: f64,
    _state: PhantomData<State>,
}

/// Output range a burn may command, within the actuator's `[0, 1]` domain.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ThrottleBounds {
    min: f64,
    max: f64,
}

impl ThrottleBounds {
    pub fn new(min: f64, max: f64) -> Result<Self, RangeError> {
        // NaN fails every comparison below.
        if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max {
            return Err(RangeError::ThrottleBounds { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn validate(&self) -> Result<(), RangeError> {
        Self::new(self.min, self.max).map(|_| ())
    }
}

impl Default for ThrottleBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl Throttle<Unvalidated> {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            _state: PhantomData,
        }
    }

    /// Clamps into `bounds`. Rejects NaN and infinities instead of clamping
    /// them, since those indicate a broken upstream computation.
    pub fn clamp_into(self, bounds: &ThrottleBounds) -> Result<Throttle<Validated>, RangeError> {
        if !self.value.is_finite() {
            return Err(RangeError::NonFiniteCommand(self.value));
        }
        Ok(Throttle {
            value: self.value.clamp(bounds.min, bounds.max),
            _state: PhantomData,
        })
    }
}

impl Throttle<Validated> {
    pub fn value(&self) -> f64 {
        self.value
    }

    pub(crate) fn neutral() -> Self {
        Throttle {
            value: 0.0,
            _state: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_bounds() {
        assert_eq!(
            ThrottleBounds::new(0.8, 0.2),
            Err(RangeError::ThrottleBounds { min: 0.8, max: 0.2 })
        );
    }

    #[test]
    fn rejects_nan_bounds() {
        assert!(ThrottleBounds::new(f64::NAN, 1.0).is_err());
        assert!(ThrottleBounds::new(0.0, f64::NAN).is_err());
    }

    #[test]
    fn range_error_message_is_descriptive() {
        let err = ThrottleBounds::new(-0.1, 1.0).unwrap_err();
        assert!(err.to_string().contains("0 <= min <= max <= 1"));
    }

    #[test]
    fn clamps_into_bounds() {
        let bounds = ThrottleBounds::new(0.1, 0.9).unwrap();
        assert_eq!(Throttle::new(2.0).clamp_into(&bounds).unwrap().value(), 0.9);
        assert_eq!(Throttle::new(0.0).clamp_into(&bounds).unwrap().value(), 0.1);
        assert_eq!(Throttle::new(0.5).clamp_into(&bounds).unwrap().value(), 0.5);
    }

    #[test]
    fn rejects_nonfinite_command() {
        let bounds = ThrottleBounds::default();
        assert!(matches!(
            Throttle::new(f64::NAN).clamp_into(&bounds),
            Err(RangeError::NonFiniteCommand(_))
        ));
        assert!(matches!(
            Throttle::new(f64::INFINITY).clamp_into(&bounds),
            Err(RangeError::NonFiniteCommand(_))
        ));
    }
}
