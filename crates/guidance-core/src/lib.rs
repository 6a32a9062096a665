pub mod burn;
pub mod cancel;
pub mod debounce;
pub mod error;
pub mod hal;
#[cfg(feature = "simulation")]
pub mod hal_sim;
pub mod limits;
pub mod pid;
pub mod preempt;
pub mod tags;
pub mod telemetry;

pub use burn::{Burn, BurnConfig, BurnMode, BurnOutcome, BurnReport};
pub use cancel::CancelToken;
pub use debounce::Debouncer;
pub use error::{Cancelled, CoreError, CoreResult, RangeError, TelemetryError};
pub use hal::{Actuator, ActuatorLease, ActuatorSlot};
#[cfg(feature = "simulation")]
pub use hal_sim::{PlantParams, SimActuator, SimChannel, SimulatedPlant};
pub use limits::{Throttle, ThrottleBounds, Unvalidated, Validated};
pub use pid::{PidController, PidGains};
pub use preempt::{PreemptibleTask, TaskOutcome, TaskState};
pub use telemetry::{Comparator, Subscription, TelemetrySource, TelemetryStream};
