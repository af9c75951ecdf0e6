pub mod actuator;
pub mod control_law;
pub mod control_loop;
pub mod hal;
#[cfg(feature = "simulation")]
pub mod hal_sim;
pub mod params;
pub mod timebase;

pub use actuator::{Actuator, DutyCycle, MAX_DUTY_PERCENT};
pub use control_law::{ControlError, ControlSample, PerformanceReport, ProportionalController};
pub use control_loop::{Axis, ControlConfig, ExecutionStats, RunOutcome, StepResponseLoop, TimestampMode};
pub use hal::{Position, PositionSource, PwmOutput};
#[cfg(feature = "simulation")]
pub use hal_sim::{SimEncoder, SimPwm, SimulatedMotor};
pub use params::{ControlParameters, ParameterError};
pub use timebase::TimeBase;
