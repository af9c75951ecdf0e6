use serde::Serialize;
use thiserror::Error;

/// Gain and target position for one step-response run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlParameters {
    gain: f64,
    setpoint: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ParameterError {
    #[error("gain must be finite, got {value}")]
    NonFiniteGain { value: f64 },
    #[error("setpoint must be finite, got {value}")]
    NonFiniteSetpoint { value: f64 },
}

impl ControlParameters {
    pub fn new(gain: f64, setpoint: f64) -> Result<Self, ParameterError> {
        if !gain.is_finite() {
            return Err(ParameterError::NonFiniteGain { value: gain });
        }
        if !setpoint.is_finite() {
            return Err(ParameterError::NonFiniteSetpoint { value: setpoint });
        }
        Ok(Self { gain, setpoint })
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }
}
