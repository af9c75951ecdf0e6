//! Duty-cycle actuation on top of a raw PWM driver.
//!
//! Out-of-range commands are a normal case here, not a fault: every value is
//! clamped before it reaches the driver.

use crate::hal::PwmOutput;

/// Largest duty-cycle magnitude forwarded to the driver, in percent.
pub const MAX_DUTY_PERCENT: f64 = 100.0;

/// Signed duty cycle in percent, always within `[-limit, limit]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct DutyCycle(f64);

impl DutyCycle {
    pub const STOP: DutyCycle = DutyCycle(0.0);

    /// Clamp a raw command into `[-limit, limit]`. NaN maps to zero;
    /// infinities saturate. Limits outside `(0, 100]` fall back to 100.
    pub fn clamped(raw: f64, limit: f64) -> Self {
        if raw.is_nan() {
            return Self::STOP;
        }
        let limit = valid_limit(limit);
        Self(raw.clamp(-limit, limit))
    }

    pub fn percent(self) -> f64 {
        self.0
    }

    pub fn is_reverse(self) -> bool {
        self.0 < 0.0
    }
}

fn valid_limit(limit: f64) -> f64 {
    if limit > 0.0 && limit <= MAX_DUTY_PERCENT {
        limit
    } else {
        MAX_DUTY_PERCENT
    }
}

/// Motor actuator: clamps, then forwards to the PWM driver.
pub struct Actuator<O: PwmOutput> {
    output: O,
    limit: f64,
    last: DutyCycle,
}

impl<O: PwmOutput> Actuator<O> {
    pub fn new(output: O) -> Self {
        Self::with_limit(output, MAX_DUTY_PERCENT)
    }

    /// Use a tighter limit than the hardware range. Limits outside
    /// `(0, 100]` fall back to 100.
    pub fn with_limit(output: O, limit: f64) -> Self {
        Self {
            output,
            limit: valid_limit(limit),
            last: DutyCycle::STOP,
        }
    }

    /// Apply a raw control output as a duty cycle and return what was sent.
    pub fn set_duty_cycle(&mut self, value: f64) -> DutyCycle {
        let duty = DutyCycle::clamped(value, self.limit);
        self.output.write_duty(duty.percent());
        self.last = duty;
        duty
    }

    pub fn stop(&mut self) {
        self.set_duty_cycle(0.0);
    }

    pub fn last(&self) -> DutyCycle {
        self.last
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn into_inner(self) -> O {
        self.output
    }
}
