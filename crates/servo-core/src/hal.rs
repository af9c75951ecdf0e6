/// Signed encoder tick count. Meaningful only between two calls to
/// [`PositionSource::zero`]; implementations sign-extend the hardware counter.
pub type Position = i64;

/// Quadrature encoder capability.
pub trait PositionSource: Send {
    /// Current signed tick count. Never blocks.
    fn read(&mut self) -> Position;
    /// Reset the reference so the next `read` returns 0. Must not touch the
    /// motor output.
    fn zero(&mut self);
}

/// Raw PWM motor driver capability.
///
/// Receives a duty cycle already clamped to [-100, 100] by
/// [`Actuator`](crate::actuator::Actuator); sign selects direction.
pub trait PwmOutput: Send {
    fn write_duty(&mut self, percent: f64);
}

impl<T: PositionSource + ?Sized> PositionSource for Box<T> {
    fn read(&mut self) -> Position {
        (**self).read()
    }

    fn zero(&mut self) {
        (**self).zero()
    }
}

impl<T: PwmOutput + ?Sized> PwmOutput for Box<T> {
    fn write_duty(&mut self, percent: f64) {
        (**self).write_duty(percent)
    }
}
