use crate::hal::{Position, PositionSource, PwmOutput};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Simulated brushed DC motor with a quadrature encoder on its shaft.
///
/// Each PWM write advances the plant by one control period, so a run is
/// deterministic regardless of how long the loop actually sleeps.
#[derive(Debug, Clone)]
pub struct SimulatedMotor {
    plant: Arc<Mutex<Plant>>,
}

#[derive(Debug, Clone)]
struct Plant {
    position_ticks: f64,
    velocity_ticks_s: f64,
    zero_offset: f64,
    duty_percent: f64,

    max_speed_ticks_s: f64,
    time_constant_s: f64,
    dt_s: f64,
}

impl SimulatedMotor {
    pub fn new(period: Duration) -> Self {
        Self::with_dynamics(period, 2_000.0, 0.05)
    }

    /// `max_speed_ticks_s` is the no-load speed at 100 % duty;
    /// `time_constant_s` the mechanical time constant.
    pub fn with_dynamics(period: Duration, max_speed_ticks_s: f64, time_constant_s: f64) -> Self {
        // A zero period would freeze the plant; fall back to 10 ms.
        let dt_s = if period.is_zero() {
            0.01
        } else {
            period.as_secs_f64()
        };
        Self {
            plant: Arc::new(Mutex::new(Plant {
                position_ticks: 0.0,
                velocity_ticks_s: 0.0,
                zero_offset: 0.0,
                duty_percent: 0.0,
                max_speed_ticks_s,
                time_constant_s: time_constant_s.max(f64::EPSILON),
                dt_s,
            })),
        }
    }

    /// Split into the encoder and PWM capabilities sharing this plant.
    pub fn split(&self) -> (SimEncoder, SimPwm) {
        (
            SimEncoder {
                plant: Arc::clone(&self.plant),
            },
            SimPwm {
                plant: Arc::clone(&self.plant),
            },
        )
    }

    pub fn duty_percent(&self) -> f64 {
        lock(&self.plant).duty_percent
    }

    pub fn velocity(&self) -> f64 {
        lock(&self.plant).velocity_ticks_s
    }

    /// Absolute shaft position, ignoring encoder resets.
    pub fn absolute_position(&self) -> f64 {
        lock(&self.plant).position_ticks
    }
}

impl Plant {
    fn step(&mut self) {
        let target = self.duty_percent / 100.0 * self.max_speed_ticks_s;
        let alpha = 1.0 - (-self.dt_s / self.time_constant_s).exp();
        self.velocity_ticks_s += (target - self.velocity_ticks_s) * alpha;
        self.position_ticks += self.velocity_ticks_s * self.dt_s;
    }
}

fn lock(plant: &Mutex<Plant>) -> MutexGuard<'_, Plant> {
    plant.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SimEncoder {
    plant: Arc<Mutex<Plant>>,
}

impl PositionSource for SimEncoder {
    fn read(&mut self) -> Position {
        let plant = lock(&self.plant);
        (plant.position_ticks - plant.zero_offset).round() as Position
    }

    fn zero(&mut self) {
        let mut plant = lock(&self.plant);
        plant.zero_offset = plant.position_ticks;
    }
}

pub struct SimPwm {
    plant: Arc<Mutex<Plant>>,
}

impl PwmOutput for SimPwm {
    fn write_duty(&mut self, percent: f64) {
        let mut plant = lock(&self.plant);
        plant.duty_percent = percent;
        plant.step();
    }
}
