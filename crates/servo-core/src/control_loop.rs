use crate::actuator::{Actuator, MAX_DUTY_PERCENT};
use crate::control_law::{ControlError, ControlSample, PerformanceReport, ProportionalController};
use crate::hal::{PositionSource, PwmOutput};
use crate::timebase::TimeBase;
use log::{debug, trace};
use std::thread;
use std::time::{Duration, Instant};

/// Where the per-sample timestamp comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimestampMode {
    /// `tick * period`, reproducible across runs.
    #[default]
    Nominal,
    /// Monotonic time since the first tick.
    WallClock,
}

#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Index of the last tick; a run executes `final_tick + 1` ticks.
    pub final_tick: u32,
    pub period: Duration,
    pub timestamps: TimestampMode,
    pub duty_limit: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            final_tick: 25,
            period: Duration::from_millis(10),
            timestamps: TimestampMode::Nominal,
            duty_limit: MAX_DUTY_PERCENT,
        }
    }
}

impl ControlConfig {
    pub fn ticks(&self) -> u32 {
        self.final_tick + 1
    }

    fn period_ms(&self) -> f64 {
        self.period.as_secs_f64() * 1_000.0
    }
}

#[derive(Clone, Default, Debug)]
pub struct ExecutionStats {
    pub ticks_executed: u64,
    pub ticks_overrun: u64,
    pub saturated_ticks: u64,
    pub max_tick_us: u64,
}

/// The single axis' owned hardware: encoder plus duty-cycle actuator.
pub struct Axis<P: PositionSource, O: PwmOutput> {
    encoder: P,
    actuator: Actuator<O>,
}

impl<P: PositionSource, O: PwmOutput> Axis<P, O> {
    pub fn new(encoder: P, pwm: O) -> Self {
        Self {
            encoder,
            actuator: Actuator::new(pwm),
        }
    }

    pub fn with_duty_limit(encoder: P, pwm: O, duty_limit: f64) -> Self {
        Self {
            encoder,
            actuator: Actuator::with_limit(pwm, duty_limit),
        }
    }

    pub fn zero_position(&mut self) {
        self.encoder.zero();
    }

    /// Stop the motor, then zero the encoder.
    pub fn reset(&mut self) {
        self.actuator.stop();
        self.encoder.zero();
    }

    pub fn read_position(&mut self) -> f64 {
        self.encoder.read() as f64
    }

    pub fn encoder(&self) -> &P {
        &self.encoder
    }

    pub fn actuator(&self) -> &Actuator<O> {
        &self.actuator
    }

    pub fn actuator_mut(&mut self) -> &mut Actuator<O> {
        &mut self.actuator
    }
}

/// Result of a completed step-response run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub report: PerformanceReport,
    pub samples: Vec<ControlSample>,
    pub final_output: f64,
    pub stats: ExecutionStats,
}

/// Fixed-count, fixed-period loop: read, compute, actuate, sleep.
pub struct StepResponseLoop {
    config: ControlConfig,
    stats: ExecutionStats,
}

impl StepResponseLoop {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            stats: ExecutionStats::default(),
        }
    }

    /// Run every tick, then summarise, stop the motor and zero the encoder.
    ///
    /// A control fault returns immediately with the motor still commanded at
    /// its last duty; the caller is responsible for the reset.
    pub fn run<P: PositionSource, O: PwmOutput>(
        &mut self,
        axis: &mut Axis<P, O>,
        controller: &mut ProportionalController,
    ) -> Result<RunOutcome, ControlError> {
        self.stats = ExecutionStats::default();
        let timebase = TimeBase::new();
        let period_ms = self.config.period_ms();
        let mut output = 0.0;
        let mut tick: u32 = 0;

        while tick <= self.config.final_tick {
            let tick_start = Instant::now();

            let measured = axis.read_position();
            let elapsed = match self.config.timestamps {
                TimestampMode::Nominal => f64::from(tick) * period_ms,
                TimestampMode::WallClock => timebase.now_ms(),
            };
            output = controller.step(measured, elapsed)?;
            let duty = axis.actuator.set_duty_cycle(output);
            if duty.percent() != output {
                self.stats.saturated_ticks += 1;
            }
            trace!(
                "tick {} t={}ms pos={} out={} duty={}",
                tick,
                elapsed,
                measured,
                output,
                duty.percent()
            );

            tick += 1;
            self.stats.ticks_executed += 1;

            let busy = tick_start.elapsed();
            self.stats.max_tick_us = self.stats.max_tick_us.max(busy.as_micros() as u64);
            if busy < self.config.period {
                thread::sleep(self.config.period - busy);
            } else if !self.config.period.is_zero() {
                self.stats.ticks_overrun += 1;
            }
        }

        let report = controller.summarize();
        axis.actuator.stop();
        axis.encoder.zero();

        debug!(
            "step response finished: {} ticks, {} saturated, {} overruns",
            self.stats.ticks_executed, self.stats.saturated_ticks, self.stats.ticks_overrun
        );

        Ok(RunOutcome {
            report,
            samples: controller.history().to_vec(),
            final_output: output,
            stats: self.stats.clone(),
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }
}
