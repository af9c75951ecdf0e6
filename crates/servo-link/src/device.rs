//! Device side of the link: parameter intake, run supervision, reporting.
//!
//! Every stage returns a [`DeviceError`]; [`Device::serve`] matches on it and
//! always lands back in [`RunState::AwaitingParameters`] through
//! [`RunState::Idle`]. Nothing short of the stop flag ends the loop.

use crate::link::ByteLink;
use crate::metrics::{
    HANDSHAKES, LAST_FINAL_ERROR, LAST_GAIN, LAST_SETPOINT, LINK_FAULTS, PARAMETER_REJECTIONS,
    RUNS_ABORTED, RUNS_COMPLETED, RUN_STATE, TICKS_EXECUTED, TICK_OVERRUNS,
};
use crate::protocol::{
    format_sample, parse_parameter, ProtocolError, BEGIN_EXCHANGE, FIELD_TERMINATOR, READY_BANNER,
};
use servo_core::{
    Axis, ControlConfig, ControlError, ControlParameters, ParameterError, PositionSource,
    ProportionalController, PwmOutput, RunOutcome, StepResponseLoop,
};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    AwaitingParameters,
    Running,
    Reporting,
    Idle,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::AwaitingParameters => "awaiting_parameters",
            RunState::Running => "running",
            RunState::Reporting => "reporting",
            RunState::Idle => "idle",
        }
    }

    fn metric_value(&self) -> f64 {
        match self {
            RunState::AwaitingParameters => 0.0,
            RunState::Running => 1.0,
            RunState::Reporting => 2.0,
            RunState::Idle => 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Gain,
    Setpoint,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParameterKind::Gain => "gain",
            ParameterKind::Setpoint => "setpoint",
        })
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("malformed {kind} parameter: {source}")]
    Parameter {
        kind: ParameterKind,
        #[source]
        source: ProtocolError,
    },
    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] ParameterError),
    #[error("link fault: {0}")]
    Link(#[from] io::Error),
    #[error("control fault: {0}")]
    Control(#[from] ControlError),
    #[error("device stopped")]
    Stopped,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub control: ControlConfig,
    /// Sleep between availability checks while waiting for the host.
    pub poll_interval: Duration,
    /// An unterminated field is taken as complete after this much silence.
    pub field_quiet_time: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            poll_interval: Duration::from_millis(1),
            field_quiet_time: Duration::from_millis(20),
        }
    }
}

/// A run that completed and was reported to the host.
#[derive(Clone, Debug)]
pub struct CompletedRun {
    pub params: ControlParameters,
    pub outcome: RunOutcome,
}

/// What the inbound stream delivered next.
#[derive(Debug, PartialEq)]
enum Inbound {
    Field(Vec<u8>),
    /// [`BEGIN_EXCHANGE`] arrived; everything buffered before it is gone.
    Exchange,
}

/// Splits the inbound stream into parameter fields and answers handshakes.
///
/// A field ends at [`FIELD_TERMINATOR`]; without one, whatever arrived
/// before the line went quiet is taken as the field.
#[derive(Debug, Default)]
struct FieldReader {
    pending: Vec<u8>,
    last_rx: Option<Instant>,
}

impl FieldReader {
    fn next_field<L: ByteLink>(
        &mut self,
        link: &mut L,
        config: &DeviceConfig,
        stop: &AtomicBool,
    ) -> Result<Inbound, DeviceError> {
        let mut temp = [0u8; 64];
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == BEGIN_EXCHANGE) {
                let stale = self.pending.drain(..=pos).count() - 1;
                HANDSHAKES.inc();
                debug!(discarded = stale, "Handshake byte received, signalling ready");
                let mut banner = READY_BANNER.as_bytes().to_vec();
                banner.push(b'\n');
                link.write_all(&banner)?;
                return Ok(Inbound::Exchange);
            }

            if let Some(pos) = self.pending.iter().position(|b| *b == FIELD_TERMINATOR) {
                let mut field = self.pending.drain(..=pos).collect::<Vec<u8>>();
                field.pop();
                if field.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Inbound::Field(field));
            }

            let n = link.read_available(&mut temp)?;
            if n > 0 {
                self.pending.extend_from_slice(&temp[..n]);
                self.last_rx = Some(Instant::now());
                continue;
            }

            let quiet = self
                .last_rx
                .is_some_and(|t| t.elapsed() >= config.field_quiet_time);
            if quiet && !self.pending.is_empty() {
                let field = std::mem::take(&mut self.pending);
                if field.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Inbound::Field(field));
            }

            if stop.load(Ordering::Relaxed) {
                return Err(DeviceError::Stopped);
            }
            thread::sleep(config.poll_interval);
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.last_rx = None;
    }
}

/// The device: owns the link and the axis hardware for the process lifetime.
pub struct Device<L: ByteLink, P: PositionSource, O: PwmOutput> {
    link: L,
    axis: Axis<P, O>,
    config: DeviceConfig,
    state: RunState,
    fields: FieldReader,
}

impl<L: ByteLink, P: PositionSource, O: PwmOutput> Device<L, P, O> {
    pub fn new(link: L, axis: Axis<P, O>, config: DeviceConfig) -> Self {
        Self {
            link,
            axis,
            config,
            state: RunState::AwaitingParameters,
            fields: FieldReader::default(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn axis(&self) -> &Axis<P, O> {
        &self.axis
    }

    pub fn axis_mut(&mut self) -> &mut Axis<P, O> {
        &mut self.axis
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Serve runs until `stop` is raised. The flag is honoured between runs
    /// and while waiting for parameters, never mid-run.
    pub fn serve(&mut self, stop: &AtomicBool) {
        info!(
            ticks = self.config.control.ticks(),
            period_ms = self.config.control.period.as_millis() as u64,
            "Device waiting for parameters"
        );
        loop {
            if stop.load(Ordering::Relaxed) {
                self.axis.reset();
                info!("Device stopped");
                break;
            }
            match self.serve_once(stop) {
                Ok(run) => {
                    info!(
                        gain = run.params.gain(),
                        setpoint = run.params.setpoint(),
                        samples = run.outcome.samples.len(),
                        "Run reported"
                    );
                }
                Err(DeviceError::Stopped) => {}
                Err(err) => self.enter_idle(&err),
            }
        }
    }

    /// One attempt: await both parameters, run, report.
    pub fn serve_once(&mut self, stop: &AtomicBool) -> Result<CompletedRun, DeviceError> {
        self.transition(RunState::AwaitingParameters);
        self.axis.zero_position();

        let params = self.await_parameters(stop)?;

        self.transition(RunState::Running);
        let outcome = self.run(params)?;

        self.transition(RunState::Reporting);
        self.report(&outcome)?;
        RUNS_COMPLETED.inc();

        self.transition(RunState::AwaitingParameters);
        Ok(CompletedRun { params, outcome })
    }

    /// Block until a gain field and then a setpoint field both parse. A
    /// handshake byte at any point restarts the pair from the gain field.
    pub fn await_parameters(&mut self, stop: &AtomicBool) -> Result<ControlParameters, DeviceError> {
        loop {
            let Some(gain) = self.read_parameter(ParameterKind::Gain, stop)? else {
                continue;
            };
            let Some(setpoint) = self.read_parameter(ParameterKind::Setpoint, stop)? else {
                continue;
            };
            return Ok(ControlParameters::new(gain, setpoint)?);
        }
    }

    /// `Ok(None)` when a new exchange began instead of a field arriving.
    fn read_parameter(
        &mut self,
        kind: ParameterKind,
        stop: &AtomicBool,
    ) -> Result<Option<f64>, DeviceError> {
        let field = match self.fields.next_field(&mut self.link, &self.config, stop)? {
            Inbound::Field(field) => field,
            Inbound::Exchange => return Ok(None),
        };
        let value =
            parse_parameter(&field).map_err(|source| DeviceError::Parameter { kind, source })?;
        debug!(%kind, value, "Parameter received");
        Ok(Some(value))
    }

    #[instrument(skip(self), fields(gain = params.gain(), setpoint = params.setpoint()))]
    fn run(&mut self, params: ControlParameters) -> Result<RunOutcome, DeviceError> {
        LAST_GAIN.set(params.gain());
        LAST_SETPOINT.set(params.setpoint());

        let mut controller = ProportionalController::new(params);
        let mut scheduler = StepResponseLoop::new(self.config.control.clone());
        let result = scheduler.run(&mut self.axis, &mut controller);

        let stats = scheduler.stats();
        TICKS_EXECUTED.inc_by(stats.ticks_executed);
        TICK_OVERRUNS.inc_by(stats.ticks_overrun);

        let outcome = result?;
        info!(report = %outcome.report, "Step response complete");
        if let Some(err) = outcome.report.final_error {
            LAST_FINAL_ERROR.set(err);
        }
        Ok(outcome)
    }

    fn report(&mut self, outcome: &RunOutcome) -> Result<(), DeviceError> {
        let mut text = String::with_capacity(outcome.samples.len() * 16);
        for sample in &outcome.samples {
            text.push_str(&format_sample(sample));
            text.push('\n');
        }
        self.link.write_all(text.as_bytes())?;
        debug!(records = outcome.samples.len(), "Telemetry sent");
        Ok(())
    }

    /// Error recovery: stop the motor, zero the encoder, wait for parameters
    /// again. Bytes left over from a rejected pair stay buffered until the
    /// next handshake byte discards them.
    pub fn enter_idle(&mut self, err: &DeviceError) {
        let failed_in = self.state;
        self.transition(RunState::Idle);
        if matches!(failed_in, RunState::Running | RunState::Reporting) {
            RUNS_ABORTED.inc();
        }
        match err {
            DeviceError::Parameter { kind, source } => {
                PARAMETER_REJECTIONS.inc();
                warn!(%kind, error = %source, "Rejected parameter, waiting for a new pair");
            }
            DeviceError::InvalidParameters(e) => {
                PARAMETER_REJECTIONS.inc();
                warn!(error = %e, "Rejected parameters, waiting for a new pair");
            }
            DeviceError::Link(e) => {
                LINK_FAULTS.inc();
                error!(error = %e, state = failed_in.as_str(), "Link fault, resetting");
                self.fields.clear();
                thread::sleep(self.config.poll_interval.max(Duration::from_millis(10)));
            }
            DeviceError::Control(e) => {
                error!(error = %e, "Run abandoned");
            }
            DeviceError::Stopped => {}
        }
        self.axis.reset();
        self.transition(RunState::AwaitingParameters);
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!(from = self.state.as_str(), to = next.as_str(), "Run state");
        }
        self.state = next;
        RUN_STATE.set(next.metric_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use servo_core::SimulatedMotor;

    fn quick_config() -> DeviceConfig {
        DeviceConfig {
            control: ControlConfig {
                period: Duration::from_millis(1),
                ..ControlConfig::default()
            },
            poll_interval: Duration::from_millis(1),
            field_quiet_time: Duration::from_millis(10),
        }
    }

    fn drain(link: &mut MemoryLink) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = link.read_available(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn handshake_answers_ready_and_splits_fields() {
        let (mut host, mut dev) = MemoryLink::pair();
        host.write_all(b"\x04\n 1.5\r\n50.0\n").unwrap();
        let mut fields = FieldReader::default();
        let stop = AtomicBool::new(false);
        let config = quick_config();

        assert_eq!(
            fields.next_field(&mut dev, &config, &stop).unwrap(),
            Inbound::Exchange
        );
        assert_eq!(
            fields.next_field(&mut dev, &config, &stop).unwrap(),
            Inbound::Field(b" 1.5\r".to_vec())
        );
        assert_eq!(
            fields.next_field(&mut dev, &config, &stop).unwrap(),
            Inbound::Field(b"50.0".to_vec())
        );
        assert_eq!(drain(&mut host), "READY\n");
    }

    #[test]
    fn handshake_discards_bytes_buffered_before_it() {
        let (mut host, mut dev) = MemoryLink::pair();
        host.write_all(b"50.0\n7\x041.5\n").unwrap();
        let mut fields = FieldReader::default();
        let stop = AtomicBool::new(false);
        let config = quick_config();

        assert_eq!(
            fields.next_field(&mut dev, &config, &stop).unwrap(),
            Inbound::Exchange
        );
        assert_eq!(
            fields.next_field(&mut dev, &config, &stop).unwrap(),
            Inbound::Field(b"1.5".to_vec())
        );
    }

    #[test]
    fn handshake_mid_pair_restarts_at_gain() {
        let (mut host, dev_link) = MemoryLink::pair();
        let motor = SimulatedMotor::new(Duration::from_millis(1));
        let (encoder, pwm) = motor.split();
        let mut device = Device::new(dev_link, Axis::new(encoder, pwm), quick_config());
        let stop = AtomicBool::new(false);

        host.write_all(b"\x049.0\n\x042.0\n30.0\n").unwrap();
        let params = device.await_parameters(&stop).unwrap();
        assert_eq!(params.gain(), 2.0);
        assert_eq!(params.setpoint(), 30.0);
        assert_eq!(drain(&mut host), "READY\nREADY\n");
    }

    #[test]
    fn unterminated_field_completes_after_quiet_time() {
        let (mut host, mut dev) = MemoryLink::pair();
        host.write_all(b"2.5").unwrap();
        let mut fields = FieldReader::default();
        let stop = AtomicBool::new(false);
        assert_eq!(
            fields.next_field(&mut dev, &quick_config(), &stop).unwrap(),
            Inbound::Field(b"2.5".to_vec())
        );
    }

    #[test]
    fn stop_flag_ends_wait() {
        let (_host, mut dev) = MemoryLink::pair();
        let mut fields = FieldReader::default();
        let stop = AtomicBool::new(true);
        assert!(matches!(
            fields.next_field(&mut dev, &quick_config(), &stop),
            Err(DeviceError::Stopped)
        ));
    }

    #[test]
    fn malformed_gain_returns_to_awaiting_with_motor_stopped() {
        let (mut host, dev_link) = MemoryLink::pair();
        let motor = SimulatedMotor::new(Duration::from_millis(1));
        let (encoder, pwm) = motor.split();
        let mut device = Device::new(dev_link, Axis::new(encoder, pwm), quick_config());
        let stop = AtomicBool::new(false);

        for _ in 0..20 {
            device.axis_mut().actuator_mut().set_duty_cycle(80.0);
        }
        assert_ne!(device.axis_mut().read_position(), 0.0);

        host.write_all(b"abc\n").unwrap();
        let err = device.serve_once(&stop).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Parameter {
                kind: ParameterKind::Gain,
                source: ProtocolError::InvalidNumber { .. }
            }
        ));

        device.enter_idle(&err);
        assert_eq!(device.state(), RunState::AwaitingParameters);
        assert_eq!(device.axis_mut().read_position(), 0.0);
        assert_eq!(motor.duty_percent(), 0.0);
    }

    #[test]
    fn completed_run_reports_every_tick() {
        let (mut host, dev_link) = MemoryLink::pair();
        let motor = SimulatedMotor::new(Duration::from_millis(1));
        let (encoder, pwm) = motor.split();
        let mut device = Device::new(dev_link, Axis::new(encoder, pwm), quick_config());
        let stop = AtomicBool::new(false);

        host.write_all(b"\x041.5\n50.0\n").unwrap();
        let run = device.serve_once(&stop).unwrap();
        assert_eq!(run.params.gain(), 1.5);
        assert_eq!(run.params.setpoint(), 50.0);
        assert_eq!(run.outcome.samples.len(), 26);
        assert_eq!(device.state(), RunState::AwaitingParameters);

        let text = drain(&mut host);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "READY");
        assert_eq!(lines.len(), 27);
        assert_eq!(lines[1], "0.0,0.0");
        assert!(lines[26].starts_with("25.0,"));
        assert_eq!(motor.duty_percent(), 0.0);
    }
}
