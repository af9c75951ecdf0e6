//! Host side of the link: parameter prompts and the run handshake.

use crate::link::{ByteLink, LineBuffer};
use crate::protocol::{encode_parameter, parse_sample, ProtocolError, BEGIN_EXCHANGE, RECORD_SEPARATOR};
use servo_core::{ControlParameters, ControlSample, PerformanceReport};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Pause before each parameter write.
    pub settle_delay: Duration,
    /// Lines to consume before closing; the ready banner counts as one.
    pub record_budget: usize,
    /// `None` waits for the device indefinitely.
    pub ready_timeout: Option<Duration>,
    /// Silence after which the record stream is considered finished.
    pub line_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            record_budget: 55,
            ready_timeout: None,
            line_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("cannot send parameter: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("link fault: {0}")]
    Link(#[from] io::Error),
    #[error("device did not answer the handshake within {0:?}")]
    ReadyTimeout(Duration),
}

/// Samples collected from one run, in arrival order.
#[derive(Clone, Debug, Serialize)]
pub struct RunTrace {
    pub params: ControlParameters,
    pub samples: Vec<ControlSample>,
    pub lines_read: usize,
    pub skipped_records: usize,
}

impl RunTrace {
    fn new(params: ControlParameters) -> Self {
        Self {
            params,
            samples: Vec::new(),
            lines_read: 0,
            skipped_records: 0,
        }
    }

    /// Same figures the device logs, recomputed from the received samples.
    pub fn report(&self) -> PerformanceReport {
        PerformanceReport::from_history(&self.samples, self.params.setpoint())
    }
}

/// Ask for gain, then setpoint. A blank answer or end of input abandons the
/// run (`Ok(None)`); anything that is not a finite number is asked again.
pub fn prompt_parameters<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
) -> io::Result<Option<ControlParameters>> {
    let Some(gain) = prompt_value(input, output, "KP")? else {
        return Ok(None);
    };
    let Some(setpoint) = prompt_value(input, output, "Setpoint")? else {
        return Ok(None);
    };
    Ok(ControlParameters::new(gain, setpoint).ok())
}

fn prompt_value<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    label: &str,
) -> io::Result<Option<f64>> {
    loop {
        write!(output, "Enter {label}: ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let text = line.trim();
        if text.is_empty() {
            return Ok(None);
        }
        match text.parse::<f64>() {
            Ok(value) if value.is_finite() => return Ok(Some(value)),
            _ => writeln!(output, "'{text}' is not a number, try again")?,
        }
    }
}

/// Run one test over a freshly opened link: handshake, send both parameters,
/// collect records. The link is released when this returns.
pub fn run_test<L: ByteLink>(
    mut link: L,
    params: ControlParameters,
    config: &HostConfig,
) -> Result<RunTrace, HostError> {
    // Encode first so a bad value never puts bytes on the wire.
    let gain = encode_parameter(params.gain())?;
    let setpoint = encode_parameter(params.setpoint())?;

    link.write_all(&[BEGIN_EXCHANGE])?;
    wait_ready(&mut link, config)?;

    thread::sleep(config.settle_delay);
    link.write_all(&gain)?;
    thread::sleep(config.settle_delay);
    link.write_all(&setpoint)?;
    info!(
        gain = params.gain(),
        setpoint = params.setpoint(),
        "Parameters sent"
    );

    let mut trace = RunTrace::new(params);
    let mut lines = LineBuffer::new();
    while trace.lines_read < config.record_budget {
        let Some(line) = lines.read_line(&mut link, config.line_timeout, config.poll_interval)?
        else {
            debug!(lines = trace.lines_read, "Record stream ended");
            break;
        };
        trace.lines_read += 1;

        if !line.contains(RECORD_SEPARATOR) {
            debug!(line = %line, "Skipping non-record line");
            continue;
        }
        match parse_sample(&line) {
            Ok(sample) => trace.samples.push(sample),
            Err(e) => {
                warn!(error = %e, "Skipping malformed record");
                trace.skipped_records += 1;
            }
        }
    }

    info!(
        samples = trace.samples.len(),
        skipped = trace.skipped_records,
        "Run collected"
    );
    Ok(trace)
}

fn wait_ready<L: ByteLink>(link: &mut L, config: &HostConfig) -> Result<(), HostError> {
    let started = Instant::now();
    while link.bytes_available()? == 0 {
        if let Some(limit) = config.ready_timeout {
            if started.elapsed() >= limit {
                return Err(HostError::ReadyTimeout(limit));
            }
        }
        thread::sleep(config.poll_interval);
    }
    debug!(waited_ms = started.elapsed().as_millis() as u64, "Device ready");
    Ok(())
}
