use crate::runtime::config::{DeviceArgs, HostArgs, LoopArgs, Mode, RuntimeConfig, SimArgs};
use crate::runtime::logging::init_tracing;
use crate::runtime::plot::{render_table, StepPlot};
use crate::runtime::telemetry;
use clap::Parser;
use serde::Serialize;
use servo_core::{
    Axis, ControlParameters, ParameterError, PerformanceReport, SimEncoder, SimPwm, SimulatedMotor,
};
use servo_link::{
    prompt_parameters, run_test, Device, DeviceConfig, HostConfig, HostError, MemoryLink,
    RunTrace, SerialLink,
};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Parameters(#[from] ParameterError),
    #[error("cannot encode report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("simulated device thread panicked")]
    DeviceThread,
}

/// JSON shape of a `sim --json` run.
#[derive(Serialize)]
struct RunSummary<'a> {
    #[serde(flatten)]
    trace: &'a RunTrace,
    report: PerformanceReport,
}

pub fn run_from_args() -> ExitCode {
    let config = RuntimeConfig::parse();
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "servo-bench failed");
            ExitCode::FAILURE
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    init_tracing(config.json_logs);
    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    match config.mode {
        Mode::Device(args) => run_device(args),
        Mode::Host(args) => run_host(args),
        Mode::Sim(args) => run_sim(args),
    }
}

fn simulated_axis(control: &LoopArgs) -> (SimulatedMotor, Axis<SimEncoder, SimPwm>) {
    let motor = SimulatedMotor::new(Duration::from_millis(control.period_ms));
    let (encoder, pwm) = motor.split();
    let axis = Axis::with_duty_limit(encoder, pwm, control.duty_limit);
    (motor, axis)
}

fn run_device(args: DeviceArgs) -> Result<(), AppError> {
    let link = SerialLink::open(&args.port.serial_config())?;
    let (_motor, axis) = simulated_axis(&args.control);
    let mut device = Device::new(link, axis, args.control.device_config());

    info!(port = %args.port.port, "Device firmware running on simulated motor");
    let stop = AtomicBool::new(false);
    device.serve(&stop);
    Ok(())
}

/// One run against a device thread over an in-memory link. The device is
/// stopped before the host end closes, so a clean run never reads as a
/// link fault.
fn simulate_run(
    params: ControlParameters,
    control: &LoopArgs,
    host_config: &HostConfig,
) -> Result<RunTrace, AppError> {
    let (mut host_link, device_link) = MemoryLink::pair();
    let (_motor, axis) = simulated_axis(control);
    let device_config: DeviceConfig = control.device_config();
    let stop = Arc::new(AtomicBool::new(false));

    let device_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let mut device = Device::new(device_link, axis, device_config);
        device.serve(&device_stop);
    });

    let result = run_test(&mut host_link, params, host_config);
    stop.store(true, Ordering::Relaxed);
    handle.join().map_err(|_| AppError::DeviceThread)?;
    drop(host_link);
    Ok(result?)
}

fn run_sim(args: SimArgs) -> Result<(), AppError> {
    let params = ControlParameters::new(args.gain, args.setpoint)?;
    let host_config = HostConfig {
        ready_timeout: Some(Duration::from_secs(5)),
        ..HostConfig::default()
    };
    let trace = simulate_run(params, &args.control, &host_config)?;

    let mut stdout = io::stdout().lock();
    if args.json {
        let summary = RunSummary {
            trace: &trace,
            report: trace.report(),
        };
        serde_json::to_writer_pretty(&mut stdout, &summary)?;
        writeln!(stdout)?;
    } else {
        write!(stdout, "{}", render_table(&trace))?;
        let mut plot = StepPlot::default();
        plot.add(trace);
        write!(stdout, "{plot}")?;
    }
    Ok(())
}

fn run_host(args: HostArgs) -> Result<(), AppError> {
    let host_config = args.host_config();
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout().lock();

    if args.sim {
        info!("Host session against simulated device");
        let sim_config = HostConfig {
            ready_timeout: Some(Duration::from_secs(5)),
            ..host_config
        };
        host_session(&mut input, &mut output, |params| {
            simulate_run(params, &args.control, &sim_config)
        })?;
    } else {
        info!(port = %args.port.port, "Host session on serial link");
        let serial = args.port.serial_config();
        host_session(&mut input, &mut output, |params| {
            let link = SerialLink::open(&serial)?;
            Ok(run_test(link, params, &host_config)?)
        })?;
    }
    Ok(())
}

/// Interactive loop: `run` prompts and plots a new trace, `clear` drops the
/// plotted traces, `quit` (or end of input) leaves.
fn host_session<R, W, F>(input: &mut R, output: &mut W, mut run_once: F) -> io::Result<StepPlot>
where
    R: BufRead,
    W: Write,
    F: FnMut(ControlParameters) -> Result<RunTrace, AppError>,
{
    let mut plot = StepPlot::default();
    loop {
        write!(output, "Command [run/clear/quit]: ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "run" | "r" => {
                let Some(params) = prompt_parameters(input, output)? else {
                    info!("Run abandoned");
                    continue;
                };
                match run_once(params) {
                    Ok(trace) => {
                        writeln!(output, "{}", trace.report())?;
                        plot.add(trace);
                        debug!(traces = plot.traces().len(), "Trace plotted");
                        write!(output, "{plot}")?;
                    }
                    Err(e) => warn!(error = %e, "Run failed"),
                }
            }
            "clear" | "c" => {
                plot.clear();
                write!(output, "{plot}")?;
            }
            "quit" | "q" => break,
            "" => {}
            other => writeln!(output, "Unknown command '{other}'")?,
        }
    }
    Ok(plot)
}
