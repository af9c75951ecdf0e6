use clap::{Args, Parser, Subcommand};
use servo_core::{ControlConfig, TimestampMode, MAX_DUTY_PERCENT};
use servo_link::protocol::DEFAULT_BAUD;
use servo_link::{DeviceConfig, HostConfig, SerialConfig};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "servo-bench")]
#[command(about = "Single-axis position controller: device firmware, host client, simulation", long_about = None)]
pub struct RuntimeConfig {
    /// Output logs in JSON format (for log aggregation)
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    #[arg(long, global = true)]
    pub metrics_addr: Option<String>,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Run the device side on a serial port, driving a simulated motor
    Device(DeviceArgs),
    /// Interactive host session: prompt, run, plot
    Host(HostArgs),
    /// One run against an in-process device, printed and exited
    Sim(SimArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PortArgs {
    /// Serial port path
    #[arg(long, default_value = "/dev/ttyACM0")]
    pub port: String,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,
}

impl PortArgs {
    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            path: self.port.clone(),
            baud_rate: self.baud,
            ..SerialConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoopArgs {
    /// Index of the last control tick (a run executes one more tick than this)
    #[arg(long, default_value_t = 25)]
    pub final_tick: u32,

    /// Control period in milliseconds
    #[arg(long, default_value_t = 10)]
    pub period_ms: u64,

    /// Timestamp samples with measured time instead of tick * period
    #[arg(long)]
    pub wall_clock: bool,

    /// Largest duty-cycle magnitude in percent
    #[arg(long, default_value_t = MAX_DUTY_PERCENT)]
    pub duty_limit: f64,
}

impl LoopArgs {
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            control: ControlConfig {
                final_tick: self.final_tick,
                period: Duration::from_millis(self.period_ms),
                timestamps: if self.wall_clock {
                    TimestampMode::WallClock
                } else {
                    TimestampMode::Nominal
                },
                duty_limit: self.duty_limit,
            },
            ..DeviceConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    #[command(flatten)]
    pub port: PortArgs,

    #[command(flatten)]
    pub control: LoopArgs,
}

#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    #[command(flatten)]
    pub port: PortArgs,

    /// Lines to read per run, ready banner included
    #[arg(long, default_value_t = 55)]
    pub records: usize,

    /// Give up on the handshake after this many milliseconds (default: wait forever)
    #[arg(long)]
    pub ready_timeout_ms: Option<u64>,

    /// Drive an in-process simulated device instead of the serial port
    #[arg(long)]
    pub sim: bool,

    #[command(flatten)]
    pub control: LoopArgs,
}

impl HostArgs {
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            record_budget: self.records,
            ready_timeout: self.ready_timeout_ms.map(Duration::from_millis),
            ..HostConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SimArgs {
    /// Proportional gain
    #[arg(long, allow_negative_numbers = true)]
    pub gain: f64,

    /// Target position in encoder ticks
    #[arg(long, allow_negative_numbers = true)]
    pub setpoint: f64,

    /// Print the run as JSON instead of a table and plot
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub control: LoopArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_defaults_match_firmware_constants() {
        let cfg = RuntimeConfig::try_parse_from(["servo-bench", "device"]).unwrap();
        let Mode::Device(args) = cfg.mode else {
            panic!("expected device mode");
        };
        assert_eq!(args.port.baud, 115_200);
        let device = args.control.device_config();
        assert_eq!(device.control.ticks(), 26);
        assert_eq!(device.control.period, Duration::from_millis(10));
        assert_eq!(device.control.timestamps, TimestampMode::Nominal);
    }

    #[test]
    fn sim_accepts_negative_setpoint() {
        let cfg = RuntimeConfig::try_parse_from([
            "servo-bench",
            "sim",
            "--gain",
            "0.5",
            "--setpoint",
            "-40",
            "--json",
        ])
        .unwrap();
        let Mode::Sim(args) = cfg.mode else {
            panic!("expected sim mode");
        };
        assert_eq!(args.gain, 0.5);
        assert_eq!(args.setpoint, -40.0);
        assert!(args.json);
    }

    #[test]
    fn host_options_feed_host_config() {
        let cfg = RuntimeConfig::try_parse_from([
            "servo-bench",
            "--json-logs",
            "host",
            "--port",
            "/dev/ttyUSB1",
            "--records",
            "30",
            "--ready-timeout-ms",
            "1500",
        ])
        .unwrap();
        assert!(cfg.json_logs);
        let Mode::Host(args) = cfg.mode else {
            panic!("expected host mode");
        };
        let host = args.host_config();
        assert_eq!(host.record_budget, 30);
        assert_eq!(host.ready_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(args.port.serial_config().path, "/dev/ttyUSB1");
        assert!(!args.sim);
    }

    #[test]
    fn sim_requires_parameters() {
        assert!(RuntimeConfig::try_parse_from(["servo-bench", "sim", "--gain", "1"]).is_err());
    }
}
