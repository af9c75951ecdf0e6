use servo_core::{Axis, ControlConfig, ControlParameters, SimulatedMotor};
use servo_link::{
    run_test, ByteLink, CompletedRun, Device, DeviceConfig, HostConfig, MemoryLink, RunState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fast_device_config() -> DeviceConfig {
    DeviceConfig {
        control: ControlConfig {
            period: Duration::from_millis(1),
            ..ControlConfig::default()
        },
        poll_interval: Duration::from_millis(1),
        field_quiet_time: Duration::from_millis(10),
    }
}

fn fast_host_config() -> HostConfig {
    HostConfig {
        settle_delay: Duration::from_millis(5),
        ready_timeout: Some(Duration::from_secs(2)),
        line_timeout: Duration::from_millis(500),
        ..HostConfig::default()
    }
}

#[test]
fn host_collects_full_step_response() {
    let (host_link, device_link) = MemoryLink::pair();
    let motor = SimulatedMotor::new(Duration::from_millis(1));
    let (encoder, pwm) = motor.split();
    let stop = Arc::new(AtomicBool::new(false));

    let device_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let mut device = Device::new(device_link, Axis::new(encoder, pwm), fast_device_config());
        device.serve(&device_stop);
        device.state()
    });

    let params = ControlParameters::new(2.0, 100.0).unwrap();
    let trace = run_test(host_link, params, &fast_host_config()).unwrap();

    stop.store(true, Ordering::Relaxed);
    let final_state = handle.join().unwrap();

    assert_eq!(trace.samples.len(), 26);
    assert_eq!(trace.skipped_records, 0);
    assert_eq!(trace.samples[0].elapsed_time, 0.0);
    assert_eq!(trace.samples[25].elapsed_time, 25.0);
    assert!(trace.samples.windows(2).all(|w| w[1].position >= w[0].position));
    assert!(trace.samples[25].position > 0.0);

    let report = trace.report();
    assert_eq!(report.sample_count, 26);
    assert_eq!(report.setpoint, 100.0);

    assert_eq!(final_state, RunState::AwaitingParameters);
    assert_eq!(motor.duty_percent(), 0.0);
}

/// Device loop that survives errors, returning every completed run.
fn spawn_recovering_device(
    device_link: MemoryLink,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<Vec<CompletedRun>> {
    let motor = SimulatedMotor::new(Duration::from_millis(1));
    let (encoder, pwm) = motor.split();
    thread::spawn(move || {
        let mut device = Device::new(device_link, Axis::new(encoder, pwm), fast_device_config());
        let mut completed = Vec::new();
        while !stop.load(Ordering::Relaxed) {
            match device.serve_once(&stop) {
                Ok(run) => completed.push(run),
                Err(err) => device.enter_idle(&err),
            }
        }
        completed
    })
}

fn collect_lines(link: &mut MemoryLink, count: usize) -> Vec<String> {
    let mut received = String::new();
    let mut buf = [0u8; 256];
    for _ in 0..2_000 {
        let n = link.read_available(&mut buf).unwrap();
        received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        if received.lines().count() >= count && received.ends_with('\n') {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    received.lines().map(str::to_owned).collect()
}

#[test]
fn device_recovers_from_malformed_parameter() {
    let (mut host_link, device_link) = MemoryLink::pair();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_recovering_device(device_link, Arc::clone(&stop));

    host_link.write_all(b"abc\n").unwrap();
    thread::sleep(Duration::from_millis(30));
    host_link.write_all(b"\x041.5\n50.0\n").unwrap();
    let lines = collect_lines(&mut host_link, 27);

    stop.store(true, Ordering::Relaxed);
    let completed = handle.join().unwrap();

    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].params.gain(), 1.5);
    assert_eq!(completed[0].params.setpoint(), 50.0);
    assert_eq!(lines[0], "READY");
    assert_eq!(lines.len(), 27);
}

#[test]
fn leftover_field_after_rejection_does_not_shift_next_run() {
    let (mut host_link, device_link) = MemoryLink::pair();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_recovering_device(device_link, Arc::clone(&stop));

    // "abc" is rejected as a gain, leaving "50.0" queued ahead of the next exchange.
    host_link.write_all(b"\x04abc\n50.0\n").unwrap();
    thread::sleep(Duration::from_millis(30));

    let params = ControlParameters::new(1.5, 20.0).unwrap();
    let trace = run_test(&mut host_link, params, &fast_host_config()).unwrap();

    stop.store(true, Ordering::Relaxed);
    let completed = handle.join().unwrap();

    assert_eq!(trace.samples.len(), 26);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].params.gain(), 1.5);
    assert_eq!(completed[0].params.setpoint(), 20.0);
}

#[test]
fn unterminated_fields_are_split_by_quiet_time() {
    let (mut host_link, device_link) = MemoryLink::pair();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_recovering_device(device_link, Arc::clone(&stop));

    host_link.write_all(&[0x04]).unwrap();
    thread::sleep(Duration::from_millis(40));
    host_link.write_all(b"1.5").unwrap();
    thread::sleep(Duration::from_millis(40));
    host_link.write_all(b"50.0").unwrap();
    let lines = collect_lines(&mut host_link, 27);

    stop.store(true, Ordering::Relaxed);
    let completed = handle.join().unwrap();

    assert_eq!(lines[0], "READY");
    assert_eq!(lines.len(), 27);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].params.gain(), 1.5);
    assert_eq!(completed[0].params.setpoint(), 50.0);
}
