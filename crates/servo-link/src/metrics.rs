//! Prometheus metrics for the position controller.
//!
//! Counters cover the device supervisor (runs, rejections, faults) and the
//! last run's parameters and outcome.

use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Device Supervisor Metrics
// ============================================================================

/// Step-response runs completed and reported
pub static RUNS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "servo_runs_completed_total",
        "Step-response runs completed and reported",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Runs abandoned after a fault
pub static RUNS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "servo_runs_aborted_total",
        "Runs abandoned due to a control or link fault",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Malformed parameter fields
pub static PARAMETER_REJECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "servo_parameter_rejections_total",
        "Parameter fields rejected as malformed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static LINK_FAULTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("servo_link_faults_total", "Byte-stream read/write failures")
        .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static HANDSHAKES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "servo_handshakes_total",
        "Parameter exchanges opened by the host",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Control Loop Metrics
// ============================================================================

/// Total control ticks executed
pub static TICKS_EXECUTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("servo_ticks_executed_total", "Total control ticks executed")
        .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Ticks whose work exceeded the control period
pub static TICK_OVERRUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "servo_tick_overruns_total",
        "Control ticks that exceeded the nominal period",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static LAST_GAIN: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new("servo_last_gain", "Gain of the most recent run").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static LAST_SETPOINT: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "servo_last_setpoint_ticks",
        "Setpoint of the most recent run in encoder ticks",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static LAST_FINAL_ERROR: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "servo_last_final_error_ticks",
        "Position error at the end of the most recent completed run",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Device run state (0=awaiting,1=running,2=reporting,3=idle)
pub static RUN_STATE: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "servo_run_state",
        "Device run state (0=awaiting,1=running,2=reporting,3=idle)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = REGISTRY.gather();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let mut response = Response::from_data(buffer);
                    if let Ok(header) = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/plain; version=0.0.4"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = RUNS_COMPLETED.get();
    let _ = RUNS_ABORTED.get();
    let _ = PARAMETER_REJECTIONS.get();
    let _ = LINK_FAULTS.get();
    let _ = HANDSHAKES.get();
    let _ = TICKS_EXECUTED.get();
    let _ = TICK_OVERRUNS.get();
    let _ = LAST_GAIN.get();
    let _ = LAST_SETPOINT.get();
    let _ = LAST_FINAL_ERROR.get();
    let _ = RUN_STATE.get();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_supervisor_counters() {
        init_metrics();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "servo_runs_completed_total"));
        assert!(names.iter().any(|n| n == "servo_run_state"));
    }
}
