//! Proportional position control law and step-response metrics.
//!
//! The controller owns the run's sample history. [`ProportionalController::summarize`]
//! derives its report from that history and the setpoint only, so the host can
//! recompute the same report from received telemetry.

use crate::params::ControlParameters;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Half-width of the settling band, as a fraction of the step size.
pub const SETTLING_BAND: f64 = 0.02;
const RISE_LOW: f64 = 0.1;
const RISE_HIGH: f64 = 0.9;

/// One tick of telemetry: nominal or measured time in ms and the encoder reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlSample {
    pub elapsed_time: f64,
    pub position: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ControlError {
    #[error("control output is not finite ({output}) at position {measured}")]
    NonFiniteOutput { output: f64, measured: f64 },
}

pub struct ProportionalController {
    params: ControlParameters,
    history: Vec<ControlSample>,
    last_output: f64,
}

impl ProportionalController {
    pub fn new(params: ControlParameters) -> Self {
        Self {
            params,
            history: Vec::new(),
            last_output: 0.0,
        }
    }

    /// Replace the parameters and forget the previous run.
    pub fn configure(&mut self, params: ControlParameters) {
        self.params = params;
        self.history.clear();
        self.last_output = 0.0;
    }

    /// `gain * (setpoint - measured)`; the sample is recorded even when the
    /// output turns out to be unusable.
    pub fn step(&mut self, measured: f64, elapsed_time: f64) -> Result<f64, ControlError> {
        self.history.push(ControlSample {
            elapsed_time,
            position: measured,
        });

        let error = self.params.setpoint() - measured;
        let output = self.params.gain() * error;
        if !output.is_finite() {
            return Err(ControlError::NonFiniteOutput { output, measured });
        }
        self.last_output = output;
        Ok(output)
    }

    pub fn summarize(&self) -> PerformanceReport {
        PerformanceReport::from_history(&self.history, self.params.setpoint())
    }

    pub fn params(&self) -> ControlParameters {
        self.params
    }

    pub fn history(&self) -> &[ControlSample] {
        &self.history
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    pub fn take_history(&mut self) -> Vec<ControlSample> {
        std::mem::take(&mut self.history)
    }
}

/// Step-response figures for one run. Times are sample timestamps in ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub setpoint: f64,
    pub sample_count: usize,
    pub initial_position: Option<f64>,
    pub final_position: Option<f64>,
    /// `setpoint - final_position`.
    pub final_error: Option<f64>,
    /// Furthest position reached in the direction of the step.
    pub peak_position: Option<f64>,
    pub overshoot: f64,
    pub overshoot_percent: Option<f64>,
    pub rise_time_ms: Option<f64>,
    pub settling_time_ms: Option<f64>,
}

impl PerformanceReport {
    pub fn from_history(history: &[ControlSample], setpoint: f64) -> Self {
        let (first, last) = match (history.first(), history.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => {
                return Self {
                    setpoint,
                    sample_count: 0,
                    initial_position: None,
                    final_position: None,
                    final_error: None,
                    peak_position: None,
                    overshoot: 0.0,
                    overshoot_percent: None,
                    rise_time_ms: None,
                    settling_time_ms: None,
                }
            }
        };

        let step = setpoint - first.position;
        let direction = if step < 0.0 { -1.0 } else { 1.0 };
        let step_size = step.abs();

        let peak = history
            .iter()
            .map(|s| s.position)
            .fold(first.position, |best, p| {
                if direction * p > direction * best {
                    p
                } else {
                    best
                }
            });
        let overshoot = (direction * (peak - setpoint)).max(0.0);
        let overshoot_percent = (step_size > 0.0).then(|| overshoot / step_size * 100.0);

        let rise_time_ms = if step_size > 0.0 {
            let progress = |s: &ControlSample| direction * (s.position - first.position);
            let t_low = history
                .iter()
                .find(|s| progress(s) >= RISE_LOW * step_size)
                .map(|s| s.elapsed_time);
            let t_high = history
                .iter()
                .find(|s| progress(s) >= RISE_HIGH * step_size)
                .map(|s| s.elapsed_time);
            match (t_low, t_high) {
                (Some(lo), Some(hi)) => Some(hi - lo),
                _ => None,
            }
        } else {
            None
        };

        let band = SETTLING_BAND * step_size;
        let settling_time_ms = match history
            .iter()
            .rposition(|s| (setpoint - s.position).abs() > band)
        {
            None => Some(first.elapsed_time),
            Some(i) => history.get(i + 1).map(|s| s.elapsed_time),
        };

        Self {
            setpoint,
            sample_count: history.len(),
            initial_position: Some(first.position),
            final_position: Some(last.position),
            final_error: Some(setpoint - last.position),
            peak_position: Some(peak),
            overshoot,
            overshoot_percent,
            rise_time_ms,
            settling_time_ms,
        }
    }

    pub fn settled(&self) -> bool {
        self.settling_time_ms.is_some()
    }
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt(v: Option<f64>) -> String {
            v.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string())
        }
        write!(
            f,
            "samples={} setpoint={} final={} error={} peak={} overshoot={:.2} ({}%) rise={}ms settle={}ms",
            self.sample_count,
            self.setpoint,
            opt(self.final_position),
            opt(self.final_error),
            opt(self.peak_position),
            self.overshoot,
            opt(self.overshoot_percent),
            opt(self.rise_time_ms),
            opt(self.settling_time_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(gain: f64, setpoint: f64) -> ProportionalController {
        ProportionalController::new(ControlParameters::new(gain, setpoint).unwrap())
    }

    fn samples(positions: &[f64]) -> Vec<ControlSample> {
        positions
            .iter()
            .enumerate()
            .map(|(i, &p)| ControlSample {
                elapsed_time: i as f64 * 10.0,
                position: p,
            })
            .collect()
    }

    #[test]
    fn output_is_gain_times_error() {
        let mut c = controller(2.0, 100.0);
        assert_eq!(c.step(30.0, 0.0).unwrap(), 140.0);
        assert_eq!(c.step(100.0, 10.0).unwrap(), 0.0);
        assert_eq!(c.step(120.0, 20.0).unwrap(), -40.0);
        assert_eq!(c.history().len(), 3);
        assert_eq!(c.history()[2].elapsed_time, 20.0);
    }

    #[test]
    fn configure_clears_history() {
        let mut c = controller(1.0, 10.0);
        c.step(1.0, 0.0).unwrap();
        c.configure(ControlParameters::new(3.0, -5.0).unwrap());
        assert!(c.history().is_empty());
        assert_eq!(c.params().gain(), 3.0);
        assert_eq!(c.last_output(), 0.0);
    }

    #[test]
    fn overflowing_output_is_a_fault() {
        let mut c = controller(f64::MAX, f64::MAX);
        let err = c.step(-f64::MAX, 0.0).unwrap_err();
        assert!(matches!(err, ControlError::NonFiniteOutput { .. }));
        assert_eq!(c.history().len(), 1);
    }

    #[test]
    fn report_for_underdamped_response() {
        let history = samples(&[0.0, 40.0, 95.0, 110.0, 104.0, 101.0, 100.5, 100.0]);
        let report = PerformanceReport::from_history(&history, 100.0);

        assert_eq!(report.sample_count, 8);
        assert_eq!(report.peak_position, Some(110.0));
        assert_eq!(report.overshoot, 10.0);
        assert_eq!(report.overshoot_percent, Some(10.0));
        assert_eq!(report.final_error, Some(0.0));
        // 10% reached at t=10, 90% at t=20.
        assert_eq!(report.rise_time_ms, Some(10.0));
        // Last excursion beyond +/-2 is 104 at t=40.
        assert_eq!(report.settling_time_ms, Some(50.0));
        assert!(report.settled());
    }

    #[test]
    fn report_for_negative_step() {
        let history = samples(&[0.0, -50.0, -90.0, -99.0]);
        let report = PerformanceReport::from_history(&history, -100.0);
        assert_eq!(report.peak_position, Some(-99.0));
        assert_eq!(report.overshoot, 0.0);
        assert_eq!(report.final_error, Some(-1.0));
        assert_eq!(report.settling_time_ms, Some(30.0));
    }

    #[test]
    fn unsettled_response_has_no_settling_time() {
        let history = samples(&[0.0, 10.0, 20.0]);
        let report = PerformanceReport::from_history(&history, 100.0);
        assert_eq!(report.settling_time_ms, None);
        assert_eq!(report.rise_time_ms, None);
        assert!(!report.settled());
    }

    #[test]
    fn empty_history_report() {
        let report = PerformanceReport::from_history(&[], 5.0);
        assert_eq!(report.sample_count, 0);
        assert_eq!(report.final_error, None);
        assert!(!report.settled());
    }

    #[test]
    fn summarize_is_pure() {
        let mut c = controller(0.5, 40.0);
        for (i, p) in [0.0, 20.0, 35.0, 39.5].iter().enumerate() {
            c.step(*p, i as f64 * 10.0).unwrap();
        }
        let a = c.summarize();
        let b = c.summarize();
        assert_eq!(a, b);
        assert_eq!(c.history().len(), 4);
        assert_eq!(a, PerformanceReport::from_history(c.history(), 40.0));
    }

    #[test]
    fn report_serializes_to_json() {
        let report = PerformanceReport::from_history(&samples(&[0.0, 50.0]), 50.0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["sample_count"], 2);
        assert_eq!(json["final_error"], 0.0);
    }
}
