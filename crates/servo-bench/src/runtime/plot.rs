//! Terminal rendering of collected step responses.
//!
//! Traces accumulate across runs so successive responses can be compared on
//! one chart until the session clears them.

use servo_link::RunTrace;
use std::fmt;

pub const TITLE: &str = "Step Response";
pub const X_LABEL: &str = "Time (ms)";
pub const Y_LABEL: &str = "Position";

const MARKERS: [char; 5] = ['*', '+', 'o', 'x', '#'];

pub struct StepPlot {
    traces: Vec<RunTrace>,
    width: usize,
    height: usize,
}

impl Default for StepPlot {
    fn default() -> Self {
        Self::new(60, 16)
    }
}

impl StepPlot {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            traces: Vec::new(),
            width: width.max(2),
            height: height.max(2),
        }
    }

    pub fn add(&mut self, trace: RunTrace) {
        self.traces.push(trace);
    }

    pub fn clear(&mut self) {
        self.traces.clear();
    }

    pub fn traces(&self) -> &[RunTrace] {
        &self.traces
    }

    pub fn is_empty(&self) -> bool {
        self.traces.iter().all(|t| t.samples.is_empty())
    }

    fn bounds(&self) -> (f64, f64, f64) {
        let mut t_max: f64 = 0.0;
        let mut p_min = f64::INFINITY;
        let mut p_max = f64::NEG_INFINITY;
        for trace in &self.traces {
            if trace.samples.is_empty() {
                continue;
            }
            p_min = p_min.min(trace.params.setpoint());
            p_max = p_max.max(trace.params.setpoint());
            for s in &trace.samples {
                t_max = t_max.max(s.elapsed_time);
                p_min = p_min.min(s.position);
                p_max = p_max.max(s.position);
            }
        }
        if p_max - p_min < f64::EPSILON {
            p_min -= 1.0;
            p_max += 1.0;
        }
        (t_max.max(1.0), p_min, p_max)
    }

    fn grid(&self, t_max: f64, p_min: f64, p_max: f64) -> Vec<Vec<char>> {
        let mut grid = vec![vec![' '; self.width]; self.height];
        let cols = (self.width - 1) as f64;
        let rows = (self.height - 1) as f64;
        for (i, trace) in self.traces.iter().enumerate() {
            let marker = MARKERS[i % MARKERS.len()];
            for s in &trace.samples {
                let col = ((s.elapsed_time.max(0.0) / t_max) * cols).round() as usize;
                let row = (((p_max - s.position) / (p_max - p_min)) * rows).round() as usize;
                grid[row.min(self.height - 1)][col.min(self.width - 1)] = marker;
            }
        }
        grid
    }
}

impl fmt::Display for StepPlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{TITLE}")?;
        if self.is_empty() {
            return writeln!(f, "(nothing plotted)");
        }

        let (t_max, p_min, p_max) = self.bounds();
        writeln!(f, "{Y_LABEL}")?;
        for (r, row) in self.grid(t_max, p_min, p_max).iter().enumerate() {
            let label = if r == 0 {
                format!("{p_max:.1}")
            } else if r == self.height - 1 {
                format!("{p_min:.1}")
            } else {
                String::new()
            };
            let line: String = row.iter().collect();
            writeln!(f, "{label:>10} |{}", line.trim_end())?;
        }
        writeln!(f, "{:>10} +{}", "", "-".repeat(self.width))?;
        let t_label = format!("{t_max:.1}");
        writeln!(
            f,
            "{:>10}  0{}{t_label}",
            "",
            " ".repeat(self.width.saturating_sub(1 + t_label.len()))
        )?;
        writeln!(f, "{:>10}  {:^width$}", "", X_LABEL, width = self.width)?;

        for (i, trace) in self.traces.iter().enumerate() {
            writeln!(
                f,
                "  {} KP={} Setpoint={}",
                MARKERS[i % MARKERS.len()],
                trace.params.gain(),
                trace.params.setpoint()
            )?;
        }
        Ok(())
    }
}

/// Sample table for one run, followed by its summary.
pub fn render_table(trace: &RunTrace) -> String {
    let mut out = format!("{:>10}  {:>10}\n", X_LABEL, Y_LABEL);
    for s in &trace.samples {
        out.push_str(&format!("{:>10.1}  {:>10.1}\n", s.elapsed_time, s.position));
    }
    out.push_str(&format!("{}\n", trace.report()));
    out
}
