//! Predicts how many rows a module can process in a given time budget.
//!
//! `original_source/` does not retain `time_predictor.py`, so this is
//! designed fresh against the evidence that does survive: the teacher's
//! `PerfCounter` (atomics updated on a hot path, read back for a
//! derived rate) and `spec.md` §4.4's description of "fit a
//! throughput estimate from recent step history; cap growth so a newly
//! fast-looking module doesn't request an enormous step".

use std::time::Duration;

use crate::tracer::TraceEntry;

/// Steps-per-second estimator fit from a module's own recent trace
/// history. A step is "large" per the mean observed throughput of the
/// last `window` runs; `predict` never grows the requested step size
/// past `default_step_size * MAX_GROWTH`, matching the corpus's
/// general caution around runaway self-reported estimates (compare
/// the teacher's capped retry/backoff growth in its worker loops).
#[derive(Debug, Clone)]
pub struct TimePredictor {
    window: usize,
    rows_per_second: Option<f64>,
}

const MAX_GROWTH: usize = 8;

impl Default for TimePredictor {
    fn default() -> Self {
        TimePredictor::new()
    }
}

impl TimePredictor {
    pub fn new() -> Self {
        TimePredictor {
            window: 16,
            rows_per_second: None,
        }
    }

    /// Recompute the throughput estimate from the tracer's recent
    /// history. Runs with zero measured duration (synthetic or
    /// clock-resolution artifacts) are excluded so they cannot produce
    /// an infinite rate.
    pub fn fit(&mut self, history: &[TraceEntry]) {
        let recent = if history.len() > self.window {
            &history[history.len() - self.window..]
        } else {
            history
        };
        let mut total_steps = 0u64;
        let mut total_secs = 0.0f64;
        for entry in recent {
            let secs = entry.duration.as_secs_f64();
            if secs > 0.0 {
                total_steps += u64::from(entry.steps.max(1));
                total_secs += secs;
            }
        }
        self.rows_per_second = if total_secs > 0.0 {
            Some(total_steps as f64 / total_secs)
        } else {
            None
        };
    }

    /// Predict how many rows can be processed within `duration`,
    /// falling back to `default_step_size` until there is enough
    /// history to fit a rate, and capping growth at
    /// `default_step_size * MAX_GROWTH`.
    pub fn predict(&self, duration: Duration, default_step_size: usize) -> usize {
        let Some(rate) = self.rows_per_second else {
            return default_step_size;
        };
        let predicted = (rate * duration.as_secs_f64()).round();
        let predicted = if predicted.is_finite() && predicted >= 1.0 {
            predicted as usize
        } else {
            1
        };
        predicted.min(default_step_size.saturating_mul(MAX_GROWTH)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(run_number: u64, duration: Duration, steps: u32) -> TraceEntry {
        TraceEntry {
            run_number,
            start: std::time::Instant::now(),
            duration,
            steps,
            reads: steps as usize,
            updates: steps as usize,
            creates: 0,
            stopped: false,
            exception: false,
            terminated: false,
            progress_current: 0,
            progress_max: 0,
            quality: 0.0,
        }
    }

    #[test]
    fn falls_back_to_default_with_no_history() {
        let p = TimePredictor::new();
        assert_eq!(p.predict(Duration::from_millis(100), 50), 50);
    }

    #[test]
    fn predicts_proportionally_to_fit_rate() {
        let mut p = TimePredictor::new();
        p.fit(&[entry(1, Duration::from_secs(1), 100)]);
        assert_eq!(p.predict(Duration::from_millis(500), 50), 50);
    }

    #[test]
    fn caps_growth_at_eight_times_default() {
        let mut p = TimePredictor::new();
        p.fit(&[entry(1, Duration::from_millis(10), 10_000)]);
        assert_eq!(p.predict(Duration::from_secs(1), 50), 400);
    }

    #[test]
    fn zero_duration_entries_do_not_pollute_the_fit() {
        let mut p = TimePredictor::new();
        p.fit(&[entry(1, Duration::ZERO, 10_000)]);
        assert_eq!(p.predict(Duration::from_millis(100), 50), 50);
    }
}
