//! Per-module step-timing history (`spec.md` §4.4, §9).
//!
//! Grounded in the teacher's `PerfCounter` (`observability/perf_counter.rs`):
//! a small struct of counters updated on the hot path, read back in bulk
//! for reporting. Here the "hot path" is `Module::run`'s step loop, and
//! the "report" is [`Tracer::trace_stats`], consumed by [`crate::predictor::TimePredictor`].

use std::time::{Duration, Instant};

use serde::Serialize;

/// One row of the trace: everything observed about a single `run_number`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub run_number: u64,
    #[serde(skip)]
    pub start: Instant,
    pub duration: Duration,
    pub steps: u32,
    pub reads: usize,
    pub updates: usize,
    pub creates: usize,
    pub stopped: bool,
    pub exception: bool,
    pub terminated: bool,
    pub progress_current: usize,
    pub progress_max: usize,
    pub quality: f64,
}

/// A bounded ring of recent [`TraceEntry`] rows plus the handful of
/// lifecycle events (`start_run`/`exception`/`terminated`) a module's
/// run loop reports at its boundaries. Unlike the Python `Tracer` base
/// class (an abstract interface with several concrete backends, e.g.
/// one that prints, one that's a no-op), this core needs exactly one
/// concrete behavior — accumulate timing stats for the predictor — so
/// it is a concrete struct rather than a trait.
#[derive(Debug, Clone)]
pub struct Tracer {
    entries: Vec<TraceEntry>,
    capacity: usize,
    current: Option<TraceEntry>,
    run_step_start: Option<Instant>,
}

impl Default for Tracer {
    fn default() -> Self {
        Tracer::new()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Tracer {
            entries: Vec::new(),
            capacity: 64,
            current: None,
            run_step_start: None,
        }
    }

    pub fn start_run(&mut self, now: Instant, run_number: u64) {
        self.current = Some(TraceEntry {
            run_number,
            start: now,
            duration: Duration::ZERO,
            steps: 0,
            reads: 0,
            updates: 0,
            creates: 0,
            stopped: false,
            exception: false,
            terminated: false,
            progress_current: 0,
            progress_max: 0,
            quality: 0.0,
        });
    }

    pub fn before_run_step(&mut self, now: Instant, _run_number: u64) {
        self.run_step_start = Some(now);
    }

    pub fn after_run_step(&mut self, now: Instant, _run_number: u64, reads: usize, updates: usize, creates: usize) {
        if let Some(entry) = self.current.as_mut() {
            if let Some(start) = self.run_step_start.take() {
                entry.duration += now.saturating_duration_since(start);
            }
            entry.steps += 1;
            entry.reads += reads;
            entry.updates += updates;
            entry.creates += creates;
        }
    }

    pub fn run_stopped(&mut self, _now: Instant, _run_number: u64) {
        if let Some(entry) = self.current.as_mut() {
            entry.stopped = true;
        }
    }

    pub fn exception(&mut self, _now: Instant, _run_number: u64) {
        if let Some(entry) = self.current.as_mut() {
            entry.exception = true;
        }
    }

    pub fn terminated(&mut self, _now: Instant, _run_number: u64) {
        if let Some(entry) = self.current.as_mut() {
            entry.terminated = true;
        }
    }

    pub fn end_run(&mut self, _now: Instant, _run_number: u64, progress_current: usize, progress_max: usize, quality: f64) {
        if let Some(mut entry) = self.current.take() {
            entry.progress_current = progress_current;
            entry.progress_max = progress_max;
            entry.quality = quality;
            if self.entries.len() == self.capacity {
                self.entries.remove(0);
            }
            self.entries.push(entry);
        }
    }

    /// The last `max_runs` entries (or all of them), most recent last.
    pub fn trace_stats(&self, max_runs: Option<usize>) -> &[TraceEntry] {
        match max_runs {
            Some(n) if n < self.entries.len() => &self.entries[self.entries.len() - n..],
            _ => &self.entries,
        }
    }

    /// Rows/second for each recorded run, oldest first, used for
    /// introspection (`Module::to_json`'s `speed` field — `spec.md` §6
    /// documents this as an array, not a single aggregate).
    pub fn get_speed(&self) -> Vec<f64> {
        self.entries
            .iter()
            .map(|e| {
                let secs = e.duration.as_secs_f64();
                if secs > 0.0 {
                    e.updates as f64 / secs
                } else {
                    0.0
                }
            })
            .collect()
    }
}
