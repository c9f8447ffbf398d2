//! Minimal module kinds used only by the integration tests — the Rust
//! stand-ins for the Python source's `Every`/`Print` demo modules
//! (`original_source/progressivis/core/module.py`). Kept under
//! `tests/support/` rather than exposed from the crate: they exist to
//! drive the scheduler, not to be a supported public API.

use std::time::Duration;

use progressive_core::module::{ModuleLogic, ReadinessContext, StepContext, StepOutcome, StepResult};
use progressive_core::{ModuleError, ModuleState, RowId, SlotDescriptor};

/// Emits `per_step` fresh row-ids per quantum step until `total` rows
/// have been emitted, then reports `Zombie`.
pub struct CountingSource {
    pub next_id: RowId,
    pub total: RowId,
    pub per_step: usize,
}

impl CountingSource {
    pub fn new(total: RowId, per_step: usize) -> Self {
        CountingSource {
            next_id: 0,
            total,
            per_step,
        }
    }
}

impl ModuleLogic for CountingSource {
    fn type_name(&self) -> &'static str {
        "counting_source"
    }

    fn output_descriptors(&self) -> Vec<SlotDescriptor> {
        vec![SlotDescriptor::new("out", "table", false)]
    }

    fn is_input(&self) -> bool {
        true
    }

    fn is_data_input(&self) -> bool {
        true
    }

    fn predict_step_size_override(&self, _duration: Duration) -> Option<usize> {
        Some(self.per_step)
    }

    fn run_step(
        &mut self,
        ctx: &mut StepContext,
        _run_number: u64,
        step_size: usize,
        _howlong: Duration,
    ) -> Result<StepOutcome, ModuleError> {
        let take = step_size.min(self.per_step);
        let remaining = self.total - self.next_id;
        let take = (take as u64).min(remaining) as usize;
        let ids: Vec<RowId> = (self.next_id..self.next_id + take as u64).collect();
        self.next_id += take as u64;
        ctx.emit_created("out", ids.iter().copied());
        let next = if self.next_id >= self.total {
            ModuleState::Zombie
        } else {
            ModuleState::Ready
        };
        Ok(StepOutcome::Ran(
            StepResult::new(next, ids.len().max(1)).creates(ids.len()),
        ))
    }
}

/// Drains its single input, re-emitting every created id unchanged on
/// its own `out` output, tracking everything it has ever seen.
pub struct Identity {
    pub seen: Vec<RowId>,
}

impl Default for Identity {
    fn default() -> Self {
        Identity { seen: Vec::new() }
    }
}

impl ModuleLogic for Identity {
    fn type_name(&self) -> &'static str {
        "identity"
    }

    fn input_descriptors(&self) -> Vec<SlotDescriptor> {
        vec![SlotDescriptor::new("in", "table", true)]
    }

    fn output_descriptors(&self) -> Vec<SlotDescriptor> {
        vec![SlotDescriptor::new("out", "table", false)]
    }

    fn run_step(
        &mut self,
        ctx: &mut StepContext,
        _run_number: u64,
        step_size: usize,
        _howlong: Duration,
    ) -> Result<StepOutcome, ModuleError> {
        let ids = ctx.input("in").map(|s| s.created.next(step_size)).unwrap_or_default();
        self.seen.extend(ids.iter().copied());
        ctx.emit_created("out", ids.iter().copied());
        let next = if ids.is_empty() {
            ModuleState::Blocked
        } else {
            ModuleState::Ready
        };
        Ok(StepOutcome::Ran(StepResult::new(next, ids.len().max(1)).creates(ids.len())))
    }
}

/// A terminal consumer that never re-emits, marked as a visualization
/// so reachability pruning has a sink to reach.
pub struct Viz {
    pub seen: Vec<RowId>,
}

impl Default for Viz {
    fn default() -> Self {
        Viz { seen: Vec::new() }
    }
}

impl ModuleLogic for Viz {
    fn type_name(&self) -> &'static str {
        "viz"
    }

    fn input_descriptors(&self) -> Vec<SlotDescriptor> {
        vec![SlotDescriptor::new("in", "table", true)]
    }

    fn is_visualization(&self) -> bool {
        true
    }

    fn run_step(
        &mut self,
        ctx: &mut StepContext,
        _run_number: u64,
        step_size: usize,
        _howlong: Duration,
    ) -> Result<StepOutcome, ModuleError> {
        let ids = ctx.input("in").map(|s| s.created.next(step_size)).unwrap_or_default();
        self.seen.extend(ids.iter().copied());
        let next = if ids.is_empty() {
            ModuleState::Blocked
        } else {
            ModuleState::Ready
        };
        Ok(StepOutcome::Ran(StepResult::new(next, ids.len().max(1))))
    }
}

/// A module with no inputs that is always ready and always has more
/// work, used to prove an unrelated module is starved while the
/// scheduler is in interaction mode.
pub struct Heavy {
    pub steps_taken: u64,
}

impl Default for Heavy {
    fn default() -> Self {
        Heavy { steps_taken: 0 }
    }
}

impl ModuleLogic for Heavy {
    fn type_name(&self) -> &'static str {
        "heavy"
    }

    fn run_step(
        &mut self,
        _ctx: &mut StepContext,
        _run_number: u64,
        _step_size: usize,
        _howlong: Duration,
    ) -> Result<StepOutcome, ModuleError> {
        self.steps_taken += 1;
        Ok(StepOutcome::Ran(StepResult::new(ModuleState::Ready, 1)))
    }
}

/// An interactive input that is never ready on its own — only an
/// external `for_input` call would ever make its downstream consumers
/// runnable. Models a live UI widget: even once every data source has
/// terminated, its mere presence keeps the scheduler hibernating
/// (waiting for interaction) instead of fully stopping (`spec.md` §8
/// scenario 5, `spec.md` §4.4).
pub struct LiveInteractiveInput;

impl ModuleLogic for LiveInteractiveInput {
    fn type_name(&self) -> &'static str {
        "live_interactive_input"
    }

    fn is_input(&self) -> bool {
        true
    }

    fn is_ready_override(&self, _ctx: &ReadinessContext) -> Option<bool> {
        Some(false)
    }

    fn run_step(
        &mut self,
        _ctx: &mut StepContext,
        _run_number: u64,
        _step_size: usize,
        _howlong: Duration,
    ) -> Result<StepOutcome, ModuleError> {
        Ok(StepOutcome::Ran(StepResult::new(ModuleState::Blocked, 1)))
    }
}

/// A module whose readiness is forced externally, used to model a UI
/// input widget in the interaction-prioritization scenario.
pub struct ManualInput {
    pub ready: bool,
}

impl Default for ManualInput {
    fn default() -> Self {
        ManualInput { ready: true }
    }
}

impl ModuleLogic for ManualInput {
    fn type_name(&self) -> &'static str {
        "manual_input"
    }

    fn output_descriptors(&self) -> Vec<SlotDescriptor> {
        vec![SlotDescriptor::new("out", "table", false)]
    }

    fn is_input(&self) -> bool {
        true
    }

    fn is_ready_override(&self, _ctx: &ReadinessContext) -> Option<bool> {
        Some(self.ready)
    }

    fn run_step(
        &mut self,
        ctx: &mut StepContext,
        _run_number: u64,
        _step_size: usize,
        _howlong: Duration,
    ) -> Result<StepOutcome, ModuleError> {
        ctx.emit_created("out", [0]);
        self.ready = false;
        Ok(StepOutcome::Ran(StepResult::new(ModuleState::Blocked, 1).creates(1)))
    }
}
