//! `spec.md` §8 scenario 3: A→B required, B→A optional. The strict
//! topological sort fails on the cycle; retrying with only required
//! dependencies succeeds and adopts order A, B.

mod support;

use progressive_core::module::{ModuleLogic, StepContext, StepOutcome, StepResult};
use progressive_core::{Dataflow, ModuleError, ModuleName, ModuleState, SlotDescriptor};
use std::time::Duration;

struct Passthrough {
    input_required: bool,
}

impl ModuleLogic for Passthrough {
    fn type_name(&self) -> &'static str {
        "passthrough"
    }
    fn input_descriptors(&self) -> Vec<SlotDescriptor> {
        vec![SlotDescriptor::new("in", "any", self.input_required)]
    }
    fn output_descriptors(&self) -> Vec<SlotDescriptor> {
        vec![SlotDescriptor::new("out", "any", false)]
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

#[test]
fn cycle_with_one_optional_edge_resolves_to_a_then_b() {
    let _ = env_logger::try_init();
    let mut df = Dataflow::new();
    // A's "in" is bound to B (optional); B's "in" is bound to A (required).
    df.add_module(ModuleName::new("a"), Box::new(Passthrough { input_required: false }))
        .unwrap();
    df.add_module(ModuleName::new("b"), Box::new(Passthrough { input_required: true }))
        .unwrap();
    df.add_connection(&ModuleName::new("a"), "out", &ModuleName::new("b"), "in")
        .unwrap();
    df.add_connection(&ModuleName::new("b"), "out", &ModuleName::new("a"), "in")
        .unwrap();

    let deps_all = df.collect_dependencies(false);
    assert!(deps_all[&ModuleName::new("a")].contains(&ModuleName::new("b")));
    assert!(deps_all[&ModuleName::new("b")].contains(&ModuleName::new("a")));

    let order = df.order_modules().unwrap();
    assert_eq!(order, vec![ModuleName::new("a"), ModuleName::new("b")]);
}
