//! `spec.md` §8 scenario 6: a module added downstream of an existing
//! one while the scheduler is running gets picked up by the next
//! replanning pass with a valid `order`; adding one with an unbound
//! required input instead surfaces as a validation error until fixed
//! (this crate's rendition of "rollback": the scheduler refuses to
//! step into a structurally invalid graph rather than silently running
//! a broken one).

mod support;

use progressive_core::{Dataflow, ModuleName, Scheduler};
use support::{CountingSource, Identity};

#[test]
fn module_added_while_running_joins_the_run_list_with_an_order() {
    let _ = env_logger::try_init();
    let mut df = Dataflow::new();
    df.add_module(ModuleName::new("a"), Box::new(CountingSource::new(50, 1))).unwrap();
    df.add_module(ModuleName::new("b"), Box::new(Identity::default())).unwrap();
    df.add_connection(&ModuleName::new("a"), "out", &ModuleName::new("b"), "in")
        .unwrap();

    let mut sched = Scheduler::new(df);
    for _ in 0..3 {
        sched.step_once().unwrap();
    }

    {
        let df = sched.dataflow_mut();
        df.add_module(ModuleName::new("x"), Box::new(Identity::default())).unwrap();
        df.add_connection(&ModuleName::new("b"), "out", &ModuleName::new("x"), "in")
            .unwrap();
    }

    for _ in 0..8 {
        sched.step_once().unwrap();
    }

    let x = sched.dataflow().get(&ModuleName::new("x")).unwrap();
    assert!(x.order.is_some());
}

#[test]
fn module_added_with_unbound_required_input_surfaces_as_an_error() {
    let _ = env_logger::try_init();
    let mut df = Dataflow::new();
    df.add_module(ModuleName::new("a"), Box::new(CountingSource::new(50, 1))).unwrap();
    df.add_module(ModuleName::new("b"), Box::new(Identity::default())).unwrap();
    df.add_connection(&ModuleName::new("a"), "out", &ModuleName::new("b"), "in")
        .unwrap();

    let mut sched = Scheduler::new(df);
    sched.step_once().unwrap();

    sched
        .dataflow_mut()
        .add_module(ModuleName::new("orphan"), Box::new(Identity::default()))
        .unwrap();
    // "orphan" declares a required "in" input that is never connected.

    let mut saw_error = false;
    for _ in 0..8 {
        if sched.step_once().is_err() {
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "an unbound required input should block the scheduler from proceeding");

    sched
        .dataflow_mut()
        .add_connection(&ModuleName::new("a"), "out", &ModuleName::new("orphan"), "in")
        .unwrap();
    for _ in 0..8 {
        sched.step_once().unwrap();
    }
}
