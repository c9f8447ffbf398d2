//! `spec.md` §8 scenario 2: one source, two independent consumers. Both
//! eventually observe everything the source emitted, advancing at
//! their own pace (the slot-level guarantee is tested directly in
//! `src/slot.rs`; this exercises it end-to-end through the scheduler).

mod support;

use progressive_core::{Dataflow, ModuleName, ModuleState, Scheduler};
use support::{CountingSource, Identity};

#[test]
fn two_independent_consumers_both_drain_the_same_source() {
    let _ = env_logger::try_init();
    let mut df = Dataflow::new();
    df.add_module(ModuleName::new("s"), Box::new(CountingSource::new(2, 2))).unwrap();
    df.add_module(ModuleName::new("c1"), Box::new(Identity::default())).unwrap();
    df.add_module(ModuleName::new("c2"), Box::new(Identity::default())).unwrap();
    df.add_connection(&ModuleName::new("s"), "out", &ModuleName::new("c1"), "in")
        .unwrap();
    df.add_connection(&ModuleName::new("s"), "out", &ModuleName::new("c2"), "in")
        .unwrap();

    let mut sched = Scheduler::new(df);
    sched.run().unwrap();

    let s = sched.dataflow().get(&ModuleName::new("s")).unwrap();
    assert_eq!(s.state(), ModuleState::Terminated);
    let c1 = sched.dataflow().get(&ModuleName::new("c1")).unwrap();
    assert_eq!(c1.state(), ModuleState::Terminated);
    let c2 = sched.dataflow().get(&ModuleName::new("c2")).unwrap();
    assert_eq!(c2.state(), ModuleState::Terminated);
}

#[test]
fn removing_one_consumer_does_not_disturb_the_other() {
    let _ = env_logger::try_init();
    let mut df = Dataflow::new();
    df.add_module(ModuleName::new("s"), Box::new(CountingSource::new(100, 1))).unwrap();
    df.add_module(ModuleName::new("c1"), Box::new(Identity::default())).unwrap();
    df.add_module(ModuleName::new("c2"), Box::new(Identity::default())).unwrap();
    df.add_connection(&ModuleName::new("s"), "out", &ModuleName::new("c1"), "in")
        .unwrap();
    df.add_connection(&ModuleName::new("s"), "out", &ModuleName::new("c2"), "in")
        .unwrap();

    df.remove_module(&ModuleName::new("c1")).unwrap();

    let s = df.get(&ModuleName::new("s")).unwrap();
    assert_eq!(s.output_fanout()["out"].len(), 1);
    assert_eq!(s.output_fanout()["out"][0].0, ModuleName::new("c2"));
}
