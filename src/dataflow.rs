//! The module graph: staging area for connecting modules, ordering them,
//! and validating that required inputs are bound (`spec.md` §4.1).
//!
//! Grounded in `original_source/progressivis/core/dataflow.py`'s
//! `Dataflow` class (`add_module`/`remove_module`/`add_connection`/
//! `collect_dependencies`/`order_modules`/`validate`), translated from
//! its `Slot` namedtuple (referenced from both a producer's and a
//! consumer's dict) into this crate's single shared [`Slot`] stored
//! once on the consumer side, with producers keeping only
//! `(consumer, input_name)` fan-out pointers — the representation
//! decision recorded in `DESIGN.md` to sidestep needing `Rc<RefCell<_>>`
//! for a value referenced from two maps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::DataflowError;
use crate::module::{Module, ModuleLogic, ModuleState, ReadinessContext, InputReadiness};
use crate::name::ModuleName;
use crate::slot::Slot;

/// The staging graph of modules and their connections. Mutations
/// (`add_module`, `add_connection`, `remove_module`) take effect
/// immediately; `order_modules`/`validate` are the "commit" checks run
/// before a [`crate::scheduler::Scheduler`] starts consuming the graph.
#[derive(Default)]
pub struct Dataflow {
    modules: HashMap<ModuleName, Module>,
}

impl Dataflow {
    pub fn new() -> Self {
        Dataflow {
            modules: HashMap::new(),
        }
    }

    pub fn modules(&self) -> &HashMap<ModuleName, Module> {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut HashMap<ModuleName, Module> {
        &mut self.modules
    }

    pub fn get(&self, name: &ModuleName) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn get_mut(&mut self, name: &ModuleName) -> Option<&mut Module> {
        self.modules.get_mut(name)
    }

    /// Generate a name for a module given its type prefix: `<prefix>_1`
    /// through `<prefix>_9`, first one unused; once those nine are all
    /// taken, fall back to a process-wide monotonic suffix rather than
    /// the source's `uuid4()` (`spec.md` §3 "scheduler-generated
    /// `<type>_<n>` or UUID suffix if congested"; no crate in this
    /// codebase's dependency stack pulls in `uuid`, so the congestion
    /// fallback is a plain counter instead — still guaranteed unique,
    /// just not random).
    pub fn generate_name(&self, prefix: &str) -> ModuleName {
        for i in 1..10 {
            let candidate = format!("{prefix}_{i}");
            if !self.modules.contains_key(candidate.as_str()) {
                return ModuleName::new(candidate);
            }
        }
        static CONGESTION_COUNTER: AtomicU64 = AtomicU64::new(0);
        loop {
            let suffix = CONGESTION_COUNTER.fetch_add(1, Ordering::Relaxed);
            let candidate = format!("{prefix}_{suffix}");
            if !self.modules.contains_key(candidate.as_str()) {
                return ModuleName::new(candidate);
            }
        }
    }

    pub fn add_module(&mut self, name: ModuleName, logic: Box<dyn ModuleLogic>) -> Result<(), DataflowError> {
        if self.modules.contains_key(&name) {
            return Err(DataflowError::DuplicateModuleName(name.to_string()));
        }
        self.modules.insert(name.clone(), Module::new(name, logic));
        Ok(())
    }

    /// Terminate and unwire a module: every producer that fed it loses
    /// the corresponding fan-out entry, and every consumer it fed has
    /// that input slot cleared back to unbound (`spec.md` §4.1).
    pub fn remove_module(&mut self, name: &ModuleName) -> Result<(), DataflowError> {
        let module = self
            .modules
            .get(name)
            .ok_or_else(|| DataflowError::UnknownModule(name.to_string()))?;

        let bound_inputs: Vec<(ModuleName, String)> = module
            .input_slots()
            .values()
            .filter_map(|s| s.as_ref().map(|slot| (slot.producer.clone(), slot.output_name.clone())))
            .collect();
        let fanouts: Vec<(String, Vec<(ModuleName, String)>)> = module
            .output_fanout()
            .iter()
            .map(|(o, v)| (o.clone(), v.clone()))
            .collect();

        for (producer, output_name) in &bound_inputs {
            if let Some(p) = self.modules.get_mut(producer) {
                if let Some(list) = p.output_fanout_mut().get_mut(output_name) {
                    list.retain(|(consumer, _)| consumer != name);
                }
            }
        }
        for (_, consumers) in &fanouts {
            for (consumer, input_name) in consumers {
                if let Some(c) = self.modules.get_mut(consumer) {
                    c.input_slots_mut().insert(input_name.clone(), None);
                }
            }
        }

        let module = self.modules.get_mut(name).expect("checked above");
        module.set_state(ModuleState::Terminated);
        self.modules.remove(name);
        Ok(())
    }

    /// Bind `producer.output -> consumer.input`. Rejects unknown
    /// modules/slots, an already-bound input, and a type mismatch
    /// (`spec.md` §4.1, §4.3).
    pub fn add_connection(
        &mut self,
        producer: &ModuleName,
        output: &str,
        consumer: &ModuleName,
        input: &str,
    ) -> Result<(), DataflowError> {
        let producer_type = {
            let p = self
                .modules
                .get(producer)
                .ok_or_else(|| DataflowError::UnknownModule(producer.to_string()))?;
            p.output_descriptors()
                .get(output)
                .map(|d| d.payload_type)
                .ok_or_else(|| DataflowError::UnknownSlot {
                    module: producer.to_string(),
                    slot: output.to_string(),
                })?
        };
        let consumer_type = {
            let c = self
                .modules
                .get(consumer)
                .ok_or_else(|| DataflowError::UnknownModule(consumer.to_string()))?;
            if c.input_slots().get(input).map(|s| s.is_some()).unwrap_or(false) {
                return Err(DataflowError::InputAlreadyBound {
                    module: consumer.to_string(),
                    input: input.to_string(),
                });
            }
            c.input_descriptors()
                .get(input)
                .map(|d| d.payload_type)
                .ok_or_else(|| DataflowError::UnknownSlot {
                    module: consumer.to_string(),
                    slot: input.to_string(),
                })?
        };

        let slot = Slot::new(producer.clone(), output, consumer.clone(), input, producer_type, consumer_type);
        if !slot.validate_types() {
            return Err(DataflowError::SlotTypeMismatch {
                producer: producer.to_string(),
                output: output.to_string(),
                consumer: consumer.to_string(),
                input: input.to_string(),
                producer_type: producer_type.to_string(),
                consumer_type: consumer_type.to_string(),
            });
        }

        self.modules
            .get_mut(consumer)
            .expect("checked above")
            .input_slots_mut()
            .insert(input.to_string(), Some(slot));
        self.modules
            .get_mut(producer)
            .expect("checked above")
            .output_fanout_mut()
            .entry(output.to_string())
            .or_default()
            .push((consumer.clone(), input.to_string()));
        Ok(())
    }

    /// Producers each bound input depends on. With `only_required`,
    /// optional (unbound-tolerant) inputs are excluded — used to retry
    /// the topological sort after a cycle involving only optional edges
    /// (`spec.md` §4.1).
    pub fn collect_dependencies(&self, only_required: bool) -> HashMap<ModuleName, HashSet<ModuleName>> {
        let mut deps = HashMap::new();
        for (name, m) in &self.modules {
            let mut producers = HashSet::new();
            for (iname, slot_opt) in m.input_slots() {
                let Some(slot) = slot_opt else { continue };
                if only_required {
                    let required = m.input_descriptors().get(iname.as_str()).map(|d| d.required).unwrap_or(false);
                    if !required {
                        continue;
                    }
                }
                producers.insert(slot.producer.clone());
            }
            deps.insert(name.clone(), producers);
        }
        deps
    }

    fn toposort(&self, only_required: bool) -> Result<Vec<ModuleName>, DataflowError> {
        let deps = self.collect_dependencies(only_required);
        let mut indegree: HashMap<ModuleName, usize> = HashMap::new();
        let mut consumers: HashMap<ModuleName, Vec<ModuleName>> = HashMap::new();
        for name in self.modules.keys() {
            indegree.insert(name.clone(), 0);
        }
        for (name, producers) in &deps {
            indegree.insert(name.clone(), producers.len());
            for p in producers {
                consumers.entry(p.clone()).or_default().push(name.clone());
            }
        }

        let mut initial: Vec<ModuleName> = indegree.iter().filter(|(_, &d)| d == 0).map(|(n, _)| n.clone()).collect();
        initial.sort();
        let mut queue: VecDeque<ModuleName> = initial.into();
        let mut order = Vec::with_capacity(self.modules.len());

        while let Some(n) = queue.pop_front() {
            order.push(n.clone());
            if let Some(cs) = consumers.get(&n) {
                let mut newly_free = Vec::new();
                for c in cs {
                    let d = indegree.get_mut(c).expect("consumer present");
                    *d -= 1;
                    if *d == 0 {
                        newly_free.push(c.clone());
                    }
                }
                newly_free.sort();
                for c in newly_free {
                    queue.push_back(c);
                }
            }
        }

        if order.len() != self.modules.len() {
            let mut remaining: Vec<String> = indegree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            remaining.sort();
            return Err(DataflowError::Cycle(remaining));
        }
        Ok(order)
    }

    /// Topologically order the modules, assigning each its `order`
    /// index. On a cycle, retry using only required dependencies — a
    /// cycle built entirely from optional edges is not a real
    /// scheduling deadlock (`spec.md` §4.1, §8 scenario 3).
    pub fn order_modules(&mut self) -> Result<Vec<ModuleName>, DataflowError> {
        let order = match self.toposort(false) {
            Ok(order) => order,
            Err(DataflowError::Cycle(_)) => self.toposort(true)?,
            Err(e) => return Err(e),
        };
        for (i, name) in order.iter().enumerate() {
            if let Some(m) = self.modules.get_mut(name) {
                m.order = Some(i);
            }
        }
        Ok(order)
    }

    /// Check every module's required inputs are bound, marking failures
    /// `Invalid` (`spec.md` §4.1).
    pub fn validate(&mut self) -> Result<(), DataflowError> {
        let mut invalid = Vec::new();
        for (name, m) in self.modules.iter_mut() {
            if !m.validate_inputs() {
                m.set_state(ModuleState::Invalid);
                invalid.push(name.to_string());
                continue;
            }
            if m.state() == ModuleState::Invalid {
                m.set_state(ModuleState::Created);
            }
            // First transition out of `Created` (`spec.md` §3): a module
            // with no bound inputs can run immediately, one with bound
            // inputs starts out waiting for its producers.
            if m.state() == ModuleState::Created {
                // A source with no inputs is always ready regardless of
                // its recorded state (`Module::is_ready`'s early-return
                // branch), but an interactive input with nothing bound
                // yet should read as waiting, not runnable, so
                // `all_blocked` can see it.
                let initial = if m.has_any_input() || m.is_input() {
                    ModuleState::Blocked
                } else {
                    ModuleState::Ready
                };
                m.set_state(initial);
            }
        }
        if invalid.is_empty() {
            Ok(())
        } else {
            invalid.sort();
            Err(DataflowError::Invalid { modules: invalid })
        }
    }

    pub fn validate_module(&self, name: &ModuleName) -> bool {
        self.modules.get(name).map(|m| m.validate_inputs()).unwrap_or(false)
    }

    /// Pull every producer log a module's bound inputs reference,
    /// updating that module's slot cursors. Run immediately before a
    /// module's quantum and before its readiness is evaluated (`spec.md`
    /// §4.3).
    pub fn sync_inputs(&mut self, name: &ModuleName, run_number: u64) {
        let bindings: Vec<(String, ModuleName, String)> = match self.modules.get(name) {
            Some(m) => m
                .input_slots()
                .iter()
                .filter_map(|(iname, s)| s.as_ref().map(|slot| (iname.clone(), slot.producer.clone(), slot.output_name.clone())))
                .collect(),
            None => return,
        };
        for (iname, producer, output_name) in bindings {
            let log = match self.modules.get(&producer).and_then(|p| p.output_log(&output_name)) {
                Some(log) => log.clone(),
                None => continue,
            };
            if let Some(m) = self.modules.get_mut(name) {
                if let Some(Some(slot)) = m.input_slots_mut().get_mut(&iname) {
                    slot.update(&log, run_number);
                }
            }
        }
    }

    /// Resolve cross-module readiness facts (producer state and
    /// staleness) for `Module::is_ready`'s default algorithm.
    pub fn readiness_context(&self, name: &ModuleName) -> ReadinessContext {
        let mut inputs = HashMap::new();
        if let Some(m) = self.modules.get(name) {
            for (iname, slot_opt) in m.input_slots() {
                let Some(slot) = slot_opt else { continue };
                let producer = self.modules.get(&slot.producer);
                let ready = slot.has_buffered()
                    || producer.map(|p| p.last_update() > slot.last_update()).unwrap_or(false);
                let terminal = producer
                    .map(|p| matches!(p.state(), ModuleState::Terminated | ModuleState::Invalid))
                    .unwrap_or(true);
                inputs.insert(iname.clone(), InputReadiness { ready, terminal });
            }
        }
        ReadinessContext { inputs }
    }

    /// For every module, whether it is itself a visualization or can
    /// reach one by forward edges. The scheduler prunes modules that
    /// reach no visualization from its run list, a BFS-per-node
    /// rendition of `_compute_reachability`'s `scipy.sparse.csgraph`
    /// shortest-path pruning (`spec.md` §4.4, original_source's
    /// `scheduler_base.py`).
    pub fn reachability(&self) -> HashMap<ModuleName, bool> {
        if !self.modules.values().any(|m| m.is_visualization()) {
            // No visualization declared anywhere in the graph: pruning
            // would otherwise drop every module, which makes no sense
            // for a headless pipeline. Treat everything as reachable.
            return self.modules.keys().cloned().map(|n| (n, true)).collect();
        }
        let mut forward: HashMap<ModuleName, Vec<ModuleName>> = HashMap::new();
        for (name, m) in &self.modules {
            for consumers in m.output_fanout().values() {
                for (consumer, _) in consumers {
                    forward.entry(name.clone()).or_default().push(consumer.clone());
                }
            }
        }
        let mut reach = HashMap::new();
        for name in self.modules.keys() {
            let mut seen: HashSet<ModuleName> = HashSet::new();
            let mut queue = VecDeque::new();
            seen.insert(name.clone());
            queue.push_back(name.clone());
            let mut found = false;
            while let Some(cur) = queue.pop_front() {
                if self.modules.get(&cur).map(|m| m.is_visualization()).unwrap_or(false) {
                    found = true;
                    break;
                }
                if let Some(next) = forward.get(&cur) {
                    for n in next {
                        if seen.insert(n.clone()) {
                            queue.push_back(n.clone());
                        }
                    }
                }
            }
            reach.insert(name.clone(), found);
        }
        reach
    }

    /// Every module reachable by forward edges from `from` (inclusive),
    /// used by the scheduler to decide which modules belong to the
    /// currently-prioritized interaction path (`spec.md` §4.4).
    pub fn forward_reachable(&self, from: &ModuleName) -> HashSet<ModuleName> {
        let mut forward: HashMap<ModuleName, Vec<ModuleName>> = HashMap::new();
        for (name, m) in &self.modules {
            for consumers in m.output_fanout().values() {
                for (consumer, _) in consumers {
                    forward.entry(name.clone()).or_default().push(consumer.clone());
                }
            }
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(from.clone());
        queue.push_back(from.clone());
        while let Some(cur) = queue.pop_front() {
            if let Some(next) = forward.get(&cur) {
                for n in next {
                    if seen.insert(n.clone()) {
                        queue.push_back(n.clone());
                    }
                }
            }
        }
        seen
    }

    /// `run_number`/`is_running`/`is_terminated` are scheduler state, not
    /// module state (the Python source's `Module.to_json` reads them off
    /// `self.scheduler()`; this crate has no such back-reference, so the
    /// caller — the owning `Scheduler` — passes them in instead).
    pub fn to_json(&self, short: bool, run_number: u64, is_running: bool, is_terminated: bool) -> serde_json::Value {
        let modules: serde_json::Map<String, serde_json::Value> = self
            .modules
            .iter()
            .map(|(name, m)| (name.to_string(), m.to_json(short, run_number, is_running, is_terminated)))
            .collect();
        serde_json::Value::Object(modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ModuleError;
    use crate::module::{StepContext, StepOutcome, StepResult};
    use crate::slot::SlotDescriptor;
    use std::time::Duration;

    struct Source;
    impl ModuleLogic for Source {
        fn type_name(&self) -> &'static str {
            "source"
        }
        fn output_descriptors(&self) -> Vec<SlotDescriptor> {
            vec![SlotDescriptor::new("out", "table", false)]
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

    struct Sink;
    impl ModuleLogic for Sink {
        fn type_name(&self) -> &'static str {
            "sink"
        }
        fn input_descriptors(&self) -> Vec<SlotDescriptor> {
            vec![SlotDescriptor::new("in", "table", true)]
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
    fn add_module_rejects_duplicate_names() {
        let mut df = Dataflow::new();
        df.add_module(ModuleName::new("a"), Box::new(Source)).unwrap();
        let err = df.add_module(ModuleName::new("a"), Box::new(Source)).unwrap_err();
        assert!(matches!(err, DataflowError::DuplicateModuleName(_)));
    }

    #[test]
    fn add_connection_rejects_type_mismatch() {
        let mut df = Dataflow::new();
        df.add_module(ModuleName::new("src"), Box::new(Source)).unwrap();
        df.add_module(ModuleName::new("dst"), Box::new(Sink)).unwrap();
        let err = df
            .add_connection(&ModuleName::new("src"), "nonexistent", &ModuleName::new("dst"), "in")
            .unwrap_err();
        assert!(matches!(err, DataflowError::UnknownSlot { .. }));
    }

    #[test]
    fn validate_flags_unbound_required_input() {
        let mut df = Dataflow::new();
        df.add_module(ModuleName::new("dst"), Box::new(Sink)).unwrap();
        let err = df.validate().unwrap_err();
        assert!(matches!(err, DataflowError::Invalid { .. }));
    }

    #[test]
    fn linear_pipeline_orders_producer_before_consumer() {
        let mut df = Dataflow::new();
        df.add_module(ModuleName::new("src"), Box::new(Source)).unwrap();
        df.add_module(ModuleName::new("dst"), Box::new(Sink)).unwrap();
        df.add_connection(&ModuleName::new("src"), "out", &ModuleName::new("dst"), "in")
            .unwrap();
        let order = df.order_modules().unwrap();
        let src_pos = order.iter().position(|n| n.as_str() == "src").unwrap();
        let dst_pos = order.iter().position(|n| n.as_str() == "dst").unwrap();
        assert!(src_pos < dst_pos);
    }

    #[test]
    fn generate_name_probes_numbered_suffixes_before_falling_back() {
        let mut df = Dataflow::new();
        assert_eq!(df.generate_name("src").as_str(), "src_1");
        for i in 1..10 {
            df.add_module(ModuleName::new(format!("src_{i}")), Box::new(Source)).unwrap();
        }
        // All nine numbered slots are taken: the fallback must still be
        // unique and distinct from every `src_1..9` name already bound.
        let congested = df.generate_name("src");
        assert!(!df.modules.contains_key(congested.as_str()));
        for i in 1..10 {
            assert_ne!(congested.as_str(), format!("src_{i}"));
        }
    }

    #[test]
    fn remove_module_unwires_both_sides() {
        let mut df = Dataflow::new();
        df.add_module(ModuleName::new("src"), Box::new(Source)).unwrap();
        df.add_module(ModuleName::new("dst"), Box::new(Sink)).unwrap();
        df.add_connection(&ModuleName::new("src"), "out", &ModuleName::new("dst"), "in")
            .unwrap();
        df.remove_module(&ModuleName::new("src")).unwrap();
        assert!(df.get(&ModuleName::new("src")).is_none());
        let dst = df.get(&ModuleName::new("dst")).unwrap();
        assert!(dst.input_slots()["in"].is_none());
    }

    struct OptionalCycleMember {
        required: bool,
    }
    impl ModuleLogic for OptionalCycleMember {
        fn type_name(&self) -> &'static str {
            "cycle_member"
        }
        fn input_descriptors(&self) -> Vec<SlotDescriptor> {
            vec![SlotDescriptor::new("in", "any", self.required)]
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
    fn cycle_through_an_optional_edge_is_broken_by_required_only_retry() {
        let mut df = Dataflow::new();
        df.add_module(ModuleName::new("a"), Box::new(OptionalCycleMember { required: true }))
            .unwrap();
        df.add_module(ModuleName::new("b"), Box::new(OptionalCycleMember { required: false }))
            .unwrap();
        // a.in <- b.out, b.in <- a.out: a 2-cycle, but b's "in" is optional.
        df.add_connection(&ModuleName::new("b"), "out", &ModuleName::new("a"), "in")
            .unwrap();
        df.add_connection(&ModuleName::new("a"), "out", &ModuleName::new("b"), "in")
            .unwrap();
        assert!(matches!(df.toposort(false), Err(DataflowError::Cycle(_))));
        let order = df.order_modules().unwrap();
        let a_pos = order.iter().position(|n| n.as_str() == "a").unwrap();
        let b_pos = order.iter().position(|n| n.as_str() == "b").unwrap();
        assert!(b_pos < a_pos);
    }
}
