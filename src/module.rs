//! The module lifecycle and step protocol (`spec.md` §3, §4.2).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::errors::ModuleError;
use crate::name::ModuleName;
use crate::params::{merge_parameters, ParamSpec, ParamValue, Params, ParamsRow};
use crate::predictor::TimePredictor;
use crate::slot::{OutputLog, RowId, Slot, SlotDescriptor, PARAMS_SLOT, TRACE_SLOT};
use crate::tracer::Tracer;
use std::sync::Arc;

/// The module state machine (`spec.md` §3). Discriminants matter: they
/// are used to range-check `next_state` the way the Python source
/// asserts `state_ready <= s <= state_invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Created = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Zombie = 4,
    Terminated = 5,
    Invalid = 6,
}

impl ModuleState {
    fn rank(self) -> u8 {
        self as u8
    }

    /// `next_state` must land in `{Ready, Blocked, Zombie}` per the
    /// step-result contract in `spec.md` §4.2.
    pub fn is_valid_next_state(self) -> bool {
        matches!(self, ModuleState::Ready | ModuleState::Blocked | ModuleState::Zombie)
    }
}

/// What a single `run_step` invocation reports.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub next_state: ModuleState,
    pub steps_run: usize,
    pub reads: usize,
    pub updates: usize,
    pub creates: usize,
}

impl StepResult {
    pub fn new(next_state: ModuleState, steps_run: usize) -> Self {
        StepResult {
            next_state,
            steps_run,
            reads: 0,
            updates: 0,
            creates: 0,
        }
    }

    pub fn reads(mut self, reads: usize) -> Self {
        self.reads = reads;
        self
    }

    pub fn updates(mut self, updates: usize) -> Self {
        self.updates = updates;
        self
    }

    pub fn creates(mut self, creates: usize) -> Self {
        self.creates = creates;
        self
    }

    /// Enforce `creates <= updates`, with the one documented
    /// auto-correction: `creates > 0 && updates == 0` implies every
    /// create is also counted as an update. Anything beyond that is a
    /// hard contract violation (`spec.md` §4.2, §7).
    fn normalize(mut self) -> Result<Self, ModuleError> {
        if self.creates > 0 && self.updates == 0 {
            self.updates = self.creates;
        } else if self.creates > self.updates {
            return Err(ModuleError::CreatesExceedUpdates {
                creates: self.creates,
                updates: self.updates,
            });
        }
        if !self.next_state.is_valid_next_state() {
            return Err(ModuleError::InvalidNextState(self.next_state));
        }
        Ok(self)
    }
}

/// `run_step`'s return, distinguishing a normal result from the
/// "exhausted" signal that used to be carried by Python's
/// `StopIteration` (`spec.md` §9 REDESIGN FLAGS).
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Ran(StepResult),
    Exhausted,
}

/// Per-input readiness facts the scheduler/dataflow resolves by looking
/// across module boundaries (a module cannot see its own producers'
/// state), fed into the default `is_ready` algorithm (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, Default)]
pub struct InputReadiness {
    /// `slot.has_buffered() || producer.last_update() > slot.last_update()`
    pub ready: bool,
    /// producer is Terminated or Invalid
    pub terminal: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReadinessContext {
    pub inputs: HashMap<String, InputReadiness>,
}

/// Mutable view over one module's bound slots and emission logs, handed
/// to `ModuleLogic::run_step` for the duration of a single step. Slot
/// synchronization against producers happens before `run_step` is
/// invoked (see `Dataflow::sync_inputs`), so by the time a module's
/// logic runs, its `ChangeBuffer`s already reflect everything the
/// producer has emitted up to this `run_number`.
pub struct StepContext<'a> {
    pub(crate) inputs: &'a mut HashMap<String, Option<Slot>>,
    pub(crate) outputs: &'a mut HashMap<String, OutputLog>,
    pub(crate) run_number: u64,
}

impl<'a> StepContext<'a> {
    pub fn input(&mut self, name: &str) -> Option<&mut Slot> {
        self.inputs.get_mut(name).and_then(|s| s.as_mut())
    }

    pub fn input_connected(&self, name: &str) -> bool {
        self.inputs.get(name).map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn emit_created(&mut self, output: &str, ids: impl IntoIterator<Item = RowId>) {
        if let Some(log) = self.outputs.get_mut(output) {
            log.emit_created(ids, self.run_number);
        }
    }

    pub fn emit_updated(&mut self, output: &str, ids: impl IntoIterator<Item = RowId>) {
        if let Some(log) = self.outputs.get_mut(output) {
            log.emit_updated(ids, self.run_number);
        }
    }

    pub fn emit_deleted(&mut self, output: &str, ids: impl IntoIterator<Item = RowId>) {
        if let Some(log) = self.outputs.get_mut(output) {
            log.emit_deleted(ids, self.run_number);
        }
    }
}

/// `Slot::has_buffered()` convenience on `next_state`, per `spec.md`
/// §4.2: "the helper `next_state(s)` returns `Ready` if `s` still has
/// buffered deltas else `Blocked`."
pub fn next_state_from_slot(slot: &Slot) -> ModuleState {
    if slot.has_buffered() {
        ModuleState::Ready
    } else {
        ModuleState::Blocked
    }
}

/// Reimplementer-supplied contract for a concrete module kind
/// (`spec.md` §6). Object-safe so `Module` can own it as `Box<dyn
/// ModuleLogic>` — the "closed sum of module kinds" design chosen over a
/// deep class hierarchy (`spec.md` §9).
pub trait ModuleLogic: Send {
    /// A human-readable, snake_case type name, the Rust stand-in for
    /// Python's `pretty_typename()`.
    fn type_name(&self) -> &'static str;

    fn declared_parameters(&self) -> &'static [ParamSpec] {
        &[]
    }

    /// Parameter sources inherited from this kind's conceptual base
    /// types, each returning that base's own (non-merged) declarations.
    /// Mirrors `all_parameters` walking `cls.__bases__` in the Python
    /// metaclass.
    fn parameter_base_chain(&self) -> &'static [fn() -> &'static [ParamSpec]] {
        &[]
    }

    fn input_descriptors(&self) -> Vec<SlotDescriptor> {
        Vec::new()
    }

    fn output_descriptors(&self) -> Vec<SlotDescriptor> {
        Vec::new()
    }

    fn run_step(
        &mut self,
        ctx: &mut StepContext,
        run_number: u64,
        step_size: usize,
        howlong: Duration,
    ) -> Result<StepOutcome, ModuleError>;

    /// Override point for `is_ready`; returning `None` falls back to the
    /// default algorithm (`spec.md` §4.2).
    fn is_ready_override(&self, _ctx: &ReadinessContext) -> Option<bool> {
        None
    }

    /// Override point for step-size prediction; `None` defers to the
    /// module's `TimePredictor`. Constant-time modules (e.g. a
    /// per-iteration print) return `Some(1)`.
    fn predict_step_size_override(&self, _duration: Duration) -> Option<usize> {
        None
    }

    fn get_progress(&self) -> (usize, usize) {
        (0, 0)
    }

    fn get_quality(&self) -> f64 {
        0.0
    }

    fn is_input(&self) -> bool {
        false
    }

    fn is_data_input(&self) -> bool {
        false
    }

    fn is_visualization(&self) -> bool {
        false
    }

    fn starting(&mut self) {}

    fn ending(&mut self) {}
}

/// A named node executing bounded increments of computation (`spec.md`
/// §3). Owns its logic, slot bindings, parameter row, and tracing
/// collaborators.
pub struct Module {
    name: ModuleName,
    state: ModuleState,
    input_descriptors: HashMap<String, SlotDescriptor>,
    output_descriptors: HashMap<String, SlotDescriptor>,
    input_slots: HashMap<String, Option<Slot>>,
    outputs: HashMap<String, OutputLog>,
    output_fanout: HashMap<String, Vec<(ModuleName, String)>>,
    params: Params,
    pub order: Option<usize>,
    steps_acc: u64,
    last_update: u64,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    tracer: Tracer,
    predictor: TimePredictor,
    default_step_size: usize,
    logic: Box<dyn ModuleLogic>,
}

impl Module {
    pub fn new(name: ModuleName, logic: Box<dyn ModuleLogic>) -> Self {
        let mut input_descriptors: HashMap<String, SlotDescriptor> = logic
            .input_descriptors()
            .into_iter()
            .map(|d| (d.name.to_string(), d))
            .collect();
        input_descriptors.insert(
            PARAMS_SLOT.to_string(),
            SlotDescriptor::new(Box::leak(PARAMS_SLOT.to_string().into_boxed_str()), "any", false),
        );

        let mut output_descriptors: HashMap<String, SlotDescriptor> = logic
            .output_descriptors()
            .into_iter()
            .map(|d| (d.name.to_string(), d))
            .collect();
        output_descriptors.insert(
            TRACE_SLOT.to_string(),
            SlotDescriptor::new(Box::leak(TRACE_SLOT.to_string().into_boxed_str()), "any", false),
        );

        let input_slots = input_descriptors.keys().map(|k| (k.clone(), None)).collect();
        let outputs = output_descriptors
            .keys()
            .map(|k| (k.clone(), OutputLog::default()))
            .collect();
        let output_fanout = output_descriptors.keys().map(|k| (k.clone(), Vec::new())).collect();

        let params = Params::new(merge_parameters(
            logic.parameter_base_chain(),
            logic.declared_parameters(),
        ));

        Module {
            name,
            state: ModuleState::Created,
            input_descriptors,
            output_descriptors,
            input_slots,
            outputs,
            output_fanout,
            params,
            order: None,
            steps_acc: 0,
            last_update: 0,
            start_time: None,
            end_time: None,
            tracer: Tracer::new(),
            predictor: TimePredictor::new(),
            default_step_size: 100,
            logic,
        }
    }

    pub fn name(&self) -> &ModuleName {
        &self.name
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn set_state(&mut self, s: ModuleState) {
        self.state = s;
    }

    pub fn steps_acc(&self) -> u64 {
        self.steps_acc
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    pub fn current_params(&self) -> Arc<ParamsRow> {
        self.params.current()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn type_name(&self) -> &'static str {
        self.logic.type_name()
    }

    pub fn is_input(&self) -> bool {
        self.logic.is_input()
    }

    pub fn is_data_input(&self) -> bool {
        self.logic.is_data_input()
    }

    pub fn is_visualization(&self) -> bool {
        self.logic.is_visualization()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ModuleState::Terminated
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ModuleState::Zombie
    }

    pub fn is_valid(&self) -> bool {
        self.state != ModuleState::Invalid
    }

    pub fn is_blocked(&self) -> bool {
        self.state == ModuleState::Blocked
    }

    pub fn input_descriptors(&self) -> &HashMap<String, SlotDescriptor> {
        &self.input_descriptors
    }

    pub fn output_descriptors(&self) -> &HashMap<String, SlotDescriptor> {
        &self.output_descriptors
    }

    pub fn input_slots(&self) -> &HashMap<String, Option<Slot>> {
        &self.input_slots
    }

    pub fn input_slots_mut(&mut self) -> &mut HashMap<String, Option<Slot>> {
        &mut self.input_slots
    }

    pub fn output_log(&self, name: &str) -> Option<&OutputLog> {
        self.outputs.get(name)
    }

    pub fn outputs_mut(&mut self) -> &mut HashMap<String, OutputLog> {
        &mut self.outputs
    }

    pub fn output_fanout(&self) -> &HashMap<String, Vec<(ModuleName, String)>> {
        &self.output_fanout
    }

    pub fn output_fanout_mut(&mut self) -> &mut HashMap<String, Vec<(ModuleName, String)>> {
        &mut self.output_fanout
    }

    pub fn has_any_input(&self) -> bool {
        self.input_slots.values().any(|s| s.is_some())
    }

    /// Validate only existence of required bindings; type checking is
    /// the connecting operation's job (`spec.md` §4.1 / `validate`).
    pub fn validate_inputs(&self) -> bool {
        self.input_descriptors
            .values()
            .filter(|d| d.required)
            .all(|d| self.input_slots.get(d.name).map(|s| s.is_some()).unwrap_or(false))
    }

    /// The default `is_ready` algorithm (`spec.md` §4.2). `ctx` is
    /// computed by the caller (the `Dataflow`/`Scheduler` own the other
    /// modules needed to resolve producer state).
    pub fn is_ready(&mut self, ctx: &ReadinessContext) -> bool {
        if self.state == ModuleState::Zombie {
            self.state = ModuleState::Terminated;
            return false;
        }
        if matches!(self.state, ModuleState::Terminated | ModuleState::Invalid) {
            return false;
        }
        if let Some(v) = self.logic.is_ready_override(ctx) {
            return v;
        }
        if !self.has_any_input() {
            return true;
        }
        if self.state == ModuleState::Ready {
            return true;
        }
        if self.state == ModuleState::Blocked {
            let in_count = ctx.inputs.len();
            let term_count = ctx.inputs.values().filter(|i| i.terminal).count();
            let ready_count = ctx.inputs.values().filter(|i| i.ready).count();
            if !self.logic.is_input() && in_count != 0 && term_count == in_count {
                self.state = ModuleState::Zombie;
                return false;
            }
            return in_count == 0 || ready_count != 0;
        }
        log::error!(
            "{} not ready because it is in an unexpected state {:?}",
            self.name,
            self.state
        );
        false
    }

    fn predict_step_size(&mut self, duration: Duration) -> usize {
        if let Some(v) = self.logic.predict_step_size_override(duration) {
            return v;
        }
        self.predictor.fit(self.tracer.trace_stats(None));
        self.predictor.predict(duration, self.default_step_size)
    }

    /// `_update_params`: declared "not implemented" in `spec.md` §9 — an
    /// overridable hook that errors only when a non-empty delta
    /// actually arrives on a connected `_params` slot, matching
    /// `original_source/progressivis/core/module.py`'s
    /// `NotImplementedError` raised only after `df is not None`.
    fn update_params(&mut self, run_number: u64) -> Result<(), ModuleError> {
        let Some(Some(slot)) = self.input_slots.get_mut(PARAMS_SLOT) else {
            return Ok(());
        };
        if let Some(log) = self.outputs.get(PARAMS_SLOT) {
            slot.update(log, run_number);
        }
        if slot.has_buffered() {
            return Err(ModuleError::ParamsUpdateUnsupported);
        }
        Ok(())
    }

    /// Run one quantum: loop calling `run_step` until the time budget
    /// is exhausted or the module stops being `Ready` (`spec.md` §4.2).
    pub fn run(&mut self, run_number: u64, fixed_quantum: f64) -> Result<(), ModuleError> {
        if self.state == ModuleState::Running {
            return Err(ModuleError::AlreadyRunning);
        }
        self.steps_acc = 0;
        let mut next_state = self.state;
        let mut now = Instant::now();
        let quantum_secs = if fixed_quantum <= 0.0 { 0.1 } else { fixed_quantum };
        let quantum = Duration::from_secs_f64(quantum_secs);
        self.state = ModuleState::Running;
        self.start_time = Some(now);
        self.end_time = Some(now + quantum);
        self.update_params(run_number)?;

        let max_time = quantum.div_f64(3.0);
        self.tracer.start_run(now, run_number);
        let mut exception: Option<ModuleError> = None;

        loop {
            let end_time = self.end_time.expect("end_time set above");
            if now >= end_time {
                break;
            }
            let remaining = end_time - now;
            let step_size = self.predict_step_size(max_time.min(remaining));
            if step_size == 0 {
                break;
            }
            self.tracer.before_run_step(now, run_number);

            let logic = &mut self.logic;
            let inputs = &mut self.input_slots;
            let outputs = &mut self.outputs;
            let debug = self.params.debug();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut ctx = StepContext {
                    inputs,
                    outputs,
                    run_number,
                };
                if debug {
                    log::debug!("debug flag set on module entering run_step");
                }
                logic.run_step(&mut ctx, run_number, step_size, remaining)
            }));

            now = Instant::now();
            match outcome {
                Ok(Ok(StepOutcome::Exhausted)) => {
                    next_state = ModuleState::Zombie;
                    self.tracer.after_run_step(now, run_number, 0, 0, 0);
                    self.state = next_state;
                    break;
                }
                Ok(Ok(StepOutcome::Ran(result))) => match result.normalize() {
                    Ok(result) => {
                        next_state = result.next_state;
                        self.steps_acc += result.steps_run as u64;
                        self.tracer
                            .after_run_step(now, run_number, result.reads, result.updates, result.creates);
                    }
                    Err(err) => {
                        next_state = ModuleState::Zombie;
                        self.tracer.exception(now, run_number);
                        exception = Some(err);
                        self.state = next_state;
                        break;
                    }
                },
                Ok(Err(err)) => {
                    next_state = ModuleState::Zombie;
                    self.tracer.exception(now, run_number);
                    exception = Some(err);
                    self.state = next_state;
                    break;
                }
                Err(panic_payload) => {
                    next_state = ModuleState::Zombie;
                    self.tracer.exception(now, run_number);
                    exception = Some(ModuleError::Panicked(self.name.to_string(), panic_message(&panic_payload)));
                    self.state = next_state;
                    break;
                }
            }
            self.state = next_state;
            if self.state != ModuleState::Ready {
                self.tracer.run_stopped(now, run_number);
                break;
            }
        }
        self.state = next_state;
        if self.state == ModuleState::Zombie {
            self.tracer.terminated(now, run_number);
        }
        let (progress_current, progress_max) = self.logic.get_progress();
        self.tracer
            .end_run(now, run_number, progress_current, progress_max, self.logic.get_quality());
        self.end_time = self.start_time;
        self.last_update = run_number;
        self.start_time = None;

        if let Some(err) = exception {
            return Err(err);
        }
        Ok(())
    }

    /// Cleanup pass: promote a zombie to terminated (`spec.md` §3).
    pub fn cleanup_run(&mut self) {
        if self.is_zombie() {
            self.state = ModuleState::Terminated;
        }
    }

    pub fn starting(&mut self) {
        self.logic.starting();
    }

    pub fn ending(&mut self) {
        self.logic.ending();
    }

    /// `run_number`/`is_running`/`is_terminated` describe the owning
    /// scheduler (`spec.md` §6); a module has no back-reference to it, so
    /// the scheduler supplies them (see `Dataflow::to_json`).
    pub fn to_json(&self, short: bool, run_number: u64, is_running: bool, is_terminated: bool) -> serde_json::Value {
        let mut json = serde_json::json!({
            "id": self.name.as_str(),
            "classname": self.type_name(),
            "state": state_name(self.state),
            "progress": [self.logic.get_progress().0, self.logic.get_progress().1],
            "quality": self.logic.get_quality(),
            "speed": self.tracer.get_speed(),
            "run_number": run_number,
            "is_running": is_running,
            "is_terminated": is_terminated,
            "last_update": self.last_update,
            "default_step_size": self.default_step_size,
        });
        if let Some(order) = self.order {
            json["order"] = serde_json::json!(order);
        }
        if !short {
            json["start_time"] = match self.start_time {
                Some(_) => serde_json::json!(true),
                None => serde_json::Value::Null,
            };
            json["end_time"] = match self.end_time {
                Some(_) => serde_json::json!(true),
                None => serde_json::Value::Null,
            };
            let input_slots: serde_json::Map<String, serde_json::Value> = self
                .input_slots
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map(|s| s.to_json()).unwrap_or(serde_json::Value::Null)))
                .collect();
            let output_slots: serde_json::Map<String, serde_json::Value> = self
                .output_fanout
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        serde_json::Value::Array(v.iter().map(|(m, n)| serde_json::json!([m.as_str(), n])).collect()),
                    )
                })
                .collect();
            json["input_slots"] = serde_json::Value::Object(input_slots);
            json["output_slots"] = serde_json::Value::Object(output_slots);
            json["parameters"] = self.params.current().to_json();
        }
        json
    }
}

fn state_name(s: ModuleState) -> &'static str {
    match s {
        ModuleState::Created => "created",
        ModuleState::Ready => "ready",
        ModuleState::Running => "running",
        ModuleState::Blocked => "blocked",
        ModuleState::Zombie => "zombie",
        ModuleState::Terminated => "terminated",
        ModuleState::Invalid => "invalid",
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
