//! The cooperative scheduler: drives the module graph one quantum at a
//! time, prioritizing interaction-touched modules, and hibernating once
//! nothing is left to do (`spec.md` §4.4).
//!
//! `original_source/progressivis/core/scheduler_base.py`'s `BaseScheduler`
//! drives this module with a Python generator (`_next_module`) cooperating
//! with greenlets. `spec.md` §9 flags the generator-based control flow as
//! REDESIGN material: this is rebuilt as an explicit state machine
//! (`Scheduler::next_module`) so a single `step_once` call is a complete,
//! interruptible unit of work with no suspended-generator state to reason
//! about across threads. The threaded wrapper that owns a background
//! worker is grounded in the teacher's `InnerLocustDB::start_worker_threads`
//! and `LocustDB`'s `Drop` impl (`src/locustdb.rs`, `src/scheduler/inner_locustdb.rs`).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::dataflow::Dataflow;
use crate::errors::SchedulerError;
use crate::module::ModuleState;
use crate::name::ModuleName;

/// Matches the Python source's `KEEP_RUNNING = 5`: once told to keep
/// running past quiescence, the scheduler stays awake for this many
/// otherwise-idle cycles before actually hibernating.
const KEEP_RUNNING: u32 = 5;

#[derive(Debug, Clone, Default)]
struct InteractionOpts {
    targets: std::collections::HashSet<ModuleName>,
    deadline: Option<Instant>,
    /// Witnesses consulted by `proc_interaction_opts`'s `starving_mods`
    /// exit condition: the interaction window ends once the combined
    /// `steps_acc` across these modules is 0 (`spec.md` §4.4).
    starving_mods: Option<Vec<ModuleName>>,
    max_time: Option<Duration>,
    max_iter: Option<u32>,
    interaction_start: Option<Instant>,
    iter_count: u32,
}

/// A callback invoked once per completed run cycle (`on_tick`) or on
/// the next cycle only (`on_tick_once`), or when the scheduler goes
/// idle (`on_idle`).
pub type TickCallback = Box<dyn FnMut(u64) + Send>;

/// Handle returned by `on_tick`/`on_idle`, usable with `remove_tick`/
/// `remove_idle` to deregister (`spec.md` §4.4 "remove_* to deregister").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// The dataflow-execution engine. Not `Sync` by itself — wrap in
/// [`ThreadedScheduler`] to run it on a background thread and drive it
/// from other threads via `for_input`/`stop`.
pub struct Scheduler {
    dataflow: Dataflow,
    run_list: Vec<ModuleName>,
    run_index: usize,
    reachability: HashMap<ModuleName, bool>,
    run_number: u64,
    interaction_latency: f64,
    interaction: InteractionOpts,
    keep_running: u32,
    stopped: bool,
    on_tick: Vec<(CallbackId, TickCallback)>,
    on_tick_once: Vec<TickCallback>,
    on_idle: Vec<(CallbackId, TickCallback)>,
    next_callback_id: u64,
    dirty: bool,
}

impl Scheduler {
    pub fn new(dataflow: Dataflow) -> Self {
        Scheduler {
            dataflow,
            run_list: Vec::new(),
            run_index: 0,
            reachability: HashMap::new(),
            run_number: 0,
            interaction_latency: 1.0,
            interaction: InteractionOpts::default(),
            keep_running: 0,
            stopped: false,
            on_tick: Vec::new(),
            on_tick_once: Vec::new(),
            on_idle: Vec::new(),
            next_callback_id: 0,
            dirty: true,
        }
    }

    pub fn dataflow(&self) -> &Dataflow {
        &self.dataflow
    }

    pub fn dataflow_mut(&mut self) -> &mut Dataflow {
        self.dirty = true;
        &mut self.dataflow
    }

    pub fn run_number(&self) -> u64 {
        self.run_number
    }

    pub fn set_interaction_latency(&mut self, secs: f64) -> Result<(), SchedulerError> {
        if secs <= 0.0 {
            return Err(SchedulerError::InvalidInteractionLatency(secs));
        }
        self.interaction_latency = secs;
        Ok(())
    }

    fn next_id(&mut self) -> CallbackId {
        let id = CallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        id
    }

    pub fn on_tick(&mut self, cb: TickCallback) -> CallbackId {
        let id = self.next_id();
        self.on_tick.push((id, cb));
        id
    }

    pub fn on_tick_once(&mut self, cb: TickCallback) {
        self.on_tick_once.push(cb);
    }

    pub fn on_idle(&mut self, cb: TickCallback) -> CallbackId {
        let id = self.next_id();
        self.on_idle.push((id, cb));
        id
    }

    /// Deregister a callback previously registered with `on_tick`
    /// (`spec.md` §4.4 "remove_* to deregister"). No-op if already
    /// removed.
    pub fn remove_tick(&mut self, id: CallbackId) {
        self.on_tick.retain(|(cb_id, _)| *cb_id != id);
    }

    /// Deregister a callback previously registered with `on_idle`.
    pub fn remove_idle(&mut self, id: CallbackId) {
        self.on_idle.retain(|(cb_id, _)| *cb_id != id);
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Recompute the run order and reachability after the graph has
    /// been mutated since the last cycle. Mirrors `_end_of_modules`
    /// dropping terminated modules and replanning (`spec.md` §4.1, §4.4).
    /// `_run_list` is built from the *full* run order — the dead-to-vis
    /// reachability filter applies only to interaction-mode selection
    /// (`for_input`/`consider_module`), never to which modules are
    /// eligible to run at all (`spec.md` §4.4, `scheduler_base.py::_end_of_modules`).
    fn replan(&mut self) -> Result<(), SchedulerError> {
        self.dataflow.validate()?;
        let terminated: Vec<ModuleName> = self
            .dataflow
            .modules()
            .iter()
            .filter(|(_, m)| m.is_terminated())
            .map(|(n, _)| n.clone())
            .collect();
        for name in terminated {
            let _ = self.dataflow.remove_module(&name);
        }
        let order = self.dataflow.order_modules()?;
        self.reachability = self.dataflow.reachability();
        self.run_list = order;
        self.run_index = 0;
        self.dirty = false;
        Ok(())
    }

    /// Mark `name` (and everything it can reach) as worth prioritizing
    /// for `interaction_latency` seconds, and wake a hibernating
    /// scheduler. Grounded in `scheduler_base.py`'s `for_input`: unions
    /// the newly reachable targets into any selection already active
    /// rather than replacing it, and only arms the deadline/iteration
    /// counters "on first activation" (`spec.md` §4.4). The dead-to-vis
    /// filter (modules that cannot reach a visualization are not worth
    /// prioritizing) applies here, to the interaction selection only —
    /// never to the scheduler's run list (`spec.md` §4.4, `replan`).
    pub fn for_input(&mut self, name: &ModuleName) {
        let first_activation = !self.has_input();
        let targets = self
            .dataflow
            .forward_reachable(name)
            .into_iter()
            .filter(|n| self.reachability.get(n).copied().unwrap_or(true));
        self.interaction.targets.extend(targets);
        if first_activation {
            let now = Instant::now();
            self.interaction.deadline = Some(now + Duration::from_secs_f64(self.interaction_latency));
            self.interaction.interaction_start = Some(now);
            self.interaction.iter_count = 0;
        }
        self.keep_running = KEEP_RUNNING;
    }

    pub fn has_input(&self) -> bool {
        matches!(self.interaction.deadline, Some(d) if Instant::now() < d)
    }

    /// Configure the optional early-exit bounds `proc_interaction_opts`
    /// evaluates at the end of every run-list pass while in interaction
    /// mode (`spec.md` §4.4, §6 `set_interaction_opts`).
    pub fn set_interaction_opts(
        &mut self,
        starving_mods: Option<Vec<ModuleName>>,
        max_time: Option<Duration>,
        max_iter: Option<u32>,
    ) -> Result<(), SchedulerError> {
        if matches!(max_time, Some(d) if d.is_zero()) {
            return Err(SchedulerError::InvalidMaxTime);
        }
        if matches!(max_iter, Some(0)) {
            return Err(SchedulerError::InvalidMaxIter);
        }
        self.interaction.starving_mods = starving_mods;
        self.interaction.max_time = max_time;
        self.interaction.max_iter = max_iter;
        Ok(())
    }

    /// Evaluated at the end of every full run-list pass while in
    /// interaction mode: `starving_mods` and `max_time` exit
    /// immediately; `max_iter` only counts a pass in which neither of
    /// those fired, preserving the source's `if/elif` ordering
    /// (`spec.md` §4.4, §9 Open Questions).
    fn proc_interaction_opts(&mut self) {
        if !self.has_input() {
            return;
        }
        if let Some(witnesses) = self.interaction.starving_mods.clone() {
            let total: u64 = witnesses
                .iter()
                .filter_map(|n| self.dataflow.get(n))
                .map(|m| m.steps_acc())
                .sum();
            if total == 0 {
                self.exit_interaction();
                return;
            }
        }
        if let Some(max_time) = self.interaction.max_time {
            if let Some(start) = self.interaction.interaction_start {
                if start.elapsed() >= max_time {
                    self.exit_interaction();
                    return;
                }
            }
        }
        if let Some(max_iter) = self.interaction.max_iter {
            self.interaction.iter_count += 1;
            if self.interaction.iter_count >= max_iter {
                self.exit_interaction();
            }
        }
    }

    fn exit_interaction(&mut self) {
        self.interaction.deadline = None;
        self.interaction.targets.clear();
        self.interaction.interaction_start = None;
        self.interaction.iter_count = 0;
    }

    fn consider_module(&self, name: &ModuleName) -> bool {
        if !self.has_input() {
            return true;
        }
        self.interaction.targets.contains(name)
    }

    /// Seconds left in the current interaction window, 0 if none active.
    pub fn time_left(&self) -> f64 {
        match self.interaction.deadline {
            Some(d) => {
                let now = Instant::now();
                if d > now {
                    (d - now).as_secs_f64()
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// Shrink a prioritized module's effective quantum to the remaining
    /// interaction window so it yields control quickly instead of
    /// claiming its full default quantum (`spec.md` §4.4).
    fn fix_quantum(&self, name: &ModuleName, declared_quantum: f64) -> f64 {
        if self.consider_module(name) && self.has_input() {
            let remaining = self.time_left();
            if remaining > 0.0 {
                return remaining.min(declared_quantum);
            }
        }
        declared_quantum
    }

    /// Explicit state machine standing in for the Python generator
    /// `_next_module`: advances the run-list cursor, replanning at
    /// graph-dirty moments, at the wrap-around point, or whenever a
    /// newly-prioritized interaction target should jump the queue.
    fn next_module(&mut self) -> Result<Option<ModuleName>, SchedulerError> {
        if self.dirty {
            self.replan()?;
        }
        if self.run_list.is_empty() {
            return Ok(None);
        }
        let len = self.run_list.len();
        if self.has_input() {
            let start = self.run_index;
            loop {
                let candidate = self.run_list[self.run_index].clone();
                self.run_index = (self.run_index + 1) % len;
                if self.run_index == 0 {
                    self.end_of_pass();
                }
                if self.consider_module(&candidate) {
                    return Ok(Some(candidate));
                }
                if self.run_index == start {
                    break;
                }
            }
        }
        let candidate = self.run_list[self.run_index].clone();
        self.run_index = (self.run_index + 1) % len;
        if self.run_index == 0 {
            self.end_of_pass();
        }
        Ok(Some(candidate))
    }

    /// End-of-run-list bookkeeping (`spec.md` §4.4 `next_module`
    /// trigger 3): apply `proc_interaction_opts`, then replan on the
    /// next call so terminated modules are dropped and the order stays
    /// current.
    fn end_of_pass(&mut self) {
        self.proc_interaction_opts();
        self.dirty = true;
    }

    fn all_blocked(&self) -> bool {
        self.dataflow
            .modules()
            .values()
            .all(|m| matches!(m.state(), ModuleState::Blocked | ModuleState::Terminated | ModuleState::Invalid))
    }

    fn no_more_data(&self) -> bool {
        self.dataflow.modules().values().all(|m| !m.is_data_input() || m.is_terminated())
    }

    fn waiting_for_input(&self) -> bool {
        self.dataflow.modules().values().any(|m| m.is_input() && !m.is_terminated())
    }

    /// `no_more_data ∧ all_blocked ∧ waiting_for_input ∧ keep_running ==
    /// 0` (`spec.md` §4.4). Used by [`ThreadedScheduler`] to decide when
    /// to park on its condition variable.
    pub fn is_quiescent(&self) -> bool {
        self.keep_running == 0 && self.no_more_data() && self.all_blocked() && self.waiting_for_input()
    }

    /// Run one module for one quantum, if one is runnable. Returns
    /// whether any work happened, so callers (and `ThreadedScheduler`)
    /// can decide whether to keep spinning or go idle.
    pub fn step_once(&mut self) -> Result<bool, SchedulerError> {
        if self.stopped {
            return Ok(false);
        }
        let Some(name) = self.next_module()? else {
            return Ok(false);
        };
        self.dataflow.sync_inputs(&name, self.run_number);
        let ctx = self.dataflow.readiness_context(&name);
        let ready = match self.dataflow.modules_mut().get_mut(&name) {
            Some(m) => m.is_ready(&ctx),
            None => false,
        };
        if !ready {
            if self.keep_running > 0 {
                self.keep_running -= 1;
            }
            return Ok(false);
        }

        let declared_quantum = self
            .dataflow
            .modules()
            .get(&name)
            .map(|m| m.params().quantum())
            .unwrap_or(0.5);
        let quantum = self.fix_quantum(&name, declared_quantum);
        self.run_number += 1;
        let run_number = self.run_number;
        if let Some(m) = self.dataflow.modules_mut().get_mut(&name) {
            m.run(run_number, quantum)?;
        }
        if self.keep_running > 0 {
            self.keep_running -= 1;
        }

        let mut once = std::mem::take(&mut self.on_tick_once);
        for (_, cb) in self.on_tick.iter_mut() {
            cb(run_number);
        }
        for cb in once.iter_mut() {
            cb(run_number);
        }
        Ok(true)
    }

    /// Run until quiescent or stopped, calling `on_idle` hooks whenever
    /// a cycle produces no progress. Blocking — the synchronous
    /// equivalent of `BaseScheduler.start()`. Prefer
    /// [`ThreadedScheduler`] when the caller needs to keep interacting
    /// with the scheduler from another thread while it runs.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        loop {
            if self.stopped {
                return Ok(());
            }
            let progressed = self.step_once()?;
            if !progressed {
                if self.is_quiescent() {
                    return Ok(());
                }
                let mut idle = std::mem::take(&mut self.on_idle);
                let run_number = self.run_number;
                for (_, cb) in idle.iter_mut() {
                    cb(run_number);
                }
                self.on_idle = idle;
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// `step()` alias for `step_once`, matching the embedded API's name
    /// in `spec.md` §6.
    pub fn step(&mut self) -> Result<bool, SchedulerError> {
        self.step_once()
    }

    /// Register `tick_proc`/`idle_proc` (if given) and run to
    /// quiescence, the embedded-API entry point named in `spec.md` §6.
    pub fn start(&mut self, tick_proc: Option<TickCallback>, idle_proc: Option<TickCallback>) -> Result<(), SchedulerError> {
        if let Some(cb) = tick_proc {
            self.on_tick(cb);
        }
        if let Some(cb) = idle_proc {
            self.on_idle(cb);
        }
        self.run()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped
    }

    /// Whether the scheduler has been told to stop. Distinct from any
    /// individual module's `Terminated` state — this is the
    /// scheduler-level counterpart named in `spec.md` §6 (`is_terminated`).
    pub fn is_terminated(&self) -> bool {
        self.stopped
    }

    /// Whether every module in the current graph passes `validate`
    /// (none sitting in `Invalid`), the scheduler-level counterpart of
    /// `Dataflow::validate` named in `spec.md` §6 (`is_valid`).
    pub fn is_valid(&self) -> bool {
        self.dataflow.modules().values().all(|m| m.is_valid())
    }

    pub fn modules(&self) -> &HashMap<ModuleName, crate::module::Module> {
        self.dataflow.modules()
    }

    /// `spec.md` §6: `modules` is a list sorted by `order` (modules
    /// without an `order` yet sort before those with one, matching the
    /// source's `_module_order` comparator verbatim), not an
    /// object keyed by name — unlike `Dataflow::to_json`, which an
    /// embedder can use to introspect just the graph.
    pub fn to_json(&self, short: bool) -> serde_json::Value {
        let is_running = !self.stopped;
        let is_terminated = self.stopped;
        let mut modules: Vec<_> = self.dataflow.modules().values().collect();
        modules.sort_by(|a, b| match (a.order, b.order) {
            (Some(x), Some(y)) => x.cmp(&y),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        let modules: Vec<serde_json::Value> = modules
            .into_iter()
            .map(|m| m.to_json(short, self.run_number, is_running, is_terminated))
            .collect();
        serde_json::json!({
            "run_number": self.run_number,
            "is_running": is_running,
            "is_terminated": is_terminated,
            "is_valid": self.is_valid(),
            "modules": modules,
            "status": "success",
        })
    }
}

/// Owns a [`Scheduler`] running on a background thread, so an embedder
/// (e.g. a UI event loop) can call `for_input`/`stop` from elsewhere
/// while it runs. Modeled on the teacher's `LocustDB` facade wrapping
/// `InnerLocustDB` plus its worker thread, and `impl Drop for LocustDB`
/// stopping that thread on drop (`src/locustdb.rs`).
pub struct ThreadedScheduler {
    shared: Arc<Mutex<Scheduler>>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedScheduler {
    pub fn spawn(dataflow: Dataflow) -> Self {
        let scheduler = Arc::new(Mutex::new(Scheduler::new(dataflow)));
        let wake = Arc::new((Mutex::new(false), Condvar::new()));

        let worker_scheduler = Arc::clone(&scheduler);
        let worker_wake = Arc::clone(&wake);
        let handle = std::thread::spawn(move || loop {
            let (stopped, progressed, quiescent) = {
                let mut guard = worker_scheduler.lock().expect("scheduler mutex poisoned");
                if guard.is_stopped() {
                    (true, false, false)
                } else {
                    let progressed = guard.step_once().unwrap_or(false);
                    (false, progressed, guard.is_quiescent())
                }
            };
            if stopped {
                return;
            }
            if !progressed {
                if quiescent {
                    let (lock, cvar) = &*worker_wake;
                    let mut woken = lock.lock().expect("wake mutex poisoned");
                    while !*woken {
                        let (guard, timeout) = cvar
                            .wait_timeout(woken, Duration::from_millis(200))
                            .expect("condvar wait");
                        woken = guard;
                        if timeout.timed_out() {
                            break;
                        }
                    }
                    *woken = false;
                } else {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        });

        ThreadedScheduler {
            shared: scheduler,
            wake,
            handle: Some(handle),
        }
    }

    fn notify(&self) {
        let (lock, cvar) = &*self.wake;
        let mut woken = lock.lock().expect("wake mutex poisoned");
        *woken = true;
        cvar.notify_one();
    }

    pub fn for_input(&self, name: &ModuleName) {
        self.shared.lock().expect("scheduler mutex poisoned").for_input(name);
        self.notify();
    }

    pub fn stop(&self) {
        self.shared.lock().expect("scheduler mutex poisoned").stop();
        self.notify();
    }

    pub fn to_json(&self, short: bool) -> serde_json::Value {
        self.shared.lock().expect("scheduler mutex poisoned").to_json(short)
    }

    pub fn with_scheduler<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> R {
        f(&self.shared.lock().expect("scheduler mutex poisoned"))
    }

    pub fn with_scheduler_mut<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        f(&mut self.shared.lock().expect("scheduler mutex poisoned"))
    }
}

impl Drop for ThreadedScheduler {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
