//! A cooperative, single-threaded dataflow engine: a graph of modules
//! wired by typed slots, executed in small time-bounded steps by a
//! scheduler that prioritizes whatever the user just touched.
//!
//! Start with [`dataflow::Dataflow`] to build a graph, [`module::Module`]
//! and [`module::ModuleLogic`] to implement a node, and
//! [`scheduler::Scheduler`] (or [`scheduler::ThreadedScheduler`] for a
//! background-thread-driven variant) to run it.

pub mod dataflow;
pub mod errors;
pub mod module;
pub mod name;
pub mod params;
pub mod predictor;
pub mod scheduler;
pub mod slot;
pub mod tracer;

pub use dataflow::Dataflow;
pub use errors::{DataflowError, ModuleError, SchedulerError};
pub use module::{Module, ModuleLogic, ModuleState, StepContext, StepOutcome, StepResult};
pub use name::ModuleName;
pub use params::{ParamSpec, ParamValue, Params, ParamsRow};
pub use scheduler::{CallbackId, Scheduler, ThreadedScheduler};
pub use slot::{RowId, Slot, SlotDescriptor};
