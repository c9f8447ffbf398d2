//! Error types for the three subsystems described in the dataflow core:
//! graph mutation/validation, the module step protocol, and the scheduler.

use thiserror::Error;

/// Errors raised while constructing or validating a [`crate::dataflow::Dataflow`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataflowError {
    #[error("module name '{0}' already exists in this dataflow")]
    DuplicateModuleName(String),
    #[error("module '{0}' is unknown to this dataflow")]
    UnknownModule(String),
    #[error("input slot '{input}' on module '{module}' is already bound")]
    InputAlreadyBound { module: String, input: String },
    #[error("duplicate slot descriptor '{0}'")]
    DuplicateSlotDescriptor(String),
    #[error("module '{module}' has no slot named '{slot}'")]
    UnknownSlot { module: String, slot: String },
    #[error(
        "slot type mismatch connecting {producer}.{output} -> {consumer}.{input}: \
         producer emits {producer_type}, consumer expects {consumer_type}"
    )]
    SlotTypeMismatch {
        producer: String,
        output: String,
        consumer: String,
        input: String,
        producer_type: String,
        consumer_type: String,
    },
    #[error("dependency cycle detected among modules: {0:?}")]
    Cycle(Vec<String>),
    #[error("{} module(s) failed validation: {modules:?}", modules.len())]
    Invalid { modules: Vec<String> },
}

/// Errors raised by a module's step protocol (contract violations are
/// always hard errors, never silently corrected).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("run_step returned creates ({creates}) > updates ({updates}), which is a contract violation")]
    CreatesExceedUpdates { creates: usize, updates: usize },
    #[error("run_step returned next_state out of range for a step result: {0:?}")]
    InvalidNextState(crate::module::ModuleState),
    #[error("module is already running")]
    AlreadyRunning,
    #[error("updating parameters through the _params slot is not implemented for this module")]
    ParamsUpdateUnsupported,
    #[error("module '{0}' panicked inside run_step: {1}")]
    Panicked(String, String),
}

/// Errors raised by the [`crate::scheduler::Scheduler`] itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("interaction_latency must be strictly positive, got {0}")]
    InvalidInteractionLatency(f64),
    #[error("max_time must be a positive duration")]
    InvalidMaxTime,
    #[error("max_iter must be strictly positive")]
    InvalidMaxIter,
    #[error(transparent)]
    Dataflow(#[from] DataflowError),
    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// Construct-and-return-early helper mirroring the teacher's `bail!`
/// macro, adapted from a `Fail`-style string constructor to a
/// `thiserror` enum variant constructor.
#[macro_export]
macro_rules! bail {
    ($variant:expr) => {
        return Err($variant)
    };
}
