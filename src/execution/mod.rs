//! Recipe Execution Module
//!
//! Runs a compiled step graph to one of four outcomes (ok, error, paused,
//! needs-human).
//!
//! # Architecture
//!
//! - [`state`]: namespaced working state with typed slots
//! - [`step`]: what a step receives and returns
//! - [`planner`]: ready-set ordering
//! - [`engine`]: the executor state machine and rollback
//! - [`trace`]: per-run event log
//! - [`outcome`]: terminal results

pub mod engine;
pub mod outcome;
pub mod planner;
pub mod state;
pub mod step;
pub mod trace;

pub use engine::{rollback, Executor, ExecutorOutput, ExecutorStatus, PauseInfo};
pub use outcome::{Outcome, OutcomeError};
pub use planner::{execution_order, ExecutionPlanner};
pub use state::{Slot, StatePatch, WorkingState};
pub use step::{
    AsyncStep, OwnedStepContext, PauseKind, PauseRequest, RollbackContext, StepApply, StepContext,
    StepError, StepOutput, StepResult,
};
pub use trace::{Trace, TraceEvent, TraceEventKind};
