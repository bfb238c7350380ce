//! # Windlass Core
//!
//! Domain model for the Windlass workflow engine:
//!
//! - **States**: the shared execution-state enumeration and its legal
//!   transition table
//! - **Executions**: the persisted workflow/task/action execution entities
//!   and the scheduler's delayed calls
//! - **Commands**: transient "what to do next" values flowing from the
//!   controller to the dispatcher
//! - **Specs**: resolved workflow/task specifications (edges, joins,
//!   with-items, policies)
//! - **Expressions**: the evaluation capability the engine requires, plus a
//!   minimal evaluator for tests
//!
//! The engine itself lives in `windlass-engine`; this crate has no opinion
//! about storage or scheduling.

pub mod command;
pub mod execution;
pub mod expr;
pub mod spec;
pub mod state;

pub use command::{
    RunExistingTaskCommand, RunTaskCommand, SetWorkflowStateCommand, WorkflowCommand,
};
pub use execution::{
    ActionExecution, ActionKind, DelayedCall, ExecutionParams, NextTask, TaskExecution,
    TriggeredBy, WorkflowExecution,
};
pub use expr::{is_truthy, merge_contexts, Evaluator, ExprError, SimpleEvaluator};
pub use spec::{
    is_reserved_task_name, AdHocActionSpec, EdgeKind, Join, PolicySpec, RetrySpec, TaskSpec,
    TransitionSpec, WithItemsBinding, WithItemsSpec, WorkflowSpec,
};
pub use state::{is_valid_transition, ExecutionState};
