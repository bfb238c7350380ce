//! Engine-to-engine RPC surface
//!
//! Sub-workflow starts and result propagation go through [`EngineClient`]
//! rather than direct calls, decoupling the handler from the triggering
//! transaction. In a single-process deployment the loopback client (wired by
//! the engine itself) routes these straight back; a distributed deployment
//! substitutes an RPC transport.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use windlass_core::{ExecutionParams, ExecutionState};

use crate::error::EngineResult;

/// Parameters for starting a sub-workflow on behalf of a parent task
#[derive(Debug, Clone)]
pub struct SubWorkflowStart {
    /// Registered workflow definition to run
    pub workflow_name: String,

    /// Evaluated input
    pub input: Value,

    /// Execution params; `action_execution_id` points at the parent-side
    /// mirror action that receives the result
    pub params: ExecutionParams,

    /// Parent task execution
    pub task_execution_id: Uuid,

    /// Root of the execution tree
    pub root_execution_id: Uuid,
}

/// RPC client to this or the parent engine
#[async_trait]
pub trait EngineClient: Send + Sync + 'static {
    /// Start a sub-workflow execution
    async fn start_workflow(&self, start: SubWorkflowStart) -> EngineResult<Uuid>;

    /// Deliver an action (or sub-workflow) result
    async fn on_action_complete(
        &self,
        action_execution_id: Uuid,
        state: ExecutionState,
        output: Value,
    ) -> EngineResult<()>;

    /// Deliver an asynchronous action state notification (e.g. a paused
    /// sub-workflow)
    async fn on_action_update(
        &self,
        action_execution_id: Uuid,
        state: ExecutionState,
    ) -> EngineResult<()>;
}
