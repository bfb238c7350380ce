//! WorkflowStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use windlass_core::{ActionExecution, DelayedCall, ExecutionState, TaskExecution, WorkflowExecution};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow execution not found
    #[error("workflow execution not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task execution not found
    #[error("task execution not found: {0}")]
    TaskNotFound(Uuid),

    /// Action execution not found
    #[error("action execution not found: {0}")]
    ActionNotFound(Uuid),

    /// Delayed call not found
    #[error("delayed call not found: {0}")]
    DelayedCallNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Pagination parameters for batch fetches
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Store for workflow execution state
///
/// This is the only shared mutable resource between engine instances, so
/// every coordination primitive the engine relies on lives here:
///
/// - **Conditional state updates**: `update_*_state` applies a transition
///   only when the row's current state is one of the expected states and
///   reports whether it won. A losing concurrent writer observes `false`
///   and no-ops.
/// - **Named locks**: a distributed lock primitive used for join-task
///   creation and with-items capacity mutation.
/// - **Delayed-call capture**: the scheduler's `processing: false -> true`
///   claim, with lease-based recovery.
///
/// Implementations must be thread-safe and support concurrent access from
/// multiple engine instances.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Executions
    // =========================================================================

    /// Persist a new workflow execution
    async fn create_workflow_execution(&self, wf: &WorkflowExecution) -> Result<(), StoreError>;

    /// Fetch a workflow execution by id
    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    /// Persist the current state of a workflow execution
    async fn update_workflow_execution(&self, wf: &WorkflowExecution) -> Result<(), StoreError>;

    /// Conditionally transition a workflow execution's state
    ///
    /// Returns `Ok(true)` when this writer applied the transition, `Ok(false)`
    /// when the row was not in one of the expected states (someone else got
    /// there first - benign).
    async fn update_workflow_state(
        &self,
        id: Uuid,
        expected: &[ExecutionState],
        to: ExecutionState,
        state_info: Option<String>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Task Executions
    // =========================================================================

    /// Persist a new task execution
    async fn create_task_execution(&self, task: &TaskExecution) -> Result<(), StoreError>;

    /// Fetch a task execution by id
    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecution, StoreError>;

    /// Persist the current state of a task execution
    async fn update_task_execution(&self, task: &TaskExecution) -> Result<(), StoreError>;

    /// Conditionally transition a task execution's state (same contract as
    /// [`WorkflowStore::update_workflow_state`])
    async fn update_task_state(
        &self,
        id: Uuid,
        expected: &[ExecutionState],
        to: ExecutionState,
        state_info: Option<String>,
    ) -> Result<bool, StoreError>;

    /// All task executions of a workflow execution, oldest first
    async fn get_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    /// Task executions with the given task name (normally zero or one)
    async fn find_task_executions_by_name(
        &self,
        workflow_execution_id: Uuid,
        name: &str,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    /// Task executions not yet in a terminal state
    async fn get_incomplete_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    /// Completed task executions in completion order, batched
    async fn get_completed_task_executions(
        &self,
        workflow_execution_id: Uuid,
        pagination: Pagination,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    /// RUNNING task executions not updated since the given instant, across
    /// all workflows (integrity-check input)
    async fn find_stale_running_task_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    // =========================================================================
    // Action Executions
    // =========================================================================

    /// Persist a new action execution
    async fn create_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError>;

    /// Fetch an action execution by id
    async fn get_action_execution(&self, id: Uuid) -> Result<ActionExecution, StoreError>;

    /// Persist the current state of an action execution
    async fn update_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError>;

    /// All action executions of a task, oldest first
    async fn get_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError>;

    // =========================================================================
    // Delayed Calls
    // =========================================================================

    /// Persist a delayed call
    async fn create_delayed_call(&self, call: &DelayedCall) -> Result<(), StoreError>;

    /// Delayed calls eligible for capture by the given instance
    ///
    /// Eligible means due (`execution_time <= now`) and either unclaimed - with
    /// foreign calls only eligible once `pickup_job_after` past their execution
    /// time - or claimed but lease-expired (`captured_at` older than
    /// `captured_job_timeout`).
    async fn get_due_delayed_calls(
        &self,
        now: DateTime<Utc>,
        instance_id: &str,
        pickup_job_after: Duration,
        captured_job_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<DelayedCall>, StoreError>;

    /// Atomically claim a delayed call (`processing: false -> true`)
    ///
    /// Returns `Ok(true)` only when this writer's conditional update affected
    /// the row; exactly one concurrent caller wins.
    async fn capture_delayed_call(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        captured_job_timeout: Duration,
    ) -> Result<bool, StoreError>;

    /// Remove a processed delayed call
    async fn delete_delayed_call(&self, id: Uuid) -> Result<(), StoreError>;

    /// Remove pending delayed calls by their unique key; returns how many
    /// were removed
    async fn delete_delayed_calls_by_key(&self, key: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Named Locks
    // =========================================================================

    /// Acquire a named distributed lock, waiting until it is free
    async fn acquire_named_lock(&self, name: &str) -> Result<(), StoreError>;

    /// Release a named distributed lock
    async fn release_named_lock(&self, name: &str) -> Result<(), StoreError>;
}
