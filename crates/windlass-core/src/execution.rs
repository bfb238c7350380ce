//! Persisted execution entities
//!
//! Workflow, task and action executions plus the scheduler's delayed calls.
//! The persistent store is the only shared state between engine instances,
//! so everything the engine needs to resume a decision lives on these
//! structs - including the per-execution `runtime_context`, an engine-private
//! JSON object holding policy scratch data, with-items progress, triggering
//! edges and the paused-command backlog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::spec::{EdgeKind, TaskSpec, WorkflowSpec};
use crate::state::ExecutionState;

/// Key in workflow runtime context holding commands deferred by a pause
pub const BACKLOG_KEY: &str = "command_backlog";

/// Key in workflow runtime context marking an explicit cancel request
pub const CANCELLED_KEY: &str = "cancelled";

/// Execution-type options for a workflow execution
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionParams {
    /// Environment variables visible to expressions as `env`
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub env: Value,

    /// When this execution is a sub-workflow: the parent-side action
    /// execution that receives the result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_execution_id: Option<Uuid>,
}

/// A single run of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,

    /// Name of the workflow definition this execution runs
    pub workflow_name: String,

    /// Immutable copy of the specification, frozen at creation
    pub spec: WorkflowSpec,

    pub state: ExecutionState,

    /// Diagnostic text accompanying the state
    pub state_info: Option<String>,

    /// Input supplied at start
    pub input: Value,

    /// Merged data-flow context visible to expressions
    pub context: Value,

    pub params: ExecutionParams,

    /// Engine-private scratch data (backlog, cancel marker)
    pub runtime_context: Value,

    /// Final output, present once the execution completes
    pub output: Option<Value>,

    /// Parent task when this execution is a sub-workflow
    pub task_execution_id: Option<Uuid>,

    /// Topmost workflow execution of the tree
    pub root_execution_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(spec: WorkflowSpec, input: Value, params: ExecutionParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_name: spec.name.clone(),
            spec,
            state: ExecutionState::Idle,
            state_info: None,
            input,
            context: json!({}),
            params,
            runtime_context: json!({}),
            output: None,
            task_execution_id: None,
            root_execution_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    /// Commands deferred while the workflow was paused
    pub fn backlog(&self) -> Vec<Value> {
        self.runtime_context
            .get(BACKLOG_KEY)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the backlog; an empty backlog removes the key entirely so the
    /// hot dispatch path never writes "backlog is absent" records
    pub fn set_backlog(&mut self, commands: Vec<Value>) {
        let ctx = ensure_object(&mut self.runtime_context);
        if commands.is_empty() {
            ctx.remove(BACKLOG_KEY);
        } else {
            ctx.insert(BACKLOG_KEY.to_string(), Value::Array(commands));
        }
    }

    /// Whether an explicit cancel was recorded for this execution
    pub fn is_cancel_requested(&self) -> bool {
        self.runtime_context
            .get(CANCELLED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_cancel_requested(&mut self) {
        ensure_object(&mut self.runtime_context).insert(CANCELLED_KEY.to_string(), json!(true));
    }
}

/// The predecessor task and edge that caused a task to be scheduled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggeredBy {
    pub task_execution_id: Uuid,
    pub event: EdgeKind,
}

/// A successor recorded when a task completes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NextTask {
    pub name: String,
    pub event: EdgeKind,
}

/// A single run of a task within a workflow execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    pub id: Uuid,

    pub workflow_execution_id: Uuid,

    pub name: String,

    /// Stable identity used as the global lock-acquisition order for joins
    pub unique_key: String,

    pub state: ExecutionState,

    pub state_info: Option<String>,

    /// Immutable copy of the task definition, resolved at creation
    pub spec: TaskSpec,

    /// Data-flow context the task sees
    pub in_context: Value,

    /// Variables this task published
    pub published: Value,

    /// Policy scratch data, with-items progress, triggering edges
    pub runtime_context: Value,

    /// Post-completion command generation already ran
    pub processed: bool,

    /// Successors computed once at completion
    pub next_tasks: Vec<NextTask>,

    pub has_next_tasks: bool,

    /// An on-error route captured this task's failure
    pub error_handled: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    pub fn new(workflow_execution_id: Uuid, spec: TaskSpec, state: ExecutionState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_execution_id,
            unique_key: format!("{}-{}", workflow_execution_id, spec.name),
            name: spec.name.clone(),
            state,
            state_info: None,
            spec,
            in_context: json!({}),
            published: json!({}),
            runtime_context: json!({}),
            processed: false,
            next_tasks: vec![],
            has_next_tasks: false,
            error_handled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Inbound edges that fired for this task so far
    pub fn triggered_by(&self) -> Vec<TriggeredBy> {
        self.runtime_context
            .get("triggered_by")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn add_triggered_by(&mut self, entry: TriggeredBy) {
        let mut entries = self.triggered_by();
        if !entries.contains(&entry) {
            entries.push(entry);
            ensure_object(&mut self.runtime_context)
                .insert("triggered_by".to_string(), json!(entries));
        }
    }

    /// Whether this task was skipped; skipped tasks complete as SUCCESS and
    /// route through on-skip edges
    pub fn is_skipped(&self) -> bool {
        self.runtime_context
            .get("skipped")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_skipped(&mut self) {
        ensure_object(&mut self.runtime_context).insert("skipped".to_string(), json!(true));
    }

    /// Read a value from the runtime context by key
    pub fn runtime_get(&self, key: &str) -> Option<&Value> {
        self.runtime_context.get(key)
    }

    /// Write a value into the runtime context
    pub fn runtime_set(&mut self, key: &str, value: Value) {
        ensure_object(&mut self.runtime_context).insert(key.to_string(), value);
    }
}

/// What kind of work an action execution represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A remote-executor action
    Action,

    /// A sub-workflow mirrored as an action on the parent side
    Workflow,
}

/// A single execution of a task's action (or sub-workflow)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionExecution {
    pub id: Uuid,

    pub task_execution_id: Uuid,

    pub workflow_execution_id: Uuid,

    /// Action reference or sub-workflow name
    pub name: String,

    pub kind: ActionKind,

    pub state: ExecutionState,

    pub state_info: Option<String>,

    pub input: Value,

    pub output: Option<Value>,

    /// True once the owning task has incorporated this execution's result.
    /// This flag, not state alone, is what with-items and retry accounting
    /// count.
    pub accepted: bool,

    /// Carries the with-items `index`, `safe_rerun`, retry markers
    pub runtime_context: Value,

    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionExecution {
    pub fn new(
        task_execution_id: Uuid,
        workflow_execution_id: Uuid,
        name: impl Into<String>,
        kind: ActionKind,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_execution_id,
            workflow_execution_id,
            name: name.into(),
            kind,
            state: ExecutionState::Running,
            state_info: None,
            input,
            output: None,
            accepted: false,
            runtime_context: json!({}),
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// With-items iteration index, when the owning task fans out
    pub fn with_items_index(&self) -> Option<usize> {
        self.runtime_context
            .get("index")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    }

    pub fn set_with_items_index(&mut self, index: usize) {
        ensure_object(&mut self.runtime_context).insert("index".to_string(), json!(index));
    }

    pub fn safe_rerun(&self) -> bool {
        self.runtime_context
            .get("safe_rerun")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_safe_rerun(&mut self, safe: bool) {
        ensure_object(&mut self.runtime_context).insert("safe_rerun".to_string(), json!(safe));
    }
}

/// A persisted request for future re-invocation of an engine operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelayedCall {
    pub id: Uuid,

    /// Target operation name, resolved by the handler registered with the
    /// scheduler
    pub target: String,

    /// Serialized arguments for the target
    pub args: Value,

    pub execution_time: DateTime<Utc>,

    /// Claimed by some scheduler instance
    pub processing: bool,

    /// When the claim was taken; claims lapse after the lease timeout
    pub captured_at: Option<DateTime<Utc>>,

    /// Instance that created the call; other instances honor a pickup grace
    /// period before claiming it
    pub scheduled_by: String,

    /// Optional key for targeted cancellation
    pub unique_key: Option<String>,

    /// Auth context snapshot restored around the invocation
    pub auth_context: Option<Value>,

    pub created_at: DateTime<Utc>,
}

impl DelayedCall {
    pub fn new(
        target: impl Into<String>,
        args: Value,
        execution_time: DateTime<Utc>,
        scheduled_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            target: target.into(),
            args,
            execution_time,
            processing: false,
            captured_at: None,
            scheduled_by: scheduled_by.into(),
            unique_key: None,
            auth_context: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }
}

fn ensure_object(value: &mut Value) -> &mut serde_json::Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(serde_json::Map::new());
    }
    match value {
        Value::Object(map) => map,
        // just replaced with an object
        _ => unreachable!(),
    }
}
