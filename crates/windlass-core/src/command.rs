//! Workflow commands
//!
//! Transient value objects describing an intended next action, produced by
//! the controller and consumed by the dispatcher. Commands are not persisted
//! as entities, but they serialize cleanly because paused workflows keep a
//! command backlog inside their runtime context.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::TriggeredBy;

/// Run a task that has no execution yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunTaskCommand {
    /// Name of the task spec within the workflow
    pub task_name: String,

    /// The task must wait for a join quorum; waiting commands are ordered by
    /// `unique_key` before dispatch
    #[serde(default)]
    pub wait: bool,

    /// Deterministic lock-ordering key for join tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,

    /// Evaluated parameter overrides carried by the firing edge
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    /// The predecessor and edge kind that produced this command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<TriggeredBy>,

    /// This command captures a predecessor's error
    #[serde(default)]
    pub handles_error: bool,
}

/// Re-enter an existing task execution (join promotion, rerun)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunExistingTaskCommand {
    pub task_execution_id: Uuid,

    /// Reset previously accepted failed/cancelled action executions so they
    /// can be redone
    #[serde(default)]
    pub reset: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<TriggeredBy>,

    #[serde(default)]
    pub handles_error: bool,
}

/// Change the owning workflow's state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetWorkflowStateCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An intended next action computed by the workflow controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowCommand {
    RunTask(RunTaskCommand),
    RunExistingTask(RunExistingTaskCommand),
    SucceedWorkflow(SetWorkflowStateCommand),
    FailWorkflow(SetWorkflowStateCommand),
    PauseWorkflow(SetWorkflowStateCommand),
    Noop,
}

impl WorkflowCommand {
    /// Build the command for a transition target, mapping the reserved
    /// engine-command names
    pub fn from_transition_target(
        target: &str,
        params: Value,
        triggered_by: Option<TriggeredBy>,
        handles_error: bool,
    ) -> Self {
        match target {
            "noop" => Self::Noop,
            "fail" => Self::FailWorkflow(SetWorkflowStateCommand::default()),
            "succeed" => Self::SucceedWorkflow(SetWorkflowStateCommand::default()),
            "pause" => Self::PauseWorkflow(SetWorkflowStateCommand::default()),
            name => Self::RunTask(RunTaskCommand {
                task_name: name.to_string(),
                wait: false,
                unique_key: None,
                params,
                triggered_by,
                handles_error,
            }),
        }
    }

    /// Whether this command changes the workflow's state
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            Self::SucceedWorkflow(_) | Self::FailWorkflow(_) | Self::PauseWorkflow(_)
        )
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, Self::PauseWorkflow(_))
    }

    /// A state change into a terminal state
    pub fn is_terminal_state_change(&self) -> bool {
        matches!(self, Self::SucceedWorkflow(_) | Self::FailWorkflow(_))
    }

    /// Whether this is a join/waiting run command
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::RunTask(cmd) if cmd.wait)
    }

    /// Lock-ordering key for waiting commands
    pub fn unique_key(&self) -> Option<&str> {
        match self {
            Self::RunTask(cmd) => cmd.unique_key.as_deref(),
            _ => None,
        }
    }

    /// Whether this command captures a predecessor's error
    pub fn handles_error(&self) -> bool {
        match self {
            Self::RunTask(cmd) => cmd.handles_error,
            Self::RunExistingTask(cmd) => cmd.handles_error,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_targets_map_to_engine_commands() {
        assert!(matches!(
            WorkflowCommand::from_transition_target("fail", Value::Null, None, false),
            WorkflowCommand::FailWorkflow(_)
        ));
        assert!(matches!(
            WorkflowCommand::from_transition_target("succeed", Value::Null, None, false),
            WorkflowCommand::SucceedWorkflow(_)
        ));
        assert!(matches!(
            WorkflowCommand::from_transition_target("pause", Value::Null, None, false),
            WorkflowCommand::PauseWorkflow(_)
        ));
        assert!(matches!(
            WorkflowCommand::from_transition_target("noop", Value::Null, None, false),
            WorkflowCommand::Noop
        ));

        match WorkflowCommand::from_transition_target("b", json!({"x": 1}), None, true) {
            WorkflowCommand::RunTask(cmd) => {
                assert_eq!(cmd.task_name, "b");
                assert!(cmd.handles_error);
            }
            other => panic!("expected RunTask, got {other:?}"),
        }
    }

    #[test]
    fn test_command_predicates() {
        let wait = WorkflowCommand::RunTask(RunTaskCommand {
            task_name: "join".into(),
            wait: true,
            unique_key: Some("k".into()),
            params: Value::Null,
            triggered_by: None,
            handles_error: false,
        });

        assert!(wait.is_waiting());
        assert_eq!(wait.unique_key(), Some("k"));
        assert!(!wait.is_state_changing());

        let pause = WorkflowCommand::PauseWorkflow(SetWorkflowStateCommand::default());
        assert!(pause.is_state_changing());
        assert!(pause.is_pause());
        assert!(!pause.is_terminal_state_change());
    }

    #[test]
    fn test_serde_roundtrip_for_backlog_storage() {
        let cmd = WorkflowCommand::RunExistingTask(RunExistingTaskCommand {
            task_execution_id: Uuid::now_v7(),
            reset: true,
            triggered_by: None,
            handles_error: false,
        });

        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "run_existing_task");

        let parsed: WorkflowCommand = serde_json::from_value(json).unwrap();
        assert_eq!(cmd, parsed);
    }
}
