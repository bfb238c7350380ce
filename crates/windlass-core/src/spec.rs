//! Resolved workflow and task specifications
//!
//! These are the post-DSL specification objects the engine consumes. Parsing
//! workflow text into this form happens upstream; task-defaults and similar
//! DSL sugar are already folded into each task here. The structures are
//! immutable from the engine's point of view: a copy is frozen into each
//! execution at creation time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task names reserved for engine commands rather than user tasks
///
/// A transition targeting one of these changes workflow state instead of
/// running a task.
pub const RESERVED_TASK_NAMES: [&str; 4] = ["noop", "fail", "succeed", "pause"];

/// Whether a transition target is an engine command, not a task reference
pub fn is_reserved_task_name(name: &str) -> bool {
    RESERVED_TASK_NAMES.contains(&name)
}

/// A complete workflow specification: a DAG of named tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSpec {
    /// Workflow name
    pub name: String,

    /// Tasks in declaration order
    pub tasks: Vec<TaskSpec>,

    /// Expression structure producing the workflow output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Expression structure producing the workflow output on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_on_error: Option<Value>,
}

impl WorkflowSpec {
    /// Look up a task spec by name
    pub fn get_task_spec(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Tasks with no inbound edges; these start the workflow
    pub fn start_task_specs(&self) -> Vec<&TaskSpec> {
        self.tasks
            .iter()
            .filter(|t| self.find_inbound_task_specs(&t.name).is_empty())
            .collect()
    }

    /// Tasks that list `name` as a transition target
    pub fn find_inbound_task_specs(&self, name: &str) -> Vec<&TaskSpec> {
        self.tasks
            .iter()
            .filter(|t| t.transition_names().any(|n| n == name))
            .collect()
    }

    /// Whether any task routes to `name`
    pub fn has_inbound(&self, name: &str) -> bool {
        !self.find_inbound_task_specs(name).is_empty()
    }
}

/// Edge kinds between tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    OnSuccess,
    OnError,
    OnComplete,
    OnSkip,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OnSuccess => "on-success",
            Self::OnError => "on-error",
            Self::OnComplete => "on-complete",
            Self::OnSkip => "on-skip",
        };
        write!(f, "{s}")
    }
}

/// A single outbound transition clause
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionSpec {
    /// Target task name (or a reserved engine command)
    pub next: String,

    /// Guard expression; an absent guard always fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Parameter overrides passed to the target task (may hold expressions)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl TransitionSpec {
    /// Unconditional transition to a task
    pub fn to(next: impl Into<String>) -> Self {
        Self {
            next: next.into(),
            condition: None,
            params: Value::Null,
        }
    }

    /// Guard the transition with a condition expression
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Attach parameter overrides
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Join quorum declared on a task with multiple inbound edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// Wait for every inbound predecessor
    All,

    /// Wait for at least N predecessors (`one` is `Count(1)`)
    Count(u32),
}

impl Join {
    /// The quorum size given the number of inbound predecessors
    pub fn quorum(&self, inbound: usize) -> usize {
        match self {
            Self::All => inbound,
            Self::Count(n) => (*n as usize).min(inbound),
        }
    }
}

// "all" | "one" | <number> in the serialized form
impl Serialize for Join {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::Count(1) => serializer.serialize_str("one"),
            Self::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Join {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        match raw {
            Value::String(s) if s == "all" => Ok(Self::All),
            Value::String(s) if s == "one" => Ok(Self::Count(1)),
            Value::Number(n) => n
                .as_u64()
                .filter(|n| *n >= 1)
                .map(|n| Self::Count(n as u32))
                .ok_or_else(|| serde::de::Error::custom("join count must be a positive integer")),
            other => Err(serde::de::Error::custom(format!(
                "invalid join specifier: {other}"
            ))),
        }
    }
}

/// One named collection a with-items task iterates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WithItemsBinding {
    /// Variable name bound per iteration
    pub var: String,

    /// The collection: a literal array or an expression yielding one
    pub items: Value,
}

/// With-items fan-out declaration: parallel, equal-length collections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WithItemsSpec {
    pub bindings: Vec<WithItemsBinding>,
}

/// Retry policy parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySpec {
    /// Maximum total attempts, the initial run included
    pub count: u32,

    /// Seconds between attempts
    #[serde(default)]
    pub delay: u64,

    /// Stop retrying an errored task when this evaluates truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_on: Option<String>,

    /// Keep iterating (even on success) while this evaluates truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<String>,
}

/// Policies attached to a task
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicySpec {
    /// Seconds to wait before the task starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_before: Option<u64>,

    /// Seconds to hold the task's completion after it finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_after: Option<u64>,

    /// Seconds after which an incomplete task is force-failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Retry parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    /// Pause the whole workflow before this task when truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_before: Option<String>,

    /// With-items concurrency cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

fn default_true() -> bool {
    true
}

/// A single task within a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Task name, unique within the workflow
    pub name: String,

    /// Action reference to execute (mutually exclusive with `workflow`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Sub-workflow name to execute (mutually exclusive with `action`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,

    /// Action/sub-workflow input (may hold expressions)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,

    /// Variables published into the data-flow context on success
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub publish: Value,

    /// Join quorum, when this task has multiple inbound edges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,

    /// Fan-out declaration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_items: Option<WithItemsSpec>,

    /// Keep the action result in the stored execution (`false` discards it)
    #[serde(default = "default_true")]
    pub keep_result: bool,

    /// Whether the action can be safely re-run after an engine crash
    #[serde(default)]
    pub safe_rerun: bool,

    /// Remote executor placement hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Attached policies
    #[serde(default)]
    pub policies: PolicySpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<TransitionSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<TransitionSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<TransitionSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_skip: Vec<TransitionSpec>,
}

impl TaskSpec {
    /// Minimal task running an action
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Some(action.into()),
            workflow: None,
            input: Value::Null,
            publish: Value::Null,
            join: None,
            with_items: None,
            keep_result: true,
            safe_rerun: false,
            target: None,
            policies: PolicySpec::default(),
            on_success: vec![],
            on_error: vec![],
            on_complete: vec![],
            on_skip: vec![],
        }
    }

    /// Whether this task is a join
    pub fn is_join(&self) -> bool {
        self.join.is_some()
    }

    /// Whether this task fans out over collections
    pub fn has_with_items(&self) -> bool {
        self.with_items.is_some()
    }

    /// Whether this task runs a sub-workflow rather than an action
    pub fn is_sub_workflow(&self) -> bool {
        self.workflow.is_some()
    }

    /// Clauses for one edge kind
    pub fn get_clauses(&self, kind: EdgeKind) -> &[TransitionSpec] {
        match kind {
            EdgeKind::OnSuccess => &self.on_success,
            EdgeKind::OnError => &self.on_error,
            EdgeKind::OnComplete => &self.on_complete,
            EdgeKind::OnSkip => &self.on_skip,
        }
    }

    /// Every transition target named by this task, reserved commands excluded
    pub fn transition_names(&self) -> impl Iterator<Item = &str> {
        self.on_success
            .iter()
            .chain(&self.on_error)
            .chain(&self.on_complete)
            .chain(&self.on_skip)
            .map(|t| t.next.as_str())
            .filter(|n| !is_reserved_task_name(n))
    }
}

/// Ad-hoc action definition: wraps a base action with partial input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdHocActionSpec {
    /// Definition name, unique within the registry
    pub name: String,

    /// The wrapped action: another ad-hoc definition or a concrete action ref
    pub base: String,

    /// Input folded into the base action (may hold expressions over the
    /// caller-provided input)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub base_input: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diamond() -> WorkflowSpec {
        // a -> b, a -> c, {b, c} -> d
        WorkflowSpec {
            name: "diamond".into(),
            tasks: vec![
                TaskSpec {
                    on_success: vec![TransitionSpec::to("b"), TransitionSpec::to("c")],
                    ..TaskSpec::new("a", "std.noop")
                },
                TaskSpec {
                    on_success: vec![TransitionSpec::to("d")],
                    ..TaskSpec::new("b", "std.noop")
                },
                TaskSpec {
                    on_success: vec![TransitionSpec::to("d")],
                    ..TaskSpec::new("c", "std.noop")
                },
                TaskSpec {
                    join: Some(Join::All),
                    ..TaskSpec::new("d", "std.noop")
                },
            ],
            output: None,
            output_on_error: None,
        }
    }

    #[test]
    fn test_start_tasks_have_no_inbound_edges() {
        let spec = diamond();
        let starts: Vec<_> = spec.start_task_specs().iter().map(|t| &t.name).collect();
        assert_eq!(starts, ["a"]);
    }

    #[test]
    fn test_inbound_task_specs() {
        let spec = diamond();
        let inbound: Vec<_> = spec
            .find_inbound_task_specs("d")
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(inbound, ["b", "c"]);
    }

    #[test]
    fn test_reserved_names_are_not_task_refs() {
        let mut spec = diamond();
        spec.tasks[3].on_error = vec![TransitionSpec::to("fail")];

        // "fail" routes to an engine command, not a task
        assert!(spec.find_inbound_task_specs("fail").is_empty());
    }

    #[test]
    fn test_join_serde() {
        assert_eq!(serde_json::from_value::<Join>(json!("all")).unwrap(), Join::All);
        assert_eq!(serde_json::from_value::<Join>(json!("one")).unwrap(), Join::Count(1));
        assert_eq!(serde_json::from_value::<Join>(json!(3)).unwrap(), Join::Count(3));
        assert!(serde_json::from_value::<Join>(json!(0)).is_err());

        assert_eq!(serde_json::to_value(Join::All).unwrap(), json!("all"));
        assert_eq!(serde_json::to_value(Join::Count(1)).unwrap(), json!("one"));
        assert_eq!(serde_json::to_value(Join::Count(2)).unwrap(), json!(2));
    }

    #[test]
    fn test_task_spec_roundtrip() {
        let task = TaskSpec {
            input: json!({"url": "<% base %>/items"}),
            publish: json!({"items": "<% result %>"}),
            policies: PolicySpec {
                retry: Some(RetrySpec {
                    count: 5,
                    delay: 2,
                    break_on: None,
                    continue_on: None,
                }),
                ..Default::default()
            },
            ..TaskSpec::new("fetch", "http.get")
        };

        let json = serde_json::to_value(&task).unwrap();
        let parsed: TaskSpec = serde_json::from_value(json).unwrap();
        assert_eq!(task, parsed);
        assert!(parsed.keep_result);
    }
}
