//! Direct workflow controller
//!
//! Given a workflow specification (a DAG of named tasks with on-success /
//! on-error / on-complete / on-skip edges) and the persisted task executions,
//! computes the next set of commands. This module is stateless: everything is
//! derived from the store on every call, which is what makes it safely
//! re-entrant across engine instances.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, instrument};

use windlass_core::{
    is_truthy, merge_contexts, EdgeKind, ExecutionState, Join, TaskExecution, TaskSpec,
    TransitionSpec, TriggeredBy, WorkflowCommand, WorkflowExecution,
};

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::persistence::Pagination;

/// Bound on the route-possibility walk up inbound edges
///
/// Graphs deeper than this are treated conservatively as "route still
/// possible", trading delayed ERROR detection for bounded work on very deep
/// or cyclic graphs.
pub const MAX_ROUTE_SEARCH_DEPTH: usize = 10;

/// Logical state of a join task derived from its predecessors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    /// The quorum is satisfied; the task may run
    Running,

    /// The quorum can no longer be satisfied
    Error(String),

    /// Still waiting; `cardinality` is how many predecessors are missing
    /// (callers use it to throttle re-check frequency)
    Waiting { cardinality: usize },
}

/// Induced state of one inbound predecessor with respect to a join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InducedState {
    Running,
    Error,
    Waiting,
}

/// Compute the next commands for a workflow
///
/// With no task executions yet this produces the start commands; given a
/// specific completed task it evaluates that task's outbound edges; with no
/// task given it evaluates every completed-but-unprocessed task.
#[instrument(skip(engine, wf_ex, task_ex), fields(workflow_execution_id = %wf_ex.id))]
pub async fn continue_workflow(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_ex: Option<&TaskExecution>,
) -> EngineResult<Vec<WorkflowCommand>> {
    let all = engine.store.get_task_executions(wf_ex.id).await?;

    if all.is_empty() {
        return Ok(start_commands(wf_ex));
    }

    match task_ex {
        Some(task_ex) => find_next_commands_for_task(engine, wf_ex, task_ex).await,
        None => {
            let mut commands = vec![];
            for task_ex in all.iter().filter(|t| t.is_completed() && !t.processed) {
                commands.extend(find_next_commands_for_task(engine, wf_ex, task_ex).await?);
            }
            Ok(commands)
        }
    }
}

/// Commands starting a workflow: one per task with no inbound edges
pub fn start_commands(wf_ex: &WorkflowExecution) -> Vec<WorkflowCommand>  {
    wf_ex
        .spec
        .start_task_specs()
        .into_iter()
        .map(|spec| {
            WorkflowCommand::RunTask(windlass_core::RunTaskCommand {
                task_name: spec.name.clone(),
                wait: spec.is_join(),
                unique_key: spec
                    .is_join()
                    .then(|| format!("{}-{}", wf_ex.id, spec.name)),
                params: Value::Null,
                triggered_by: None,
                handles_error: false,
            })
        })
        .collect()
}

/// Evaluate one completed task's outbound edges into commands
pub async fn find_next_commands_for_task(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_ex: &TaskExecution,
) -> EngineResult<Vec<WorkflowCommand>> {
    if !task_ex.is_completed() {
        return Ok(vec![]);
    }

    let spec = &task_ex.spec;
    let ctx = task_outbound_context(wf_ex, task_ex);
    let mut selected: Vec<(&TransitionSpec, EdgeKind)> = vec![];

    match task_ex.state {
        ExecutionState::Error => {
            selected.extend(spec.on_error.iter().map(|t| (t, EdgeKind::OnError)));
        }
        ExecutionState::Success if task_ex.is_skipped() => {
            // Skip-is-a-success: fall through to on-success when the task
            // declares no on-skip edges
            if spec.on_skip.is_empty() {
                selected.extend(spec.on_success.iter().map(|t| (t, EdgeKind::OnSuccess)));
            } else {
                selected.extend(spec.on_skip.iter().map(|t| (t, EdgeKind::OnSkip)));
            }
        }
        ExecutionState::Success => {
            selected.extend(spec.on_success.iter().map(|t| (t, EdgeKind::OnSuccess)));
        }
        _ => {}
    }

    // on-complete fires for any completed, non-cancelled, non-skipped state
    if task_ex.state != ExecutionState::Cancelled && !task_ex.is_skipped() {
        selected.extend(spec.on_complete.iter().map(|t| (t, EdgeKind::OnComplete)));
    }

    let mut commands = vec![];
    for (clause, kind) in selected {
        let fires = match &clause.condition {
            None => true,
            Some(expr) => is_truthy(&engine.evaluator.evaluate(expr, &ctx)?),
        };
        if !fires {
            continue;
        }

        let params = if clause.params.is_null() {
            Value::Null
        } else {
            engine.evaluator.evaluate_recursively(&clause.params, &ctx)?
        };

        let triggered_by = Some(TriggeredBy {
            task_execution_id: task_ex.id,
            event: kind,
        });

        let mut command = WorkflowCommand::from_transition_target(
            &clause.next,
            params,
            triggered_by,
            kind == EdgeKind::OnError,
        );

        // Join targets become waiting commands with a deterministic lock key
        if let WorkflowCommand::RunTask(ref mut run) = command {
            if let Some(target) = wf_ex.spec.get_task_spec(&run.task_name) {
                if target.is_join() {
                    run.wait = true;
                    run.unique_key = Some(format!("{}-{}", wf_ex.id, run.task_name));
                }
            }
        }

        commands.push(command);
    }

    debug!(task = %task_ex.name, state = %task_ex.state, count = commands.len(), "computed next commands");
    Ok(commands)
}

/// The data-flow context a task exposes to its outbound edges
pub fn task_outbound_context(wf_ex: &WorkflowExecution, task_ex: &TaskExecution) -> Value {
    let mut ctx = wf_ex.context.clone();
    merge_contexts(&mut ctx, &task_ex.in_context);
    merge_contexts(&mut ctx, &task_ex.published);
    ctx
}

/// Compute the logical state of a join task from its inbound predecessors
pub async fn evaluate_join_state(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_spec: &TaskSpec,
) -> EngineResult<JoinState> {
    let join = match task_spec.join {
        Some(join) => join,
        None => return Ok(JoinState::Running),
    };

    let inbound = wf_ex.spec.find_inbound_task_specs(&task_spec.name);
    let total = inbound.len();

    let mut running = 0usize;
    let mut errored = 0usize;
    let mut waiting = 0usize;

    for pred in &inbound {
        match induced_state(engine, wf_ex, pred, &task_spec.name).await? {
            InducedState::Running => running += 1,
            InducedState::Error => errored += 1,
            InducedState::Waiting => waiting += 1,
        }
    }

    let state = match join {
        Join::All => {
            if errored > 0 {
                JoinState::Error(format!(
                    "Impossible join: {errored} of {total} inbound tasks can no longer trigger '{}'",
                    task_spec.name
                ))
            } else if running == total {
                JoinState::Running
            } else {
                JoinState::Waiting {
                    cardinality: total - running,
                }
            }
        }
        Join::Count(_) => {
            let quorum = join.quorum(total);
            if running >= quorum {
                JoinState::Running
            } else if running + waiting < quorum {
                JoinState::Error(format!(
                    "Impossible join: only {} of the {quorum} required inbound tasks can still trigger '{}'",
                    running + waiting,
                    task_spec.name
                ))
            } else {
                JoinState::Waiting {
                    cardinality: quorum - running,
                }
            }
        }
    };

    debug!(join_task = %task_spec.name, ?state, "evaluated join state");
    Ok(state)
}

async fn induced_state(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    pred: &TaskSpec,
    join_name: &str,
) -> EngineResult<InducedState> {
    let mut execs = engine
        .store
        .find_task_executions_by_name(wf_ex.id, &pred.name)
        .await?;

    match execs.pop() {
        None => {
            if possible_route(engine, wf_ex, pred).await? {
                Ok(InducedState::Waiting)
            } else {
                Ok(InducedState::Error)
            }
        }
        // Successors are only final once the completion was processed
        Some(t) if !t.is_completed() || !t.processed => Ok(InducedState::Waiting),
        Some(t) => {
            if t.next_tasks.iter().any(|n| n.name == join_name) {
                Ok(InducedState::Running)
            } else {
                Ok(InducedState::Error)
            }
        }
    }
}

/// Whether a task with no execution yet can still be reached
///
/// Walks inbound edges upward, bounded by [`MAX_ROUTE_SEARCH_DEPTH`]:
/// a pending predecessor or a predecessor that already triggered the path
/// means "possible"; exhausting the walk means "blocked forever". Beyond the
/// depth bound the answer is conservatively "possible".
pub async fn possible_route(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_spec: &TaskSpec,
) -> EngineResult<bool> {
    let mut frontier: Vec<(String, usize)> = vec![(task_spec.name.clone(), 0)];
    let mut visited: HashSet<String> = HashSet::new();

    while let Some((name, depth)) = frontier.pop() {
        if depth > MAX_ROUTE_SEARCH_DEPTH {
            return Ok(true);
        }
        if !visited.insert(name.clone()) {
            continue;
        }

        let inbound = wf_ex.spec.find_inbound_task_specs(&name);
        if inbound.is_empty() {
            // A start task can always run
            return Ok(true);
        }

        for pred in inbound {
            let mut execs = engine
                .store
                .find_task_executions_by_name(wf_ex.id, &pred.name)
                .await?;

            match execs.pop() {
                None => frontier.push((pred.name.clone(), depth + 1)),
                Some(t) if !t.is_completed() => return Ok(true),
                Some(t) => {
                    if t.next_tasks.iter().any(|n| n.name == name) {
                        return Ok(true);
                    }
                    // Completed without triggering this edge: dead branch
                }
            }
        }
    }

    Ok(false)
}

/// A task may complete the workflow only when it triggered no successors
pub fn may_complete_workflow(task_ex: &TaskExecution) -> bool {
    !task_ex.has_next_tasks
}

/// Task executions in ERROR whose failure no route captured
pub async fn find_unhandled_errors(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
) -> EngineResult<Vec<TaskExecution>> {
    Ok(engine
        .store
        .get_task_executions(wf_ex.id)
        .await?
        .into_iter()
        .filter(|t| t.state == ExecutionState::Error && !t.error_handled)
        .collect())
}

/// Whether every errored task was captured by an error route
pub async fn all_errors_handled(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
) -> EngineResult<bool> {
    Ok(find_unhandled_errors(engine, wf_ex).await?.is_empty())
}

/// The context visible at workflow completion
///
/// Merges, in completion order, the published context of every task with no
/// outgoing edges. Fetches run in batches to bound memory on very large
/// workflows.
pub async fn evaluate_final_context(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
) -> EngineResult<Value> {
    let mut ctx = wf_ex.context.clone();
    let batch = engine.config.final_context_batch_size;
    let mut offset = 0u32;

    loop {
        let tasks = engine
            .store
            .get_completed_task_executions(
                wf_ex.id,
                Pagination {
                    offset,
                    limit: batch,
                },
            )
            .await?;

        if tasks.is_empty() {
            break;
        }

        for task_ex in &tasks {
            if task_ex.spec.transition_names().next().is_none() {
                merge_contexts(&mut ctx, &task_ex.published);
            }
        }

        if (tasks.len() as u32) < batch {
            break;
        }
        offset += batch;
    }

    Ok(ctx)
}
