//! Task state machine
//!
//! Drives a single task from creation through completion. Task kind
//! (regular vs with-items fan-out) is selected by spec shape. All state is
//! persisted; every function here re-reads what it needs from the store so
//! concurrent engine instances stay correct through conditional updates
//! rather than shared memory.

pub mod with_items;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use windlass_core::{
    merge_contexts, ExecutionState, NextTask, RunTaskCommand, TaskExecution, TaskSpec,
    WorkflowExecution,
};

use crate::controller::{self, JoinState};
use crate::engine::{Engine, TARGET_REFRESH_TASK_STATE};
use crate::error::{truncate_state_info, EngineError, EngineResult};
use crate::policy::build_policies;
use crate::{action, dispatcher};

/// Entry point for a RunTask command
///
/// Join targets are deferred into WAITING executions and promoted by quorum;
/// everything else gets a fresh execution and runs immediately.
#[instrument(skip(engine, wf_ex, cmd), fields(workflow_execution_id = %wf_ex.id, task = %cmd.task_name))]
pub async fn run_task(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    cmd: &RunTaskCommand,
) -> EngineResult<()> {
    let spec = wf_ex
        .spec
        .get_task_spec(&cmd.task_name)
        .cloned()
        .ok_or_else(|| {
            EngineError::Workflow(format!(
                "task '{}' is not defined in workflow '{}'",
                cmd.task_name, wf_ex.workflow_name
            ))
        })?;

    if cmd.wait {
        let mut task_ex = get_or_create_waiting(engine, wf_ex, &spec).await?;

        if let Some(triggered_by) = &cmd.triggered_by {
            task_ex.add_triggered_by(triggered_by.clone());
            engine.store.update_task_execution(&task_ex).await?;
        }

        return refresh_join_task(engine, wf_ex, &task_ex).await;
    }

    let mut task_ex = TaskExecution::new(wf_ex.id, spec, ExecutionState::Idle);
    task_ex.in_context = build_in_context(wf_ex, &cmd.params);
    if let Some(triggered_by) = &cmd.triggered_by {
        task_ex.add_triggered_by(triggered_by.clone());
    }
    engine.store.create_task_execution(&task_ex).await?;

    run_existing_task(engine, task_ex.id, false).await
}

/// Re-enter an existing task execution (join promotion, rerun, delayed
/// re-entry, resume)
///
/// Promotes the task to RUNNING with a conditional update - a losing
/// concurrent writer no-ops - then runs before-start policies and schedules
/// actions unless a policy redirected the state.
#[instrument(skip(engine))]
pub async fn run_existing_task(
    engine: &Engine,
    task_execution_id: Uuid,
    reset: bool,
) -> EngineResult<()> {
    let mut task_ex = engine.store.get_task_execution(task_execution_id).await?;

    // Only ERROR may leave a terminal state (rerun)
    if task_ex.is_completed() && task_ex.state != ExecutionState::Error {
        return Ok(());
    }

    let wf_ex = engine
        .store
        .get_workflow_execution(task_ex.workflow_execution_id)
        .await?;

    if wf_ex.state.is_paused_or_completed() {
        debug!(task = %task_ex.name, "workflow not running, skipping task start");
        return Ok(());
    }

    EngineError::check_transition(task_ex.state, ExecutionState::Running)?;

    let won = engine
        .store
        .update_task_state(
            task_ex.id,
            &[task_ex.state],
            ExecutionState::Running,
            None,
        )
        .await?;
    if !won {
        // Someone else is already driving this task
        return Ok(());
    }
    task_ex.state = ExecutionState::Running;
    task_ex.state_info = None;

    if reset {
        reset_action_executions(engine, &task_ex).await?;
    }

    // Refresh the inbound context so reruns observe data published since
    let mut in_context = task_ex.in_context.clone();
    merge_contexts(&mut in_context, &wf_ex.context);
    task_ex.in_context = in_context;

    for policy in build_policies(&task_ex) {
        policy.before_task_start(engine, &wf_ex, &mut task_ex).await?;
    }
    engine.store.update_task_execution(&task_ex).await?;

    if task_ex.state != ExecutionState::Running {
        debug!(task = %task_ex.name, state = %task_ex.state, "policy redirected task, skipping action scheduling");
        return Ok(());
    }

    // Malformed input (with-items shape, bad action input) fails the task
    // rather than surfacing to the caller
    match schedule_actions(engine, &wf_ex, &mut task_ex).await {
        Err(EngineError::Input(message)) => {
            complete_task(engine, task_ex.id, ExecutionState::Error, Some(message)).await
        }
        other => other,
    }
}

/// Complete a task execution
///
/// This is the single funnel for task completion: action results, with-items
/// completion, timeouts, the integrity check and delayed wait-after
/// completions all land here. Returns a boxed future because completion
/// cascades into dispatching successor tasks, which can complete inline and
/// re-enter this function.
pub fn complete_task<'a>(
    engine: &'a Engine,
    task_execution_id: Uuid,
    state: ExecutionState,
    state_info: Option<String>,
) -> BoxFuture<'a, EngineResult<()>> {
    async move {
        let mut task_ex = engine.store.get_task_execution(task_execution_id).await?;

        // Already decided; idempotent no-op
        if task_ex.is_completed() {
            return Ok(());
        }

        // WAITING and RUNNING_DELAYED completions pass through RUNNING
        if matches!(
            task_ex.state,
            ExecutionState::Waiting | ExecutionState::RunningDelayed
        ) {
            task_ex.state = ExecutionState::Running;
        }
        EngineError::check_transition(task_ex.state, state)?;

        task_ex.state = state;
        task_ex.state_info =
            state_info.map(|m| truncate_state_info(&m, engine.config.state_info_limit));

        info!(task = %task_ex.name, %state, "completing task");

        let wf_ex = engine
            .store
            .get_workflow_execution(task_ex.workflow_execution_id)
            .await?;

        // After-complete policies may downgrade the completion (wait-after,
        // retry) - in that case the real completion happens on a delayed call
        for policy in build_policies(&task_ex) {
            policy.after_task_complete(engine, &wf_ex, &mut task_ex).await?;
        }
        if !task_ex.state.is_completed() {
            engine.store.update_task_execution(&task_ex).await?;
            return Ok(());
        }

        if task_ex.state == ExecutionState::Success && !task_ex.spec.publish.is_null() {
            let result = action_result(engine, &task_ex).await?;
            let mut publish_ctx = task_ex.in_context.clone();
            merge_contexts(&mut publish_ctx, &json!({ "result": result }));
            task_ex.published = engine
                .evaluator
                .evaluate_recursively(&task_ex.spec.publish, &publish_ctx)?;
        }

        // Fold published variables into the workflow data-flow context;
        // this is a read-modify-write over shared state, hence the lock
        if task_ex
            .published
            .as_object()
            .map(|o| !o.is_empty())
            .unwrap_or(false)
        {
            let lock = format!("{}-context", wf_ex.id);
            engine.store.acquire_named_lock(&lock).await?;
            let merged: EngineResult<()> = async {
                let mut fresh = engine.store.get_workflow_execution(wf_ex.id).await?;
                merge_contexts(&mut fresh.context, &task_ex.published);
                engine.store.update_workflow_execution(&fresh).await?;
                Ok(())
            }
            .await;
            engine.store.release_named_lock(&lock).await?;
            merged?;
        }

        // Compute continuation and cache the successor record
        let wf_ex = engine.store.get_workflow_execution(wf_ex.id).await?;
        let commands = controller::find_next_commands_for_task(engine, &wf_ex, &task_ex).await?;

        task_ex.next_tasks = commands
            .iter()
            .filter_map(|c| match c {
                windlass_core::WorkflowCommand::RunTask(run) => Some(NextTask {
                    name: run.task_name.clone(),
                    event: run
                        .triggered_by
                        .as_ref()
                        .map(|t| t.event)
                        .unwrap_or(windlass_core::EdgeKind::OnSuccess),
                }),
                _ => None,
            })
            .collect();
        task_ex.has_next_tasks = !task_ex.next_tasks.is_empty();
        task_ex.error_handled =
            task_ex.state == ExecutionState::Error && !task_ex.spec.on_error.is_empty();

        if wf_ex.is_paused() {
            // Commands computed under a pause are dropped, not queued: the
            // pause invalidates them and resume recomputes continuation
            engine.store.update_task_execution(&task_ex).await?;
            return Ok(());
        }

        task_ex.processed = true;
        engine.store.update_task_execution(&task_ex).await?;

        // The dispatch also runs the workflow-completion check once the
        // outermost command cascade unwinds
        dispatcher::dispatch_workflow_commands(engine, wf_ex.id, commands).await?;

        Ok(())
    }
    .boxed()
}

/// Lighter-weight state change for asynchronous progress notifications
///
/// Used when a child action execution (typically a sub-workflow) reports a
/// non-terminal state such as PAUSED. Refuses to move the task into RUNNING
/// while any child action execution is itself paused.
pub async fn update_task(
    engine: &Engine,
    task_execution_id: Uuid,
    state: ExecutionState,
) -> EngineResult<()> {
    let task_ex = engine.store.get_task_execution(task_execution_id).await?;

    if task_ex.state == state || task_ex.is_completed() {
        return Ok(());
    }

    if state == ExecutionState::Running {
        let actions = engine.store.get_action_executions(task_ex.id).await?;
        if actions.iter().any(|a| a.state == ExecutionState::Paused) {
            debug!(task = %task_ex.name, "child action still paused, refusing RUNNING");
            return Ok(());
        }
    }

    EngineError::check_transition(task_ex.state, state)?;
    engine
        .store
        .update_task_state(task_ex.id, &[task_ex.state], state, None)
        .await?;
    Ok(())
}

/// Delayed-call target: fail the task if it has not completed yet
pub async fn fail_task_if_incomplete(
    engine: &Engine,
    task_execution_id: Uuid,
    timeout: u64,
) -> EngineResult<()> {
    let task_ex = engine.store.get_task_execution(task_execution_id).await?;

    if task_ex.is_completed() {
        return Ok(());
    }

    warn!(task = %task_ex.name, timeout, "task timed out");
    complete_task(
        engine,
        task_execution_id,
        ExecutionState::Error,
        Some(format!("Task timed out after {timeout} seconds")),
    )
    .await
}

/// Delayed-call target: re-evaluate a waiting join task
pub async fn refresh_task_state(engine: &Engine, task_execution_id: Uuid) -> EngineResult<()> {
    let task_ex = engine.store.get_task_execution(task_execution_id).await?;

    if task_ex.state != ExecutionState::Waiting {
        return Ok(());
    }

    let wf_ex = engine
        .store
        .get_workflow_execution(task_ex.workflow_execution_id)
        .await?;

    if wf_ex.state.is_paused_or_completed() {
        return Ok(());
    }

    refresh_join_task(engine, &wf_ex, &task_ex).await
}

/// Evaluate a join task's logical state and act on it
async fn refresh_join_task(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_ex: &TaskExecution,
) -> EngineResult<()> {
    if task_ex.state != ExecutionState::Waiting {
        return Ok(());
    }

    match controller::evaluate_join_state(engine, wf_ex, &task_ex.spec).await? {
        JoinState::Running => run_existing_task(engine, task_ex.id, false).await,
        JoinState::Error(message) => {
            complete_task(engine, task_ex.id, ExecutionState::Error, Some(message)).await
        }
        JoinState::Waiting { cardinality } => {
            // Fallback polling in case a completion event never arrives;
            // nearly-complete joins poll faster than far-from-complete ones
            let key = format!("{}:refresh", task_ex.id);
            engine.scheduler.cancel_by_key(&key).await?;
            engine
                .scheduler
                .schedule(
                    TARGET_REFRESH_TASK_STATE,
                    refresh_delay(cardinality),
                    Some(key.as_str()),
                    json!({"task_execution_id": task_ex.id}),
                )
                .await?;
            Ok(())
        }
    }
}

fn refresh_delay(cardinality: usize) -> Duration {
    Duration::from_secs((2 * (1 + cardinality as u64)).min(60))
}

/// Create the WAITING execution for a join task, exactly once
///
/// Concurrent transactions discover the same join simultaneously, so
/// creation is guarded by a named lock keyed on the task's unique key. The
/// fast unlocked existence check keeps the common case lock-free.
async fn get_or_create_waiting(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    spec: &TaskSpec,
) -> EngineResult<TaskExecution> {
    let mut existing = engine
        .store
        .find_task_executions_by_name(wf_ex.id, &spec.name)
        .await?;
    if let Some(task_ex) = existing.pop() {
        return Ok(task_ex);
    }

    let lock = format!("{}-{}", wf_ex.id, spec.name);
    engine.store.acquire_named_lock(&lock).await?;

    let result: EngineResult<TaskExecution> = async {
        let mut existing = engine
            .store
            .find_task_executions_by_name(wf_ex.id, &spec.name)
            .await?;
        if let Some(task_ex) = existing.pop() {
            return Ok(task_ex);
        }

        let mut task_ex = TaskExecution::new(wf_ex.id, spec.clone(), ExecutionState::Waiting);
        task_ex.in_context = build_in_context(wf_ex, &Value::Null);
        engine.store.create_task_execution(&task_ex).await?;
        debug!(task = %task_ex.name, "created waiting join task");
        Ok(task_ex)
    }
    .await;

    engine.store.release_named_lock(&lock).await?;
    result
}

async fn schedule_actions(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_ex: &mut TaskExecution,
) -> EngineResult<()> {
    // An in-flight action execution means scheduling already happened
    let existing = engine.store.get_action_executions(task_ex.id).await?;
    if existing.iter().any(|a| !a.is_completed()) {
        return Ok(());
    }

    if task_ex.spec.has_with_items() {
        with_items::schedule_next_batch(engine, wf_ex, task_ex).await
    } else {
        action::schedule_action(engine, wf_ex, task_ex, None, None).await
    }
}

/// Un-accept failed/cancelled results so a rerun can redo them
async fn reset_action_executions(engine: &Engine, task_ex: &TaskExecution) -> EngineResult<()> {
    for mut action_ex in engine.store.get_action_executions(task_ex.id).await? {
        if action_ex.accepted
            && matches!(
                action_ex.state,
                ExecutionState::Error | ExecutionState::Cancelled
            )
        {
            action_ex.accepted = false;
            engine.store.update_action_execution(&action_ex).await?;
        }
    }
    Ok(())
}

/// The task's result as seen by publish expressions
///
/// A single accepted output for a regular task, an index-ordered array for
/// with-items.
async fn action_result(engine: &Engine, task_ex: &TaskExecution) -> EngineResult<Value> {
    let actions = engine.store.get_action_executions(task_ex.id).await?;

    if task_ex.spec.has_with_items() {
        let mut by_index: BTreeMap<usize, Value> = BTreeMap::new();
        for action_ex in &actions {
            if action_ex.accepted {
                if let Some(index) = action_ex.with_items_index() {
                    by_index.insert(index, action_ex.output.clone().unwrap_or(Value::Null));
                }
            }
        }
        return Ok(Value::Array(by_index.into_values().collect()));
    }

    Ok(actions
        .iter()
        .rev()
        .find(|a| a.accepted)
        .and_then(|a| a.output.clone())
        .unwrap_or(Value::Null))
}

fn build_in_context(wf_ex: &WorkflowExecution, params: &Value) -> Value {
    let mut ctx = wf_ex.context.clone();
    if !wf_ex.params.env.is_null() {
        merge_contexts(&mut ctx, &json!({"env": wf_ex.params.env}));
    }
    if !params.is_null() {
        merge_contexts(&mut ctx, params);
    }
    ctx
}
