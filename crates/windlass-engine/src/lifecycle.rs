//! Workflow lifecycle
//!
//! Start/stop/pause/resume/rerun at the whole-workflow level, plus
//! `check_and_complete` - the single authoritative place that decides a
//! workflow's final SUCCESS/ERROR/CANCELLED state, computes its output and
//! propagates the result to a parent engine when the execution is a
//! sub-workflow.

use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use windlass_core::{
    ExecutionParams, ExecutionState, RunExistingTaskCommand, WorkflowCommand, WorkflowExecution,
    WorkflowSpec,
};

use crate::controller;
use crate::dispatcher;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

/// Parent linkage for sub-workflow executions
#[derive(Debug, Clone, Copy)]
pub struct ParentLink {
    pub task_execution_id: Uuid,
    pub root_execution_id: Uuid,
}

/// Create and start a workflow execution
#[instrument(skip(engine, spec, input, params), fields(workflow = %spec.name))]
pub async fn start_workflow(
    engine: &Engine,
    spec: WorkflowSpec,
    input: Value,
    params: ExecutionParams,
    parent: Option<ParentLink>,
) -> EngineResult<WorkflowExecution> {
    let mut wf_ex = WorkflowExecution::new(spec, input.clone(), params);
    wf_ex.state = ExecutionState::Running;

    if let Some(parent) = parent {
        wf_ex.task_execution_id = Some(parent.task_execution_id);
        wf_ex.root_execution_id = Some(parent.root_execution_id);
    }

    // Initial data-flow context: the input, with the environment under `env`
    let mut context = json!({});
    if input.is_object() {
        windlass_core::merge_contexts(&mut context, &input);
    }
    if !wf_ex.params.env.is_null() {
        windlass_core::merge_contexts(&mut context, &json!({"env": wf_ex.params.env}));
    }
    wf_ex.context = context;

    engine.store.create_workflow_execution(&wf_ex).await?;
    info!(workflow_execution_id = %wf_ex.id, "started workflow execution");

    // Dispatch runs the completion check when it unwinds, so a workflow
    // with no tasks finalizes right away
    let commands = controller::continue_workflow(engine, &wf_ex, None).await?;
    dispatcher::dispatch_workflow_commands(engine, wf_ex.id, commands).await?;

    Ok(engine.store.get_workflow_execution(wf_ex.id).await?)
}

/// Pause a running workflow
///
/// Tasks already dispatched keep going; new command dispatch lands in the
/// backlog. A sub-workflow notifies its parent asynchronously.
pub async fn pause_workflow(
    engine: &Engine,
    workflow_execution_id: Uuid,
    message: Option<String>,
) -> EngineResult<()> {
    let won = engine
        .store
        .update_workflow_state(
            workflow_execution_id,
            &[ExecutionState::Running],
            ExecutionState::Paused,
            message,
        )
        .await?;

    if !won {
        debug!(%workflow_execution_id, "workflow not running, pause is a no-op");
        return Ok(());
    }

    info!(%workflow_execution_id, "paused workflow execution");

    let wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;
    if let Some(mirror) = wf_ex.params.action_execution_id {
        engine
            .client()
            .on_action_update(mirror, ExecutionState::Paused)
            .await?;
    }
    Ok(())
}

/// Resume a paused workflow
///
/// Continuation is re-evaluated from the controller (any PAUSE commands
/// still in the backlog are discarded), completed-but-unprocessed tasks are
/// marked processed so their decisions are not re-triggered, and tasks
/// parked in IDLE are re-entered.
#[instrument(skip(engine))]
pub async fn resume_workflow(engine: &Engine, workflow_execution_id: Uuid) -> EngineResult<()> {
    let mut wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;

    if !wf_ex.is_paused() {
        return Err(EngineError::Workflow(format!(
            "workflow execution {workflow_execution_id} is not paused (state: {})",
            wf_ex.state
        )));
    }

    // Pending pause commands predate this resume and must not re-fire
    let backlog = wf_ex.backlog();
    if !backlog.is_empty() {
        let mut kept = Vec::with_capacity(backlog.len());
        for raw in backlog {
            let command: WorkflowCommand = serde_json::from_value(raw)?;
            if !command.is_pause() {
                kept.push(serde_json::to_value(&command)?);
            }
        }
        wf_ex.set_backlog(kept);
        engine.store.update_workflow_execution(&wf_ex).await?;
    }

    let won = engine
        .store
        .update_workflow_state(
            workflow_execution_id,
            &[ExecutionState::Paused],
            ExecutionState::Running,
            None,
        )
        .await?;
    if !won {
        return Ok(());
    }

    info!(%workflow_execution_id, "resumed workflow execution");

    let wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;

    // Compute continuation for tasks completed under the pause, then mark
    // them processed - their decisions are now effectively made
    let mut commands: Vec<WorkflowCommand> = controller::continue_workflow(engine, &wf_ex, None)
        .await?
        .into_iter()
        .filter(|c| !c.is_pause())
        .collect();

    let tasks = engine.store.get_task_executions(workflow_execution_id).await?;
    for task_ex in &tasks {
        if task_ex.is_completed() && !task_ex.processed {
            let mut task_ex = task_ex.clone();
            task_ex.processed = true;
            engine.store.update_task_execution(&task_ex).await?;
        }
    }

    // Tasks parked in IDLE (pause-before) are re-entered
    for task_ex in &tasks {
        if task_ex.state == ExecutionState::Idle {
            commands.push(WorkflowCommand::RunExistingTask(RunExistingTaskCommand {
                task_execution_id: task_ex.id,
                reset: false,
                triggered_by: None,
                handles_error: false,
            }));
        }
    }

    dispatcher::dispatch_workflow_commands(engine, workflow_execution_id, commands).await?;

    if let Some(mirror) = wf_ex.params.action_execution_id {
        engine
            .client()
            .on_action_update(mirror, ExecutionState::Running)
            .await?;
    }

    Ok(())
}

/// Force a workflow into a terminal state
///
/// With `force` set on cancellation, incomplete action executions are
/// reported to the remote executor for best-effort cancellation; the
/// executor may still be running the underlying work.
#[instrument(skip(engine, message))]
pub async fn stop_workflow(
    engine: &Engine,
    workflow_execution_id: Uuid,
    state: ExecutionState,
    message: Option<String>,
    force: bool,
) -> EngineResult<()> {
    if !state.is_completed() {
        return Err(EngineError::Workflow(format!(
            "cannot stop workflow with non-terminal state {state}"
        )));
    }

    let mut wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;
    if wf_ex.is_completed() {
        return Ok(());
    }

    if state == ExecutionState::Cancelled {
        wf_ex.set_cancel_requested();
        engine.store.update_workflow_execution(&wf_ex).await?;
    }

    finalize(
        engine,
        &wf_ex,
        state,
        message.or_else(|| Some(format!("Workflow execution stopped ({state})"))),
    )
    .await?;

    if state == ExecutionState::Cancelled && force {
        for task_ex in engine
            .store
            .get_incomplete_task_executions(workflow_execution_id)
            .await?
        {
            for action_ex in engine.store.get_action_executions(task_ex.id).await? {
                if !action_ex.is_completed() {
                    engine.runner.cancel_action(action_ex.id).await?;
                }
            }
        }
    }

    Ok(())
}

/// Rerun a task that completed in ERROR
///
/// Walks up through parent sub-workflow executions, re-arming each ancestor
/// to RUNNING, before re-entering the target task.
#[instrument(skip(engine))]
pub async fn rerun_workflow(
    engine: &Engine,
    task_execution_id: Uuid,
    reset: bool,
) -> EngineResult<()> {
    let mut task_ex = engine.store.get_task_execution(task_execution_id).await?;

    if task_ex.state != ExecutionState::Error {
        return Err(EngineError::Workflow(format!(
            "only tasks in ERROR can be rerun (task '{}' is {})",
            task_ex.name, task_ex.state
        )));
    }

    // Re-arm the ancestor chain, bottom up
    let mut workflow_execution_id = task_ex.workflow_execution_id;
    loop {
        engine
            .store
            .update_workflow_state(
                workflow_execution_id,
                &[
                    ExecutionState::Error,
                    ExecutionState::Paused,
                    ExecutionState::Running,
                ],
                ExecutionState::Running,
                None,
            )
            .await?;

        let wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;
        let parent_task_id = match wf_ex.task_execution_id {
            Some(id) => id,
            None => break,
        };

        // The parent task and its mirror action un-complete so the child's
        // new result can be accepted again
        let parent_task = engine.store.get_task_execution(parent_task_id).await?;
        engine
            .store
            .update_task_state(
                parent_task.id,
                &[ExecutionState::Error],
                ExecutionState::Running,
                None,
            )
            .await?;

        if let Some(mirror) = wf_ex.params.action_execution_id {
            let mut action_ex = engine.store.get_action_execution(mirror).await?;
            if action_ex.is_completed() {
                action_ex.state = ExecutionState::Running;
                action_ex.accepted = false;
                engine.store.update_action_execution(&action_ex).await?;
            }
        }

        workflow_execution_id = parent_task.workflow_execution_id;
    }

    task_ex.processed = false;
    engine.store.update_task_execution(&task_ex).await?;

    info!(task = %task_ex.name, "re-running task");

    dispatcher::dispatch_workflow_commands(
        engine,
        task_ex.workflow_execution_id,
        vec![WorkflowCommand::RunExistingTask(RunExistingTaskCommand {
            task_execution_id,
            reset,
            triggered_by: None,
            handles_error: false,
        })],
    )
    .await
}

/// Fail the workflow (dispatcher command path)
pub async fn fail_workflow(
    engine: &Engine,
    workflow_execution_id: Uuid,
    message: Option<String>,
) -> EngineResult<()> {
    let wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;
    if wf_ex.is_completed() {
        return Ok(());
    }
    finalize(
        engine,
        &wf_ex,
        ExecutionState::Error,
        message.or_else(|| Some("Workflow failed".to_string())),
    )
    .await
}

/// Succeed the workflow (dispatcher command path)
pub async fn succeed_workflow(
    engine: &Engine,
    workflow_execution_id: Uuid,
    message: Option<String>,
) -> EngineResult<()> {
    let wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;
    if wf_ex.is_completed() {
        return Ok(());
    }
    finalize(engine, &wf_ex, ExecutionState::Success, message).await
}

/// Decide whether the workflow is done and, if so, finalize it
///
/// Short-circuits while paused or completed; returns early while incomplete
/// tasks remain. Cancellation takes priority over unhandled errors, which
/// take priority over success.
pub async fn check_and_complete(engine: &Engine, workflow_execution_id: Uuid) -> EngineResult<()> {
    // A dispatch further up the stack is still placing commands; it runs
    // this check once it unwinds
    if engine.in_dispatch(workflow_execution_id) {
        return Ok(());
    }

    let wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;

    if wf_ex.state.is_paused_or_completed() {
        return Ok(());
    }

    let tasks = engine.store.get_task_executions(workflow_execution_id).await?;
    if tasks.is_empty() && !wf_ex.spec.tasks.is_empty() {
        // Nothing dispatched yet
        return Ok(());
    }

    let incomplete = engine
        .store
        .get_incomplete_task_executions(workflow_execution_id)
        .await?;
    if !incomplete.is_empty() {
        return Ok(());
    }

    let cancelled = wf_ex.is_cancel_requested()
        || tasks.iter().any(|t| t.state == ExecutionState::Cancelled);

    if cancelled {
        return finalize(
            engine,
            &wf_ex,
            ExecutionState::Cancelled,
            Some("Workflow execution was cancelled".to_string()),
        )
        .await;
    }

    let unhandled = controller::find_unhandled_errors(engine, &wf_ex).await?;
    if !unhandled.is_empty() {
        let names: Vec<&str> = unhandled.iter().map(|t| t.name.as_str()).collect();
        let message = format!("Tasks failed without an error route: {}", names.join(", "));
        return finalize(engine, &wf_ex, ExecutionState::Error, Some(message)).await;
    }

    finalize(engine, &wf_ex, ExecutionState::Success, None).await
}

/// Apply a terminal state, compute the output, notify the parent
async fn finalize(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    state: ExecutionState,
    message: Option<String>,
) -> EngineResult<()> {
    let final_context = controller::evaluate_final_context(engine, wf_ex).await?;
    let mut message = message;

    let output = match state {
        ExecutionState::Success => match &wf_ex.spec.output {
            Some(expr) => engine.evaluator.evaluate_recursively(expr, &final_context)?,
            None => final_context.clone(),
        },
        ExecutionState::Error => match &wf_ex.spec.output_on_error {
            Some(expr) => match engine.evaluator.evaluate_recursively(expr, &final_context) {
                Ok(value) => value,
                Err(e) => {
                    // Best effort: a broken output transform must not mask
                    // the original failure
                    warn!(workflow_execution_id = %wf_ex.id, "output_on_error evaluation failed: {}", e);
                    message = Some(format!(
                        "{} (output_on_error evaluation failed: {e})",
                        message.unwrap_or_else(|| "Workflow failed".to_string())
                    ));
                    json!({})
                }
            },
            None => json!({"message": message.clone()}),
        },
        _ => json!({}),
    };

    // SUCCESS is only reachable from RUNNING; failure and cancellation may
    // also take a paused workflow
    let expected: &[ExecutionState] = if state == ExecutionState::Success {
        &[ExecutionState::Running]
    } else {
        &[ExecutionState::Running, ExecutionState::Paused]
    };

    let won = engine
        .store
        .update_workflow_state(wf_ex.id, expected, state, message.clone())
        .await?;
    if !won {
        // Another instance finalized first
        return Ok(());
    }

    let mut fresh = engine.store.get_workflow_execution(wf_ex.id).await?;
    fresh.context = final_context;
    fresh.output = Some(output.clone());
    engine.store.update_workflow_execution(&fresh).await?;

    info!(workflow_execution_id = %wf_ex.id, %state, "finalized workflow execution");

    // Sub-workflow: report to the parent outside the finalizing transaction
    if let Some(mirror) = fresh.params.action_execution_id {
        let payload = match state {
            ExecutionState::Success => output,
            _ => json!(message.unwrap_or_else(|| format!("Sub-workflow {state}"))),
        };
        engine.client().on_action_complete(mirror, state, payload).await?;
    }

    Ok(())
}
