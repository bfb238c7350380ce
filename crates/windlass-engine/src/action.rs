//! Action scheduling and completion
//!
//! A task's "action" is one of three shapes, selected by its spec:
//! a concrete remote-executor action (possibly reached through an ad-hoc
//! definition chain), or a sub-workflow mirrored on the parent side by an
//! action execution that receives the child's result. Selection happens here
//! via spec shape, not inheritance.

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use windlass_core::{
    merge_contexts, ActionExecution, ActionKind, ExecutionParams, ExecutionState, TaskExecution,
    WorkflowExecution,
};

use crate::client::SubWorkflowStart;
use crate::engine::Engine;
use crate::error::{truncate_state_info, EngineError, EngineResult};
use crate::runner::ActionCall;
use crate::{task, task::with_items};

/// Schedule one action (or sub-workflow) execution for a task
///
/// `index`/`item_ctx` are set for with-items iterations. The action
/// execution row is created before dispatch so a result can never arrive for
/// an unknown execution.
pub async fn schedule_action(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_ex: &TaskExecution,
    index: Option<usize>,
    item_ctx: Option<Value>,
) -> EngineResult<()> {
    let spec = &task_ex.spec;

    let mut eval_ctx = task_ex.in_context.clone();
    if let Some(item) = &item_ctx {
        merge_contexts(&mut eval_ctx, item);
    }

    let input = if spec.input.is_null() {
        json!({})
    } else {
        engine.evaluator.evaluate_recursively(&spec.input, &eval_ctx)?
    };

    if let Some(workflow_name) = &spec.workflow {
        return schedule_sub_workflow(engine, wf_ex, task_ex, workflow_name, input, index).await;
    }

    // Regular action; ad-hoc definitions resolve to their concrete base
    let name = spec.action.clone().unwrap_or_else(|| "std.noop".to_string());
    let (action_ref, input) = engine
        .actions
        .resolve(&name, input, engine.evaluator.as_ref())?;

    let mut action_ex =
        ActionExecution::new(task_ex.id, wf_ex.id, &name, ActionKind::Action, input.clone());
    if let Some(index) = index {
        action_ex.set_with_items_index(index);
    }
    action_ex.set_safe_rerun(spec.safe_rerun);
    engine.store.create_action_execution(&action_ex).await?;

    debug!(task = %task_ex.name, action = %name, action_execution_id = %action_ex.id, "scheduling action");

    let call = ActionCall {
        action_execution_id: action_ex.id,
        action_ref,
        input,
        safe_rerun: spec.safe_rerun,
        exec_context: json!({
            "workflow_execution_id": wf_ex.id,
            "task_execution_id": task_ex.id,
            "task_name": task_ex.name,
        }),
        target: spec.target.clone(),
        timeout: spec.policies.timeout,
    };

    match engine.runner.run_action(call).await {
        // Synchronous result: complete inline
        Ok(Some(output)) => {
            complete_action(engine, action_ex.id, ExecutionState::Success, output).await
        }
        // Result arrives later through on_action_complete
        Ok(None) => Ok(()),
        Err(e) => {
            complete_action(
                engine,
                action_ex.id,
                ExecutionState::Error,
                json!(e.to_string()),
            )
            .await
        }
    }
}

async fn schedule_sub_workflow(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_ex: &TaskExecution,
    workflow_name: &str,
    input: Value,
    index: Option<usize>,
) -> EngineResult<()> {
    let mut action_ex = ActionExecution::new(
        task_ex.id,
        wf_ex.id,
        workflow_name,
        ActionKind::Workflow,
        input.clone(),
    );
    if let Some(index) = index {
        action_ex.set_with_items_index(index);
    }
    action_ex.set_safe_rerun(task_ex.spec.safe_rerun);
    engine.store.create_action_execution(&action_ex).await?;

    debug!(task = %task_ex.name, workflow = %workflow_name, "starting sub-workflow");

    let start = SubWorkflowStart {
        workflow_name: workflow_name.to_string(),
        input,
        params: ExecutionParams {
            env: wf_ex.params.env.clone(),
            action_execution_id: Some(action_ex.id),
        },
        task_execution_id: task_ex.id,
        root_execution_id: wf_ex.root_execution_id.unwrap_or(wf_ex.id),
    };

    // Through the client, not a direct call: the child may live on another
    // engine, and the loopback path must behave identically
    engine.client().start_workflow(start).await?;
    Ok(())
}

/// Incorporate a terminal action result
///
/// Results arriving for an already-decided execution (logical cancel,
/// timeout) are ignored.
pub async fn complete_action(
    engine: &Engine,
    action_execution_id: Uuid,
    state: ExecutionState,
    output: Value,
) -> EngineResult<()> {
    let mut action = engine.store.get_action_execution(action_execution_id).await?;

    if action.is_completed() {
        debug!(%action_execution_id, "late result for a decided action execution, ignoring");
        return Ok(());
    }

    EngineError::check_transition(action.state, state)?;

    let task_ex = engine.store.get_task_execution(action.task_execution_id).await?;

    action.state = state;
    if matches!(state, ExecutionState::Error | ExecutionState::Cancelled) {
        let message = output
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| output.to_string());
        action.state_info = Some(truncate_state_info(&message, engine.config.state_info_limit));
    }
    action.output = Some(if task_ex.spec.keep_result {
        output
    } else {
        // The result is discarded by configuration; keep only the envelope
        json!({})
    });
    engine.store.update_action_execution(&action).await?;

    if task_ex.is_completed() {
        debug!(task = %task_ex.name, "task already decided, ignoring action result");
        return Ok(());
    }

    let wf_ex = engine
        .store
        .get_workflow_execution(task_ex.workflow_execution_id)
        .await?;

    if task_ex.spec.has_with_items() {
        return with_items::on_action_complete(engine, &wf_ex, task_ex, action).await;
    }

    action.accepted = true;
    engine.store.update_action_execution(&action).await?;

    let (task_state, state_info) = map_to_task_state(&action);
    task::complete_task(engine, task_ex.id, task_state, state_info).await
}

/// Apply an asynchronous action state notification (e.g. a paused
/// sub-workflow) to the action and its owning task
pub async fn update_action(
    engine: &Engine,
    action_execution_id: Uuid,
    state: ExecutionState,
) -> EngineResult<()> {
    let mut action = engine.store.get_action_execution(action_execution_id).await?;

    if action.state == state {
        return Ok(());
    }

    EngineError::check_transition(action.state, state)?;
    action.state = state;
    engine.store.update_action_execution(&action).await?;

    task::update_task(engine, action.task_execution_id, state).await
}

pub(crate) fn map_to_task_state(action: &ActionExecution) -> (ExecutionState, Option<String>) {
    match action.state {
        ExecutionState::Success => (ExecutionState::Success, None),
        ExecutionState::Cancelled => (
            ExecutionState::Cancelled,
            Some(format!("Action '{}' was cancelled", action.name)),
        ),
        _ => (
            ExecutionState::Error,
            Some(
                action
                    .state_info
                    .clone()
                    .unwrap_or_else(|| format!("Action '{}' failed", action.name)),
            ),
        ),
    }
}
