//! Command dispatcher
//!
//! Converts a raw list of workflow commands into a safely ordered execution
//! sequence and runs it. Two guarantees matter here:
//!
//! - **Deadlock-free locking order**: join ("waiting") commands are sorted by
//!   `unique_key` ascending before execution. Every engine instance applies
//!   the same total order, so two transactions that touch the same set of
//!   join-task rows always lock them in the same sequence.
//! - **Terminal/pause handling**: commands after a non-pause terminal command
//!   can never execute and are discarded; commands after a pause survive into
//!   the workflow's backlog for replay on resume.
//!
//! The backlog lives in the workflow's runtime context and is only written
//! when non-empty - this path runs extremely frequently in high-fan-out
//! workflows and must not generate spurious persistence writes.

use tracing::{debug, instrument};
use uuid::Uuid;

use windlass_core::WorkflowCommand;

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::{lifecycle, task};

/// Order and filter commands for safe execution
///
/// - No-op commands are dropped.
/// - If the first command changes workflow state and is not a pause, it is
///   the only survivor.
/// - Commands before the first state change run first: non-waiting commands
///   in their original order, then waiting commands sorted by `unique_key`.
/// - Commands after a pause are preserved (they feed the backlog); commands
///   after a terminal state change are discarded.
pub fn rearrange_commands(commands: Vec<WorkflowCommand>) -> Vec<WorkflowCommand> {
    let commands: Vec<WorkflowCommand> = commands
        .into_iter()
        .filter(|c| !matches!(c, WorkflowCommand::Noop))
        .collect();

    let state_cmd_idx = commands.iter().position(|c| c.is_state_changing());

    if let Some(0) = state_cmd_idx {
        if !commands[0].is_pause() {
            return commands.into_iter().take(1).collect();
        }
    }

    let split = state_cmd_idx.unwrap_or(commands.len());
    let mut rest = commands;
    let before = rest.drain(..split).collect::<Vec<_>>();

    let (mut result, mut waiting): (Vec<_>, Vec<_>) =
        before.into_iter().partition(|c| !c.is_waiting());

    waiting.sort_by(|a, b| a.unique_key().cmp(&b.unique_key()));
    result.extend(waiting);

    if let Some(state_cmd) = rest.first().cloned() {
        let is_pause = state_cmd.is_pause();
        result.push(state_cmd);
        if is_pause {
            // Everything after the pause is replayed on resume
            result.extend(rest.into_iter().skip(1));
        }
    }

    result
}

/// Execute commands against a workflow, draining the backlog first
///
/// Processing stops dead once the workflow reaches a completed state. If the
/// workflow is (or becomes) paused, the remaining commands are pushed to the
/// backlog instead of executing.
#[instrument(skip(engine, commands), fields(command_count = commands.len()))]
pub async fn dispatch_workflow_commands(
    engine: &Engine,
    workflow_execution_id: Uuid,
    commands: Vec<WorkflowCommand>,
) -> EngineResult<()> {
    // Inline action results can cascade completions while this dispatch is
    // still placing sibling commands; nested workflow-completion checks are
    // held off until the outermost dispatch unwinds
    engine.enter_dispatch(workflow_execution_id);
    let result = dispatch_inner(engine, workflow_execution_id, commands).await;
    let depth = engine.leave_dispatch(workflow_execution_id);

    result?;

    if depth == 0 {
        lifecycle::check_and_complete(engine, workflow_execution_id).await?;
    }
    Ok(())
}

async fn dispatch_inner(
    engine: &Engine,
    workflow_execution_id: Uuid,
    commands: Vec<WorkflowCommand>,
) -> EngineResult<()> {
    let commands = rearrange_commands(commands);

    // Drain the persisted backlog ahead of the newly computed commands
    let mut wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;
    let backlog = wf_ex.backlog();
    let mut queue: Vec<WorkflowCommand> = Vec::with_capacity(backlog.len() + commands.len());

    if !backlog.is_empty() {
        for raw in backlog {
            queue.push(serde_json::from_value(raw)?);
        }
        wf_ex.set_backlog(vec![]);
        engine.store.update_workflow_execution(&wf_ex).await?;
        debug!(count = queue.len(), "drained command backlog");
    }

    queue.extend(commands);

    let mut deferred: Vec<WorkflowCommand> = vec![];
    let mut iter = queue.into_iter();

    while let Some(command) = iter.next() {
        // The workflow may change state under us while commands execute
        let wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;

        if wf_ex.is_completed() {
            break;
        }

        if wf_ex.is_paused() {
            deferred.push(command);
            deferred.extend(iter);
            break;
        }

        execute_command(engine, workflow_execution_id, command).await?;
    }

    if !deferred.is_empty() {
        let mut wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;
        let mut backlog = wf_ex.backlog();
        for command in &deferred {
            backlog.push(serde_json::to_value(command)?);
        }
        wf_ex.set_backlog(backlog);
        engine.store.update_workflow_execution(&wf_ex).await?;
        debug!(count = deferred.len(), "deferred commands to backlog");
    }

    Ok(())
}

async fn execute_command(
    engine: &Engine,
    workflow_execution_id: Uuid,
    command: WorkflowCommand,
) -> EngineResult<()> {
    match command {
        WorkflowCommand::RunTask(cmd) => {
            let wf_ex = engine.store.get_workflow_execution(workflow_execution_id).await?;
            task::run_task(engine, &wf_ex, &cmd).await
        }
        WorkflowCommand::RunExistingTask(cmd) => {
            task::run_existing_task(engine, cmd.task_execution_id, cmd.reset).await
        }
        WorkflowCommand::FailWorkflow(cmd) => {
            lifecycle::fail_workflow(engine, workflow_execution_id, cmd.message).await
        }
        WorkflowCommand::SucceedWorkflow(cmd) => {
            lifecycle::succeed_workflow(engine, workflow_execution_id, cmd.message).await
        }
        WorkflowCommand::PauseWorkflow(cmd) => {
            lifecycle::pause_workflow(engine, workflow_execution_id, cmd.message).await
        }
        WorkflowCommand::Noop => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_core::{RunTaskCommand, SetWorkflowStateCommand};

    fn run(name: &str) -> WorkflowCommand {
        WorkflowCommand::RunTask(RunTaskCommand {
            task_name: name.into(),
            wait: false,
            unique_key: None,
            params: serde_json::Value::Null,
            triggered_by: None,
            handles_error: false,
        })
    }

    fn wait(name: &str, key: &str) -> WorkflowCommand {
        WorkflowCommand::RunTask(RunTaskCommand {
            task_name: name.into(),
            wait: true,
            unique_key: Some(key.into()),
            params: serde_json::Value::Null,
            triggered_by: None,
            handles_error: false,
        })
    }

    fn fail() -> WorkflowCommand {
        WorkflowCommand::FailWorkflow(SetWorkflowStateCommand::default())
    }

    fn succeed() -> WorkflowCommand {
        WorkflowCommand::SucceedWorkflow(SetWorkflowStateCommand::default())
    }

    fn pause() -> WorkflowCommand {
        WorkflowCommand::PauseWorkflow(SetWorkflowStateCommand::default())
    }

    fn names(commands: &[WorkflowCommand]) -> Vec<String> {
        commands
            .iter()
            .map(|c| match c {
                WorkflowCommand::RunTask(cmd) => cmd.task_name.clone(),
                WorkflowCommand::FailWorkflow(_) => "fail".into(),
                WorkflowCommand::SucceedWorkflow(_) => "succeed".into(),
                WorkflowCommand::PauseWorkflow(_) => "pause".into(),
                WorkflowCommand::RunExistingTask(_) => "existing".into(),
                WorkflowCommand::Noop => "noop".into(),
            })
            .collect()
    }

    #[test]
    fn test_leading_terminal_command_truncates_everything() {
        let result = rearrange_commands(vec![
            fail(),
            run("a"),
            wait("b", "2"),
            wait("d", "9"),
            wait("c", "5"),
        ]);

        assert_eq!(names(&result), ["fail"]);
    }

    #[test]
    fn test_waiting_commands_sorted_by_key_terminal_last() {
        let result = rearrange_commands(vec![
            run("a"),
            wait("b", "2"),
            wait("c", "9"),
            wait("d", "5"),
            succeed(),
        ]);

        assert_eq!(names(&result), ["a", "b", "d", "c", "succeed"]);
    }

    #[test]
    fn test_commands_after_terminal_are_discarded() {
        let result = rearrange_commands(vec![run("a"), fail(), run("b")]);
        assert_eq!(names(&result), ["a", "fail"]);
    }

    #[test]
    fn test_commands_after_pause_are_preserved() {
        let result = rearrange_commands(vec![run("a"), pause(), run("b"), run("c")]);
        assert_eq!(names(&result), ["a", "pause", "b", "c"]);
    }

    #[test]
    fn test_leading_pause_keeps_rest() {
        let result = rearrange_commands(vec![pause(), run("a")]);
        assert_eq!(names(&result), ["pause", "a"]);
    }

    #[test]
    fn test_noops_are_dropped() {
        let result = rearrange_commands(vec![WorkflowCommand::Noop, run("a"), WorkflowCommand::Noop]);
        assert_eq!(names(&result), ["a"]);
    }

    #[test]
    fn test_non_waiting_keep_relative_order_before_waiting() {
        let result = rearrange_commands(vec![wait("j2", "9"), run("a"), wait("j1", "1"), run("b")]);
        assert_eq!(names(&result), ["a", "b", "j1", "j2"]);
    }
}
