//! Task policies
//!
//! Pluggable before/after hooks attached to a task. Policies redirect task
//! state (typically to RUNNING_DELAYED) and use the scheduler for re-entry;
//! they never block. Because `before_task_start` / `after_task_complete` can
//! be invoked more than once across delayed re-entries, each policy keeps a
//! one-shot `skip` flag in the task's runtime context.
//!
//! Callers persist the task execution after running a policy chain; a policy
//! only mutates the in-memory entity and schedules delayed calls.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use windlass_core::{is_truthy, ExecutionState, RetrySpec, TaskExecution, WorkflowExecution};

use crate::controller;
use crate::engine::{
    Engine, TARGET_COMPLETE_TASK, TARGET_FAIL_IF_INCOMPLETE, TARGET_RUN_EXISTING,
};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle;

/// A before/after hook attached to a task
#[async_trait]
pub trait TaskPolicy: Send + Sync {
    async fn before_task_start(
        &self,
        _engine: &Engine,
        _wf_ex: &WorkflowExecution,
        _task_ex: &mut TaskExecution,
    ) -> EngineResult<()> {
        Ok(())
    }

    async fn after_task_complete(
        &self,
        _engine: &Engine,
        _wf_ex: &WorkflowExecution,
        _task_ex: &mut TaskExecution,
    ) -> EngineResult<()> {
        Ok(())
    }
}

/// Build the policy chain a task spec declares
pub fn build_policies(task_ex: &TaskExecution) -> Vec<Box<dyn TaskPolicy>> {
    let policies = &task_ex.spec.policies;
    let mut chain: Vec<Box<dyn TaskPolicy>> = vec![];

    if let Some(delay) = policies.wait_before {
        chain.push(Box::new(WaitBeforePolicy { delay }));
    }
    if let Some(delay) = policies.wait_after {
        chain.push(Box::new(WaitAfterPolicy { delay }));
    }
    if let Some(retry) = &policies.retry {
        chain.push(Box::new(RetryPolicy {
            spec: retry.clone(),
        }));
    }
    if let Some(seconds) = policies.timeout {
        chain.push(Box::new(TimeoutPolicy { seconds }));
    }
    if let Some(expr) = &policies.pause_before {
        chain.push(Box::new(PauseBeforePolicy {
            expression: expr.clone(),
        }));
    }
    if let Some(limit) = policies.concurrency {
        chain.push(Box::new(ConcurrencyPolicy { limit }));
    }

    chain
}

fn skip_flag(task_ex: &TaskExecution, key: &str) -> bool {
    task_ex
        .runtime_get(key)
        .and_then(|v| v.get("skip"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn set_skip_flag(task_ex: &mut TaskExecution, key: &str) {
    task_ex.runtime_set(key, json!({"skip": true}));
}

// =============================================================================
// WaitBefore
// =============================================================================

/// Delay the task's first start
pub struct WaitBeforePolicy {
    pub delay: u64,
}

const WAIT_BEFORE_KEY: &str = "wait_before_policy";

#[async_trait]
impl TaskPolicy for WaitBeforePolicy {
    async fn before_task_start(
        &self,
        engine: &Engine,
        _wf_ex: &WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> EngineResult<()> {
        if skip_flag(task_ex, WAIT_BEFORE_KEY) {
            // Delayed re-entry: let the start proceed
            return Ok(());
        }
        set_skip_flag(task_ex, WAIT_BEFORE_KEY);

        debug!(task = %task_ex.name, delay = self.delay, "waiting before task start");
        task_ex.state = ExecutionState::RunningDelayed;
        task_ex.state_info = Some(format!("Waiting {}s before task start", self.delay));

        let key = format!("{}:wait-before", task_ex.id);
        engine
            .scheduler
            .schedule(
                TARGET_RUN_EXISTING,
                Duration::from_secs(self.delay),
                Some(key.as_str()),
                json!({"task_execution_id": task_ex.id, "reset": false}),
            )
            .await?;

        Ok(())
    }
}

// =============================================================================
// WaitAfter
// =============================================================================

/// Hold the task's completion for a while
///
/// The true completion state is carried by the delayed call; the task parks
/// in RUNNING_DELAYED until it fires.
pub struct WaitAfterPolicy {
    pub delay: u64,
}

const WAIT_AFTER_KEY: &str = "wait_after_policy";

#[async_trait]
impl TaskPolicy for WaitAfterPolicy {
    async fn after_task_complete(
        &self,
        engine: &Engine,
        _wf_ex: &WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> EngineResult<()> {
        if skip_flag(task_ex, WAIT_AFTER_KEY) {
            // The delayed completion is the real one
            return Ok(());
        }
        set_skip_flag(task_ex, WAIT_AFTER_KEY);

        let state = task_ex.state;
        let state_info = task_ex.state_info.clone();

        debug!(task = %task_ex.name, delay = self.delay, %state, "holding task completion");
        task_ex.state = ExecutionState::RunningDelayed;
        task_ex.state_info = Some(format!("Waiting {}s after task completion", self.delay));

        let key = format!("{}:wait-after", task_ex.id);
        engine
            .scheduler
            .schedule(
                TARGET_COMPLETE_TASK,
                Duration::from_secs(self.delay),
                Some(key.as_str()),
                json!({
                    "task_execution_id": task_ex.id,
                    "state": state,
                    "state_info": state_info,
                }),
            )
            .await?;

        Ok(())
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Re-run a task after completion
///
/// `count` caps total attempts (the initial run included), tracked through a
/// `retry_no` counter in the runtime context. The remaining-attempts check
/// deliberately gates `continue_on` evaluation: workflow authors depend on
/// that precedence.
pub struct RetryPolicy {
    pub spec: RetrySpec,
}

const RETRY_NO_KEY: &str = "retry_no";

#[async_trait]
impl TaskPolicy for RetryPolicy {
    async fn after_task_complete(
        &self,
        engine: &Engine,
        wf_ex: &WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> EngineResult<()> {
        // A preceding policy (wait-after) already downgraded the completion
        if !task_ex.state.is_completed() {
            return Ok(());
        }
        if task_ex.state == ExecutionState::Cancelled {
            return Ok(());
        }

        let retry_no = task_ex
            .runtime_get(RETRY_NO_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        if retry_no + 1 >= self.spec.count {
            return Ok(());
        }

        let ctx = controller::task_outbound_context(wf_ex, task_ex);

        match task_ex.state {
            ExecutionState::Success => {
                // Success only keeps iterating under an explicit continue-on
                let continue_on = match &self.spec.continue_on {
                    Some(expr) => expr,
                    None => return Ok(()),
                };
                if !is_truthy(&engine.evaluator.evaluate(continue_on, &ctx)?) {
                    return Ok(());
                }
            }
            ExecutionState::Error => {
                if let Some(break_on) = &self.spec.break_on {
                    if is_truthy(&engine.evaluator.evaluate(break_on, &ctx)?) {
                        return Ok(());
                    }
                }
            }
            _ => return Ok(()),
        }

        // Invalidate prior results so the re-run starts clean
        for mut action in engine.store.get_action_executions(task_ex.id).await? {
            if action.is_completed() && action.accepted {
                action.accepted = false;
                engine.store.update_action_execution(&action).await?;
            }
        }

        let retry_no = retry_no + 1;
        task_ex.runtime_set(RETRY_NO_KEY, json!(retry_no));
        task_ex.state = ExecutionState::RunningDelayed;
        task_ex.state_info = Some(format!(
            "Waiting {}s for retry #{retry_no}",
            self.spec.delay
        ));

        debug!(task = %task_ex.name, retry_no, "rescheduling task for retry");

        let key = format!("{}:retry", task_ex.id);
        engine
            .scheduler
            .schedule(
                TARGET_RUN_EXISTING,
                Duration::from_secs(self.spec.delay),
                Some(key.as_str()),
                json!({"task_execution_id": task_ex.id, "reset": true}),
            )
            .await?;

        Ok(())
    }
}

// =============================================================================
// Timeout
// =============================================================================

/// Force-fail the task if it is still incomplete when the check fires
pub struct TimeoutPolicy {
    pub seconds: u64,
}

const TIMEOUT_KEY: &str = "timeout_policy";

#[async_trait]
impl TaskPolicy for TimeoutPolicy {
    async fn before_task_start(
        &self,
        engine: &Engine,
        _wf_ex: &WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> EngineResult<()> {
        if skip_flag(task_ex, TIMEOUT_KEY) {
            return Ok(());
        }
        set_skip_flag(task_ex, TIMEOUT_KEY);

        let key = format!("{}:timeout", task_ex.id);
        engine
            .scheduler
            .schedule(
                TARGET_FAIL_IF_INCOMPLETE,
                Duration::from_secs(self.seconds),
                Some(key.as_str()),
                json!({"task_execution_id": task_ex.id, "timeout": self.seconds}),
            )
            .await?;

        Ok(())
    }
}

// =============================================================================
// PauseBefore
// =============================================================================

/// Pause the whole workflow before this task starts
pub struct PauseBeforePolicy {
    pub expression: String,
}

const PAUSE_BEFORE_KEY: &str = "pause_before_policy";

#[async_trait]
impl TaskPolicy for PauseBeforePolicy {
    async fn before_task_start(
        &self,
        engine: &Engine,
        wf_ex: &WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> EngineResult<()> {
        if skip_flag(task_ex, PAUSE_BEFORE_KEY) {
            return Ok(());
        }

        if !is_truthy(&engine.evaluator.evaluate(&self.expression, &task_ex.in_context)?) {
            return Ok(());
        }

        // The skip flag makes resume proceed past the pause
        set_skip_flag(task_ex, PAUSE_BEFORE_KEY);

        debug!(task = %task_ex.name, "pausing workflow before task start");
        lifecycle::pause_workflow(
            engine,
            wf_ex.id,
            Some(format!("Paused before task '{}'", task_ex.name)),
        )
        .await?;

        task_ex.state = ExecutionState::Idle;
        task_ex.state_info = None;

        Ok(())
    }
}

// =============================================================================
// Concurrency
// =============================================================================

/// Validate the with-items concurrency cap
///
/// Enforcement lives in the with-items fan-out logic; this policy only
/// rejects nonsensical limits up front.
pub struct ConcurrencyPolicy {
    pub limit: usize,
}

#[async_trait]
impl TaskPolicy for ConcurrencyPolicy {
    async fn before_task_start(
        &self,
        _engine: &Engine,
        _wf_ex: &WorkflowExecution,
        _task_ex: &mut TaskExecution,
    ) -> EngineResult<()> {
        if self.limit == 0 {
            return Err(EngineError::Input(
                "concurrency must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}
