//! With-items fan-out
//!
//! A with-items task iterates one or more equal-length collections,
//! producing one action execution per tuple of items, capped by the task's
//! concurrency limit. Progress lives in the task's runtime context as
//! `count` (total items) and `capacity` (remaining concurrent slots, absent
//! when unbounded). Capacity is a read-modify-write over a JSON field the
//! store cannot update atomically, so every mutation runs under a named lock
//! scoped to the task id.

use std::collections::{BTreeSet, HashSet};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::debug;

use windlass_core::{ActionExecution, ExecutionState, TaskExecution, WorkflowExecution};

use crate::action;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

const WITH_ITEMS_KEY: &str = "with_items";

/// Fan-out progress kept in the task runtime context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithItemsContext {
    /// Total number of items
    pub count: usize,

    /// Remaining concurrent slots; `None` means unbounded
    pub capacity: Option<usize>,
}

pub fn get_context(task_ex: &TaskExecution) -> Option<WithItemsContext> {
    let ctx = task_ex.runtime_get(WITH_ITEMS_KEY)?;
    Some(WithItemsContext {
        count: ctx.get("count")?.as_u64()? as usize,
        capacity: ctx.get("capacity").and_then(Value::as_u64).map(|v| v as usize),
    })
}

pub fn set_context(task_ex: &mut TaskExecution, ctx: WithItemsContext) {
    task_ex.runtime_set(
        WITH_ITEMS_KEY,
        json!({"count": ctx.count, "capacity": ctx.capacity}),
    );
}

fn capacity_lock_name(task_ex: &TaskExecution) -> String {
    format!("{}-with-items", task_ex.id)
}

/// Evaluate the task's collections into one context object per index
///
/// Collections must all be arrays of equal length; anything else is an input
/// error that fails the task.
pub fn prepare_item_contexts(
    engine: &Engine,
    task_ex: &TaskExecution,
) -> EngineResult<Vec<Value>> {
    let spec = match &task_ex.spec.with_items {
        Some(spec) => spec,
        None => return Ok(vec![]),
    };

    let mut columns: Vec<(String, Vec<Value>)> = Vec::with_capacity(spec.bindings.len());

    for binding in &spec.bindings {
        let value = engine
            .evaluator
            .evaluate_recursively(&binding.items, &task_ex.in_context)?;

        let items = value.as_array().cloned().ok_or_else(|| {
            EngineError::Input(format!(
                "with-items collection '{}' did not evaluate to a list",
                binding.var
            ))
        })?;

        if let Some((first_var, first)) = columns.first() {
            if first.len() != items.len() {
                return Err(EngineError::Input(format!(
                    "with-items collections have different lengths: '{}' has {}, '{}' has {}",
                    first_var,
                    first.len(),
                    binding.var,
                    items.len()
                )));
            }
        }

        columns.push((binding.var.clone(), items));
    }

    let count = columns.first().map(|(_, items)| items.len()).unwrap_or(0);
    let mut contexts = Vec::with_capacity(count);
    for index in 0..count {
        let mut item_ctx = serde_json::Map::with_capacity(columns.len());
        for (var, items) in &columns {
            item_ctx.insert(var.clone(), items[index].clone());
        }
        contexts.push(Value::Object(item_ctx));
    }

    Ok(contexts)
}

/// Indexes to schedule next, bounded by remaining capacity
///
/// Previously attempted but unaccepted indexes (failed, invalidated by a
/// retry) come back first because they are the smallest unaccepted indexes;
/// only then does the high-water mark advance.
pub fn next_indexes(count: usize, capacity: Option<usize>, actions: &[ActionExecution]) -> Vec<usize> {
    let accepted: HashSet<usize> = actions
        .iter()
        .filter(|a| a.accepted)
        .filter_map(|a| a.with_items_index())
        .collect();

    let in_flight: HashSet<usize> = actions
        .iter()
        .filter(|a| !a.is_completed())
        .filter_map(|a| a.with_items_index())
        .collect();

    let mut candidates: Vec<usize> = (0..count)
        .filter(|i| !accepted.contains(i) && !in_flight.contains(i))
        .collect();

    if let Some(cap) = capacity {
        candidates.truncate(cap);
    }
    candidates
}

/// Schedule the next batch of item actions
///
/// Capacity is consumed per scheduled item under the task-scoped named lock;
/// the actions themselves are dispatched after the lock is released so an
/// inline completion can re-enter this module.
pub async fn schedule_next_batch(
    engine: &Engine,
    wf_ex: &WorkflowExecution,
    task_ex: &mut TaskExecution,
) -> EngineResult<()> {
    let item_contexts = prepare_item_contexts(engine, task_ex)?;
    let count = item_contexts.len();

    // A fan-out over nothing completes immediately
    if count == 0 {
        set_context(
            task_ex,
            WithItemsContext {
                count: 0,
                capacity: task_ex.spec.policies.concurrency,
            },
        );
        engine.store.update_task_execution(task_ex).await?;
        return crate::task::complete_task(engine, task_ex.id, ExecutionState::Success, None).await;
    }

    let lock = capacity_lock_name(task_ex);
    engine.store.acquire_named_lock(&lock).await?;

    let planned: EngineResult<Vec<usize>> = async {
        let mut fresh = engine.store.get_task_execution(task_ex.id).await?;
        let mut ctx = get_context(&fresh).unwrap_or(WithItemsContext {
            count,
            capacity: fresh.spec.policies.concurrency,
        });
        ctx.count = count;

        let actions = engine.store.get_action_executions(fresh.id).await?;
        let indexes = next_indexes(ctx.count, ctx.capacity, &actions);

        if let Some(cap) = ctx.capacity {
            ctx.capacity = Some(cap.saturating_sub(indexes.len()));
        }

        set_context(&mut fresh, ctx);
        engine.store.update_task_execution(&fresh).await?;
        *task_ex = fresh;
        Ok(indexes)
    }
    .await;

    engine.store.release_named_lock(&lock).await?;
    let indexes = planned?;

    debug!(task = %task_ex.name, ?indexes, "scheduling with-items batch");

    for index in indexes {
        // An inline completion during this loop may already have advanced
        // the task or scheduled this index through a nested batch
        let fresh = engine.store.get_task_execution(task_ex.id).await?;
        if fresh.is_completed() {
            break;
        }
        let actions = engine.store.get_action_executions(task_ex.id).await?;
        let covered = actions
            .iter()
            .any(|a| a.with_items_index() == Some(index) && (!a.is_completed() || a.accepted));
        if covered {
            continue;
        }

        action::schedule_action(
            engine,
            wf_ex,
            task_ex,
            Some(index),
            Some(item_contexts[index].clone()),
        )
        .await?;
    }

    Ok(())
}

/// Incorporate one completed item action
///
/// Accepts the result and frees a capacity slot under the named lock, then
/// either completes the task (cancellation beating error beating success) or
/// schedules the next batch. Boxed because scheduling the next batch can
/// complete an item inline and re-enter this function.
pub fn on_action_complete<'a>(
    engine: &'a Engine,
    wf_ex: &'a WorkflowExecution,
    task_ex: TaskExecution,
    mut action: ActionExecution,
) -> BoxFuture<'a, EngineResult<()>> {
    async move {
        let lock = capacity_lock_name(&task_ex);
        engine.store.acquire_named_lock(&lock).await?;

        let accepted: EngineResult<TaskExecution> = async {
            let mut fresh = engine.store.get_task_execution(task_ex.id).await?;

            action.accepted = true;
            engine.store.update_action_execution(&action).await?;

            if let Some(mut ctx) = get_context(&fresh) {
                if let Some(cap) = ctx.capacity {
                    let limit = fresh.spec.policies.concurrency.unwrap_or(usize::MAX);
                    ctx.capacity = Some((cap + 1).min(limit));
                    set_context(&mut fresh, ctx);
                    engine.store.update_task_execution(&fresh).await?;
                }
            }
            Ok(fresh)
        }
        .await;

        engine.store.release_named_lock(&lock).await?;
        let mut task_ex = accepted?;

        let ctx = get_context(&task_ex).ok_or_else(|| {
            EngineError::Workflow(format!(
                "with-items context missing on task execution {}",
                task_ex.id
            ))
        })?;

        let actions = engine.store.get_action_executions(task_ex.id).await?;
        let accepted_indexes: BTreeSet<usize> = actions
            .iter()
            .filter(|a| a.accepted && a.is_completed())
            .filter_map(|a| a.with_items_index())
            .collect();

        let all_done = (0..ctx.count).all(|i| accepted_indexes.contains(&i));

        if all_done {
            let accepted_actions: Vec<&ActionExecution> =
                actions.iter().filter(|a| a.accepted).collect();

            let (state, info) = if accepted_actions
                .iter()
                .any(|a| a.state == ExecutionState::Cancelled)
            {
                (
                    ExecutionState::Cancelled,
                    Some("One or more items were cancelled".to_string()),
                )
            } else if let Some(failed) = accepted_actions
                .iter()
                .find(|a| a.state == ExecutionState::Error)
            {
                (
                    ExecutionState::Error,
                    Some(failed.state_info.clone().unwrap_or_else(|| {
                        format!("Action '{}' failed", failed.name)
                    })),
                )
            } else {
                (ExecutionState::Success, None)
            };

            return crate::task::complete_task(engine, task_ex.id, state, info).await;
        }

        // Capacity may have opened up for further iterations
        let has_capacity = ctx.capacity.map(|c| c > 0).unwrap_or(true);
        if has_capacity {
            schedule_next_batch(engine, wf_ex, &mut task_ex).await?;
        }

        Ok(())
    }
    .boxed()
}
