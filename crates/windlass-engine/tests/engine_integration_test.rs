//! End-to-end engine tests against the in-memory store
//!
//! These drive whole workflows through the public RPC surface. Two runner
//! styles are used: `LocalActionRunner` completes actions synchronously
//! (collapsing a workflow into one call), while `ManualRunner` parks every
//! action so the tests can observe intermediate states and deliver results
//! one at a time, the way a remote executor would.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use windlass_core::{
    ExecutionParams, ExecutionState, Join, PolicySpec, RetrySpec, SimpleEvaluator, TaskExecution,
    TaskSpec, TransitionSpec, WithItemsBinding, WithItemsSpec, WorkflowSpec,
};
use windlass_engine::{
    ActionCall, ActionRunner, Engine, EngineError, EngineResult, InMemoryWorkflowStore,
    LocalActionRunner,
};

// =============================================================================
// Test runners
// =============================================================================

/// Parks every action; tests deliver results through on_action_complete
#[derive(Default)]
struct ManualRunner {
    calls: Mutex<Vec<ActionCall>>,
    cancelled: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl ActionRunner for ManualRunner {
    async fn run_action(&self, call: ActionCall) -> EngineResult<Option<Value>> {
        self.calls.lock().push(call);
        Ok(None)
    }

    async fn cancel_action(&self, action_execution_id: Uuid) -> EngineResult<()> {
        self.cancelled.lock().push(action_execution_id);
        Ok(())
    }
}

/// Fails the first N calls, then succeeds synchronously
struct FlakyRunner {
    failures_remaining: Mutex<u32>,
}

#[async_trait]
impl ActionRunner for FlakyRunner {
    async fn run_action(&self, _call: ActionCall) -> EngineResult<Option<Value>> {
        let mut remaining = self.failures_remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(EngineError::Workflow("transient failure".to_string()));
        }
        Ok(Some(json!({"ok": true})))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn engine_with(runner: Arc<dyn ActionRunner>) -> (Arc<Engine>, Arc<InMemoryWorkflowStore>) {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let engine = Engine::new(store.clone(), Arc::new(SimpleEvaluator::new()), runner);
    (engine, store)
}

async fn task_by_name(
    store: &InMemoryWorkflowStore,
    wf_id: Uuid,
    name: &str,
) -> Option<TaskExecution> {
    use windlass_engine::WorkflowStore;
    store
        .find_task_executions_by_name(wf_id, name)
        .await
        .unwrap()
        .pop()
}

async fn complete_pending_action(
    engine: &Engine,
    store: &InMemoryWorkflowStore,
    wf_id: Uuid,
    task_name: &str,
    state: ExecutionState,
    output: Value,
) {
    use windlass_engine::WorkflowStore;
    let task = task_by_name(store, wf_id, task_name)
        .await
        .unwrap_or_else(|| panic!("task '{task_name}' should exist"));
    let action = store
        .get_action_executions(task.id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| !a.is_completed())
        .unwrap_or_else(|| panic!("task '{task_name}' should have a pending action"));

    engine
        .on_action_complete(action.id, state, output)
        .await
        .unwrap();
}

async fn workflow_state(store: &InMemoryWorkflowStore, wf_id: Uuid) -> ExecutionState {
    use windlass_engine::WorkflowStore;
    store.get_workflow_execution(wf_id).await.unwrap().state
}

/// a -> b, a -> c, {b, c} -> d (join: all)
fn diamond_spec() -> WorkflowSpec {
    WorkflowSpec {
        name: "diamond".into(),
        tasks: vec![
            TaskSpec {
                on_success: vec![TransitionSpec::to("b"), TransitionSpec::to("c")],
                ..TaskSpec::new("a", "test.work")
            },
            TaskSpec {
                publish: json!({"from_b": "b-val"}),
                on_success: vec![TransitionSpec::to("d")],
                ..TaskSpec::new("b", "test.work")
            },
            TaskSpec {
                publish: json!({"from_c": "c-val"}),
                on_success: vec![TransitionSpec::to("d")],
                ..TaskSpec::new("c", "test.work")
            },
            TaskSpec {
                join: Some(Join::All),
                publish: json!({"from_d": "<% result.d %>"}),
                ..TaskSpec::new("d", "test.work")
            },
        ],
        output: None,
        output_on_error: None,
    }
}

// =============================================================================
// End-to-end
// =============================================================================

#[tokio::test]
async fn test_diamond_join_workflow_step_by_step() {
    let runner = Arc::new(ManualRunner::default());
    let (engine, store) = engine_with(runner);

    let wf_ex = engine
        .start_workflow_spec(diamond_spec(), json!({}), ExecutionParams::default())
        .await
        .unwrap();

    // Starting runs only the start task
    let a = task_by_name(&store, wf_ex.id, "a").await.unwrap();
    assert_eq!(a.state, ExecutionState::Running);
    assert!(task_by_name(&store, wf_ex.id, "b").await.is_none());

    // Completing a triggers b and c
    complete_pending_action(&engine, &store, wf_ex.id, "a", ExecutionState::Success, json!({}))
        .await;

    let b = task_by_name(&store, wf_ex.id, "b").await.unwrap();
    let c = task_by_name(&store, wf_ex.id, "c").await.unwrap();
    assert_eq!(b.state, ExecutionState::Running);
    assert_eq!(c.state, ExecutionState::Running);
    assert!(task_by_name(&store, wf_ex.id, "d").await.is_none());

    // Completing b alone leaves the join waiting on c
    complete_pending_action(&engine, &store, wf_ex.id, "b", ExecutionState::Success, json!({}))
        .await;

    let d = task_by_name(&store, wf_ex.id, "d").await.unwrap();
    assert_eq!(d.state, ExecutionState::Waiting);

    // Completing c satisfies the quorum
    complete_pending_action(&engine, &store, wf_ex.id, "c", ExecutionState::Success, json!({}))
        .await;

    let d = task_by_name(&store, wf_ex.id, "d").await.unwrap();
    assert_eq!(d.state, ExecutionState::Running);

    // Completing d (the only end task) completes the workflow
    complete_pending_action(
        &engine,
        &store,
        wf_ex.id,
        "d",
        ExecutionState::Success,
        json!({"d": "d-val"}),
    )
    .await;

    use windlass_engine::WorkflowStore;
    let final_wf = store.get_workflow_execution(wf_ex.id).await.unwrap();
    assert_eq!(final_wf.state, ExecutionState::Success);

    // Final context merges d's outbound context over b's and c's
    let output = final_wf.output.unwrap();
    assert_eq!(output["from_b"], json!("b-val"));
    assert_eq!(output["from_c"], json!("c-val"));
    assert_eq!(output["from_d"], json!("d-val"));
}

#[tokio::test]
async fn test_synchronous_workflow_completes_in_one_call() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    let spec = WorkflowSpec {
        name: "echo_chain".into(),
        tasks: vec![
            TaskSpec {
                input: json!({"output": "<% seed %>"}),
                publish: json!({"first": "<% result %>"}),
                on_success: vec![TransitionSpec::to("second")],
                ..TaskSpec::new("first", "std.echo")
            },
            TaskSpec {
                input: json!({"output": "done-<% first %>"}),
                publish: json!({"last": "<% result %>"}),
                ..TaskSpec::new("second", "std.echo")
            },
        ],
        output: Some(json!({"answer": "<% last %>"})),
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({"seed": 7}), ExecutionParams::default())
        .await
        .unwrap();

    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(wf_ex.output, Some(json!({"answer": "done-7"})));

    use windlass_engine::WorkflowStore;
    let second = store
        .find_task_executions_by_name(wf_ex.id, "second")
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert!(second.processed);
    assert!(!second.has_next_tasks);
}

#[tokio::test]
async fn test_conditional_routing_follows_guard() {
    let (engine, _store) = engine_with(Arc::new(LocalActionRunner::new()));

    let spec = WorkflowSpec {
        name: "branch".into(),
        tasks: vec![
            TaskSpec {
                input: json!({"output": "<% mode %>"}),
                publish: json!({"mode_out": "<% result %>"}),
                on_success: vec![
                    TransitionSpec::to("left").when("mode_out == 'l'"),
                    TransitionSpec::to("right").when("mode_out == 'r'"),
                ],
                ..TaskSpec::new("pick", "std.echo")
            },
            TaskSpec {
                publish: json!({"took": "left"}),
                ..TaskSpec::new("left", "std.noop")
            },
            TaskSpec {
                publish: json!({"took": "right"}),
                ..TaskSpec::new("right", "std.noop")
            },
        ],
        output: Some(json!({"took": "<% took %>"})),
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({"mode": "r"}), ExecutionParams::default())
        .await
        .unwrap();

    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(wf_ex.output, Some(json!({"took": "right"})));
}

#[tokio::test]
async fn test_join_one_runs_on_first_predecessor() {
    let runner = Arc::new(ManualRunner::default());
    let (engine, store) = engine_with(runner);

    let spec = WorkflowSpec {
        name: "race".into(),
        tasks: vec![
            TaskSpec {
                on_success: vec![TransitionSpec::to("b"), TransitionSpec::to("c")],
                ..TaskSpec::new("a", "test.work")
            },
            TaskSpec {
                on_success: vec![TransitionSpec::to("d")],
                ..TaskSpec::new("b", "test.work")
            },
            TaskSpec {
                on_success: vec![TransitionSpec::to("d")],
                ..TaskSpec::new("c", "test.work")
            },
            TaskSpec {
                join: Some(Join::Count(1)),
                ..TaskSpec::new("d", "test.work")
            },
        ],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    complete_pending_action(&engine, &store, wf_ex.id, "a", ExecutionState::Success, json!({}))
        .await;

    // One predecessor satisfies join: one
    complete_pending_action(&engine, &store, wf_ex.id, "b", ExecutionState::Success, json!({}))
        .await;

    let d = task_by_name(&store, wf_ex.id, "d").await.unwrap();
    assert_eq!(d.state, ExecutionState::Running);
}

#[tokio::test]
async fn test_impossible_join_fails_the_join_task() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    // b routes to d only under a guard that never fires; c always routes.
    // Once b completes without triggering, join:all can never be satisfied.
    let spec = WorkflowSpec {
        name: "blocked".into(),
        tasks: vec![
            TaskSpec {
                on_success: vec![TransitionSpec::to("b"), TransitionSpec::to("c")],
                ..TaskSpec::new("a", "std.noop")
            },
            TaskSpec {
                on_success: vec![TransitionSpec::to("d").when("false")],
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
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    let d = task_by_name(&store, wf_ex.id, "d").await.unwrap();
    assert_eq!(d.state, ExecutionState::Error);
    assert!(d.state_info.unwrap().contains("Impossible join"));
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Error);
}

// =============================================================================
// Error handling
// =============================================================================

#[tokio::test]
async fn test_error_route_handles_failure() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    let spec = WorkflowSpec {
        name: "recover".into(),
        tasks: vec![
            TaskSpec {
                on_error: vec![TransitionSpec::to("cleanup")],
                ..TaskSpec::new("breaks", "std.fail")
            },
            TaskSpec {
                publish: json!({"cleaned": true}),
                ..TaskSpec::new("cleanup", "std.noop")
            },
        ],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    // The failure was routed, so the workflow still succeeds
    assert_eq!(wf_ex.state, ExecutionState::Success);

    let breaks = task_by_name(&store, wf_ex.id, "breaks").await.unwrap();
    assert_eq!(breaks.state, ExecutionState::Error);
    assert!(breaks.error_handled);
}

#[tokio::test]
async fn test_unhandled_error_fails_workflow() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    let spec = WorkflowSpec {
        name: "broken".into(),
        tasks: vec![TaskSpec::new("breaks", "std.fail")],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    assert_eq!(wf_ex.state, ExecutionState::Error);
    assert!(wf_ex.state_info.unwrap().contains("breaks"));

    let breaks = task_by_name(&store, wf_ex.id, "breaks").await.unwrap();
    assert!(!breaks.error_handled);
}

#[tokio::test]
async fn test_non_terminal_action_completion_is_rejected() {
    let (engine, _store) = engine_with(Arc::new(ManualRunner::default()));

    let result = engine
        .on_action_complete(Uuid::now_v7(), ExecutionState::Running, json!({}))
        .await;

    assert!(matches!(result, Err(EngineError::Workflow(_))));
}

// =============================================================================
// Policies
// =============================================================================

#[tokio::test]
async fn test_retry_policy_reschedules_then_exhausts() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    let spec = WorkflowSpec {
        name: "retrying".into(),
        tasks: vec![TaskSpec {
            policies: PolicySpec {
                retry: Some(RetrySpec {
                    count: 3,
                    delay: 0,
                    break_on: None,
                    continue_on: None,
                }),
                ..Default::default()
            },
            ..TaskSpec::new("flaky", "std.fail")
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    // First failure: parked for retry #1
    let flaky = task_by_name(&store, wf_ex.id, "flaky").await.unwrap();
    assert_eq!(flaky.state, ExecutionState::RunningDelayed);
    assert_eq!(flaky.runtime_get("retry_no"), Some(&json!(1)));

    // Second attempt fails, retry #2
    engine.process_delayed_calls().await.unwrap();
    let flaky = task_by_name(&store, wf_ex.id, "flaky").await.unwrap();
    assert_eq!(flaky.state, ExecutionState::RunningDelayed);
    assert_eq!(flaky.runtime_get("retry_no"), Some(&json!(2)));

    // Third attempt exhausts the budget: the error sticks
    engine.process_delayed_calls().await.unwrap();
    let flaky = task_by_name(&store, wf_ex.id, "flaky").await.unwrap();
    assert_eq!(flaky.state, ExecutionState::Error);
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Error);
}

#[tokio::test]
async fn test_wait_before_policy_delays_start() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    let spec = WorkflowSpec {
        name: "delayed".into(),
        tasks: vec![TaskSpec {
            policies: PolicySpec {
                wait_before: Some(0),
                ..Default::default()
            },
            ..TaskSpec::new("later", "std.noop")
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    let later = task_by_name(&store, wf_ex.id, "later").await.unwrap();
    assert_eq!(later.state, ExecutionState::RunningDelayed);
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Running);

    // Delayed re-entry lets the start proceed
    engine.process_delayed_calls().await.unwrap();
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Success);
}

#[tokio::test]
async fn test_wait_after_policy_holds_completion() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    let spec = WorkflowSpec {
        name: "held".into(),
        tasks: vec![TaskSpec {
            policies: PolicySpec {
                wait_after: Some(0),
                ..Default::default()
            },
            ..TaskSpec::new("hold", "std.noop")
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    // Completed synchronously, but the completion is parked
    let hold = task_by_name(&store, wf_ex.id, "hold").await.unwrap();
    assert_eq!(hold.state, ExecutionState::RunningDelayed);

    engine.process_delayed_calls().await.unwrap();
    let hold = task_by_name(&store, wf_ex.id, "hold").await.unwrap();
    assert_eq!(hold.state, ExecutionState::Success);
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Success);
}

#[tokio::test]
async fn test_timeout_policy_fails_stuck_task() {
    let (engine, store) = engine_with(Arc::new(ManualRunner::default()));

    let spec = WorkflowSpec {
        name: "stuck".into(),
        tasks: vec![TaskSpec {
            policies: PolicySpec {
                timeout: Some(0),
                ..Default::default()
            },
            ..TaskSpec::new("slow", "test.work")
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    engine.process_delayed_calls().await.unwrap();

    let slow = task_by_name(&store, wf_ex.id, "slow").await.unwrap();
    assert_eq!(slow.state, ExecutionState::Error);
    assert!(slow.state_info.unwrap().contains("timed out"));
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Error);
}

// =============================================================================
// With-items
// =============================================================================

#[tokio::test]
async fn test_with_items_respects_concurrency_and_collects_results() {
    let runner = Arc::new(ManualRunner::default());
    let (engine, store) = engine_with(runner.clone());

    let spec = WorkflowSpec {
        name: "fanout".into(),
        tasks: vec![TaskSpec {
            with_items: Some(WithItemsSpec {
                bindings: vec![WithItemsBinding {
                    var: "item".into(),
                    items: json!("<% items %>"),
                }],
            }),
            input: json!({"n": "<% item %>"}),
            publish: json!({"results": "<% result %>"}),
            policies: PolicySpec {
                concurrency: Some(2),
                ..Default::default()
            },
            ..TaskSpec::new("fan", "test.work")
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(
            spec,
            json!({"items": [10, 20, 30, 40]}),
            ExecutionParams::default(),
        )
        .await
        .unwrap();

    // Only the first two iterations are in flight
    assert_eq!(runner.calls.lock().len(), 2);

    use windlass_engine::WorkflowStore;
    let fan = task_by_name(&store, wf_ex.id, "fan").await.unwrap();

    // Complete index 0: a capacity slot frees and index 2 is scheduled
    let pending: Vec<_> = store
        .get_action_executions(fan.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| !a.is_completed())
        .collect();
    let idx0 = pending.iter().find(|a| a.with_items_index() == Some(0)).unwrap();
    engine
        .on_action_complete(idx0.id, ExecutionState::Success, json!("r-10"))
        .await
        .unwrap();

    assert_eq!(runner.calls.lock().len(), 3);

    // Drain the rest
    loop {
        let pending: Vec<_> = store
            .get_action_executions(fan.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| !a.is_completed())
            .collect();
        if pending.is_empty() {
            break;
        }
        for action in pending {
            let n = action.input["n"].as_i64().unwrap();
            engine
                .on_action_complete(action.id, ExecutionState::Success, json!(format!("r-{n}")))
                .await
                .unwrap();
        }
    }

    let fan = task_by_name(&store, wf_ex.id, "fan").await.unwrap();
    assert_eq!(fan.state, ExecutionState::Success);
    assert_eq!(
        fan.published["results"],
        json!(["r-10", "r-20", "r-30", "r-40"])
    );
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Success);
}

#[tokio::test]
async fn test_with_items_error_wins_over_success() {
    let runner = Arc::new(ManualRunner::default());
    let (engine, store) = engine_with(runner);

    let spec = WorkflowSpec {
        name: "fanout_err".into(),
        tasks: vec![TaskSpec {
            with_items: Some(WithItemsSpec {
                bindings: vec![WithItemsBinding {
                    var: "item".into(),
                    items: json!([1, 2]),
                }],
            }),
            ..TaskSpec::new("fan", "test.work")
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    use windlass_engine::WorkflowStore;
    let fan = task_by_name(&store, wf_ex.id, "fan").await.unwrap();
    let actions = store.get_action_executions(fan.id).await.unwrap();
    assert_eq!(actions.len(), 2);

    engine
        .on_action_complete(actions[0].id, ExecutionState::Success, json!({}))
        .await
        .unwrap();
    engine
        .on_action_complete(actions[1].id, ExecutionState::Error, json!("item 2 broke"))
        .await
        .unwrap();

    let fan = task_by_name(&store, wf_ex.id, "fan").await.unwrap();
    assert_eq!(fan.state, ExecutionState::Error);
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Error);
}

#[tokio::test]
async fn test_with_items_mismatched_lengths_fail_the_task() {
    let (engine, store) = engine_with(Arc::new(ManualRunner::default()));

    let spec = WorkflowSpec {
        name: "fanout_bad".into(),
        tasks: vec![TaskSpec {
            with_items: Some(WithItemsSpec {
                bindings: vec![
                    WithItemsBinding {
                        var: "x".into(),
                        items: json!([1, 2, 3]),
                    },
                    WithItemsBinding {
                        var: "y".into(),
                        items: json!([1, 2]),
                    },
                ],
            }),
            ..TaskSpec::new("fan", "test.work")
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    assert_eq!(wf_ex.state, ExecutionState::Error);

    let fan = task_by_name(&store, wf_ex.id, "fan").await.unwrap();
    assert_eq!(fan.state, ExecutionState::Error);
    assert!(fan.state_info.unwrap().contains("different lengths"));
}

// =============================================================================
// Pause / resume / cancel / rerun
// =============================================================================

#[tokio::test]
async fn test_pause_defers_continuation_until_resume() {
    let (engine, store) = engine_with(Arc::new(ManualRunner::default()));

    let spec = WorkflowSpec {
        name: "pausable".into(),
        tasks: vec![
            TaskSpec {
                on_success: vec![TransitionSpec::to("b")],
                ..TaskSpec::new("a", "test.work")
            },
            TaskSpec::new("b", "test.work"),
        ],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    engine.pause_workflow(wf_ex.id).await.unwrap();
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Paused);

    // The task still completes, but its continuation is dropped
    complete_pending_action(&engine, &store, wf_ex.id, "a", ExecutionState::Success, json!({}))
        .await;

    let a = task_by_name(&store, wf_ex.id, "a").await.unwrap();
    assert_eq!(a.state, ExecutionState::Success);
    assert!(!a.processed);
    assert!(task_by_name(&store, wf_ex.id, "b").await.is_none());

    // Resume recomputes the continuation and runs b
    engine.resume_workflow(wf_ex.id).await.unwrap();

    let a = task_by_name(&store, wf_ex.id, "a").await.unwrap();
    assert!(a.processed);
    let b = task_by_name(&store, wf_ex.id, "b").await.unwrap();
    assert_eq!(b.state, ExecutionState::Running);

    complete_pending_action(&engine, &store, wf_ex.id, "b", ExecutionState::Success, json!({}))
        .await;
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Success);
}

#[tokio::test]
async fn test_force_cancel_asks_executor_to_cancel_outstanding_work() {
    let runner = Arc::new(ManualRunner::default());
    let (engine, store) = engine_with(runner.clone());

    let spec = WorkflowSpec {
        name: "cancellable".into(),
        tasks: vec![TaskSpec::new("a", "test.work")],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    engine
        .stop_workflow(wf_ex.id, ExecutionState::Cancelled, None, true)
        .await
        .unwrap();

    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Cancelled);
    assert_eq!(runner.cancelled.lock().len(), 1);

    // A result arriving for the decided execution is ignored
    let pending_call_id = runner.calls.lock()[0].action_execution_id;
    engine
        .on_action_complete(pending_call_id, ExecutionState::Success, json!({}))
        .await
        .unwrap();
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Cancelled);
}

#[tokio::test]
async fn test_rerun_failed_task_recovers_workflow() {
    let runner = Arc::new(FlakyRunner {
        failures_remaining: Mutex::new(1),
    });
    let (engine, store) = engine_with(runner);

    let spec = WorkflowSpec {
        name: "rerunnable".into(),
        tasks: vec![TaskSpec {
            publish: json!({"ok": "<% result.ok %>"}),
            ..TaskSpec::new("a", "custom.flaky")
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Error);

    let a = task_by_name(&store, wf_ex.id, "a").await.unwrap();
    assert_eq!(a.state, ExecutionState::Error);

    engine.rerun_workflow(a.id, true).await.unwrap();

    let a = task_by_name(&store, wf_ex.id, "a").await.unwrap();
    assert_eq!(a.state, ExecutionState::Success);
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Success);
}

#[tokio::test]
async fn test_rollback_is_not_supported() {
    let (engine, _store) = engine_with(Arc::new(LocalActionRunner::new()));
    let result = engine.rollback_workflow(Uuid::now_v7()).await;
    assert!(matches!(result, Err(EngineError::NotSupported(_))));
}

// =============================================================================
// Sub-workflows
// =============================================================================

#[tokio::test]
async fn test_sub_workflow_result_propagates_to_parent() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    let child = WorkflowSpec {
        name: "child".into(),
        tasks: vec![TaskSpec {
            input: json!({"output": "child-saw-<% payload %>"}),
            publish: json!({"child_result": "<% result %>"}),
            ..TaskSpec::new("echo", "std.echo")
        }],
        output: Some(json!({"from_child": "<% child_result %>"})),
        output_on_error: None,
    };
    engine.workflows().register(child);

    let parent = WorkflowSpec {
        name: "parent".into(),
        tasks: vec![TaskSpec {
            name: "call".into(),
            action: None,
            workflow: Some("child".into()),
            input: json!({"payload": "<% seed %>"}),
            publish: json!({"final": "<% result.from_child %>"}),
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
        }],
        output: Some(json!({"final": "<% final %>"})),
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(parent, json!({"seed": "x"}), ExecutionParams::default())
        .await
        .unwrap();

    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(wf_ex.output, Some(json!({"final": "child-saw-x"})));

    // The child execution is linked to the parent task
    use windlass_engine::WorkflowStore;
    let call = task_by_name(&store, wf_ex.id, "call").await.unwrap();
    assert_eq!(call.state, ExecutionState::Success);
    let actions = store.get_action_executions(call.id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert!(actions[0].accepted);
}

#[tokio::test]
async fn test_failed_sub_workflow_fails_parent_task() {
    let (engine, store) = engine_with(Arc::new(LocalActionRunner::new()));

    let child = WorkflowSpec {
        name: "bad_child".into(),
        tasks: vec![TaskSpec::new("breaks", "std.fail")],
        output: None,
        output_on_error: None,
    };
    engine.workflows().register(child);

    let parent = WorkflowSpec {
        name: "parent".into(),
        tasks: vec![TaskSpec {
            name: "call".into(),
            action: None,
            workflow: Some("bad_child".into()),
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
        }],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(parent, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    assert_eq!(wf_ex.state, ExecutionState::Error);
    let call = task_by_name(&store, wf_ex.id, "call").await.unwrap();
    assert_eq!(call.state, ExecutionState::Error);
}

// =============================================================================
// Integrity check
// =============================================================================

#[tokio::test]
async fn test_integrity_check_reconciles_dropped_completion() {
    use windlass_engine::{EngineConfig, WorkflowStore};

    let store = Arc::new(InMemoryWorkflowStore::new());
    let engine = Engine::with_config(
        store.clone(),
        Arc::new(SimpleEvaluator::new()),
        Arc::new(ManualRunner::default()),
        EngineConfig::default().with_task_staleness(std::time::Duration::ZERO),
    );

    let spec = WorkflowSpec {
        name: "dropped".into(),
        tasks: vec![TaskSpec::new("a", "test.work")],
        output: None,
        output_on_error: None,
    };

    let wf_ex = engine
        .start_workflow_spec(spec, json!({}), ExecutionParams::default())
        .await
        .unwrap();

    // Simulate a completion whose notification never reached the task:
    // the action result landed but nothing accepted it
    let a = task_by_name(&store, wf_ex.id, "a").await.unwrap();
    let mut action = store.get_action_executions(a.id).await.unwrap().remove(0);
    action.state = ExecutionState::Success;
    action.output = Some(json!({"late": true}));
    store.update_action_execution(&action).await.unwrap();

    let reconciled = engine.run_integrity_check_once().await.unwrap();
    assert_eq!(reconciled, 1);

    let a = task_by_name(&store, wf_ex.id, "a").await.unwrap();
    assert_eq!(a.state, ExecutionState::Success);
    assert_eq!(workflow_state(&store, wf_ex.id).await, ExecutionState::Success);
}
