//! Engine facade
//!
//! Wires the store, evaluator, action runner, scheduler and definition
//! registries together and exposes the engine-facing RPC surface. One
//! `Engine` value is one engine instance; many instances may run against the
//! same store concurrently.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use uuid::Uuid;

use windlass_core::{Evaluator, ExecutionParams, ExecutionState, WorkflowExecution, WorkflowSpec};

use crate::action;
use crate::client::{EngineClient, SubWorkflowStart};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{self, ParentLink};
use crate::persistence::WorkflowStore;
use crate::registry::{ActionDefinitions, WorkflowDefinitions};
use crate::runner::ActionRunner;
use crate::scheduler::{DelayedCallHandler, Scheduler, SchedulerConfig};
use crate::task;

// Delayed-call targets this engine registers with the scheduler
pub const TARGET_RUN_EXISTING: &str = "task.run_existing";
pub const TARGET_COMPLETE_TASK: &str = "task.complete";
pub const TARGET_FAIL_IF_INCOMPLETE: &str = "task.fail_if_incomplete";
pub const TARGET_REFRESH_TASK_STATE: &str = "task.refresh_state";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size limit for persisted diagnostic messages
    pub state_info_limit: usize,

    /// How long a RUNNING task may go without updates before the integrity
    /// check re-derives its state
    pub task_staleness: Duration,

    /// Period of the background integrity check
    pub integrity_check_interval: Duration,

    /// Batch size for final-context evaluation over completed tasks
    pub final_context_batch_size: u32,

    /// Scheduler tuning
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_info_limit: 4096,
            task_staleness: Duration::from_secs(600),
            integrity_check_interval: Duration::from_secs(120),
            final_context_batch_size: 100,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the diagnostic message size limit
    pub fn with_state_info_limit(mut self, limit: usize) -> Self {
        self.state_info_limit = limit;
        self
    }

    /// Set the task staleness threshold
    pub fn with_task_staleness(mut self, staleness: Duration) -> Self {
        self.task_staleness = staleness;
        self
    }

    /// Set the integrity check period
    pub fn with_integrity_check_interval(mut self, interval: Duration) -> Self {
        self.integrity_check_interval = interval;
        self
    }

    /// Set the scheduler configuration
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// A single engine instance
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use windlass_engine::{Engine, InMemoryWorkflowStore, LocalActionRunner};
/// use windlass_core::SimpleEvaluator;
///
/// let engine = Engine::new(
///     Arc::new(InMemoryWorkflowStore::new()),
///     Arc::new(SimpleEvaluator::new()),
///     Arc::new(LocalActionRunner::new()),
/// );
///
/// engine.workflows().register(my_spec);
/// let wf_ex = engine.start_workflow("my_workflow", input, Default::default()).await?;
/// ```
pub struct Engine {
    pub(crate) store: Arc<dyn WorkflowStore>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) runner: Arc<dyn ActionRunner>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) config: EngineConfig,
    pub(crate) actions: ActionDefinitions,
    workflows: WorkflowDefinitions,
    client: RwLock<Arc<dyn EngineClient>>,
    instance_id: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    integrity_handle: Mutex<Option<JoinHandle<()>>>,
    // Per-workflow dispatch nesting within this process. Synchronous action
    // results complete inline, so a completion can observe the store while
    // sibling commands of the same continuation are still undispatched;
    // the workflow-completion check only runs once the outermost dispatch
    // for a workflow unwinds.
    dispatch_depth: Mutex<std::collections::HashMap<Uuid, usize>>,
}

impl Engine {
    /// Create an engine with default configuration
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        evaluator: Arc<dyn Evaluator>,
        runner: Arc<dyn ActionRunner>,
    ) -> Arc<Self> {
        Self::with_config(store, evaluator, runner, EngineConfig::default())
    }

    /// Create an engine with custom configuration
    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        evaluator: Arc<dyn Evaluator>,
        runner: Arc<dyn ActionRunner>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let instance_id = format!("windlass-{}", Uuid::now_v7());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            instance_id.as_str(),
            config.scheduler.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new_cyclic(|weak: &Weak<Engine>| Engine {
            client: RwLock::new(Arc::new(LoopbackClient {
                engine: weak.clone(),
            }) as Arc<dyn EngineClient>),
            store,
            evaluator,
            runner,
            scheduler,
            config,
            workflows: WorkflowDefinitions::new(),
            actions: ActionDefinitions::new(),
            instance_id,
            shutdown_tx,
            shutdown_rx,
            integrity_handle: Mutex::new(None),
            dispatch_depth: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub(crate) fn enter_dispatch(&self, workflow_execution_id: Uuid) {
        *self
            .dispatch_depth
            .lock()
            .entry(workflow_execution_id)
            .or_insert(0) += 1;
    }

    /// Returns the remaining depth after leaving
    pub(crate) fn leave_dispatch(&self, workflow_execution_id: Uuid) -> usize {
        let mut depths = self.dispatch_depth.lock();
        match depths.get_mut(&workflow_execution_id) {
            Some(depth) if *depth > 1 => {
                *depth -= 1;
                *depth
            }
            _ => {
                depths.remove(&workflow_execution_id);
                0
            }
        }
    }

    pub(crate) fn in_dispatch(&self, workflow_execution_id: Uuid) -> bool {
        self.dispatch_depth
            .lock()
            .get(&workflow_execution_id)
            .copied()
            .unwrap_or(0)
            > 0
    }

    /// This instance's identity
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Workflow definition registry
    pub fn workflows(&self) -> &WorkflowDefinitions {
        &self.workflows
    }

    /// Ad-hoc action definition registry
    pub fn actions(&self) -> &ActionDefinitions {
        &self.actions
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Replace the engine client (defaults to in-process loopback)
    pub fn set_client(&self, client: Arc<dyn EngineClient>) {
        *self.client.write() = client;
    }

    pub(crate) fn client(&self) -> Arc<dyn EngineClient> {
        self.client.read().clone()
    }

    /// Start the background loops (scheduler capture, integrity check)
    pub fn start(self: &Arc<Self>) {
        self.scheduler.start(self.clone());

        let engine = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(engine.config.integrity_check_interval) => {}
                    _ = shutdown_rx.changed() => return,
                }
                if let Err(e) = engine.run_integrity_check_once().await {
                    error!("integrity check failed: {}", e);
                }
            }
        });
        *self.integrity_handle.lock() = Some(handle);

        info!(instance_id = %self.instance_id, "engine started");
    }

    /// Stop the background loops and wait for them
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.scheduler.shutdown().await;
        let handle = self.integrity_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(instance_id = %self.instance_id, "engine stopped");
    }

    /// Run one scheduler iteration inline (deterministic alternative to the
    /// background loop, used by tests)
    pub async fn process_delayed_calls(&self) -> EngineResult<usize> {
        self.scheduler.run_once(self).await
    }

    // =========================================================================
    // RPC surface
    // =========================================================================

    /// Start a registered workflow
    #[instrument(skip(self, input, params))]
    pub async fn start_workflow(
        &self,
        workflow_name: &str,
        input: Value,
        params: ExecutionParams,
    ) -> EngineResult<WorkflowExecution> {
        let spec = self.workflows.get(workflow_name)?;
        lifecycle::start_workflow(self, spec, input, params, None).await
    }

    /// Start a workflow from an explicit specification
    pub async fn start_workflow_spec(
        &self,
        spec: WorkflowSpec,
        input: Value,
        params: ExecutionParams,
    ) -> EngineResult<WorkflowExecution> {
        lifecycle::start_workflow(self, spec, input, params, None).await
    }

    /// Deliver a terminal action result from a remote executor
    #[instrument(skip(self, output))]
    pub async fn on_action_complete(
        &self,
        action_execution_id: Uuid,
        state: ExecutionState,
        output: Value,
    ) -> EngineResult<()> {
        if !state.is_completed() {
            return Err(EngineError::Workflow(format!(
                "action completion requires a terminal state, got {state}"
            )));
        }
        action::complete_action(self, action_execution_id, state, output).await
    }

    /// Deliver an asynchronous action state notification
    #[instrument(skip(self))]
    pub async fn on_action_update(
        &self,
        action_execution_id: Uuid,
        state: ExecutionState,
    ) -> EngineResult<()> {
        action::update_action(self, action_execution_id, state).await
    }

    /// Pause a running workflow
    pub async fn pause_workflow(&self, workflow_execution_id: Uuid) -> EngineResult<()> {
        lifecycle::pause_workflow(self, workflow_execution_id, None).await
    }

    /// Resume a paused workflow
    pub async fn resume_workflow(&self, workflow_execution_id: Uuid) -> EngineResult<()> {
        lifecycle::resume_workflow(self, workflow_execution_id).await
    }

    /// Rerun a task that completed in ERROR
    pub async fn rerun_workflow(
        &self,
        task_execution_id: Uuid,
        reset: bool,
    ) -> EngineResult<()> {
        lifecycle::rerun_workflow(self, task_execution_id, reset).await
    }

    /// Force a workflow into a terminal state
    pub async fn stop_workflow(
        &self,
        workflow_execution_id: Uuid,
        state: ExecutionState,
        message: Option<String>,
        force: bool,
    ) -> EngineResult<()> {
        lifecycle::stop_workflow(self, workflow_execution_id, state, message, force).await
    }

    /// Roll a workflow back to its initial state
    pub async fn rollback_workflow(&self, _workflow_execution_id: Uuid) -> EngineResult<()> {
        Err(EngineError::NotSupported(
            "workflow rollback is not supported".to_string(),
        ))
    }

    /// Heartbeat reconciliation: stamp the given action executions as alive
    ///
    /// The integrity check leaves heartbeating executions alone even when the
    /// owning task looks stale.
    pub async fn report_running_actions(&self, action_execution_ids: &[Uuid]) -> EngineResult<()> {
        for id in action_execution_ids {
            let mut action_ex = self.store.get_action_execution(*id).await?;
            if action_ex.is_completed() {
                continue;
            }
            action_ex.last_heartbeat_at = Some(Utc::now());
            self.store.update_action_execution(&action_ex).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Integrity check
    // =========================================================================

    /// Re-derive the state of tasks stuck in RUNNING
    ///
    /// A task whose actions all completed but whose own completion never ran
    /// lost a notification somewhere; feed the newest result back through the
    /// normal acceptance path. Tasks with in-flight or heartbeating actions
    /// are left alone - a slow executor is not an error.
    pub async fn run_integrity_check_once(&self) -> EngineResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.task_staleness)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let stale = self.store.find_stale_running_task_executions(cutoff).await?;
        let mut reconciled = 0;

        for task_ex in stale {
            let actions = self.store.get_action_executions(task_ex.id).await?;

            let heartbeating = actions.iter().any(|a| {
                !a.is_completed()
                    && a.last_heartbeat_at.map(|t| t >= cutoff).unwrap_or(false)
            });
            if heartbeating {
                continue;
            }

            if actions.is_empty() || actions.iter().any(|a| !a.is_completed()) {
                continue;
            }

            info!(task = %task_ex.name, task_execution_id = %task_ex.id, "reconciling stale RUNNING task");

            if task_ex.spec.has_with_items() {
                let unaccepted = actions
                    .iter()
                    .rev()
                    .find(|a| !a.accepted && a.is_completed())
                    .cloned();
                if let Some(action_ex) = unaccepted {
                    let wf_ex = self
                        .store
                        .get_workflow_execution(task_ex.workflow_execution_id)
                        .await?;
                    task::with_items::on_action_complete(self, &wf_ex, task_ex, action_ex).await?;
                    reconciled += 1;
                }
            } else if let Some(action_ex) = actions.iter().rev().find(|a| a.is_completed()) {
                let mut action_ex = action_ex.clone();
                action_ex.accepted = true;
                self.store.update_action_execution(&action_ex).await?;

                let (state, state_info) = action::map_to_task_state(&action_ex);
                task::complete_task(self, task_ex.id, state, state_info).await?;
                reconciled += 1;
            }
        }

        Ok(reconciled)
    }
}

// =============================================================================
// Delayed-call targets
// =============================================================================

#[derive(Debug, Deserialize)]
struct TaskRunArgs {
    task_execution_id: Uuid,
    #[serde(default)]
    reset: bool,
}

#[derive(Debug, Deserialize)]
struct TaskCompleteArgs {
    task_execution_id: Uuid,
    state: ExecutionState,
    #[serde(default)]
    state_info: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskTimeoutArgs {
    task_execution_id: Uuid,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct TaskRefreshArgs {
    task_execution_id: Uuid,
}

#[async_trait]
impl DelayedCallHandler for Engine {
    async fn invoke(&self, target: &str, args: Value) -> EngineResult<()> {
        match target {
            TARGET_RUN_EXISTING => {
                let args: TaskRunArgs = serde_json::from_value(args)?;
                task::run_existing_task(self, args.task_execution_id, args.reset).await
            }
            TARGET_COMPLETE_TASK => {
                let args: TaskCompleteArgs = serde_json::from_value(args)?;
                task::complete_task(self, args.task_execution_id, args.state, args.state_info)
                    .await
            }
            TARGET_FAIL_IF_INCOMPLETE => {
                let args: TaskTimeoutArgs = serde_json::from_value(args)?;
                task::fail_task_if_incomplete(self, args.task_execution_id, args.timeout).await
            }
            TARGET_REFRESH_TASK_STATE => {
                let args: TaskRefreshArgs = serde_json::from_value(args)?;
                task::refresh_task_state(self, args.task_execution_id).await
            }
            other => Err(EngineError::Workflow(format!(
                "unknown delayed call target: {other}"
            ))),
        }
    }
}

// =============================================================================
// Loopback client
// =============================================================================

/// Routes engine-client calls back into the same process
struct LoopbackClient {
    engine: Weak<Engine>,
}

impl LoopbackClient {
    fn engine(&self) -> EngineResult<Arc<Engine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| EngineError::Workflow("engine is shutting down".to_string()))
    }
}

#[async_trait]
impl EngineClient for LoopbackClient {
    async fn start_workflow(&self, start: SubWorkflowStart) -> EngineResult<Uuid> {
        let engine = self.engine()?;
        let spec = engine.workflows.get(&start.workflow_name)?;
        let wf_ex = lifecycle::start_workflow(
            &engine,
            spec,
            start.input,
            start.params,
            Some(ParentLink {
                task_execution_id: start.task_execution_id,
                root_execution_id: start.root_execution_id,
            }),
        )
        .await?;
        Ok(wf_ex.id)
    }

    async fn on_action_complete(
        &self,
        action_execution_id: Uuid,
        state: ExecutionState,
        output: Value,
    ) -> EngineResult<()> {
        let engine = self.engine()?;
        engine
            .on_action_complete(action_execution_id, state, output)
            .await
    }

    async fn on_action_update(
        &self,
        action_execution_id: Uuid,
        state: ExecutionState,
    ) -> EngineResult<()> {
        let engine = self.engine()?;
        engine.on_action_update(action_execution_id, state).await
    }
}
