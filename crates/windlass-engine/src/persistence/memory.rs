//! In-memory implementation of WorkflowStore for testing

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use windlass_core::{ActionExecution, DelayedCall, ExecutionState, TaskExecution, WorkflowExecution};

use super::store::*;

/// In-memory implementation of WorkflowStore
///
/// This is primarily for testing. It stores all data in memory and provides
/// the same semantics as the PostgreSQL implementation, including conditional
/// state updates, named locks and delayed-call capture.
///
/// # Example
///
/// ```
/// use windlass_engine::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, WorkflowExecution>>,
    tasks: RwLock<HashMap<Uuid, TaskExecution>>,
    actions: RwLock<HashMap<Uuid, ActionExecution>>,
    delayed_calls: RwLock<HashMap<Uuid, DelayedCall>>,
    named_locks: Mutex<HashSet<String>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workflow executions
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Number of pending delayed calls
    pub fn delayed_call_count(&self) -> usize {
        self.delayed_calls.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.tasks.write().clear();
        self.actions.write().clear();
        self.delayed_calls.write().clear();
        self.named_locks.lock().clear();
    }

    fn sorted_by_creation<T: Clone>(
        items: impl Iterator<Item = T>,
        key: impl Fn(&T) -> (DateTime<Utc>, Uuid),
    ) -> Vec<T> {
        let mut out: Vec<T> = items.collect();
        out.sort_by_key(key);
        out
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow_execution(&self, wf: &WorkflowExecution) -> Result<(), StoreError> {
        self.workflows.write().insert(wf.id, wf.clone());
        Ok(())
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn update_workflow_execution(&self, wf: &WorkflowExecution) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if !workflows.contains_key(&wf.id) {
            return Err(StoreError::WorkflowNotFound(wf.id));
        }
        let mut updated = wf.clone();
        updated.updated_at = Utc::now();
        workflows.insert(wf.id, updated);
        Ok(())
    }

    async fn update_workflow_state(
        &self,
        id: Uuid,
        expected: &[ExecutionState],
        to: ExecutionState,
        state_info: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut workflows = self.workflows.write();
        let wf = workflows.get_mut(&id).ok_or(StoreError::WorkflowNotFound(id))?;

        if !expected.contains(&wf.state) {
            return Ok(false);
        }

        wf.state = to;
        if state_info.is_some() {
            wf.state_info = state_info;
        }
        wf.updated_at = Utc::now();
        Ok(true)
    }

    async fn create_task_execution(&self, task: &TaskExecution) -> Result<(), StoreError> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecution, StoreError> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn update_task_execution(&self, task: &TaskExecution) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        if !tasks.contains_key(&task.id) {
            return Err(StoreError::TaskNotFound(task.id));
        }
        let mut updated = task.clone();
        updated.updated_at = Utc::now();
        tasks.insert(task.id, updated);
        Ok(())
    }

    async fn update_task_state(
        &self,
        id: Uuid,
        expected: &[ExecutionState],
        to: ExecutionState,
        state_info: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        if !expected.contains(&task.state) {
            return Ok(false);
        }

        task.state = to;
        if state_info.is_some() {
            task.state_info = state_info;
        }
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(Self::sorted_by_creation(
            self.tasks
                .read()
                .values()
                .filter(|t| t.workflow_execution_id == workflow_execution_id)
                .cloned(),
            |t| (t.created_at, t.id),
        ))
    }

    async fn find_task_executions_by_name(
        &self,
        workflow_execution_id: Uuid,
        name: &str,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(Self::sorted_by_creation(
            self.tasks
                .read()
                .values()
                .filter(|t| t.workflow_execution_id == workflow_execution_id && t.name == name)
                .cloned(),
            |t| (t.created_at, t.id),
        ))
    }

    async fn get_incomplete_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(Self::sorted_by_creation(
            self.tasks
                .read()
                .values()
                .filter(|t| {
                    t.workflow_execution_id == workflow_execution_id && !t.state.is_completed()
                })
                .cloned(),
            |t| (t.created_at, t.id),
        ))
    }

    async fn get_completed_task_executions(
        &self,
        workflow_execution_id: Uuid,
        pagination: Pagination,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let completed = Self::sorted_by_creation(
            self.tasks
                .read()
                .values()
                .filter(|t| {
                    t.workflow_execution_id == workflow_execution_id && t.state.is_completed()
                })
                .cloned(),
            // Completion order approximated by last update
            |t| (t.updated_at, t.id),
        );

        Ok(completed
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn find_stale_running_task_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(Self::sorted_by_creation(
            self.tasks
                .read()
                .values()
                .filter(|t| t.state == ExecutionState::Running && t.updated_at < older_than)
                .cloned(),
            |t| (t.created_at, t.id),
        ))
    }

    async fn create_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        self.actions.write().insert(action.id, action.clone());
        Ok(())
    }

    async fn get_action_execution(&self, id: Uuid) -> Result<ActionExecution, StoreError> {
        self.actions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ActionNotFound(id))
    }

    async fn update_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        let mut actions = self.actions.write();
        if !actions.contains_key(&action.id) {
            return Err(StoreError::ActionNotFound(action.id));
        }
        let mut updated = action.clone();
        updated.updated_at = Utc::now();
        actions.insert(action.id, updated);
        Ok(())
    }

    async fn get_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        Ok(Self::sorted_by_creation(
            self.actions
                .read()
                .values()
                .filter(|a| a.task_execution_id == task_execution_id)
                .cloned(),
            |a| (a.created_at, a.id),
        ))
    }

    async fn create_delayed_call(&self, call: &DelayedCall) -> Result<(), StoreError> {
        self.delayed_calls.write().insert(call.id, call.clone());
        Ok(())
    }

    async fn get_due_delayed_calls(
        &self,
        now: DateTime<Utc>,
        instance_id: &str,
        pickup_job_after: Duration,
        captured_job_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<DelayedCall>, StoreError> {
        let pickup_cutoff =
            now - chrono::Duration::from_std(pickup_job_after).unwrap_or_else(|_| chrono::Duration::zero());
        let lease_cutoff = now
            - chrono::Duration::from_std(captured_job_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let mut due: Vec<DelayedCall> = self
            .delayed_calls
            .read()
            .values()
            .filter(|c| {
                if c.execution_time > now {
                    return false;
                }
                if c.processing {
                    // Claimed: eligible again only once the lease lapsed
                    return c.captured_at.map(|t| t <= lease_cutoff).unwrap_or(true);
                }
                // Unclaimed: foreign calls wait out the pickup grace period
                c.scheduled_by == instance_id || c.execution_time <= pickup_cutoff
            })
            .cloned()
            .collect();

        due.sort_by_key(|c| (c.execution_time, c.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn capture_delayed_call(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        captured_job_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let lease_cutoff =
            now - chrono::Duration::from_std(captured_job_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let mut calls = self.delayed_calls.write();
        let call = match calls.get_mut(&id) {
            Some(call) => call,
            // Already processed and deleted by another instance
            None => return Ok(false),
        };

        let claimable = !call.processing
            || call.captured_at.map(|t| t <= lease_cutoff).unwrap_or(true);

        if !claimable {
            return Ok(false);
        }

        call.processing = true;
        call.captured_at = Some(now);
        Ok(true)
    }

    async fn delete_delayed_call(&self, id: Uuid) -> Result<(), StoreError> {
        self.delayed_calls
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::DelayedCallNotFound(id))
    }

    async fn delete_delayed_calls_by_key(&self, key: &str) -> Result<u64, StoreError> {
        let mut calls = self.delayed_calls.write();
        let ids: Vec<Uuid> = calls
            .values()
            .filter(|c| c.unique_key.as_deref() == Some(key) && !c.processing)
            .map(|c| c.id)
            .collect();

        for id in &ids {
            calls.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn acquire_named_lock(&self, name: &str) -> Result<(), StoreError> {
        loop {
            {
                let mut locks = self.named_locks.lock();
                if locks.insert(name.to_string()) {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn release_named_lock(&self, name: &str) -> Result<(), StoreError> {
        self.named_locks.lock().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use windlass_core::{ExecutionParams, TaskSpec, WorkflowSpec};

    fn make_workflow() -> WorkflowExecution {
        let spec = WorkflowSpec {
            name: "wf".into(),
            tasks: vec![TaskSpec::new("t1", "std.noop")],
            output: None,
            output_on_error: None,
        };
        WorkflowExecution::new(spec, json!({}), ExecutionParams::default())
    }

    #[tokio::test]
    async fn test_workflow_crud() {
        let store = InMemoryWorkflowStore::new();
        let mut wf = make_workflow();

        store.create_workflow_execution(&wf).await.unwrap();

        wf.state = ExecutionState::Running;
        store.update_workflow_execution(&wf).await.unwrap();

        let loaded = store.get_workflow_execution(wf.id).await.unwrap();
        assert_eq!(loaded.state, ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_conditional_task_state_update() {
        let store = InMemoryWorkflowStore::new();
        let wf = make_workflow();
        let task = TaskExecution::new(
            wf.id,
            TaskSpec::new("t1", "std.noop"),
            ExecutionState::Idle,
        );

        store.create_task_execution(&task).await.unwrap();

        // Expected state matches: the update wins
        let won = store
            .update_task_state(
                task.id,
                &[ExecutionState::Idle],
                ExecutionState::Running,
                None,
            )
            .await
            .unwrap();
        assert!(won);

        // Second writer expecting IDLE loses without error
        let won = store
            .update_task_state(
                task.id,
                &[ExecutionState::Idle],
                ExecutionState::Running,
                None,
            )
            .await
            .unwrap();
        assert!(!won);
    }

    #[tokio::test]
    async fn test_delayed_call_capture_is_exclusive() {
        let store = InMemoryWorkflowStore::new();
        let now = Utc::now();
        let call = DelayedCall::new("task.run_existing", json!({}), now, "instance-1");

        store.create_delayed_call(&call).await.unwrap();

        let lease = Duration::from_secs(30);
        let first = store.capture_delayed_call(call.id, now, lease).await.unwrap();
        let second = store.capture_delayed_call(call.id, now, lease).await.unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_lease_expiry_allows_recapture() {
        let store = InMemoryWorkflowStore::new();
        let now = Utc::now();
        let mut call = DelayedCall::new("task.run_existing", json!({}), now, "instance-1");
        call.processing = true;
        call.captured_at = Some(now - chrono::Duration::seconds(120));

        store.create_delayed_call(&call).await.unwrap();

        let recaptured = store
            .capture_delayed_call(call.id, now, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(recaptured);
    }

    #[tokio::test]
    async fn test_foreign_calls_wait_out_pickup_grace() {
        let store = InMemoryWorkflowStore::new();
        let now = Utc::now();

        // Due now, scheduled by another instance
        let call = DelayedCall::new("task.run_existing", json!({}), now, "instance-1");
        store.create_delayed_call(&call).await.unwrap();

        let due = store
            .get_due_delayed_calls(
                now,
                "instance-2",
                Duration::from_secs(10),
                Duration::from_secs(30),
                10,
            )
            .await
            .unwrap();
        assert!(due.is_empty());

        // The owner sees it immediately
        let due = store
            .get_due_delayed_calls(
                now,
                "instance-1",
                Duration::from_secs(10),
                Duration::from_secs(30),
                10,
            )
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_named_lock_excludes_concurrent_holder() {
        let store = std::sync::Arc::new(InMemoryWorkflowStore::new());

        store.acquire_named_lock("k").await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                store.acquire_named_lock("k").await.unwrap();
                store.release_named_lock("k").await.unwrap();
            })
        };

        // Give the contender a moment to block, then release
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        store.release_named_lock("k").await.unwrap();
        contender.await.unwrap();
    }
}
