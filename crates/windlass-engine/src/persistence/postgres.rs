//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Conditional `UPDATE ... WHERE state = ANY(...)` for optimistic state
//!   transitions (losing writers observe zero affected rows)
//! - Atomic delayed-call capture with lease-based recovery
//! - A `windlass_named_locks` table backing the distributed lock primitive
//!
//! Entities are stored as JSONB documents with the queryable fields extracted
//! into columns. Schema creation and migration are owned by the deployment
//! layer; this store assumes its tables exist.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::{debug, error};
use uuid::Uuid;

use windlass_core::{ActionExecution, DelayedCall, ExecutionState, TaskExecution, WorkflowExecution};

use super::store::*;

/// PostgreSQL implementation of WorkflowStore
///
/// Uses a connection pool for efficient database access. Safe to share
/// between many concurrent engine instances: every coordination primitive is
/// a single conditional statement.
///
/// # Example
///
/// ```ignore
/// use windlass_engine::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/windlass").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

fn to_json<T: Serialize>(entity: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(entity).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_row<T: DeserializeOwned>(row: &sqlx::postgres::PgRow) -> Result<T, StoreError> {
    let data: serde_json::Value = row.get("data");
    serde_json::from_value(data).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn states_to_strings(states: &[ExecutionState]) -> Vec<String> {
    states.iter().map(|s| s.to_string()).collect()
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    // Out-of-range timeouts clamp to something safely "forever"
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365_000))
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn create_workflow_execution(&self, wf: &WorkflowExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO windlass_workflow_executions (id, state, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            "#,
        )
        .bind(wf.id)
        .bind(wf.state.to_string())
        .bind(to_json(wf)?)
        .bind(wf.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(workflow_execution_id = %wf.id, workflow = %wf.workflow_name, "created workflow execution");
        Ok(())
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_workflow_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::WorkflowNotFound(id))?;

        let mut wf: WorkflowExecution = from_row(&row)?;
        wf.updated_at = row.get("updated_at");
        Ok(wf)
    }

    async fn update_workflow_execution(&self, wf: &WorkflowExecution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE windlass_workflow_executions
            SET state = $2, data = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(wf.id)
        .bind(wf.state.to_string())
        .bind(to_json(wf)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(wf.id));
        }
        Ok(())
    }

    async fn update_workflow_state(
        &self,
        id: Uuid,
        expected: &[ExecutionState],
        to: ExecutionState,
        state_info: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE windlass_workflow_executions
            SET state = $3,
                data = jsonb_set(
                    CASE WHEN $4::text IS NULL THEN data
                         ELSE jsonb_set(data, '{state_info}', to_jsonb($4::text)) END,
                    '{state}', to_jsonb($3::text)),
                updated_at = NOW()
            WHERE id = $1 AND state = ANY($2)
            "#,
        )
        .bind(id)
        .bind(states_to_strings(expected))
        .bind(to.to_string())
        .bind(state_info)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn create_task_execution(&self, task: &TaskExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO windlass_task_executions
                (id, workflow_execution_id, name, state, processed, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(task.id)
        .bind(task.workflow_execution_id)
        .bind(&task.name)
        .bind(task.state.to_string())
        .bind(task.processed)
        .bind(to_json(task)?)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(task_execution_id = %task.id, task = %task.name, state = %task.state, "created task execution");
        Ok(())
    }

    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecution, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_task_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::TaskNotFound(id))?;

        let mut task: TaskExecution = from_row(&row)?;
        task.updated_at = row.get("updated_at");
        Ok(task)
    }

    async fn update_task_execution(&self, task: &TaskExecution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE windlass_task_executions
            SET state = $2, processed = $3, data = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.state.to_string())
        .bind(task.processed)
        .bind(to_json(task)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task.id));
        }
        Ok(())
    }

    async fn update_task_state(
        &self,
        id: Uuid,
        expected: &[ExecutionState],
        to: ExecutionState,
        state_info: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE windlass_task_executions
            SET state = $3,
                data = jsonb_set(
                    CASE WHEN $4::text IS NULL THEN data
                         ELSE jsonb_set(data, '{state_info}', to_jsonb($4::text)) END,
                    '{state}', to_jsonb($3::text)),
                updated_at = NOW()
            WHERE id = $1 AND state = ANY($2)
            "#,
        )
        .bind(id)
        .bind(states_to_strings(expected))
        .bind(to.to_string())
        .bind(state_info)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_task_executions
            WHERE workflow_execution_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(workflow_execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let mut task: TaskExecution = from_row(row)?;
                task.updated_at = row.get("updated_at");
                Ok(task)
            })
            .collect()
    }

    async fn find_task_executions_by_name(
        &self,
        workflow_execution_id: Uuid,
        name: &str,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_task_executions
            WHERE workflow_execution_id = $1 AND name = $2
            ORDER BY created_at, id
            "#,
        )
        .bind(workflow_execution_id)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let mut task: TaskExecution = from_row(row)?;
                task.updated_at = row.get("updated_at");
                Ok(task)
            })
            .collect()
    }

    async fn get_incomplete_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_task_executions
            WHERE workflow_execution_id = $1
              AND state NOT IN ('SUCCESS', 'ERROR', 'CANCELLED')
            ORDER BY created_at, id
            "#,
        )
        .bind(workflow_execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let mut task: TaskExecution = from_row(row)?;
                task.updated_at = row.get("updated_at");
                Ok(task)
            })
            .collect()
    }

    async fn get_completed_task_executions(
        &self,
        workflow_execution_id: Uuid,
        pagination: Pagination,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_task_executions
            WHERE workflow_execution_id = $1
              AND state IN ('SUCCESS', 'ERROR', 'CANCELLED')
            ORDER BY updated_at, id
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(workflow_execution_id)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let mut task: TaskExecution = from_row(row)?;
                task.updated_at = row.get("updated_at");
                Ok(task)
            })
            .collect()
    }

    async fn find_stale_running_task_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_task_executions
            WHERE state = 'RUNNING' AND updated_at < $1
            ORDER BY updated_at, id
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let mut task: TaskExecution = from_row(row)?;
                task.updated_at = row.get("updated_at");
                Ok(task)
            })
            .collect()
    }

    async fn create_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO windlass_action_executions
                (id, task_execution_id, workflow_execution_id, state, accepted, data,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(action.id)
        .bind(action.task_execution_id)
        .bind(action.workflow_execution_id)
        .bind(action.state.to_string())
        .bind(action.accepted)
        .bind(to_json(action)?)
        .bind(action.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_action_execution(&self, id: Uuid) -> Result<ActionExecution, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_action_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ActionNotFound(id))?;

        let mut action: ActionExecution = from_row(&row)?;
        action.updated_at = row.get("updated_at");
        Ok(action)
    }

    async fn update_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE windlass_action_executions
            SET state = $2, accepted = $3, data = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(action.id)
        .bind(action.state.to_string())
        .bind(action.accepted)
        .bind(to_json(action)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound(action.id));
        }
        Ok(())
    }

    async fn get_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data, updated_at FROM windlass_action_executions
            WHERE task_execution_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(task_execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let mut action: ActionExecution = from_row(row)?;
                action.updated_at = row.get("updated_at");
                Ok(action)
            })
            .collect()
    }

    async fn create_delayed_call(&self, call: &DelayedCall) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO windlass_delayed_calls
                (id, target, execution_time, processing, captured_at, scheduled_by,
                 unique_key, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(call.id)
        .bind(&call.target)
        .bind(call.execution_time)
        .bind(call.processing)
        .bind(call.captured_at)
        .bind(&call.scheduled_by)
        .bind(&call.unique_key)
        .bind(to_json(call)?)
        .bind(call.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(delayed_call_id = %call.id, target = %call.target, "created delayed call");
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
        let pickup_cutoff = now - chrono_duration(pickup_job_after);
        let lease_cutoff = now - chrono_duration(captured_job_timeout);

        let rows = sqlx::query(
            r#"
            SELECT data FROM windlass_delayed_calls
            WHERE execution_time <= $1
              AND (
                    (processing = FALSE
                     AND (scheduled_by = $2 OR execution_time <= $3))
                 OR (processing = TRUE
                     AND (captured_at IS NULL OR captured_at <= $4))
              )
            ORDER BY execution_time, id
            LIMIT $5
            "#,
        )
        .bind(now)
        .bind(instance_id)
        .bind(pickup_cutoff)
        .bind(lease_cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(from_row).collect()
    }

    async fn capture_delayed_call(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        captured_job_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let lease_cutoff = now - chrono_duration(captured_job_timeout);

        let result = sqlx::query(
            r#"
            UPDATE windlass_delayed_calls
            SET processing = TRUE, captured_at = $2
            WHERE id = $1
              AND (processing = FALSE
                   OR captured_at IS NULL
                   OR captured_at <= $3)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(lease_cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_delayed_call(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM windlass_delayed_calls WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DelayedCallNotFound(id));
        }
        Ok(())
    }

    async fn delete_delayed_calls_by_key(&self, key: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM windlass_delayed_calls
            WHERE unique_key = $1 AND processing = FALSE
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn acquire_named_lock(&self, name: &str) -> Result<(), StoreError> {
        loop {
            let result = sqlx::query(
                r#"
                INSERT INTO windlass_named_locks (name, acquired_at)
                VALUES ($1, NOW())
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 1 {
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn release_named_lock(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM windlass_named_locks WHERE name = $1
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
