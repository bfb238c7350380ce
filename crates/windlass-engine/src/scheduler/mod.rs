//! Delayed-call scheduler
//!
//! The only source of time-based re-entry into the engine. A component that
//! needs the engine to act later persists a [`DelayedCall`] through
//! [`Scheduler::schedule`]; a background loop running in every engine
//! instance captures due calls and invokes them through the handler
//! registered at startup.
//!
//! Multiple instances run this loop concurrently against the shared store.
//! Exclusivity comes from the conditional capture update
//! (`processing: false -> true`): only the instance whose update affected the
//! row owns the call. A captured-but-never-completed call (instance crash)
//! becomes eligible again after `captured_job_timeout`, and an instance gets
//! `pickup_job_after` seconds of uncontested time on its own calls before
//! others may claim them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use windlass_core::DelayedCall;

use crate::error::EngineResult;
use crate::persistence::{StoreError, WorkflowStore};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base period of the capture loop
    pub fixed_delay: Duration,

    /// Random extra delay added per iteration to avoid thundering-herd
    /// across instances
    pub random_delay: Duration,

    /// Maximum calls captured per iteration
    pub batch_size: usize,

    /// Lease: a captured call becomes re-claimable after this long
    pub captured_job_timeout: Duration,

    /// Grace period before an instance claims calls scheduled by others
    pub pickup_job_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fixed_delay: Duration::from_secs(1),
            random_delay: Duration::from_secs(1),
            batch_size: 50,
            captured_job_timeout: Duration::from_secs(30),
            pickup_job_after: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base loop period
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.fixed_delay = delay;
        self
    }

    /// Set the random extra delay
    pub fn with_random_delay(mut self, delay: Duration) -> Self {
        self.random_delay = delay;
        self
    }

    /// Set the per-iteration batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the capture lease timeout
    pub fn with_captured_job_timeout(mut self, timeout: Duration) -> Self {
        self.captured_job_timeout = timeout;
        self
    }

    /// Set the foreign-call pickup grace period
    pub fn with_pickup_job_after(mut self, delay: Duration) -> Self {
        self.pickup_job_after = delay;
        self
    }
}

/// Resolves and invokes delayed-call targets by name
///
/// The engine registers itself as the handler when it starts the scheduler;
/// targets are engine operations like "task.run_existing".
#[async_trait]
pub trait DelayedCallHandler: Send + Sync + 'static {
    async fn invoke(&self, target: &str, args: Value) -> EngineResult<()>;
}

/// Durable, lease-based future invocation
pub struct Scheduler {
    store: Arc<dyn WorkflowStore>,
    config: SchedulerConfig,
    instance_id: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loop_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a new scheduler bound to a store and instance identity
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        instance_id: impl Into<String>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            config,
            instance_id: instance_id.into(),
            shutdown_tx,
            shutdown_rx,
            loop_handle: parking_lot::Mutex::new(None),
        }
    }

    /// This instance's identity, recorded on every call it schedules
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Persist a delayed call firing `delay` from now
    #[instrument(skip(self, args), fields(instance_id = %self.instance_id))]
    pub async fn schedule(
        &self,
        target: &str,
        delay: Duration,
        unique_key: Option<&str>,
        args: Value,
    ) -> Result<Uuid, StoreError> {
        let execution_time =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let mut call = DelayedCall::new(target, args, execution_time, &self.instance_id);
        if let Some(key) = unique_key {
            call = call.with_unique_key(key);
        }

        self.store.create_delayed_call(&call).await?;
        debug!(%target, delay_ms = delay.as_millis() as u64, delayed_call_id = %call.id, "scheduled delayed call");
        Ok(call.id)
    }

    /// Cancel pending calls carrying the given unique key
    pub async fn cancel_by_key(&self, key: &str) -> Result<u64, StoreError> {
        self.store.delete_delayed_calls_by_key(key).await
    }

    /// Start the background capture loop
    pub fn start(self: &Arc<Self>, handler: Arc<dyn DelayedCallHandler>) {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            loop {
                let sleep_for = scheduler.jittered_period();
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("scheduler loop shutting down");
                        return;
                    }
                }

                if let Err(e) = scheduler.run_once(handler.as_ref()).await {
                    error!("scheduler iteration failed: {}", e);
                }
            }
        });

        *self.loop_handle.lock() = Some(handle);
    }

    /// Stop the background loop and wait for it to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One capture/prepare/invoke/delete iteration
    ///
    /// Exposed so tests (and the integrity job) can drive delayed calls
    /// deterministically. Returns the number of calls this instance
    /// processed.
    pub async fn run_once(&self, handler: &dyn DelayedCallHandler) -> EngineResult<usize> {
        let now = Utc::now();

        // Capture: only calls whose conditional update we win are ours.
        let due = self
            .store
            .get_due_delayed_calls(
                now,
                &self.instance_id,
                self.config.pickup_job_after,
                self.config.captured_job_timeout,
                self.config.batch_size,
            )
            .await?;

        let mut captured = Vec::with_capacity(due.len());
        for call in due {
            if self
                .store
                .capture_delayed_call(call.id, now, self.config.captured_job_timeout)
                .await?
            {
                captured.push(call);
            }
        }

        if captured.is_empty() {
            return Ok(0);
        }

        debug!(count = captured.len(), "captured delayed calls");

        // Invoke: a failing target is logged and does not abort the batch.
        // Delete: a failing delete is re-raised - the store must not silently
        // diverge from what we just executed.
        let mut processed = 0;
        for call in captured {
            if let Err(e) = handler.invoke(&call.target, call.args.clone()).await {
                warn!(target = %call.target, delayed_call_id = %call.id, "delayed call failed: {}", e);
            }

            self.store.delete_delayed_call(call.id).await?;
            processed += 1;
        }

        Ok(processed)
    }

    fn jittered_period(&self) -> Duration {
        let random_ms = self.config.random_delay.as_millis() as u64;
        let jitter = if random_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=random_ms)
        };
        self.config.fixed_delay + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::persistence::InMemoryWorkflowStore;

    struct RecordingHandler {
        invocations: Mutex<Vec<(String, Value)>>,
        fail_targets: Vec<String>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                invocations: Mutex::new(vec![]),
                fail_targets: vec![],
            }
        }

        fn failing_on(target: &str) -> Self {
            Self {
                invocations: Mutex::new(vec![]),
                fail_targets: vec![target.to_string()],
            }
        }
    }

    #[async_trait]
    impl DelayedCallHandler for RecordingHandler {
        async fn invoke(&self, target: &str, args: Value) -> EngineResult<()> {
            self.invocations.lock().push((target.to_string(), args));
            if self.fail_targets.iter().any(|t| t == target) {
                return Err(crate::error::EngineError::Workflow("boom".into()));
            }
            Ok(())
        }
    }

    fn scheduler(store: Arc<InMemoryWorkflowStore>) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            store,
            "test-instance",
            SchedulerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_schedule_and_run_once() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let scheduler = scheduler(store.clone());
        let handler = RecordingHandler::new();

        scheduler
            .schedule("task.run_existing", Duration::ZERO, None, json!({"n": 1}))
            .await
            .unwrap();

        let processed = scheduler.run_once(&handler).await.unwrap();
        assert_eq!(processed, 1);

        let invocations = handler.invocations.lock();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].0, "task.run_existing");
        assert_eq!(invocations[0].1, json!({"n": 1}));

        // Processed calls are deleted
        assert_eq!(store.delayed_call_count(), 0);
    }

    #[tokio::test]
    async fn test_future_calls_are_not_picked_up() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let scheduler = scheduler(store.clone());
        let handler = RecordingHandler::new();

        scheduler
            .schedule("task.complete", Duration::from_secs(3600), None, json!({}))
            .await
            .unwrap();

        let processed = scheduler.run_once(&handler).await.unwrap();
        assert_eq!(processed, 0);
        assert_eq!(store.delayed_call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_invocation_does_not_abort_batch() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let scheduler = scheduler(store.clone());
        let handler = RecordingHandler::failing_on("bad.target");

        scheduler
            .schedule("bad.target", Duration::ZERO, None, json!({}))
            .await
            .unwrap();
        scheduler
            .schedule("good.target", Duration::ZERO, None, json!({}))
            .await
            .unwrap();

        let processed = scheduler.run_once(&handler).await.unwrap();
        assert_eq!(processed, 2);
        assert_eq!(handler.invocations.lock().len(), 2);
        assert_eq!(store.delayed_call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_instances_do_not_double_invoke() {
        let store = Arc::new(InMemoryWorkflowStore::new());

        // Both instances see the call as due (zero pickup grace)
        let config = SchedulerConfig::default().with_pickup_job_after(Duration::ZERO);
        let s1 = Arc::new(Scheduler::new(store.clone() as Arc<dyn WorkflowStore>, "i-1", config.clone()));
        let s2 = Arc::new(Scheduler::new(store.clone() as Arc<dyn WorkflowStore>, "i-2", config));

        s1.schedule("task.complete", Duration::ZERO, None, json!({}))
            .await
            .unwrap();

        let h1 = RecordingHandler::new();
        let h2 = RecordingHandler::new();

        let p1 = s1.run_once(&h1).await.unwrap();
        let p2 = s2.run_once(&h2).await.unwrap();

        assert_eq!(p1 + p2, 1, "exactly one instance processes the call");
        assert_eq!(
            h1.invocations.lock().len() + h2.invocations.lock().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_by_key() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let scheduler = scheduler(store.clone());

        scheduler
            .schedule("task.complete", Duration::from_secs(60), Some("t1-wait"), json!({}))
            .await
            .unwrap();

        let removed = scheduler.cancel_by_key("t1-wait").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.delayed_call_count(), 0);
    }

    #[tokio::test]
    async fn test_background_loop_shutdown() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let scheduler = Arc::new(Scheduler::new(
            store as Arc<dyn WorkflowStore>,
            "loop-instance",
            SchedulerConfig::default().with_fixed_delay(Duration::from_millis(10)),
        ));

        scheduler.start(Arc::new(RecordingHandler::new()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown().await;
    }
}
