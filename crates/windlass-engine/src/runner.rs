//! Remote-executor dispatch
//!
//! The engine never executes action code itself; it hands the work to a
//! remote executor through [`ActionRunner`] and waits for the result to come
//! back through `on_action_complete`. A runner may also answer synchronously
//! (returning `Some(output)`), in which case the engine completes the action
//! inline - that is how `std.noop` and the test runner behave.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Everything a runner needs to dispatch one action execution
#[derive(Debug, Clone)]
pub struct ActionCall {
    /// Action execution receiving the result
    pub action_execution_id: Uuid,

    /// Concrete action reference (ad-hoc chains already resolved)
    pub action_ref: String,

    /// Evaluated input
    pub input: Value,

    /// The action can be redone after a crash without side effects
    pub safe_rerun: bool,

    /// Engine context (workflow/task identifiers) travelling with the call
    pub exec_context: Value,

    /// Placement hint for the remote executor
    pub target: Option<String>,

    /// Execution timeout in seconds, when the task carries one
    pub timeout: Option<u64>,
}

/// Dispatch interface to remote executors
#[async_trait]
pub trait ActionRunner: Send + Sync + 'static {
    /// Run an action
    ///
    /// Returns `Ok(Some(output))` when the result is available synchronously;
    /// `Ok(None)` when the executor will report the result later via the
    /// engine's `on_action_complete`. An `Err` fails the action execution.
    async fn run_action(&self, call: ActionCall) -> EngineResult<Option<Value>>;

    /// Best-effort cancellation of outstanding work
    ///
    /// The engine has already decided the execution's outcome; this only
    /// asks the executor to stop burning resources.
    async fn cancel_action(&self, _action_execution_id: Uuid) -> EngineResult<()> {
        Ok(())
    }
}

/// Handler function executing one action locally
pub type ActionHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn std::future::Future<Output = Result<Value, String>> + Send>>
        + Send
        + Sync,
>;

/// In-process runner with a registered-handler map, for tests and examples
///
/// `std.noop` and `std.echo` are built in; `std.fail` always errors.
///
/// # Example
///
/// ```
/// use windlass_engine::LocalActionRunner;
/// use serde_json::json;
///
/// let runner = LocalActionRunner::new();
/// runner.register_handler("my.action", |input| async move {
///     Ok(json!({ "seen": input }))
/// });
/// ```
#[derive(Default)]
pub struct LocalActionRunner {
    handlers: parking_lot::RwLock<HashMap<String, ActionHandler>>,
}

impl LocalActionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an action reference
    pub fn register_handler<F, Fut>(&self, action_ref: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |input| Box::pin(handler(input)));
        self.handlers.write().insert(action_ref.into(), handler);
    }
}

#[async_trait]
impl ActionRunner for LocalActionRunner {
    async fn run_action(&self, call: ActionCall) -> EngineResult<Option<Value>> {
        debug!(action_ref = %call.action_ref, action_execution_id = %call.action_execution_id, "running action locally");

        match call.action_ref.as_str() {
            "std.noop" => return Ok(Some(json!({}))),
            "std.echo" => {
                let output = call.input.get("output").cloned().unwrap_or(call.input);
                return Ok(Some(output));
            }
            "std.fail" => {
                let message = call
                    .input
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("action failed");
                return Err(EngineError::Workflow(message.to_string()));
            }
            _ => {}
        }

        let handler = self.handlers.read().get(&call.action_ref).cloned();
        match handler {
            Some(handler) => match handler(call.input).await {
                Ok(output) => Ok(Some(output)),
                Err(message) => Err(EngineError::Workflow(message)),
            },
            None => Err(EngineError::Workflow(format!(
                "no action registered for ref: {}",
                call.action_ref
            ))),
        }
    }
}
