//! # Windlass Execution Engine
//!
//! A store-backed workflow orchestration engine for reliable, distributed
//! execution of declaratively defined workflows.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   (RPC surface: start / on_action_complete / pause / ...)   │
//! └─────────────────────────────────────────────────────────────┘
//!        │                │                   │
//!        ▼                ▼                   ▼
//! ┌─────────────┐  ┌──────────────┐  ┌──────────────────┐
//! │ Controller  │→ │  Dispatcher  │→ │ Task / Action     │
//! │ (joins,     │  │ (ordering,   │  │ state machines    │
//! │  routing)   │  │  backlog)    │  │ (+ policies)      │
//! └─────────────┘  └──────────────┘  └──────────────────┘
//!        │                │                   │
//!        ▼                ▼                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (PostgreSQL / in-memory: executions, delayed calls, locks) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Multiple engine instances run concurrently against the shared store;
//! there is no in-memory authority. Coordination rests on three store
//! primitives: conditional state updates, named locks and lease-based
//! delayed-call capture. The scheduler is the only source of time-based
//! re-entry.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use windlass_engine::prelude::*;
//! use windlass_core::SimpleEvaluator;
//!
//! let engine = Engine::new(
//!     Arc::new(InMemoryWorkflowStore::new()),
//!     Arc::new(SimpleEvaluator::new()),
//!     Arc::new(LocalActionRunner::new()),
//! );
//! engine.start();
//!
//! engine.workflows().register(spec);
//! let wf_ex = engine
//!     .start_workflow("deploy", serde_json::json!({"env": "prod"}), Default::default())
//!     .await?;
//! ```

pub mod action;
pub mod client;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod persistence;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod task;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{EngineClient, SubWorkflowStart};
    pub use crate::engine::{Engine, EngineConfig};
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::persistence::{
        InMemoryWorkflowStore, Pagination, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::runner::{ActionCall, ActionRunner, LocalActionRunner};
    pub use crate::scheduler::{DelayedCallHandler, Scheduler, SchedulerConfig};
}

// Re-export key types at crate root
pub use client::{EngineClient, SubWorkflowStart};
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use persistence::{
    InMemoryWorkflowStore, Pagination, PostgresWorkflowStore, StoreError, WorkflowStore,
};
pub use registry::{ActionDefinitions, WorkflowDefinitions};
pub use runner::{ActionCall, ActionRunner, LocalActionRunner};
pub use scheduler::{DelayedCallHandler, Scheduler, SchedulerConfig};
