//! Persistence layer: the WorkflowStore trait and its implementations

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{Pagination, StoreError, WorkflowStore};
