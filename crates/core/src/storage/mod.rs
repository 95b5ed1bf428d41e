//! Repositories for definitions and executions.
//!
//! Both are stored as JSON documents so every nested step, action and condition
//! survives a round trip. `InMemoryStore` backs tests and development;
//! `RedbIndexStore` persists to an embedded database file.

pub mod execution_store;
pub mod index;
pub mod memory;

pub use execution_store::{ExecutionFilter, ExecutionStore};
pub use index::RedbIndexStore;
pub use memory::InMemoryStore;

use crate::types::{DefinitionId, ExecutionId, WorkflowDefinition, WorkflowExecution};
use anyhow::Result;

pub trait DefinitionRepository: Send + Sync {
    /// Insert or replace a definition
    fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()>;

    fn get_definition(&self, id: &DefinitionId) -> Result<Option<WorkflowDefinition>>;

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Returns whether a definition was removed
    fn delete_definition(&self, id: &DefinitionId) -> Result<bool>;
}

pub trait ExecutionRepository: Send + Sync {
    /// Insert or replace an execution
    fn save_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>>;

    /// All executions, most recently started first
    fn list_executions(&self) -> Result<Vec<WorkflowExecution>>;
}
