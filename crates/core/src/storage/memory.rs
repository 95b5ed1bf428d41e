use super::{DefinitionRepository, ExecutionRepository};
use crate::types::{DefinitionId, ExecutionId, WorkflowDefinition, WorkflowExecution};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Map-backed repository; reads hand out clones so callers never alias stored records
#[derive(Default)]
pub struct InMemoryStore {
    definitions: RwLock<HashMap<DefinitionId, WorkflowDefinition>>,
    executions: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionRepository for InMemoryStore {
    fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id, definition.clone());
        Ok(())
    }

    fn get_definition(&self, id: &DefinitionId) -> Result<Option<WorkflowDefinition>> {
        Ok(self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut definitions: Vec<WorkflowDefinition> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(definitions)
    }

    fn delete_definition(&self, id: &DefinitionId) -> Result<bool> {
        Ok(self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some())
    }
}

impl ExecutionRepository for InMemoryStore {
    fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution.id, execution.clone());
        Ok(())
    }

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        Ok(self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    fn list_executions(&self) -> Result<Vec<WorkflowExecution>> {
        let mut executions: Vec<WorkflowExecution> = self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(executions)
    }
}
