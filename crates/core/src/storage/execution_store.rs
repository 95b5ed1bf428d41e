use super::ExecutionRepository;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    DefinitionId, ExecutionId, ExecutionStatus, LogLevel, StepId, WorkflowExecution,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// Criteria for listing executions; empty fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default)]
    pub definition_id: Option<DefinitionId>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn for_definition(definition_id: DefinitionId) -> Self {
        Self {
            definition_id: Some(definition_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.definition_id
            .map_or(true, |id| execution.definition_id == id)
            && self
                .tenant_id
                .as_ref()
                .map_or(true, |t| &execution.tenant_id == t)
            && self.status.map_or(true, |s| execution.status == s)
    }
}

/// Live executions behind a repository.
///
/// Readers always receive a snapshot copy. Writers go through [`ExecutionStore::modify`],
/// which serializes read-modify-write cycles so a cancel issued by an API caller cannot be
/// lost under a concurrent update from the processor.
pub struct ExecutionStore {
    repo: Arc<dyn ExecutionRepository>,
    write_lock: Mutex<()>,
}

impl ExecutionStore {
    pub fn new(repo: Arc<dyn ExecutionRepository>) -> Self {
        Self {
            repo,
            write_lock: Mutex::new(()),
        }
    }

    pub fn insert(&self, execution: &WorkflowExecution) -> EngineResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.repo.save_execution(execution)?;
        Ok(())
    }

    /// Snapshot of an execution
    pub fn get(&self, id: &ExecutionId) -> EngineResult<WorkflowExecution> {
        self.repo
            .get_execution(id)?
            .ok_or(EngineError::ExecutionNotFound(*id))
    }

    pub fn list(&self, filter: &ExecutionFilter) -> EngineResult<Vec<WorkflowExecution>> {
        Ok(self
            .repo
            .list_executions()?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    /// Number of non-terminal executions of a definition
    pub fn count_active(&self, definition_id: &DefinitionId) -> EngineResult<usize> {
        Ok(self
            .repo
            .list_executions()?
            .iter()
            .filter(|e| &e.definition_id == definition_id && !e.status.is_terminal())
            .count())
    }

    /// Apply `f` to the stored execution and persist the result.
    ///
    /// Nothing is written when `f` returns an error.
    pub fn modify<T>(
        &self,
        id: &ExecutionId,
        f: impl FnOnce(&mut WorkflowExecution) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut execution = self
            .repo
            .get_execution(id)?
            .ok_or(EngineError::ExecutionNotFound(*id))?;

        let result = f(&mut execution)?;
        self.repo.save_execution(&execution)?;
        Ok(result)
    }

    /// Like [`ExecutionStore::modify`], for writes that must not touch a finished execution.
    ///
    /// Fails with `InvalidStateTransition` naming `action` once the execution is terminal.
    pub fn modify_active<T>(
        &self,
        id: &ExecutionId,
        action: &'static str,
        f: impl FnOnce(&mut WorkflowExecution) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.modify(id, |execution| {
            if execution.status.is_terminal() {
                return Err(EngineError::invalid_transition(
                    format!("execution {}", execution.id),
                    execution.status,
                    action,
                ));
            }
            f(execution)
        })
    }

    /// Append an entry to the execution log.
    ///
    /// Appends are allowed on terminal executions and never fail the caller;
    /// a storage problem is reported through tracing only.
    pub fn log(
        &self,
        id: &ExecutionId,
        level: LogLevel,
        step_id: Option<&StepId>,
        message: impl Into<String>,
        data: Value,
    ) {
        let message = message.into();
        let result = self.modify(id, |execution| {
            execution.push_log(level, step_id, message.clone(), data);
            Ok(())
        });

        if let Err(e) = result {
            tracing::warn!("Dropped log entry for execution {}: {} ({})", id, message, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::types::{DefinitionSnapshot, ExecutionContext, ExecutionSettings, VariableMap};
    use chrono::Utc;

    fn execution(definition_id: DefinitionId, status: ExecutionStatus) -> WorkflowExecution {
        WorkflowExecution {
            id: ExecutionId::new(),
            definition_id,
            tenant_id: "acme".to_string(),
            status,
            progress: 0,
            input: VariableMap::new(),
            output: VariableMap::new(),
            variables: VariableMap::new(),
            steps: vec![],
            logs: vec![],
            context: ExecutionContext::for_user("bob"),
            snapshot: DefinitionSnapshot {
                name: "test".to_string(),
                version: 1,
                steps: vec![],
                settings: ExecutionSettings::default(),
            },
            started_at: Utc::now(),
            run_started_at: None,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn test_failed_modify_does_not_persist() {
        let store = ExecutionStore::new(Arc::new(InMemoryStore::new()));
        let exec = execution(DefinitionId::new(), ExecutionStatus::Running);
        store.insert(&exec).unwrap();

        let result: EngineResult<()> = store.modify(&exec.id, |e| {
            e.status = ExecutionStatus::Completed;
            Err(EngineError::validation("nope"))
        });

        assert!(result.is_err());
        assert_eq!(store.get(&exec.id).unwrap().status, ExecutionStatus::Running);
    }

    #[test]
    fn test_terminal_execution_rejects_active_writes() {
        let store = ExecutionStore::new(Arc::new(InMemoryStore::new()));
        let exec = execution(DefinitionId::new(), ExecutionStatus::Cancelled);
        store.insert(&exec).unwrap();

        let err = store
            .modify_active(&exec.id, "complete step", |e| {
                e.variables.insert("late".to_string(), Value::Bool(true));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStateTransition { action: "complete step", .. }
        ));

        store.log(&exec.id, LogLevel::Info, None, "still appendable", Value::Null);
        let stored = store.get(&exec.id).unwrap();
        assert!(!stored.variables.contains_key("late"));
        assert_eq!(stored.logs.len(), 1);
    }

    #[test]
    fn test_snapshots_are_detached() {
        let store = ExecutionStore::new(Arc::new(InMemoryStore::new()));
        let exec = execution(DefinitionId::new(), ExecutionStatus::Pending);
        store.insert(&exec).unwrap();

        let mut copy = store.get(&exec.id).unwrap();
        copy.status = ExecutionStatus::Failed;

        assert_eq!(store.get(&exec.id).unwrap().status, ExecutionStatus::Pending);
    }

    #[test]
    fn test_log_on_missing_execution_is_silent() {
        let store = ExecutionStore::new(Arc::new(InMemoryStore::new()));
        store.log(&ExecutionId::new(), LogLevel::Info, None, "orphan", Value::Null);
    }

    #[test]
    fn test_filter_and_active_count() {
        let store = ExecutionStore::new(Arc::new(InMemoryStore::new()));
        let def = DefinitionId::new();
        store.insert(&execution(def, ExecutionStatus::Running)).unwrap();
        store.insert(&execution(def, ExecutionStatus::Completed)).unwrap();
        store.insert(&execution(DefinitionId::new(), ExecutionStatus::Pending)).unwrap();

        assert_eq!(store.count_active(&def).unwrap(), 1);
        assert_eq!(store.list(&ExecutionFilter::for_definition(def)).unwrap().len(), 2);

        let filter = ExecutionFilter {
            status: Some(ExecutionStatus::Pending),
            ..ExecutionFilter::default()
        };
        assert_eq!(store.list(&filter).unwrap().len(), 1);
    }
}
