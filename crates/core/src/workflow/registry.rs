use super::dag::validate_definition;
use crate::error::{EngineError, EngineResult};
use crate::storage::DefinitionRepository;
use crate::types::{
    DefinitionDraft, DefinitionId, DefinitionPatch, ExecutionStatus, WorkflowDefinition,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Lifetime execution totals for one definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounters {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
}

/// Validated workflow definitions plus per-definition execution counters
pub struct DefinitionRegistry {
    repo: Arc<dyn DefinitionRepository>,
    counters: Mutex<HashMap<DefinitionId, ExecutionCounters>>,
    write_lock: Mutex<()>,
}

impl DefinitionRegistry {
    pub fn new(repo: Arc<dyn DefinitionRepository>) -> Self {
        Self {
            repo,
            counters: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Validate and store a new definition at version 1
    pub fn register(&self, draft: DefinitionDraft) -> EngineResult<WorkflowDefinition> {
        validate_definition(&draft.name, &draft.steps)?;

        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: DefinitionId::new(),
            tenant_id: draft.tenant_id,
            name: draft.name,
            description: draft.description,
            version: 1,
            is_active: draft.is_active,
            steps: draft.steps,
            triggers: draft.triggers,
            settings: draft.settings,
            metadata: draft.metadata,
            created_by: draft.created_by,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.repo.save_definition(&definition)?;

        tracing::info!(
            "Registered workflow definition {} ({}) with {} steps",
            definition.name,
            definition.id,
            definition.steps.len()
        );
        Ok(definition)
    }

    pub fn get(&self, id: &DefinitionId) -> EngineResult<Option<WorkflowDefinition>> {
        Ok(self.repo.get_definition(id)?)
    }

    /// Like [`DefinitionRegistry::get`] but a missing definition is an error
    pub fn require(&self, id: &DefinitionId) -> EngineResult<WorkflowDefinition> {
        self.get(id)?.ok_or(EngineError::DefinitionNotFound(*id))
    }

    /// Definitions, oldest first, optionally restricted to one tenant
    pub fn list(&self, tenant_id: Option<&str>) -> EngineResult<Vec<WorkflowDefinition>> {
        let mut definitions: Vec<_> = self
            .repo
            .list_definitions()?
            .into_iter()
            .filter(|d| tenant_id.map_or(true, |t| d.tenant_id == t))
            .collect();
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(definitions)
    }

    /// Apply a patch. The patched definition is validated before anything is written,
    /// so a rejected update leaves the stored definition untouched.
    pub fn update(&self, id: &DefinitionId, patch: DefinitionPatch) -> EngineResult<WorkflowDefinition> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut definition = self.require(id)?;

        if let Some(name) = patch.name {
            definition.name = name;
        }
        if let Some(description) = patch.description {
            definition.description = Some(description);
        }
        if let Some(is_active) = patch.is_active {
            definition.is_active = is_active;
        }
        if let Some(steps) = patch.steps {
            definition.steps = steps;
        }
        if let Some(triggers) = patch.triggers {
            definition.triggers = triggers;
        }
        if let Some(settings) = patch.settings {
            definition.settings = settings;
        }
        if let Some(metadata) = patch.metadata {
            definition.metadata = metadata;
        }

        validate_definition(&definition.name, &definition.steps)?;

        definition.version += 1;
        definition.updated_at = Utc::now();
        self.repo.save_definition(&definition)?;

        tracing::info!(
            "Updated workflow definition {} to version {}",
            definition.id,
            definition.version
        );
        Ok(definition)
    }

    /// Remove a definition. Callers are responsible for checking active executions first.
    pub fn delete(&self, id: &DefinitionId) -> EngineResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.repo.delete_definition(id)? {
            return Err(EngineError::DefinitionNotFound(*id));
        }
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        tracing::info!("Deleted workflow definition {}", id);
        Ok(())
    }

    pub fn record_started(&self, id: &DefinitionId) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.entry(*id).or_default().started += 1;
    }

    /// Count a terminal status; non-terminal statuses are ignored
    pub fn record_finished(&self, id: &DefinitionId, status: ExecutionStatus) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = counters.entry(*id).or_default();
        match status {
            ExecutionStatus::Completed => entry.completed += 1,
            ExecutionStatus::Failed => entry.failed += 1,
            ExecutionStatus::Cancelled => entry.cancelled += 1,
            ExecutionStatus::TimedOut => entry.timed_out += 1,
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Paused => {}
        }
    }

    pub fn counters(&self, id: &DefinitionId) -> ExecutionCounters {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or_default()
    }
}
