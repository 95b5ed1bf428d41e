use super::{DefinitionRepository, ExecutionRepository};
use crate::types::{DefinitionId, ExecutionId, WorkflowDefinition, WorkflowExecution};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const DEFINITIONS_TABLE: JsonTable = TableDefinition::new("definitions");
const EXECUTIONS_TABLE: JsonTable = TableDefinition::new("executions");

/// Durable repository on an embedded redb file; records are stored as JSON
#[derive(Clone)]
pub struct RedbIndexStore {
    db: Arc<Database>,
}

impl RedbIndexStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _definitions = write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("Failed to open definitions table")?;
            let _executions = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put(&self, table_def: JsonTable, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(table_def)
                .context("Failed to open table")?;
            table.insert(key, value).context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_bytes(&self, table_def: JsonTable, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table_def).context("Failed to open table")?;
        let value = table.get(key).context("Failed to get record")?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn all_bytes(&self, table_def: JsonTable) -> Result<Vec<Vec<u8>>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table_def).context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            records.push(value.value().to_vec());
        }
        Ok(records)
    }
}

impl DefinitionRepository for RedbIndexStore {
    fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        let value = serde_json::to_vec(definition).context("Failed to serialize definition")?;
        self.put(DEFINITIONS_TABLE, &definition.id.to_string(), &value)
    }

    fn get_definition(&self, id: &DefinitionId) -> Result<Option<WorkflowDefinition>> {
        match self.get_bytes(DEFINITIONS_TABLE, &id.to_string())? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to deserialize definition")?,
            )),
            None => Ok(None),
        }
    }

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut definitions = self
            .all_bytes(DEFINITIONS_TABLE)?
            .iter()
            .map(|bytes| {
                serde_json::from_slice::<WorkflowDefinition>(bytes)
                    .context("Failed to deserialize definition")
            })
            .collect::<Result<Vec<_>>>()?;
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(definitions)
    }

    fn delete_definition(&self, id: &DefinitionId) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let removed = {
            let mut table = write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("Failed to open table")?;
            let key = id.to_string();
            let existed = table
                .remove(key.as_str())
                .context("Failed to delete definition")?
                .is_some();
            existed
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }
}

impl ExecutionRepository for RedbIndexStore {
    fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let value = serde_json::to_vec(execution).context("Failed to serialize execution")?;
        self.put(EXECUTIONS_TABLE, &execution.id.to_string(), &value)
    }

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        match self.get_bytes(EXECUTIONS_TABLE, &id.to_string())? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to deserialize execution")?,
            )),
            None => Ok(None),
        }
    }

    fn list_executions(&self) -> Result<Vec<WorkflowExecution>> {
        let mut executions = self
            .all_bytes(EXECUTIONS_TABLE)?
            .iter()
            .map(|bytes| {
                serde_json::from_slice::<WorkflowExecution>(bytes)
                    .context("Failed to deserialize execution")
            })
            .collect::<Result<Vec<_>>>()?;

        // Most recent first
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        Ok(executions)
    }
}
