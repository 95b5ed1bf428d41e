use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::{Mutex, PoisonError};

/// Security-relevant events reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    DefinitionCreated,
    DefinitionUpdated,
    DefinitionDeleted,
    ExecutionStarted,
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCancelled,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionTimedOut,
    StepApproved,
    StepRejected,
    AccessDenied,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::DefinitionCreated => "definition_created",
            AuditAction::DefinitionUpdated => "definition_updated",
            AuditAction::DefinitionDeleted => "definition_deleted",
            AuditAction::ExecutionStarted => "execution_started",
            AuditAction::ExecutionPaused => "execution_paused",
            AuditAction::ExecutionResumed => "execution_resumed",
            AuditAction::ExecutionCancelled => "execution_cancelled",
            AuditAction::ExecutionCompleted => "execution_completed",
            AuditAction::ExecutionFailed => "execution_failed",
            AuditAction::ExecutionTimedOut => "execution_timed_out",
            AuditAction::StepApproved => "step_approved",
            AuditAction::StepRejected => "step_rejected",
            AuditAction::AccessDenied => "access_denied",
        }
    }
}

/// Receives audit events. Implementations must not block the caller for long.
pub trait AuditSink: Send + Sync {
    fn log(&self, tenant_id: &str, actor_id: &str, action: AuditAction, resource: &str, details: Value);
}

/// Discards every event
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn log(&self, _tenant_id: &str, _actor_id: &str, _action: AuditAction, _resource: &str, _details: Value) {}
}

/// Tamper-evident audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub actor_id: String,
    pub action: AuditAction,
    pub resource: String,
    pub details: Value,
    /// Hash of the previous entry
    pub previous_hash: Option<String>,
    /// Hash of this entry's content
    pub entry_hash: String,
}

impl AuditEntry {
    fn new(
        tenant_id: &str,
        actor_id: &str,
        action: AuditAction,
        resource: &str,
        details: Value,
        previous_hash: Option<String>,
    ) -> Self {
        let mut entry = Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tenant_id: tenant_id.to_string(),
            actor_id: actor_id.to_string(),
            action,
            resource: resource.to_string(),
            details,
            previous_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.calculate_hash();
        entry
    }

    fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update(self.id.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.tenant_id.as_bytes());
        hasher.update(self.actor_id.as_bytes());
        hasher.update(self.action.as_str().as_bytes());
        hasher.update(self.resource.as_bytes());
        hasher.update(self.details.to_string().as_bytes());
        if let Some(prev) = &self.previous_hash {
            hasher.update(prev.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Verify entry integrity
    pub fn verify_hash(&self) -> bool {
        self.calculate_hash() == self.entry_hash
    }
}

/// In-process audit sink that chains each entry to the hash of the one before it
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn entries_for_tenant(&self, tenant_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.action == action)
            .count()
    }

    /// Check every entry hash and every link of the chain
    pub fn verify_chain(&self) -> Result<(), Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut errors = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            if !entry.verify_hash() {
                errors.push(format!("Entry {} hash mismatch", entry.id));
            }

            let expected_prev = i.checked_sub(1).map(|p| entries[p].entry_hash.clone());
            if entry.previous_hash != expected_prev {
                errors.push(format!("Entry {} chain link broken", entry.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl AuditSink for InMemoryAuditLog {
    fn log(&self, tenant_id: &str, actor_id: &str, action: AuditAction, resource: &str, details: Value) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let previous_hash = entries.last().map(|e| e.entry_hash.clone());
        let entry = AuditEntry::new(tenant_id, actor_id, action, resource, details, previous_hash);

        tracing::info!(
            audit_id = %entry.id,
            action = entry.action.as_str(),
            resource = %entry.resource,
            "Audit event recorded"
        );

        entries.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_verifies() {
        let log = InMemoryAuditLog::new();
        log.log("acme", "alice", AuditAction::DefinitionCreated, "workflow:1", json!({}));
        log.log("acme", "bob", AuditAction::ExecutionStarted, "execution:1", json!({"input": 1}));
        log.log("globex", "eve", AuditAction::AccessDenied, "workflow:2", Value::Null);

        assert!(log.verify_chain().is_ok());
        assert_eq!(log.entries_for_tenant("acme").len(), 2);
        assert_eq!(log.count(AuditAction::AccessDenied), 1);

        let entries = log.entries();
        assert!(entries[0].previous_hash.is_none());
        assert_eq!(entries[1].previous_hash.as_ref(), Some(&entries[0].entry_hash));
    }

    #[test]
    fn test_tampering_is_detected() {
        let log = InMemoryAuditLog::new();
        log.log("acme", "alice", AuditAction::DefinitionCreated, "workflow:1", json!({}));
        log.log("acme", "alice", AuditAction::DefinitionDeleted, "workflow:1", json!({}));

        log.entries.lock().unwrap()[0].actor_id = "mallory".to_string();

        let errors = log.verify_chain().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("hash mismatch"));
    }
}
