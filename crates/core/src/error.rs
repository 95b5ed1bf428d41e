use crate::types::{DefinitionId, ExecutionId, StepId};

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the workflow engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The definition was rejected before storage
    #[error("invalid workflow definition: {message}")]
    Validation {
        step: Option<StepId>,
        message: String,
    },

    #[error("user {user_id} may not execute workflows in tenant {tenant_id}")]
    PermissionDenied { tenant_id: String, user_id: String },

    #[error("workflow definition {0} not found")]
    DefinitionNotFound(DefinitionId),

    #[error("workflow definition {0} is not active")]
    DefinitionInactive(DefinitionId),

    #[error("workflow definition {id} still has {active} active execution(s)")]
    DefinitionInUse { id: DefinitionId, active: usize },

    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("step {step_id} not found in execution {execution_id}")]
    StepNotFound {
        execution_id: ExecutionId,
        step_id: StepId,
    },

    /// Scheduler signal; never returned to API callers
    #[error("dependencies of step {0} are not met")]
    DependencyNotMet(StepId),

    #[error("unsupported step type: {0}")]
    UnsupportedStepType(String),

    #[error("step {step_id} failed: {message}")]
    StepExecution { step_id: StepId, message: String },

    #[error("execution exceeded its maximum duration of {max_duration_ms}ms")]
    ExecutionTimeout { max_duration_ms: u64 },

    #[error("cannot {action} while {subject} is {state}")]
    InvalidStateTransition {
        subject: String,
        state: String,
        action: &'static str,
    },

    #[error("concurrency limit of {limit} reached for workflow definition {id}")]
    ConcurrencyLimitReached { id: DefinitionId, limit: u32 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            step: None,
            message: message.into(),
        }
    }

    pub fn validation_at(step: &StepId, message: impl Into<String>) -> Self {
        Self::Validation {
            step: Some(step.clone()),
            message: message.into(),
        }
    }

    pub fn invalid_transition(
        subject: impl std::fmt::Display,
        state: impl std::fmt::Display,
        action: &'static str,
    ) -> Self {
        Self::InvalidStateTransition {
            subject: subject.to_string(),
            state: state.to_string(),
            action,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", err))
    }
}
