use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Untyped key/value bag used for step configs, inputs, outputs and execution variables
pub type VariableMap = Map<String, Value>;

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionId(pub Uuid);

impl DefinitionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DefinitionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a step, unique within its definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a step performs; selects the handler that runs it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Approval,
    Notification,
    Integration,
    Decision,
    Delay,
    Webhook,
    Script,
    Form,
    Email,
    Sms,
    Slack,
    Database,
    FileUpload,
    ApiCall,
}

impl StepType {
    pub const ALL: [StepType; 15] = [
        StepType::Task,
        StepType::Approval,
        StepType::Notification,
        StepType::Integration,
        StepType::Decision,
        StepType::Delay,
        StepType::Webhook,
        StepType::Script,
        StepType::Form,
        StepType::Email,
        StepType::Sms,
        StepType::Slack,
        StepType::Database,
        StepType::FileUpload,
        StepType::ApiCall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Task => "task",
            StepType::Approval => "approval",
            StepType::Notification => "notification",
            StepType::Integration => "integration",
            StepType::Decision => "decision",
            StepType::Delay => "delay",
            StepType::Webhook => "webhook",
            StepType::Script => "script",
            StepType::Form => "form",
            StepType::Email => "email",
            StepType::Sms => "sms",
            StepType::Slack => "slack",
            StepType::Database => "database",
            StepType::FileUpload => "file_upload",
            StepType::ApiCall => "api_call",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied by a gating condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Regex,
}

/// How a condition combines with the result of the conditions before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// Predicate over an execution variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCondition {
    /// Variable path, dotted for nested objects (e.g. `customer.tier`)
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_operator: Option<LogicalOperator>,
}

impl WorkflowCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            logical_operator: None,
        }
    }

    pub fn or(mut self) -> Self {
        self.logical_operator = Some(LogicalOperator::Or);
        self
    }
}

/// Side effect fired on a step outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendNotification,
    SendEmail,
    SendSms,
    SendSlack,
    CallWebhook,
    CallApi,
    SetVariable,
    Log,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionType::SendNotification => "send_notification",
            ActionType::SendEmail => "send_email",
            ActionType::SendSms => "send_sms",
            ActionType::SendSlack => "send_slack",
            ActionType::CallWebhook => "call_webhook",
            ActionType::CallApi => "call_api",
            ActionType::SetVariable => "set_variable",
            ActionType::Log => "log",
        };
        f.write_str(name)
    }
}

/// An action attached to a step's success, failure or timeout outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub order: u32,
    #[serde(default)]
    pub config: VariableMap,
}

/// Retry policy for failing steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

/// One node of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub order: u32,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub is_parallel: bool,
    #[serde(default)]
    pub config: VariableMap,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,
    #[serde(default)]
    pub on_success: Vec<WorkflowAction>,
    #[serde(default)]
    pub on_failure: Vec<WorkflowAction>,
    #[serde(default)]
    pub on_timeout: Vec<WorkflowAction>,
    /// Handler deadline; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the definition-wide retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn default_true() -> bool {
    true
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: StepType, order: u32) -> Self {
        let id = StepId::new(id);
        Self {
            name: id.0.clone(),
            id,
            step_type,
            order,
            required: true,
            is_parallel: false,
            config: VariableMap::new(),
            depends_on: Vec::new(),
            conditions: Vec::new(),
            on_success: Vec::new(),
            on_failure: Vec::new(),
            on_timeout: Vec::new(),
            timeout_ms: None,
            retry: None,
        }
    }
}

/// How an execution may be started; recorded on the definition only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Schedule,
    Event,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub id: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub config: VariableMap,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Execution-wide settings of a definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Wall-clock budget measured from execution start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Maximum number of non-terminal executions of the definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,
    /// Approval steps wait for a human decision when set; otherwise they are auto-approved
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub rollback_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DefinitionMetadata {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Validated, stored workflow template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: u32,
    pub is_active: bool,
    pub steps: Vec<WorkflowStep>,
    pub triggers: Vec<WorkflowTrigger>,
    pub settings: ExecutionSettings,
    pub metadata: DefinitionMetadata,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied contents of a new definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionDraft {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub triggers: Vec<WorkflowTrigger>,
    #[serde(default)]
    pub settings: ExecutionSettings,
    #[serde(default)]
    pub metadata: DefinitionMetadata,
    #[serde(default)]
    pub created_by: String,
}

impl DefinitionDraft {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            name: name.into(),
            description: None,
            is_active: true,
            steps,
            triggers: Vec::new(),
            settings: ExecutionSettings::default(),
            metadata: DefinitionMetadata::default(),
            created_by: String::new(),
        }
    }
}

/// Partial update of a definition; absent fields keep their stored value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub steps: Option<Vec<WorkflowStep>>,
    #[serde(default)]
    pub triggers: Option<Vec<WorkflowTrigger>>,
    #[serde(default)]
    pub settings: Option<ExecutionSettings>,
    #[serde(default)]
    pub metadata: Option<DefinitionMetadata>,
}

/// Workflow-level execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::TimedOut
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Step-level execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
    WaitingForApproval,
    Approved,
    Rejected,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    /// Finished without blocking the workflow from completing
    pub fn is_finished_ok(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
            StepStatus::WaitingForApproval => "waiting_for_approval",
            StepStatus::Approved => "approved",
            StepStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Who started an execution and from where
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub user_id: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ExecutionContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            environment: "production".to_string(),
            request_id: None,
            source: None,
        }
    }
}

/// Human decision recorded on an approval step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub actor_id: String,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Runtime record of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepExecution {
    pub step_id: StepId,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub input: VariableMap,
    pub output: VariableMap,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalDecision>,
}

impl WorkflowStepExecution {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only entry in an execution's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl WorkflowExecutionLog {
    pub fn new(level: LogLevel, step_id: Option<StepId>, message: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            step_id,
            message: message.into(),
            data,
        }
    }
}

/// Copy of the definition parts an execution runs against, taken at start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSnapshot {
    pub name: String,
    pub version: u32,
    /// Sorted by ascending `order`; index-aligned with `WorkflowExecution::steps`
    pub steps: Vec<WorkflowStep>,
    pub settings: ExecutionSettings,
}

/// One run of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub definition_id: DefinitionId,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    /// 0-100
    pub progress: u8,
    pub input: VariableMap,
    pub output: VariableMap,
    pub variables: VariableMap,
    pub steps: Vec<WorkflowStepExecution>,
    pub logs: Vec<WorkflowExecutionLog>,
    pub context: ExecutionContext,
    pub snapshot: DefinitionSnapshot,
    pub started_at: DateTime<Utc>,
    pub run_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn step(&self, step_id: &StepId) -> Option<&WorkflowStepExecution> {
        self.steps.iter().find(|s| &s.step_id == step_id)
    }

    pub fn step_index(&self, step_id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.step_id == step_id)
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.completed_at.unwrap_or(now);
        (end - self.started_at).num_milliseconds()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    /// Recompute progress as finished (completed or skipped) steps over total steps
    pub fn refresh_progress(&mut self) {
        let total = self.steps.len();
        if total == 0 {
            self.progress = 100;
            return;
        }
        let finished = self
            .steps
            .iter()
            .filter(|s| s.status.is_finished_ok())
            .count();
        self.progress = ((finished * 100) / total) as u8;
    }

    pub fn push_log(
        &mut self,
        level: LogLevel,
        step_id: Option<&StepId>,
        message: impl Into<String>,
        data: Value,
    ) {
        self.logs
            .push(WorkflowExecutionLog::new(level, step_id.cloned(), message, data));
    }
}
