use super::actions::{ActionDispatcher, ActionTrigger};
use super::condition::evaluate_all;
use super::queue::ExecutionQueue;
use super::registry::{DefinitionRegistry, ExecutionCounters};
use super::step_executor::{StepHandler, StepHandlerRegistry, StepRequest};
use super::template::render_map;
use crate::analytics::{self, AnalyticsPeriod, WorkflowAnalytics};
use crate::audit::{AuditAction, AuditSink, NoopAuditSink};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::rbac::{AccessChecker, AllowAll};
use crate::side_effects::SideEffects;
use crate::storage::{
    DefinitionRepository, ExecutionFilter, ExecutionRepository, ExecutionStore, InMemoryStore,
};
use crate::types::{
    ApprovalDecision, DefinitionDraft, DefinitionId, DefinitionPatch, DefinitionSnapshot,
    ExecutionContext, ExecutionId, ExecutionSettings, ExecutionStatus, LogLevel, StepId,
    StepStatus, StepType, VariableMap, WorkflowDefinition, WorkflowExecution, WorkflowStep,
    WorkflowStepExecution,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Actor recorded on automatic decisions
pub const SYSTEM_ACTOR: &str = "system";

/// Result of driving one step as far as it can go in the current pass
#[derive(Debug, Clone, PartialEq)]
enum StepOutcome {
    Completed,
    Skipped,
    AwaitingApproval,
    Failed { abort: bool, error: String },
    /// The execution left the running state; the pass must stop
    Interrupted,
    DeadlineExceeded,
}

enum Readiness {
    Ready,
    Blocked,
    Unsatisfiable(StepId, StepStatus),
}

/// How a pass ended when it did not finalize the execution
enum PassEnd {
    Stopped,
    Requeue,
    Waiting,
    Stalled(Vec<StepId>),
}

/// Builder for [`WorkflowEngine`]; every collaborator has a permissive default
pub struct EngineBuilder {
    config: EngineConfig,
    definitions: Option<Arc<dyn DefinitionRepository>>,
    executions: Option<Arc<dyn ExecutionRepository>>,
    access: Arc<dyn AccessChecker>,
    audit: Arc<dyn AuditSink>,
    effects: SideEffects,
    handlers: Vec<(StepType, Arc<dyn StepHandler>)>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            definitions: None,
            executions: None,
            access: Arc::new(AllowAll),
            audit: Arc::new(NoopAuditSink),
            effects: SideEffects::simulated(),
            handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn access_checker(mut self, access: Arc<dyn AccessChecker>) -> Self {
        self.access = access;
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn side_effects(mut self, effects: SideEffects) -> Self {
        self.effects = effects;
        self
    }

    /// Replace the built-in handler for a step type
    pub fn handler(mut self, step_type: StepType, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.push((step_type, handler));
        self
    }

    pub fn definition_repository(mut self, repo: Arc<dyn DefinitionRepository>) -> Self {
        self.definitions = Some(repo);
        self
    }

    pub fn execution_repository(mut self, repo: Arc<dyn ExecutionRepository>) -> Self {
        self.executions = Some(repo);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let memory = Arc::new(InMemoryStore::new());
        let definitions = self.definitions.unwrap_or_else(|| memory.clone());
        let executions = self.executions.unwrap_or(memory);

        let mut handlers = StepHandlerRegistry::with_builtin_handlers(&self.effects);
        for (step_type, handler) in self.handlers {
            handlers.register(step_type, handler);
        }

        let store = Arc::new(ExecutionStore::new(executions));

        WorkflowEngine {
            config: self.config,
            registry: Arc::new(DefinitionRegistry::new(definitions)),
            dispatcher: ActionDispatcher::new(self.effects, store.clone()),
            store,
            handlers: Arc::new(handlers),
            access: self.access,
            audit: self.audit,
            queue: Arc::new(ExecutionQueue::new()),
            worker: tokio::sync::Mutex::new(()),
            admission: Mutex::new(()),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Definition registry, execution store and the single queue processor behind them
pub struct WorkflowEngine {
    config: EngineConfig,
    registry: Arc<DefinitionRegistry>,
    store: Arc<ExecutionStore>,
    handlers: Arc<StepHandlerRegistry>,
    dispatcher: ActionDispatcher,
    access: Arc<dyn AccessChecker>,
    audit: Arc<dyn AuditSink>,
    queue: Arc<ExecutionQueue>,
    // held for the duration of a pass so only one processor advances state
    worker: tokio::sync::Mutex<()>,
    // serializes admission checks with the insert, and the in-use check with a delete
    admission: Mutex<()>,
}

impl WorkflowEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of executions waiting for a processing pass
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Validate and store a new definition
    pub fn create_definition(&self, draft: DefinitionDraft) -> EngineResult<WorkflowDefinition> {
        let definition = self.registry.register(draft)?;
        self.audit.log(
            &definition.tenant_id,
            &definition.created_by,
            AuditAction::DefinitionCreated,
            &format!("workflow:{}", definition.id),
            json!({ "name": definition.name, "version": definition.version }),
        );
        Ok(definition)
    }

    pub fn get_definition(&self, id: &DefinitionId) -> EngineResult<Option<WorkflowDefinition>> {
        self.registry.get(id)
    }

    pub fn list_definitions(&self, tenant_id: Option<&str>) -> EngineResult<Vec<WorkflowDefinition>> {
        self.registry.list(tenant_id)
    }

    /// Update a definition; running executions keep the steps they were started with
    pub fn update_definition(
        &self,
        id: &DefinitionId,
        patch: DefinitionPatch,
        actor_id: &str,
    ) -> EngineResult<WorkflowDefinition> {
        let definition = self.registry.update(id, patch)?;
        self.audit.log(
            &definition.tenant_id,
            actor_id,
            AuditAction::DefinitionUpdated,
            &format!("workflow:{}", definition.id),
            json!({ "version": definition.version }),
        );
        Ok(definition)
    }

    /// Delete a definition that has no active executions
    pub fn delete_definition(&self, id: &DefinitionId, actor_id: &str) -> EngineResult<()> {
        let definition = self.registry.require(id)?;

        {
            let _guard = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
            let active = self.store.count_active(id)?;
            if active > 0 {
                return Err(EngineError::DefinitionInUse { id: *id, active });
            }
            self.registry.delete(id)?;
        }
        self.audit.log(
            &definition.tenant_id,
            actor_id,
            AuditAction::DefinitionDeleted,
            &format!("workflow:{}", id),
            json!({ "name": definition.name }),
        );
        Ok(())
    }

    pub fn counters(&self, id: &DefinitionId) -> ExecutionCounters {
        self.registry.counters(id)
    }

    /// Create a pending execution of an active definition and queue it
    pub fn start(
        &self,
        definition_id: &DefinitionId,
        input: VariableMap,
        context: ExecutionContext,
    ) -> EngineResult<WorkflowExecution> {
        let definition = self.registry.require(definition_id)?;
        if !definition.is_active {
            return Err(EngineError::DefinitionInactive(*definition_id));
        }

        if !self
            .access
            .can_execute(&definition.tenant_id, &context.user_id, "workflows", "execute")
        {
            tracing::warn!(
                "User {} denied execution of workflow {} in tenant {}",
                context.user_id,
                definition_id,
                definition.tenant_id
            );
            self.audit.log(
                &definition.tenant_id,
                &context.user_id,
                AuditAction::AccessDenied,
                &format!("workflow:{}", definition_id),
                json!({ "action": "execute" }),
            );
            return Err(EngineError::PermissionDenied {
                tenant_id: definition.tenant_id,
                user_id: context.user_id,
            });
        }

        let mut steps = definition.steps.clone();
        steps.sort_by_key(|s| s.order);

        let now = Utc::now();
        let mut execution = WorkflowExecution {
            id: ExecutionId::new(),
            definition_id: definition.id,
            tenant_id: definition.tenant_id.clone(),
            status: ExecutionStatus::Pending,
            progress: 0,
            variables: input.clone(),
            input,
            output: VariableMap::new(),
            steps: steps
                .iter()
                .map(|step| WorkflowStepExecution {
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    step_type: step.step_type,
                    status: StepStatus::Pending,
                    input: VariableMap::new(),
                    output: VariableMap::new(),
                    retry_count: 0,
                    max_retries: self.max_retries(step, &definition.settings),
                    started_at: None,
                    completed_at: None,
                    error: None,
                    approval: None,
                })
                .collect(),
            logs: Vec::new(),
            context,
            snapshot: DefinitionSnapshot {
                name: definition.name.clone(),
                version: definition.version,
                steps,
                settings: definition.settings.clone(),
            },
            started_at: now,
            run_started_at: None,
            completed_at: None,
            error: None,
        };
        execution.push_log(
            LogLevel::Info,
            None,
            format!("Execution created from {} v{}", definition.name, definition.version),
            json!({ "user_id": execution.context.user_id }),
        );

        {
            let _guard = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
            // a delete may have won the race since the lookup above
            self.registry.require(definition_id)?;
            if let Some(limit) = definition.settings.concurrency_limit {
                if self.store.count_active(definition_id)? >= limit as usize {
                    return Err(EngineError::ConcurrencyLimitReached {
                        id: *definition_id,
                        limit,
                    });
                }
            }
            self.store.insert(&execution)?;
        }

        self.registry.record_started(definition_id);
        self.audit.log(
            &execution.tenant_id,
            &execution.context.user_id,
            AuditAction::ExecutionStarted,
            &format!("execution:{}", execution.id),
            json!({ "definition_id": definition_id }),
        );
        self.queue.push(execution.id);

        tracing::info!(
            "Queued execution {} of workflow {} ({} steps)",
            execution.id,
            definition.name,
            execution.steps.len()
        );
        Ok(execution)
    }

    pub fn get_execution(&self, id: &ExecutionId) -> EngineResult<WorkflowExecution> {
        self.store.get(id)
    }

    pub fn list_executions(&self, filter: &ExecutionFilter) -> EngineResult<Vec<WorkflowExecution>> {
        self.store.list(filter)
    }

    /// Stop a running execution at its next step boundary
    pub fn pause(&self, id: &ExecutionId, actor_id: &str) -> EngineResult<WorkflowExecution> {
        let execution = self.store.modify(id, |e| {
            if e.status != ExecutionStatus::Running {
                return Err(EngineError::invalid_transition(
                    format!("execution {}", e.id),
                    e.status,
                    "pause",
                ));
            }
            e.status = ExecutionStatus::Paused;
            e.push_log(LogLevel::Info, None, format!("Execution paused by {}", actor_id), Value::Null);
            Ok(e.clone())
        })?;

        tracing::info!("Paused execution {}", id);
        self.audit.log(
            &execution.tenant_id,
            actor_id,
            AuditAction::ExecutionPaused,
            &format!("execution:{}", id),
            Value::Null,
        );
        Ok(execution)
    }

    pub fn resume(&self, id: &ExecutionId, actor_id: &str) -> EngineResult<WorkflowExecution> {
        let execution = self.store.modify(id, |e| {
            if e.status != ExecutionStatus::Paused {
                return Err(EngineError::invalid_transition(
                    format!("execution {}", e.id),
                    e.status,
                    "resume",
                ));
            }
            e.status = ExecutionStatus::Running;
            e.push_log(LogLevel::Info, None, format!("Execution resumed by {}", actor_id), Value::Null);
            Ok(e.clone())
        })?;

        tracing::info!("Resumed execution {}", id);
        self.audit.log(
            &execution.tenant_id,
            actor_id,
            AuditAction::ExecutionResumed,
            &format!("execution:{}", id),
            Value::Null,
        );
        self.queue.push(*id);
        Ok(execution)
    }

    /// Cancel a non-terminal execution. A handler already in flight finishes but its result is dropped.
    pub fn cancel(&self, id: &ExecutionId, actor_id: &str) -> EngineResult<WorkflowExecution> {
        self.finalize(
            id,
            ExecutionStatus::Cancelled,
            Some(format!("cancelled by {}", actor_id)),
            actor_id,
        )
    }

    pub fn approve_step(
        &self,
        id: &ExecutionId,
        step_id: &StepId,
        actor_id: &str,
        comment: Option<String>,
    ) -> EngineResult<WorkflowExecution> {
        self.decide(id, step_id, actor_id, comment, true)
    }

    pub fn reject_step(
        &self,
        id: &ExecutionId,
        step_id: &StepId,
        actor_id: &str,
        comment: Option<String>,
    ) -> EngineResult<WorkflowExecution> {
        self.decide(id, step_id, actor_id, comment, false)
    }

    fn decide(
        &self,
        id: &ExecutionId,
        step_id: &StepId,
        actor_id: &str,
        comment: Option<String>,
        approved: bool,
    ) -> EngineResult<WorkflowExecution> {
        let verb = if approved { "approve" } else { "reject" };

        let execution = self.store.modify(id, |e| {
            if e.status.is_terminal() {
                return Err(EngineError::invalid_transition(
                    format!("execution {}", e.id),
                    e.status,
                    verb,
                ));
            }
            {
                let step = step_mut(e, step_id)?;
                if step.status != StepStatus::WaitingForApproval {
                    return Err(EngineError::invalid_transition(
                        format!("step {}", step_id),
                        step.status,
                        verb,
                    ));
                }
                step.status = if approved {
                    StepStatus::Approved
                } else {
                    StepStatus::Rejected
                };
                step.approval = Some(ApprovalDecision {
                    approved,
                    actor_id: actor_id.to_string(),
                    comment: comment.clone(),
                    decided_at: Utc::now(),
                });
            }
            e.push_log(
                LogLevel::Info,
                Some(step_id),
                format!("Step {}d by {}", verb, actor_id),
                json!({ "comment": comment }),
            );
            Ok(e.clone())
        })?;

        tracing::info!("Step {} of execution {} {}d by {}", step_id, id, verb, actor_id);
        self.audit.log(
            &execution.tenant_id,
            actor_id,
            if approved {
                AuditAction::StepApproved
            } else {
                AuditAction::StepRejected
            },
            &format!("execution:{}/step:{}", id, step_id),
            json!({ "comment": comment }),
        );

        if execution.status == ExecutionStatus::Running {
            self.queue.push(*id);
        }
        Ok(execution)
    }

    /// Aggregate a definition's executions; definitions of other tenants are reported as missing
    pub fn get_analytics(
        &self,
        definition_id: &DefinitionId,
        tenant_id: &str,
        period: AnalyticsPeriod,
    ) -> EngineResult<WorkflowAnalytics> {
        let definition = self.registry.require(definition_id)?;
        if definition.tenant_id != tenant_id {
            return Err(EngineError::DefinitionNotFound(*definition_id));
        }
        let executions = self.store.list(&ExecutionFilter::for_definition(*definition_id))?;
        Ok(analytics::aggregate(
            definition.id,
            &definition.tenant_id,
            &executions,
            period,
            Utc::now(),
        ))
    }

    /// Run one pass over the next queued execution. Returns false if the queue was empty.
    pub async fn process_next(&self) -> bool {
        let _worker = self.worker.lock().await;
        let Some(id) = self.queue.pop() else {
            return false;
        };

        if let Err(e) = self.process(&id).await {
            tracing::error!("Processing pass for execution {} failed: {}", id, e);
        }
        true
    }

    /// Process until the queue is empty. Executions waiting on a timer are not awaited.
    pub async fn run_until_idle(&self) {
        while self.process_next().await {}
    }

    /// Queue executions left pending or running by a previous process; paused ones stay parked
    pub fn recover(&self) -> EngineResult<usize> {
        let executions = self.store.list(&ExecutionFilter::default())?;
        let mut recovered = 0;
        // listed newest first
        for execution in executions.iter().rev() {
            if matches!(execution.status, ExecutionStatus::Pending | ExecutionStatus::Running) {
                self.queue.push(execution.id);
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!("Recovered {} unfinished execution(s)", recovered);
        }
        Ok(recovered)
    }

    /// Start the background processor loop
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Workflow processor started");
            loop {
                engine.run_until_idle().await;
                engine.queue.notified().await;
            }
        })
    }

    async fn process(&self, id: &ExecutionId) -> EngineResult<()> {
        let execution = self.store.get(id)?;
        match execution.status {
            ExecutionStatus::Pending => {
                let started = self.store.modify_active(id, "start", |e| {
                    e.status = ExecutionStatus::Running;
                    e.run_started_at = Some(Utc::now());
                    e.push_log(LogLevel::Info, None, "Execution started", Value::Null);
                    Ok(())
                });
                if refused_as_finished(&started) {
                    tracing::debug!("Execution {} finished before it started", id);
                    return Ok(());
                }
                started?;
                tracing::info!("Execution {} started", id);
            }
            ExecutionStatus::Running => {}
            status => {
                tracing::debug!("Dropping queued execution {} in state {}", id, status);
                return Ok(());
            }
        }

        if let Some(max) = deadline_exceeded(&execution) {
            self.time_out(id, max)?;
            return Ok(());
        }

        // nothing is in flight between passes; a step left in progress was interrupted
        let reset = self.store.modify_active(id, "resume", |e| {
            let stale: Vec<StepId> = e
                .steps
                .iter_mut()
                .filter(|s| s.status == StepStatus::InProgress)
                .map(|s| {
                    s.status = StepStatus::Pending;
                    s.step_id.clone()
                })
                .collect();
            for step_id in &stale {
                e.push_log(LogLevel::Warn, Some(step_id), "Restarting interrupted step", Value::Null);
            }
            Ok(())
        });
        if refused_as_finished(&reset) {
            return Ok(());
        }
        reset?;

        tracing::debug!("Processing pass for execution {}", id);
        let end = self.run_pass(id, &execution.snapshot).await?;

        match end {
            PassEnd::Stopped => {}
            PassEnd::Requeue => {
                self.queue.push(*id);
            }
            PassEnd::Waiting => {
                if let Some(delay) = remaining_budget(&self.store.get(id)?) {
                    self.wake_after(*id, delay);
                }
            }
            PassEnd::Stalled(blocked) => {
                let execution = self.store.get(id)?;
                if execution.snapshot.settings.max_duration_ms.is_some() {
                    tracing::debug!("Execution {} is blocked; re-checking later", id);
                    self.wake_after(*id, self.config.poll_interval());
                } else {
                    for step_id in &blocked {
                        let deps = execution
                            .snapshot
                            .steps
                            .iter()
                            .find(|s| &s.id == step_id)
                            .map(|s| s.depends_on.clone())
                            .unwrap_or_default();
                        self.store.log(
                            id,
                            LogLevel::Error,
                            Some(step_id),
                            EngineError::DependencyNotMet(step_id.clone()).to_string(),
                            json!({ "depends_on": deps }),
                        );
                    }
                    let names: Vec<&str> = blocked.iter().map(StepId::as_str).collect();
                    self.fail_execution(
                        id,
                        format!("no step can make progress; blocked: {}", names.join(", ")),
                    )
                    .await?;
                }
            }
        }

        Ok(())
    }

    async fn run_pass(&self, id: &ExecutionId, snapshot: &DefinitionSnapshot) -> EngineResult<PassEnd> {
        let settings = &snapshot.settings;
        let mut progressed = false;
        let mut batch: Vec<&WorkflowStep> = Vec::new();

        for step in &snapshot.steps {
            let current = self.store.get(id)?;
            if current.status != ExecutionStatus::Running {
                return Ok(PassEnd::Stopped);
            }
            let Some(state) = current.step(&step.id) else {
                continue;
            };

            let outcome = match state.status {
                StepStatus::Approved | StepStatus::Rejected => {
                    if let Some(end) = self.flush(id, &mut batch, settings, &mut progressed).await? {
                        return Ok(end);
                    }
                    let outcome = self.resolve_decision(id, step, settings).await;
                    self.discard_if_finished(id, step, outcome)?
                }
                StepStatus::Pending => match readiness(&current, step) {
                    Readiness::Blocked => continue,
                    Readiness::Unsatisfiable(dep, status) => {
                        let outcome = self.skip_step(id, step, &format!("dependency {} {}", dep, status));
                        self.discard_if_finished(id, step, outcome)?
                    }
                    Readiness::Ready if step.is_parallel => {
                        batch.push(step);
                        continue;
                    }
                    Readiness::Ready => {
                        if let Some(end) = self.flush(id, &mut batch, settings, &mut progressed).await? {
                            return Ok(end);
                        }
                        self.run_step(id, step, settings).await?
                    }
                },
                _ => continue,
            };

            if let Some(end) = self.apply_outcome(id, outcome, &mut progressed).await? {
                return Ok(end);
            }
        }

        if let Some(end) = self.flush(id, &mut batch, settings, &mut progressed).await? {
            return Ok(end);
        }

        let execution = self.store.get(id)?;
        if execution.status != ExecutionStatus::Running {
            return Ok(PassEnd::Stopped);
        }

        if execution.steps.iter().all(|s| s.status.is_terminal()) {
            let finished = self.finalize(id, ExecutionStatus::Completed, None, &execution.context.user_id);
            if !refused_as_finished(&finished) {
                finished?;
            }
            return Ok(PassEnd::Stopped);
        }

        if progressed {
            return Ok(PassEnd::Requeue);
        }

        let waiting = execution.steps.iter().any(|s| {
            matches!(
                s.status,
                StepStatus::WaitingForApproval | StepStatus::Approved | StepStatus::Rejected
            )
        });
        if waiting {
            return Ok(PassEnd::Waiting);
        }

        Ok(PassEnd::Stalled(
            execution
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .map(|s| s.step_id.clone())
                .collect(),
        ))
    }

    /// Run the collected parallel steps concurrently
    async fn flush(
        &self,
        id: &ExecutionId,
        batch: &mut Vec<&WorkflowStep>,
        settings: &ExecutionSettings,
        progressed: &mut bool,
    ) -> EngineResult<Option<PassEnd>> {
        if batch.is_empty() {
            return Ok(None);
        }
        let steps = std::mem::take(batch);
        tracing::debug!("Running {} parallel step(s) of execution {}", steps.len(), id);

        let outcomes =
            futures::future::join_all(steps.iter().map(|step| self.run_step(id, step, settings))).await;

        let mut end = None;
        for outcome in outcomes {
            if end.is_none() {
                end = self.apply_outcome(id, outcome?, progressed).await?;
            }
        }
        Ok(end)
    }

    async fn apply_outcome(
        &self,
        id: &ExecutionId,
        outcome: StepOutcome,
        progressed: &mut bool,
    ) -> EngineResult<Option<PassEnd>> {
        match outcome {
            StepOutcome::Completed
            | StepOutcome::Skipped
            | StepOutcome::AwaitingApproval
            | StepOutcome::Failed { abort: false, .. } => {
                *progressed = true;
                Ok(None)
            }
            StepOutcome::Failed { abort: true, error } => {
                let failed = self.fail_execution(id, error).await;
                if !refused_as_finished(&failed) {
                    failed?;
                }
                Ok(Some(PassEnd::Stopped))
            }
            StepOutcome::DeadlineExceeded => {
                let execution = self.store.get(id)?;
                if !execution.status.is_terminal() {
                    let max = execution.snapshot.settings.max_duration_ms.unwrap_or_default();
                    self.time_out(id, max)?;
                }
                Ok(Some(PassEnd::Stopped))
            }
            StepOutcome::Interrupted => Ok(Some(PassEnd::Stopped)),
        }
    }

    async fn run_step(
        &self,
        id: &ExecutionId,
        step: &WorkflowStep,
        settings: &ExecutionSettings,
    ) -> EngineResult<StepOutcome> {
        let outcome = self.attempt_step(id, step, settings).await;
        self.discard_if_finished(id, step, outcome)
    }

    /// A step write refused because the execution reached a terminal state
    /// mid-step becomes `Interrupted`; the finished record is left as it is.
    fn discard_if_finished(
        &self,
        id: &ExecutionId,
        step: &WorkflowStep,
        outcome: EngineResult<StepOutcome>,
    ) -> EngineResult<StepOutcome> {
        match outcome {
            Err(EngineError::InvalidStateTransition { state, .. }) => {
                self.store.log(
                    id,
                    LogLevel::Warn,
                    Some(&step.id),
                    format!("Discarded result of step {}: execution is {}", step.id, state),
                    Value::Null,
                );
                tracing::warn!(
                    "Discarded result of step {} of execution {}: execution is {}",
                    step.id,
                    id,
                    state
                );
                Ok(StepOutcome::Interrupted)
            }
            outcome => outcome,
        }
    }

    async fn attempt_step(
        &self,
        id: &ExecutionId,
        step: &WorkflowStep,
        settings: &ExecutionSettings,
    ) -> EngineResult<StepOutcome> {
        let execution = self.store.get(id)?;
        if execution.status != ExecutionStatus::Running {
            return Ok(StepOutcome::Interrupted);
        }

        if !evaluate_all(&step.conditions, &execution.variables) {
            return self.skip_step(id, step, "conditions not met");
        }

        let max_retries = self.max_retries(step, settings);
        let (backoff_ms, multiplier) = self.backoff(step, settings);

        loop {
            let execution = self.store.get(id)?;
            if execution.status != ExecutionStatus::Running {
                return Ok(StepOutcome::Interrupted);
            }

            let timeout = match self.step_timeout(step, &execution) {
                Some(t) => t,
                None => return Ok(StepOutcome::DeadlineExceeded),
            };

            let config = render_map(&step.config, &execution.variables);
            let attempt = self.store.modify_active(id, "start step", |e| {
                let attempt = {
                    let state = step_mut(e, &step.id)?;
                    state.status = StepStatus::InProgress;
                    state.input = config.clone();
                    state.max_retries = max_retries;
                    state.started_at.get_or_insert_with(Utc::now);
                    state.retry_count + 1
                };
                e.push_log(
                    LogLevel::Info,
                    Some(&step.id),
                    format!("Step {} started (attempt {})", step.name, attempt),
                    json!({ "type": step.step_type }),
                );
                Ok(attempt)
            })?;
            tracing::info!("Executing step {} of execution {} (attempt {})", step.id, id, attempt);

            let request = StepRequest {
                step_id: &step.id,
                step_type: step.step_type,
                config: &config,
                input: &execution.input,
                variables: &execution.variables,
            };
            let result = tokio::time::timeout(timeout, self.handlers.execute(&request)).await;

            let after = self.store.get(id)?;
            if after.status.is_terminal() {
                return Err(EngineError::invalid_transition(
                    format!("execution {}", id),
                    after.status,
                    "record step result",
                ));
            }

            match result {
                Ok(Ok(output)) if step.step_type == StepType::Approval => {
                    return self.request_approval(id, step, settings, output).await;
                }
                Ok(Ok(output)) => {
                    self.complete_step(id, step, output).await?;
                    return Ok(StepOutcome::Completed);
                }
                Ok(Err(e)) => {
                    let retryable = !matches!(e, EngineError::UnsupportedStepType(_));
                    let retry_count = after.step(&step.id).map_or(0, |s| s.retry_count);

                    if retryable && retry_count < max_retries {
                        let retry = retry_count + 1;
                        let message = e.to_string();
                        self.store.modify_active(id, "retry step", |ex| {
                            {
                                let state = step_mut(ex, &step.id)?;
                                state.status = StepStatus::Pending;
                                state.retry_count = retry;
                                state.error = Some(message.clone());
                            }
                            ex.push_log(
                                LogLevel::Warn,
                                Some(&step.id),
                                format!("Step failed, retrying ({}/{}): {}", retry, max_retries, message),
                                json!({ "retry_count": retry }),
                            );
                            Ok(())
                        })?;
                        tracing::warn!(
                            "Step {} of execution {} failed, retry {}/{}: {}",
                            step.id,
                            id,
                            retry,
                            max_retries,
                            e
                        );

                        let delay = self.config.backoff_for(backoff_ms, multiplier, retry);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        continue;
                    }

                    return self
                        .fail_step(id, step, settings, e.to_string(), ActionTrigger::Failure)
                        .await;
                }
                Err(_) => {
                    let error = EngineError::StepExecution {
                        step_id: step.id.clone(),
                        message: format!("timed out after {}ms", timeout.as_millis()),
                    }
                    .to_string();
                    let outcome = self
                        .fail_step(id, step, settings, error, ActionTrigger::Timeout)
                        .await?;

                    if deadline_exceeded(&self.store.get(id)?).is_some() {
                        return Ok(StepOutcome::DeadlineExceeded);
                    }
                    return Ok(outcome);
                }
            }
        }
    }

    async fn request_approval(
        &self,
        id: &ExecutionId,
        step: &WorkflowStep,
        settings: &ExecutionSettings,
        output: VariableMap,
    ) -> EngineResult<StepOutcome> {
        if !settings.require_approval {
            self.store.modify_active(id, "approve step", |e| {
                let state = step_mut(e, &step.id)?;
                state.approval = Some(ApprovalDecision {
                    approved: true,
                    actor_id: SYSTEM_ACTOR.to_string(),
                    comment: Some("auto-approved".to_string()),
                    decided_at: Utc::now(),
                });
                Ok(())
            })?;
            let mut output = output;
            output.insert("approved".to_string(), json!(true));
            output.insert("approved_by".to_string(), json!(SYSTEM_ACTOR));
            self.complete_step(id, step, output).await?;
            return Ok(StepOutcome::Completed);
        }

        self.store.modify_active(id, "wait for approval", |e| {
            {
                let state = step_mut(e, &step.id)?;
                state.status = StepStatus::WaitingForApproval;
                state.output = output;
            }
            e.push_log(LogLevel::Info, Some(&step.id), "Waiting for approval", Value::Null);
            Ok(())
        })?;
        tracing::info!("Step {} of execution {} is waiting for approval", step.id, id);
        Ok(StepOutcome::AwaitingApproval)
    }

    /// Turn a recorded approve/reject decision into a final step state
    async fn resolve_decision(
        &self,
        id: &ExecutionId,
        step: &WorkflowStep,
        settings: &ExecutionSettings,
    ) -> EngineResult<StepOutcome> {
        let execution = self.store.get(id)?;
        let Some(state) = execution.step(&step.id) else {
            return Err(EngineError::StepNotFound {
                execution_id: *id,
                step_id: step.id.clone(),
            });
        };
        let (actor, comment) = state
            .approval
            .as_ref()
            .map(|d| (d.actor_id.clone(), d.comment.clone()))
            .unwrap_or_else(|| (SYSTEM_ACTOR.to_string(), None));

        if state.status == StepStatus::Approved {
            let mut output = state.output.clone();
            output.insert("approved".to_string(), json!(true));
            output.insert("approved_by".to_string(), json!(actor));
            if let Some(comment) = comment {
                output.insert("comment".to_string(), json!(comment));
            }
            self.complete_step(id, step, output).await?;
            return Ok(StepOutcome::Completed);
        }

        let error = match comment {
            Some(comment) => format!("rejected by {}: {}", actor, comment),
            None => format!("rejected by {}", actor),
        };
        self.fail_step(id, step, settings, error, ActionTrigger::Failure).await
    }

    async fn complete_step(&self, id: &ExecutionId, step: &WorkflowStep, output: VariableMap) -> EngineResult<()> {
        self.store.modify_active(id, "complete step", |e| {
            {
                let state = step_mut(e, &step.id)?;
                state.status = StepStatus::Completed;
                state.output = output.clone();
                state.completed_at = Some(Utc::now());
                state.error = None;
            }

            for (key, value) in &output {
                e.variables.insert(key.clone(), value.clone());
            }
            let steps = e
                .variables
                .entry("steps")
                .or_insert_with(|| Value::Object(VariableMap::new()));
            if !steps.is_object() {
                *steps = Value::Object(VariableMap::new());
            }
            if let Value::Object(map) = steps {
                map.insert(step.id.to_string(), Value::Object(output.clone()));
            }

            e.refresh_progress();
            e.push_log(
                LogLevel::Info,
                Some(&step.id),
                format!("Step {} completed", step.name),
                Value::Object(output.clone()),
            );
            Ok(())
        })?;
        tracing::info!("Step {} of execution {} completed", step.id, id);

        self.dispatcher
            .dispatch(ActionTrigger::Success, &step.on_success, id, &step.id, &output)
            .await;
        Ok(())
    }

    fn skip_step(&self, id: &ExecutionId, step: &WorkflowStep, reason: &str) -> EngineResult<StepOutcome> {
        self.store.modify_active(id, "skip step", |e| {
            {
                let state = step_mut(e, &step.id)?;
                state.status = StepStatus::Skipped;
                state.completed_at = Some(Utc::now());
            }
            e.refresh_progress();
            e.push_log(
                LogLevel::Info,
                Some(&step.id),
                format!("Step {} skipped: {}", step.name, reason),
                Value::Null,
            );
            Ok(())
        })?;
        tracing::info!("Skipped step {} of execution {}: {}", step.id, id, reason);
        Ok(StepOutcome::Skipped)
    }

    /// Mark a step terminally failed and run its failure or timeout actions once
    async fn fail_step(
        &self,
        id: &ExecutionId,
        step: &WorkflowStep,
        settings: &ExecutionSettings,
        error: String,
        trigger: ActionTrigger,
    ) -> EngineResult<StepOutcome> {
        self.store.modify_active(id, "fail step", |e| {
            {
                let state = step_mut(e, &step.id)?;
                state.status = StepStatus::Failed;
                state.completed_at = Some(Utc::now());
                state.error = Some(error.clone());
            }
            e.push_log(
                LogLevel::Error,
                Some(&step.id),
                format!("Step {} failed: {}", step.name, error),
                Value::Null,
            );
            Ok(())
        })?;
        tracing::error!("Step {} of execution {} failed: {}", step.id, id, error);

        let actions = match trigger {
            ActionTrigger::Timeout => &step.on_timeout,
            _ => &step.on_failure,
        };
        let mut output = VariableMap::new();
        output.insert("error".to_string(), json!(error));
        self.dispatcher
            .dispatch(trigger, actions, id, &step.id, &output)
            .await;

        Ok(StepOutcome::Failed {
            abort: step.required && !settings.continue_on_error,
            error,
        })
    }

    fn time_out(&self, id: &ExecutionId, max_duration_ms: u64) -> EngineResult<()> {
        let user = self.store.get(id)?.context.user_id;
        self.finalize(
            id,
            ExecutionStatus::TimedOut,
            Some(EngineError::ExecutionTimeout { max_duration_ms }.to_string()),
            &user,
        )?;
        Ok(())
    }

    /// Move an execution to a terminal state; remaining unfinished steps are cancelled
    fn finalize(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
        actor_id: &str,
    ) -> EngineResult<WorkflowExecution> {
        let verb = if status == ExecutionStatus::Cancelled {
            "cancel"
        } else {
            "finish"
        };

        let execution = self.store.modify(id, |e| {
            if e.status.is_terminal() {
                return Err(EngineError::invalid_transition(
                    format!("execution {}", e.id),
                    e.status,
                    verb,
                ));
            }

            let now = Utc::now();
            e.status = status;
            e.completed_at = Some(now);
            e.error = error.clone();

            for step in e.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
                step.status = StepStatus::Cancelled;
                step.completed_at = Some(now);
            }

            if status == ExecutionStatus::Completed {
                e.output = e
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Completed)
                    .map(|s| (s.step_id.to_string(), Value::Object(s.output.clone())))
                    .collect();
                e.progress = 100;
            } else {
                e.refresh_progress();
            }

            let level = match status {
                ExecutionStatus::Completed | ExecutionStatus::Cancelled => LogLevel::Info,
                _ => LogLevel::Error,
            };
            e.push_log(
                level,
                None,
                format!("Execution {}", status),
                json!({ "error": error }),
            );
            Ok(e.clone())
        })?;

        match status {
            ExecutionStatus::Completed | ExecutionStatus::Cancelled => {
                tracing::info!("Execution {} {}", id, status)
            }
            _ => tracing::error!(
                "Execution {} {}: {}",
                id,
                status,
                execution.error.as_deref().unwrap_or("unknown error")
            ),
        }

        let action = match status {
            ExecutionStatus::Completed => AuditAction::ExecutionCompleted,
            ExecutionStatus::Cancelled => AuditAction::ExecutionCancelled,
            ExecutionStatus::TimedOut => AuditAction::ExecutionTimedOut,
            _ => AuditAction::ExecutionFailed,
        };
        self.audit.log(
            &execution.tenant_id,
            actor_id,
            action,
            &format!("execution:{}", id),
            json!({ "error": execution.error }),
        );
        self.registry.record_finished(&execution.definition_id, status);

        Ok(execution)
    }

    /// Fail the execution, then run the compensation pass if the definition asks for one
    async fn fail_execution(&self, id: &ExecutionId, error: String) -> EngineResult<()> {
        let user = self.store.get(id)?.context.user_id;
        let execution = self.finalize(id, ExecutionStatus::Failed, Some(error), &user)?;
        if execution.snapshot.settings.rollback_on_error {
            self.compensate(&execution).await;
        }
        Ok(())
    }

    /// Replay the failure actions of completed steps, most recent first
    async fn compensate(&self, execution: &WorkflowExecution) {
        let completed: Vec<&WorkflowStepExecution> = execution
            .steps
            .iter()
            .rev()
            .filter(|s| s.status == StepStatus::Completed)
            .collect();

        self.store.log(
            &execution.id,
            LogLevel::Warn,
            None,
            format!("Rolling back {} completed step(s)", completed.len()),
            Value::Null,
        );
        tracing::warn!("Rolling back execution {}", execution.id);

        for state in completed {
            let Some(step) = execution.snapshot.steps.iter().find(|d| d.id == state.step_id) else {
                continue;
            };
            self.dispatcher
                .dispatch(
                    ActionTrigger::Compensation,
                    &step.on_failure,
                    &execution.id,
                    &step.id,
                    &state.output,
                )
                .await;
        }

        self.store
            .log(&execution.id, LogLevel::Info, None, "Rollback finished", Value::Null);
    }

    fn wake_after(&self, id: ExecutionId, delay: Duration) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(id);
        });
    }

    fn max_retries(&self, step: &WorkflowStep, settings: &ExecutionSettings) -> u32 {
        step.retry
            .as_ref()
            .or(settings.retry_policy.as_ref())
            .map_or(self.config.default_max_retries, |p| p.max_retries)
    }

    fn backoff(&self, step: &WorkflowStep, settings: &ExecutionSettings) -> (u64, Option<f64>) {
        step.retry
            .as_ref()
            .or(settings.retry_policy.as_ref())
            .map_or((self.config.default_backoff_ms, None), |p| {
                (p.backoff_ms, p.backoff_multiplier)
            })
    }

    /// Handler timeout, capped by what is left of the execution budget. `None` once the budget is spent.
    fn step_timeout(&self, step: &WorkflowStep, execution: &WorkflowExecution) -> Option<Duration> {
        let step_timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_step_timeout());

        match execution.snapshot.settings.max_duration_ms {
            Some(_) => remaining_budget(execution).map(|left| step_timeout.min(left)),
            None => Some(step_timeout),
        }
    }
}

fn step_mut<'a>(
    execution: &'a mut WorkflowExecution,
    step_id: &StepId,
) -> EngineResult<&'a mut WorkflowStepExecution> {
    let index = execution
        .step_index(step_id)
        .ok_or_else(|| EngineError::StepNotFound {
            execution_id: execution.id,
            step_id: step_id.clone(),
        })?;
    Ok(&mut execution.steps[index])
}

fn readiness(execution: &WorkflowExecution, step: &WorkflowStep) -> Readiness {
    let mut blocked = false;
    for dep in &step.depends_on {
        match execution.step(dep).map(|s| s.status) {
            Some(StepStatus::Completed) => {}
            Some(status @ (StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled)) => {
                return Readiness::Unsatisfiable(dep.clone(), status);
            }
            _ => blocked = true,
        }
    }

    if blocked {
        Readiness::Blocked
    } else {
        Readiness::Ready
    }
}

/// Whether a guarded write was refused because the execution had already finished
fn refused_as_finished<T>(result: &EngineResult<T>) -> bool {
    matches!(result, Err(EngineError::InvalidStateTransition { .. }))
}

/// Time left before the max duration, measured from creation. `None` when unbounded or spent.
fn remaining_budget(execution: &WorkflowExecution) -> Option<Duration> {
    let max = execution.snapshot.settings.max_duration_ms?;
    let elapsed = execution.elapsed_ms(Utc::now()).max(0) as u64;
    max.checked_sub(elapsed)
        .filter(|left| *left > 0)
        .map(Duration::from_millis)
}

/// The max duration if the execution has used it up
fn deadline_exceeded(execution: &WorkflowExecution) -> Option<u64> {
    let max = execution.snapshot.settings.max_duration_ms?;
    if remaining_budget(execution).is_none() {
        Some(max)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConditionOperator, WorkflowCondition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StepHandler for Counting {
        async fn execute(&self, request: &StepRequest<'_>) -> anyhow::Result<VariableMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = VariableMap::new();
            out.insert(format!("{}_done", request.step_id), json!(true));
            Ok(out)
        }
    }

    fn engine_with_counter() -> (WorkflowEngine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = WorkflowEngine::builder()
            .handler(StepType::Task, Arc::new(Counting { calls: calls.clone() }))
            .build();
        (engine, calls)
    }

    fn task(id: &str, order: u32, deps: &[&str]) -> WorkflowStep {
        let mut step = WorkflowStep::new(id, StepType::Task, order);
        step.depends_on = deps.iter().map(|d| StepId::new(*d)).collect();
        step
    }

    #[tokio::test]
    async fn test_steps_run_in_dependency_order() {
        let (engine, calls) = engine_with_counter();
        // b is listed first by order but depends on a
        let def = engine
            .create_definition(DefinitionDraft::new(
                "acme",
                "flow",
                vec![task("b", 1, &["a"]), task("a", 2, &[])],
            ))
            .unwrap();

        let exec = engine
            .start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob"))
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);

        engine.run_until_idle().await;

        let exec = engine.get_execution(&exec.id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exec.variables["a_done"], json!(true));
        assert_eq!(exec.variables["steps"]["b"]["b_done"], json!(true));
        assert_eq!(exec.output["a"]["a_done"], json!(true));
        assert_eq!(engine.counters(&def.id).completed, 1);
    }

    #[tokio::test]
    async fn test_parallel_steps_all_complete() {
        let (engine, calls) = engine_with_counter();
        let mut steps: Vec<WorkflowStep> = (1..=3)
            .map(|i| {
                let mut s = task(&format!("p{}", i), i, &[]);
                s.is_parallel = true;
                s
            })
            .collect();
        steps.push(task("join", 4, &["p1", "p2", "p3"]));

        let def = engine
            .create_definition(DefinitionDraft::new("acme", "fan-out", steps))
            .unwrap();
        let exec = engine
            .start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob"))
            .unwrap();
        engine.run_until_idle().await;

        let exec = engine.get_execution(&exec.id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(exec.progress, 100);
    }

    #[tokio::test]
    async fn test_skipped_dependency_cascades() {
        let (engine, calls) = engine_with_counter();
        let mut gated = task("gated", 1, &[]);
        gated.conditions = vec![WorkflowCondition::new("go", ConditionOperator::Equals, json!(true))];

        let def = engine
            .create_definition(DefinitionDraft::new(
                "acme",
                "cascade",
                vec![gated, task("after", 2, &["gated"])],
            ))
            .unwrap();
        let exec = engine
            .start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob"))
            .unwrap();
        engine.run_until_idle().await;

        let exec = engine.get_execution(&exec.id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let (engine, _) = engine_with_counter();
        let def = engine
            .create_definition(DefinitionDraft::new("acme", "flow", vec![task("a", 1, &[])]))
            .unwrap();
        let exec = engine
            .start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob"))
            .unwrap();

        let err = engine.pause(&exec.id, "bob").unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { action: "pause", .. }));
        let err = engine.resume(&exec.id, "bob").unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { action: "resume", .. }));
    }

    #[tokio::test]
    async fn test_cancel_pending_execution() {
        let (engine, calls) = engine_with_counter();
        let def = engine
            .create_definition(DefinitionDraft::new("acme", "flow", vec![task("a", 1, &[])]))
            .unwrap();
        let exec = engine
            .start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob"))
            .unwrap();

        let cancelled = engine.cancel(&exec.id, "alice").unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.steps[0].status, StepStatus::Cancelled);

        engine.run_until_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            engine.cancel(&exec.id, "alice"),
            Err(EngineError::InvalidStateTransition { action: "cancel", .. })
        ));
    }

    #[tokio::test]
    async fn test_inactive_definition_cannot_start() {
        let (engine, _) = engine_with_counter();
        let mut draft = DefinitionDraft::new("acme", "flow", vec![task("a", 1, &[])]);
        draft.is_active = false;
        let def = engine.create_definition(draft).unwrap();

        assert!(matches!(
            engine.start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob")),
            Err(EngineError::DefinitionInactive(_))
        ));
        assert!(matches!(
            engine.start(&DefinitionId::new(), VariableMap::new(), ExecutionContext::for_user("bob")),
            Err(EngineError::DefinitionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_delete_guard() {
        let (engine, _) = engine_with_counter();
        let mut draft = DefinitionDraft::new("acme", "flow", vec![task("a", 1, &[])]);
        draft.settings.concurrency_limit = Some(1);
        let def = engine.create_definition(draft).unwrap();

        engine
            .start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob"))
            .unwrap();
        assert!(matches!(
            engine.start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob")),
            Err(EngineError::ConcurrencyLimitReached { limit: 1, .. })
        ));
        assert!(matches!(
            engine.delete_definition(&def.id, "alice"),
            Err(EngineError::DefinitionInUse { active: 1, .. })
        ));

        engine.run_until_idle().await;
        engine.delete_definition(&def.id, "alice").unwrap();
        assert!(engine.get_definition(&def.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_racing_start_leaves_no_live_executions() {
        let (engine, _) = engine_with_counter();
        for round in 0..20 {
            let def = engine
                .create_definition(DefinitionDraft::new("acme", format!("flow-{round}"), vec![task("a", 1, &[])]))
                .unwrap();
            let filter = ExecutionFilter::for_definition(def.id);

            std::thread::scope(|scope| {
                scope.spawn(|| loop {
                    match engine.start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob")) {
                        Ok(_) => {}
                        Err(EngineError::DefinitionNotFound(_)) => break,
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                });
                scope.spawn(|| loop {
                    match engine.delete_definition(&def.id, "alice") {
                        Ok(()) => break,
                        Err(EngineError::DefinitionInUse { .. }) => {
                            for execution in engine.list_executions(&filter).unwrap() {
                                let _ = engine.cancel(&execution.id, "alice");
                            }
                        }
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                });
            });

            assert!(engine.get_definition(&def.id).unwrap().is_none());
            let live = engine
                .list_executions(&filter)
                .unwrap()
                .into_iter()
                .filter(|e| !e.status.is_terminal())
                .count();
            assert_eq!(live, 0, "round {round} left live executions behind");
        }
    }

    #[tokio::test]
    async fn test_definition_edit_does_not_affect_running_execution() {
        let (engine, calls) = engine_with_counter();
        let def = engine
            .create_definition(DefinitionDraft::new("acme", "flow", vec![task("a", 1, &[])]))
            .unwrap();
        let exec = engine
            .start(&def.id, VariableMap::new(), ExecutionContext::for_user("bob"))
            .unwrap();

        engine
            .update_definition(
                &def.id,
                DefinitionPatch {
                    steps: Some(vec![task("a", 1, &[]), task("b", 2, &["a"])]),
                    ..DefinitionPatch::default()
                },
                "alice",
            )
            .unwrap();
        engine.run_until_idle().await;

        let exec = engine.get_execution(&exec.id).unwrap();
        assert_eq!(exec.steps.len(), 1);
        assert_eq!(exec.snapshot.version, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
