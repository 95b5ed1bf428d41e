use super::actor::Actor;
use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use procflow_core::analytics::{AnalyticsPeriod, WorkflowAnalytics};
use procflow_core::storage::ExecutionFilter;
use procflow_core::{
    DefinitionDraft, DefinitionId, DefinitionPatch, EngineError, ExecutionContext, ExecutionId,
    ExecutionStatus, StepId, VariableMap, WorkflowDefinition, WorkflowExecution,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Create a workflow definition
pub async fn create_definition(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(mut draft): Json<DefinitionDraft>,
) -> ApiResult<(StatusCode, Json<WorkflowDefinition>)> {
    if draft.created_by.is_empty() {
        draft.created_by = actor.0;
    }
    let definition = state.engine.create_definition(draft)?;
    Ok((StatusCode::CREATED, Json(definition)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListDefinitionsQuery {
    pub tenant_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListDefinitionsResponse {
    pub definitions: Vec<WorkflowDefinition>,
}

/// List definitions, optionally for one tenant
pub async fn list_definitions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListDefinitionsQuery>,
) -> ApiResult<Json<ListDefinitionsResponse>> {
    let definitions = state.engine.list_definitions(query.tenant_id.as_deref())?;
    Ok(Json(ListDefinitionsResponse { definitions }))
}

/// Get a definition by ID
pub async fn get_definition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let id = DefinitionId(id);
    let definition = state
        .engine
        .get_definition(&id)?
        .ok_or(EngineError::DefinitionNotFound(id))?;
    Ok(Json(definition))
}

pub async fn update_definition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
    Json(patch): Json<DefinitionPatch>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let definition = state
        .engine
        .update_definition(&DefinitionId(id), patch, actor.as_str())?;
    Ok(Json(definition))
}

pub async fn delete_definition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<StatusCode> {
    state
        .engine
        .delete_definition(&DefinitionId(id), actor.as_str())?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct StartExecutionRequest {
    #[serde(default)]
    pub input: VariableMap,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Start an execution of a definition; the background processor picks it up
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
    Json(request): Json<StartExecutionRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowExecution>)> {
    let mut context = ExecutionContext::for_user(actor.0);
    if let Some(environment) = request.environment {
        context.environment = environment;
    }
    context.request_id = request.request_id;
    context.source = Some("api".to_string());

    let execution = state
        .engine
        .start(&DefinitionId(id), request.input, context)?;
    Ok((StatusCode::CREATED, Json(execution)))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub tenant_id: String,
    pub period: Option<String>,
}

pub async fn get_analytics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<Json<WorkflowAnalytics>> {
    let period = match query.period.as_deref() {
        Some(raw) => raw.parse::<AnalyticsPeriod>().map_err(ApiError::bad_request)?,
        None => AnalyticsPeriod::default(),
    };
    let analytics = state
        .engine
        .get_analytics(&DefinitionId(id), &query.tenant_id, period)?;
    Ok(Json(analytics))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListExecutionsQuery {
    pub definition_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<WorkflowExecution>,
}

/// List executions matching the query filters
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListExecutionsQuery>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let filter = ExecutionFilter {
        definition_id: query.definition_id.map(DefinitionId),
        tenant_id: query.tenant_id,
        status: query.status,
    };
    let executions = state.engine.list_executions(&filter)?;
    Ok(Json(ListExecutionsResponse { executions }))
}

/// Get an execution by ID
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    Ok(Json(state.engine.get_execution(&ExecutionId(id))?))
}

pub async fn pause_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<Json<WorkflowExecution>> {
    Ok(Json(state.engine.pause(&ExecutionId(id), actor.as_str())?))
}

pub async fn resume_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<Json<WorkflowExecution>> {
    Ok(Json(state.engine.resume(&ExecutionId(id), actor.as_str())?))
}

pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<Json<WorkflowExecution>> {
    Ok(Json(state.engine.cancel(&ExecutionId(id), actor.as_str())?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionRequest {
    #[serde(default)]
    pub comment: Option<String>,
}

/// Approve a step waiting for approval
pub async fn approve_step(
    State(state): State<Arc<AppState>>,
    Path((id, step_id)): Path<(Uuid, String)>,
    actor: Actor,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<Json<WorkflowExecution>> {
    let execution = state.engine.approve_step(
        &ExecutionId(id),
        &StepId::new(step_id),
        actor.as_str(),
        request.comment,
    )?;
    Ok(Json(execution))
}

/// Reject a step waiting for approval
pub async fn reject_step(
    State(state): State<Arc<AppState>>,
    Path((id, step_id)): Path<(Uuid, String)>,
    actor: Actor,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<Json<WorkflowExecution>> {
    let execution = state.engine.reject_step(
        &ExecutionId(id),
        &StepId::new(step_id),
        actor.as_str(),
        request.comment,
    )?;
    Ok(Json(execution))
}
