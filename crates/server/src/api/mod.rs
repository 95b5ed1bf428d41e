use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use procflow_core::EngineError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod actor;
mod handlers;

/// Start the queue processor and the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;
    state.engine.recover()?;

    let worker = state.engine.spawn();
    tracing::info!("Queue processor started");

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    worker.abort();
    Ok(())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/definitions",
            get(handlers::list_definitions).post(handlers::create_definition),
        )
        .route(
            "/api/definitions/{id}",
            get(handlers::get_definition)
                .put(handlers::update_definition)
                .delete(handlers::delete_definition),
        )
        .route(
            "/api/definitions/{id}/executions",
            post(handlers::start_execution),
        )
        .route("/api/definitions/{id}/analytics", get(handlers::get_analytics))
        .route("/api/executions", get(handlers::list_executions))
        .route("/api/executions/{id}", get(handlers::get_execution))
        .route("/api/executions/{id}/pause", post(handlers::pause_execution))
        .route("/api/executions/{id}/resume", post(handlers::resume_execution))
        .route("/api/executions/{id}/cancel", post(handlers::cancel_execution))
        .route(
            "/api/executions/{id}/steps/{step_id}/approve",
            post(handlers::approve_step),
        )
        .route(
            "/api/executions/{id}/steps/{step_id}/reject",
            post(handlers::reject_step),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "procflow",
        "version": env!("CARGO_PKG_VERSION"),
        "queued": state.engine.queued(),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Error returned by API handlers, carrying the HTTP status it maps to
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    response: ErrorResponse,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            response: ErrorResponse::new(message),
        }
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation { .. } | EngineError::UnsupportedStepType(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        EngineError::DefinitionNotFound(_)
        | EngineError::ExecutionNotFound(_)
        | EngineError::StepNotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::DefinitionInactive(_)
        | EngineError::DefinitionInUse { .. }
        | EngineError::InvalidStateTransition { .. }
        | EngineError::ConcurrencyLimitReached { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", err);
        }

        let response = match &err {
            EngineError::Validation {
                step: Some(step), ..
            } => ErrorResponse::with_details(err.to_string(), format!("step {}", step)),
            _ => ErrorResponse::new(err.to_string()),
        };

        Self { status, response }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::actor::ACTOR_HEADER;
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use procflow_core::{ExecutionStatus, WorkflowDefinition, WorkflowExecution};
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(&ServerConfig::default()).unwrap()
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(ACTOR_HEADER, "alice");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn approval_draft() -> Value {
        json!({
            "tenant_id": "acme",
            "name": "expense",
            "settings": {"require_approval": true},
            "steps": [
                {"id": "submit", "name": "Submit", "type": "task", "order": 1},
                {"id": "review", "name": "Review", "type": "approval", "order": 2,
                 "depends_on": ["submit"], "config": {"approvers": ["bob"]}}
            ]
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(test_state());
        let response = send(&app, Method::GET, "/api/health", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = read_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queued"], 0);
    }

    #[tokio::test]
    async fn test_approval_round_trip_over_http() {
        let state = test_state();
        let engine = state.engine.clone();
        let app = create_router(state);

        let response = send(&app, Method::POST, "/api/definitions", Some(approval_draft())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let definition: WorkflowDefinition = read_json(response).await;
        assert_eq!(definition.created_by, "alice");

        let response = send(
            &app,
            Method::POST,
            &format!("/api/definitions/{}/executions", definition.id),
            Some(json!({"input": {"amount": 120}})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let execution: WorkflowExecution = read_json(response).await;
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.context.user_id, "alice");

        engine.run_until_idle().await;

        let response = send(
            &app,
            Method::POST,
            &format!("/api/executions/{}/steps/review/approve", execution.id),
            Some(json!({"comment": "fine"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        engine.run_until_idle().await;

        let response = send(
            &app,
            Method::GET,
            &format!("/api/executions/{}", execution.id),
            None,
        )
        .await;
        let finished: WorkflowExecution = read_json(response).await;
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(finished.progress, 100);

        let response = send(
            &app,
            Method::GET,
            &format!("/api/executions?status=completed&definition_id={}", definition.id),
            None,
        )
        .await;
        let listed: Value = read_json(response).await;
        assert_eq!(listed["executions"].as_array().map(Vec::len), Some(1));

        let response = send(
            &app,
            Method::GET,
            &format!("/api/definitions/{}/analytics?tenant_id=acme&period=week", definition.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let analytics: Value = read_json(response).await;
        assert_eq!(analytics["completed"], 1);
    }

    #[tokio::test]
    async fn test_engine_errors_map_to_status_codes() {
        let state = test_state();
        let engine = state.engine.clone();
        let app = create_router(state);

        let missing = uuid::Uuid::new_v4();
        let response = send(&app, Method::GET, &format!("/api/definitions/{}", missing), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let cyclic = json!({
            "tenant_id": "acme",
            "name": "loop",
            "steps": [
                {"id": "a", "name": "A", "type": "task", "order": 1, "depends_on": ["b"]},
                {"id": "b", "name": "B", "type": "task", "order": 2, "depends_on": ["a"]}
            ]
        });
        let response = send(&app, Method::POST, "/api/definitions", Some(cyclic)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&app, Method::POST, "/api/definitions", Some(approval_draft())).await;
        let definition: WorkflowDefinition = read_json(response).await;

        let response = send(
            &app,
            Method::GET,
            &format!("/api/definitions/{}/analytics?tenant_id=acme&period=decade", definition.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            Method::POST,
            &format!("/api/definitions/{}/executions", definition.id),
            Some(json!({})),
        )
        .await;
        let execution: WorkflowExecution = read_json(response).await;

        // pausing a pending execution is not a valid transition
        let response = send(
            &app,
            Method::POST,
            &format!("/api/executions/{}/pause", execution.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error: ErrorResponse = read_json(response).await;
        assert!(error.error.contains("pause"));

        // definitions with live executions cannot be deleted
        let response = send(
            &app,
            Method::DELETE,
            &format!("/api/definitions/{}", definition.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(
            &app,
            Method::POST,
            &format!("/api/executions/{}/cancel", execution.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        engine.run_until_idle().await;

        let response = send(
            &app,
            Method::DELETE,
            &format!("/api/definitions/{}", definition.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
