use super::handlers;
use crate::error::{EngineError, EngineResult};
use crate::side_effects::{NotificationChannel, SideEffects};
use crate::types::{StepId, StepType, VariableMap};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Everything a handler may look at when producing a step's output
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub step_id: &'a StepId,
    pub step_type: StepType,
    /// Step config with placeholders already rendered
    pub config: &'a VariableMap,
    /// Execution input as submitted at start
    pub input: &'a VariableMap,
    /// Variables accumulated so far (input plus earlier step outputs)
    pub variables: &'a VariableMap,
}

/// Produces a step's output. Retry, timeout and logging belong to the scheduler.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, request: &StepRequest<'_>) -> anyhow::Result<VariableMap>;
}

/// Maps step-type tags to handlers
#[derive(Clone, Default)]
pub struct StepHandlerRegistry {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl StepHandlerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a handler for every built-in step type, wired to the given collaborators
    pub fn with_builtin_handlers(effects: &SideEffects) -> Self {
        let mut registry = Self::new();

        registry.register(StepType::Task, Arc::new(handlers::TaskHandler));
        registry.register(
            StepType::Approval,
            Arc::new(handlers::ApprovalHandler::new(effects.notifications.clone())),
        );
        registry.register(
            StepType::Notification,
            Arc::new(handlers::NotificationHandler::new(
                effects.notifications.clone(),
                NotificationChannel::InApp,
            )),
        );
        registry.register(
            StepType::Slack,
            Arc::new(handlers::NotificationHandler::new(
                effects.notifications.clone(),
                NotificationChannel::Slack,
            )),
        );
        registry.register(StepType::Email, Arc::new(handlers::EmailHandler::new(effects.email.clone())));
        registry.register(StepType::Sms, Arc::new(handlers::SmsHandler::new(effects.sms.clone())));
        registry.register(
            StepType::Webhook,
            Arc::new(handlers::WebhookHandler::new(effects.webhooks.clone())),
        );
        registry.register(
            StepType::Integration,
            Arc::new(handlers::ApiHandler::integration(effects.api.clone())),
        );
        registry.register(
            StepType::ApiCall,
            Arc::new(handlers::ApiHandler::api_call(effects.api.clone())),
        );
        registry.register(
            StepType::Database,
            Arc::new(handlers::DatabaseHandler::new(effects.database.clone())),
        );
        registry.register(
            StepType::FileUpload,
            Arc::new(handlers::FileUploadHandler::new(effects.files.clone())),
        );
        registry.register(
            StepType::Script,
            Arc::new(handlers::ScriptHandler::new(effects.scripts.clone())),
        );
        registry.register(StepType::Form, Arc::new(handlers::FormHandler));
        registry.register(StepType::Decision, Arc::new(handlers::DecisionHandler));
        registry.register(StepType::Delay, Arc::new(handlers::DelayHandler));

        registry
    }

    /// Register (or replace) the handler for a step type
    pub fn register(
        &mut self,
        step_type: StepType,
        handler: Arc<dyn StepHandler>,
    ) -> Option<Arc<dyn StepHandler>> {
        self.handlers.insert(step_type, handler)
    }

    /// Dispatch a step to the handler registered for its type. A panicking handler
    /// fails the step like any other handler error.
    pub async fn execute(&self, request: &StepRequest<'_>) -> EngineResult<VariableMap> {
        let handler = self
            .handlers
            .get(&request.step_type)
            .ok_or_else(|| EngineError::UnsupportedStepType(request.step_type.to_string()))?;

        match AssertUnwindSafe(handler.execute(request)).catch_unwind().await {
            Ok(result) => result.map_err(|e| EngineError::StepExecution {
                step_id: request.step_id.clone(),
                message: format!("{:#}", e),
            }),
            Err(payload) => {
                let message = format!("handler panicked: {}", panic_message(payload.as_ref()));
                tracing::error!("Step {} ({}) {}", request.step_id, request.step_type, message);
                Err(EngineError::StepExecution {
                    step_id: request.step_id.clone(),
                    message,
                })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> VariableMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_unknown_step_type_is_unsupported() {
        let registry = StepHandlerRegistry::new();
        let step_id = StepId::new("s1");
        let empty = VariableMap::new();

        let err = registry
            .execute(&StepRequest {
                step_id: &step_id,
                step_type: StepType::Webhook,
                config: &empty,
                input: &empty,
                variables: &empty,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::UnsupportedStepType(ref t) if t == "webhook"));
    }

    #[tokio::test]
    async fn test_builtin_registry_covers_every_type() {
        let registry = StepHandlerRegistry::with_builtin_handlers(&SideEffects::simulated());
        let step_id = StepId::new("s");
        let empty = VariableMap::new();

        for step_type in StepType::ALL {
            let result = registry
                .execute(&StepRequest {
                    step_id: &step_id,
                    step_type,
                    config: &empty,
                    input: &empty,
                    variables: &empty,
                })
                .await;
            assert!(
                !matches!(result, Err(EngineError::UnsupportedStepType(_))),
                "missing handler for {step_type}"
            );
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_the_step() {
        struct Exploding;

        #[async_trait]
        impl StepHandler for Exploding {
            async fn execute(&self, _request: &StepRequest<'_>) -> anyhow::Result<VariableMap> {
                panic!("ledger offline");
            }
        }

        let mut registry = StepHandlerRegistry::new();
        registry.register(StepType::Script, Arc::new(Exploding));

        let step_id = StepId::new("charge");
        let empty = VariableMap::new();
        let err = registry
            .execute(&StepRequest {
                step_id: &step_id,
                step_type: StepType::Script,
                config: &empty,
                input: &empty,
                variables: &empty,
            })
            .await
            .unwrap_err();

        match err {
            EngineError::StepExecution { step_id, message } => {
                assert_eq!(step_id.as_str(), "charge");
                assert_eq!(message, "handler panicked: ledger offline");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_maps_to_step_execution_error() {
        let registry = StepHandlerRegistry::with_builtin_handlers(&SideEffects::simulated());
        let step_id = StepId::new("mail");
        let empty = VariableMap::new();

        // Email without recipients is rejected by the handler
        let err = registry
            .execute(&StepRequest {
                step_id: &step_id,
                step_type: StepType::Email,
                config: &map(json!({"subject": "hi"})),
                input: &empty,
                variables: &empty,
            })
            .await
            .unwrap_err();

        match err {
            EngineError::StepExecution { step_id, message } => {
                assert_eq!(step_id.as_str(), "mail");
                assert!(message.contains("to"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_custom_handler_replaces_builtin() {
        struct Fixed;

        #[async_trait]
        impl StepHandler for Fixed {
            async fn execute(&self, _request: &StepRequest<'_>) -> anyhow::Result<VariableMap> {
                Ok(map(json!({"fixed": true})))
            }
        }

        let mut registry = StepHandlerRegistry::with_builtin_handlers(&SideEffects::simulated());
        assert!(registry.register(StepType::Task, Arc::new(Fixed)).is_some());

        let step_id = StepId::new("t");
        let empty = VariableMap::new();
        let output = registry
            .execute(&StepRequest {
                step_id: &step_id,
                step_type: StepType::Task,
                config: &empty,
                input: &empty,
                variables: &empty,
            })
            .await
            .unwrap();

        assert_eq!(output["fixed"], json!(true));
    }
}
