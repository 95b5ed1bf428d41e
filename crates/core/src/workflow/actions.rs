//! Executes the action lists attached to a step outcome.
//!
//! Each action is attempted independently: a failure is logged on the execution and the
//! remaining actions still run. Rollback happens after the execution is final, so variable
//! writes are skipped there.

use super::handlers::{headers, optional_str, required_str, string_list};
use super::template::render_map;
use crate::side_effects::{
    ApiRequest, EmailRequest, NotificationChannel, NotificationRequest, SideEffects, SmsRequest,
    WebhookRequest,
};
use crate::storage::ExecutionStore;
use crate::types::{
    ActionType, ExecutionId, LogLevel, StepId, VariableMap, WorkflowAction,
};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Which outcome an action list is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTrigger {
    Success,
    Failure,
    Timeout,
    /// Failure actions replayed during rollback
    Compensation,
}

impl std::fmt::Display for ActionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionTrigger::Success => "on_success",
            ActionTrigger::Failure => "on_failure",
            ActionTrigger::Timeout => "on_timeout",
            ActionTrigger::Compensation => "compensation",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct ActionDispatcher {
    effects: SideEffects,
    store: Arc<ExecutionStore>,
}

impl ActionDispatcher {
    pub fn new(effects: SideEffects, store: Arc<ExecutionStore>) -> Self {
        Self { effects, store }
    }

    /// Run `actions` in ascending `order`.
    ///
    /// Configs are rendered against the execution variables with the step output layered on
    /// top (and also available as `output.*`).
    pub async fn dispatch(
        &self,
        trigger: ActionTrigger,
        actions: &[WorkflowAction],
        execution_id: &ExecutionId,
        step_id: &StepId,
        step_output: &VariableMap,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if actions.is_empty() {
            return report;
        }

        let mut ordered: Vec<&WorkflowAction> = actions.iter().collect();
        ordered.sort_by_key(|a| a.order);

        for action in ordered {
            if trigger == ActionTrigger::Compensation && action.action_type == ActionType::SetVariable {
                report.skipped += 1;
                self.store.log(
                    execution_id,
                    LogLevel::Info,
                    Some(step_id),
                    format!("Action {} ({}) skipped during rollback", action.id, action.action_type),
                    json!({ "trigger": trigger, "action_id": action.id }),
                );
                continue;
            }

            let context = match self.store.get(execution_id) {
                Ok(execution) => {
                    let mut vars = execution.variables;
                    vars.extend(step_output.clone());
                    vars.insert("output".to_string(), Value::Object(step_output.clone()));
                    vars
                }
                Err(e) => {
                    tracing::error!("Cannot dispatch actions for execution {}: {}", execution_id, e);
                    report.failed += 1;
                    continue;
                }
            };
            let config = render_map(&action.config, &context);

            match self.run(action.action_type, &config, execution_id, step_id).await {
                Ok(()) => {
                    report.succeeded += 1;
                    self.store.log(
                        execution_id,
                        LogLevel::Info,
                        Some(step_id),
                        format!("Action {} ({}) succeeded", action.id, action.action_type),
                        json!({ "trigger": trigger, "action_id": action.id }),
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        "Action {} ({}) for step {} failed: {:#}",
                        action.id,
                        trigger,
                        step_id,
                        e
                    );
                    self.store.log(
                        execution_id,
                        LogLevel::Error,
                        Some(step_id),
                        format!("Action {} ({}) failed: {:#}", action.id, action.action_type, e),
                        json!({ "trigger": trigger, "action_id": action.id }),
                    );
                }
            }
        }

        report
    }

    async fn run(
        &self,
        action_type: ActionType,
        config: &VariableMap,
        execution_id: &ExecutionId,
        step_id: &StepId,
    ) -> Result<()> {
        match action_type {
            ActionType::SendNotification | ActionType::SendSlack => {
                let channel = if action_type == ActionType::SendSlack {
                    NotificationChannel::Slack
                } else {
                    NotificationChannel::InApp
                };
                let mut recipients = string_list(config, "recipients");
                recipients.extend(string_list(config, "channel"));
                if recipients.is_empty() {
                    bail!("notification action has no recipients");
                }
                self.effects
                    .notifications
                    .notify(NotificationRequest {
                        channel,
                        recipients,
                        title: optional_str(config, "title").unwrap_or_else(|| step_id.to_string()),
                        message: required_str(config, "message")?,
                        data: config.get("data").cloned().unwrap_or(Value::Null),
                    })
                    .await?;
            }
            ActionType::SendEmail => {
                let to = string_list(config, "to");
                if to.is_empty() {
                    bail!("email action requires at least one 'to' address");
                }
                self.effects
                    .email
                    .send_email(EmailRequest {
                        to,
                        subject: required_str(config, "subject")?,
                        body: optional_str(config, "body").unwrap_or_default(),
                        template: optional_str(config, "template"),
                    })
                    .await?;
            }
            ActionType::SendSms => {
                let to = string_list(config, "to");
                if to.is_empty() {
                    bail!("sms action requires at least one 'to' number");
                }
                self.effects
                    .sms
                    .send_sms(SmsRequest {
                        to,
                        message: required_str(config, "message")?,
                    })
                    .await?;
            }
            ActionType::CallWebhook => {
                let url = required_str(config, "url")?;
                let response = self
                    .effects
                    .webhooks
                    .call_webhook(WebhookRequest {
                        url: url.clone(),
                        method: optional_str(config, "method").unwrap_or_else(|| "POST".to_string()),
                        headers: headers(config),
                        payload: config.get("payload").cloned().unwrap_or(Value::Null),
                    })
                    .await?;
                if !response.is_success() {
                    bail!("webhook {} returned status {}", url, response.status);
                }
            }
            ActionType::CallApi => {
                let response = self
                    .effects
                    .api
                    .call_api(ApiRequest {
                        service: optional_str(config, "service").unwrap_or_else(|| "http".to_string()),
                        endpoint: required_str(config, "endpoint")?,
                        method: optional_str(config, "method").unwrap_or_else(|| "GET".to_string()),
                        headers: headers(config),
                        body: config.get("body").cloned().unwrap_or(Value::Null),
                    })
                    .await?;
                if !response.is_success() {
                    bail!("api call returned status {}", response.status);
                }
            }
            ActionType::SetVariable => {
                let name = optional_str(config, "name")
                    .or_else(|| optional_str(config, "variable"))
                    .ok_or_else(|| anyhow::anyhow!("set_variable action requires 'name'"))?;
                let value = config.get("value").cloned().unwrap_or(Value::Null);
                self.store.modify_active(execution_id, "set variable", |execution| {
                    execution.variables.insert(name, value);
                    Ok(())
                })?;
            }
            ActionType::Log => {
                let level = match optional_str(config, "level").as_deref() {
                    Some("debug") => LogLevel::Debug,
                    Some("warn") => LogLevel::Warn,
                    Some("error") => LogLevel::Error,
                    _ => LogLevel::Info,
                };
                let message = optional_str(config, "message").unwrap_or_else(|| "log action".to_string());
                self.store.log(
                    execution_id,
                    level,
                    Some(step_id),
                    message,
                    config.get("data").cloned().unwrap_or(Value::Null),
                );
            }
        }

        Ok(())
    }
}
