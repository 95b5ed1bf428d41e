//! Built-in step handlers, one per step category.

use super::condition::{evaluate_all, resolve_path};
use super::step_executor::{StepHandler, StepRequest};
use crate::side_effects::{
    ApiCaller, ApiRequest, DatabaseExecutor, DatabaseRequest, EmailRequest, EmailSender,
    FileStore, FileUploadRequest, NotificationChannel, NotificationRequest, NotificationSender,
    ScriptRequest, ScriptRunner, SmsRequest, SmsSender, WebhookCaller, WebhookRequest,
};
use crate::types::{VariableMap, WorkflowCondition};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn required_str(config: &VariableMap, key: &str) -> Result<String> {
    optional_str(config, key).ok_or_else(|| anyhow!("missing required config field '{}'", key))
}

pub(crate) fn optional_str(config: &VariableMap, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A single string or an array of strings
pub(crate) fn string_list(config: &VariableMap, key: &str) -> Vec<String> {
    match config.get(key) {
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn headers(config: &VariableMap) -> BTreeMap<String, String> {
    config
        .get("headers")
        .and_then(Value::as_object)
        .map(|h| {
            h.iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn into_map(value: Value) -> VariableMap {
    match value {
        Value::Object(map) => map,
        Value::Null => VariableMap::new(),
        other => {
            let mut map = VariableMap::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

fn output(value: Value) -> Result<VariableMap> {
    Ok(into_map(value))
}

/// Generic unit of work; echoes its configured output
pub struct TaskHandler;

#[async_trait]
impl StepHandler for TaskHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let mut out = into_map(json!({
            "task": optional_str(request.config, "title").unwrap_or_else(|| request.step_id.to_string()),
            "completed": true,
        }));
        if let Some(assignee) = optional_str(request.config, "assignee") {
            out.insert("assignee".to_string(), Value::String(assignee));
        }
        if let Some(Value::Object(extra)) = request.config.get("output") {
            out.extend(extra.clone());
        }
        Ok(out)
    }
}

/// Requests a decision from the configured approvers
pub struct ApprovalHandler {
    notifications: Arc<dyn NotificationSender>,
}

impl ApprovalHandler {
    pub fn new(notifications: Arc<dyn NotificationSender>) -> Self {
        Self { notifications }
    }
}

#[async_trait]
impl StepHandler for ApprovalHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let approvers = string_list(request.config, "approvers");
        let message = optional_str(request.config, "message")
            .unwrap_or_else(|| format!("Step {} is waiting for your approval", request.step_id));

        let receipt = if approvers.is_empty() {
            None
        } else {
            Some(
                self.notifications
                    .notify(NotificationRequest {
                        channel: NotificationChannel::InApp,
                        recipients: approvers.clone(),
                        title: "Approval required".to_string(),
                        message,
                        data: json!({ "step_id": request.step_id }),
                    })
                    .await
                    .context("failed to request approval")?,
            )
        };

        output(json!({
            "approval_requested": true,
            "approvers": approvers,
            "request_id": receipt.map(|r| r.message_id),
        }))
    }
}

/// In-app and Slack notifications
pub struct NotificationHandler {
    notifications: Arc<dyn NotificationSender>,
    channel: NotificationChannel,
}

impl NotificationHandler {
    pub fn new(notifications: Arc<dyn NotificationSender>, channel: NotificationChannel) -> Self {
        Self {
            notifications,
            channel,
        }
    }
}

#[async_trait]
impl StepHandler for NotificationHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let mut recipients = string_list(request.config, "recipients");
        if self.channel == NotificationChannel::Slack {
            recipients.extend(string_list(request.config, "channel"));
        }
        if recipients.is_empty() {
            bail!("notification has no recipients");
        }

        let receipt = self
            .notifications
            .notify(NotificationRequest {
                channel: self.channel,
                recipients,
                title: optional_str(request.config, "title").unwrap_or_else(|| request.step_id.to_string()),
                message: required_str(request.config, "message")?,
                data: request.config.get("data").cloned().unwrap_or(Value::Null),
            })
            .await?;

        output(json!({
            "notification_id": receipt.message_id,
            "delivered": receipt.accepted,
        }))
    }
}

pub struct EmailHandler {
    email: Arc<dyn EmailSender>,
}

impl EmailHandler {
    pub fn new(email: Arc<dyn EmailSender>) -> Self {
        Self { email }
    }
}

#[async_trait]
impl StepHandler for EmailHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let to = string_list(request.config, "to");
        if to.is_empty() {
            bail!("email step requires at least one 'to' address");
        }

        let receipt = self
            .email
            .send_email(EmailRequest {
                to,
                subject: required_str(request.config, "subject")?,
                body: optional_str(request.config, "body").unwrap_or_default(),
                template: optional_str(request.config, "template"),
            })
            .await?;

        output(json!({
            "message_id": receipt.message_id,
            "accepted": receipt.accepted,
        }))
    }
}

pub struct SmsHandler {
    sms: Arc<dyn SmsSender>,
}

impl SmsHandler {
    pub fn new(sms: Arc<dyn SmsSender>) -> Self {
        Self { sms }
    }
}

#[async_trait]
impl StepHandler for SmsHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let to = string_list(request.config, "to");
        if to.is_empty() {
            bail!("sms step requires at least one 'to' number");
        }

        let receipt = self
            .sms
            .send_sms(SmsRequest {
                to,
                message: required_str(request.config, "message")?,
            })
            .await?;

        output(json!({
            "message_id": receipt.message_id,
            "accepted": receipt.accepted,
        }))
    }
}

pub struct WebhookHandler {
    webhooks: Arc<dyn WebhookCaller>,
}

impl WebhookHandler {
    pub fn new(webhooks: Arc<dyn WebhookCaller>) -> Self {
        Self { webhooks }
    }
}

#[async_trait]
impl StepHandler for WebhookHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let url = required_str(request.config, "url")?;
        let payload = request
            .config
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(request.variables.clone()));

        let response = self
            .webhooks
            .call_webhook(WebhookRequest {
                url: url.clone(),
                method: optional_str(request.config, "method").unwrap_or_else(|| "POST".to_string()),
                headers: headers(request.config),
                payload,
            })
            .await?;

        if !response.is_success() {
            bail!("webhook {} returned status {}", url, response.status);
        }

        output(json!({
            "status": response.status,
            "response": response.body,
        }))
    }
}

/// Serves both `integration` (named service) and `api_call` (raw endpoint) steps
pub struct ApiHandler {
    api: Arc<dyn ApiCaller>,
    default_service: Option<&'static str>,
}

impl ApiHandler {
    pub fn integration(api: Arc<dyn ApiCaller>) -> Self {
        Self {
            api,
            default_service: None,
        }
    }

    pub fn api_call(api: Arc<dyn ApiCaller>) -> Self {
        Self {
            api,
            default_service: Some("external"),
        }
    }
}

#[async_trait]
impl StepHandler for ApiHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let service = match optional_str(request.config, "service")
            .or_else(|| optional_str(request.config, "integration"))
        {
            Some(service) => service,
            None => self
                .default_service
                .map(str::to_string)
                .ok_or_else(|| anyhow!("missing required config field 'service'"))?,
        };
        let endpoint = optional_str(request.config, "endpoint")
            .or_else(|| optional_str(request.config, "url"))
            .ok_or_else(|| anyhow!("missing required config field 'endpoint'"))?;

        let response = self
            .api
            .call_api(ApiRequest {
                service: service.clone(),
                endpoint,
                method: optional_str(request.config, "method").unwrap_or_else(|| "GET".to_string()),
                headers: headers(request.config),
                body: request.config.get("body").cloned().unwrap_or(Value::Null),
            })
            .await?;

        if !response.is_success() {
            bail!("{} call returned status {}", service, response.status);
        }

        output(json!({
            "status": response.status,
            "response": response.body,
        }))
    }
}

pub struct DatabaseHandler {
    database: Arc<dyn DatabaseExecutor>,
}

impl DatabaseHandler {
    pub fn new(database: Arc<dyn DatabaseExecutor>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl StepHandler for DatabaseHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let result = self
            .database
            .execute(DatabaseRequest {
                operation: required_str(request.config, "operation")?,
                table: required_str(request.config, "table")?,
                query: optional_str(request.config, "query"),
                params: request.config.get("params").cloned().unwrap_or(Value::Null),
            })
            .await?;

        output(json!({
            "rows_affected": result.rows_affected,
            "rows": result.rows,
        }))
    }
}

pub struct FileUploadHandler {
    files: Arc<dyn FileStore>,
}

impl FileUploadHandler {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl StepHandler for FileUploadHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let stored = self
            .files
            .store_file(FileUploadRequest {
                file_name: required_str(request.config, "file_name")?,
                destination: optional_str(request.config, "destination")
                    .unwrap_or_else(|| "uploads".to_string()),
                content_type: optional_str(request.config, "content_type"),
                source: optional_str(request.config, "source"),
            })
            .await?;

        output(json!({
            "location": stored.location,
            "size_bytes": stored.size_bytes,
        }))
    }
}

pub struct ScriptHandler {
    scripts: Arc<dyn ScriptRunner>,
}

impl ScriptHandler {
    pub fn new(scripts: Arc<dyn ScriptRunner>) -> Self {
        Self { scripts }
    }
}

#[async_trait]
impl StepHandler for ScriptHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let source = optional_str(request.config, "script")
            .or_else(|| optional_str(request.config, "source"))
            .ok_or_else(|| anyhow!("missing required config field 'script'"))?;

        let result = self
            .scripts
            .run_script(ScriptRequest {
                language: optional_str(request.config, "language")
                    .unwrap_or_else(|| "javascript".to_string()),
                source,
                variables: Value::Object(request.variables.clone()),
            })
            .await?;

        Ok(into_map(result.output))
    }
}

/// Collects the configured fields from the execution variables
pub struct FormHandler;

#[async_trait]
impl StepHandler for FormHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let fields = request
            .config
            .get("fields")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut form_data = VariableMap::new();
        let mut missing = Vec::new();

        for field in &fields {
            let (name, required) = match field {
                Value::String(name) => (name.clone(), false),
                Value::Object(attrs) => (
                    attrs.get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| anyhow!("form field is missing a name"))?
                        .to_string(),
                    attrs.get("required").and_then(Value::as_bool).unwrap_or(false),
                ),
                other => bail!("invalid form field definition: {}", other),
            };

            match resolve_path(request.variables, &name) {
                Some(value) if !value.is_null() => {
                    form_data.insert(name, value.clone());
                }
                _ if required => missing.push(name),
                _ => {}
            }
        }

        if !missing.is_empty() {
            bail!("required form field(s) missing: {}", missing.join(", "));
        }

        output(json!({ "form_data": form_data }))
    }
}

/// Evaluates its configured conditions and reports the chosen branch
pub struct DecisionHandler;

#[async_trait]
impl StepHandler for DecisionHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let conditions: Vec<WorkflowCondition> = match request.config.get("conditions") {
            Some(raw) => serde_json::from_value(raw.clone()).context("invalid decision conditions")?,
            None => Vec::new(),
        };

        let decision = evaluate_all(&conditions, request.variables);
        let branch_key = if decision { "true_branch" } else { "false_branch" };

        output(json!({
            "decision": decision,
            "branch": request.config.get(branch_key).cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Sleeps for `duration_ms` (or `duration_secs`); the scheduler's step timeout bounds it
pub struct DelayHandler;

#[async_trait]
impl StepHandler for DelayHandler {
    async fn execute(&self, request: &StepRequest<'_>) -> Result<VariableMap> {
        let duration_ms = request
            .config
            .get("duration_ms")
            .and_then(Value::as_u64)
            .or_else(|| {
                request
                    .config
                    .get("duration_secs")
                    .and_then(Value::as_u64)
                    .map(|s| s.saturating_mul(1_000))
            })
            .ok_or_else(|| anyhow!("delay step requires 'duration_ms' or 'duration_secs'"))?;

        tokio::time::sleep(Duration::from_millis(duration_ms)).await;

        output(json!({ "delayed_ms": duration_ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side_effects::SimulatedSideEffects;
    use crate::types::{StepId, StepType};

    fn map(value: Value) -> VariableMap {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn run(
        handler: &dyn StepHandler,
        step_type: StepType,
        config: Value,
        variables: Value,
    ) -> Result<VariableMap> {
        let step_id = StepId::new("step");
        let config = map(config);
        let variables = map(variables);
        handler
            .execute(&StepRequest {
                step_id: &step_id,
                step_type,
                config: &config,
                input: &variables,
                variables: &variables,
            })
            .await
    }

    #[tokio::test]
    async fn test_task_merges_configured_output() {
        let out = run(
            &TaskHandler,
            StepType::Task,
            json!({"title": "Create account", "output": {"account_id": "acc-1"}}),
            json!({}),
        )
        .await
        .unwrap();

        assert_eq!(out["task"], json!("Create account"));
        assert_eq!(out["account_id"], json!("acc-1"));
    }

    #[tokio::test]
    async fn test_decision_picks_branch() {
        let config = json!({
            "conditions": [{"field": "amount", "operator": "greater_than", "value": 1000}],
            "true_branch": "manual_review",
            "false_branch": "auto_approve"
        });

        let out = run(&DecisionHandler, StepType::Decision, config.clone(), json!({"amount": 50}))
            .await
            .unwrap();
        assert_eq!(out["decision"], json!(false));
        assert_eq!(out["branch"], json!("auto_approve"));

        let out = run(&DecisionHandler, StepType::Decision, config, json!({"amount": 5000}))
            .await
            .unwrap();
        assert_eq!(out["branch"], json!("manual_review"));
    }

    #[tokio::test]
    async fn test_form_reports_missing_required_fields() {
        let config = json!({"fields": ["nickname", {"name": "email", "required": true}]});

        let err = run(&FormHandler, StepType::Form, config.clone(), json!({"nickname": "ada"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("email"));

        let out = run(&FormHandler, StepType::Form, config, json!({"email": "a@b.c"}))
            .await
            .unwrap();
        assert_eq!(out["form_data"], json!({"email": "a@b.c"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_sleeps_configured_duration() {
        let started = tokio::time::Instant::now();
        let out = run(&DelayHandler, StepType::Delay, json!({"duration_secs": 5}), json!({}))
            .await
            .unwrap();

        assert_eq!(out["delayed_ms"], json!(5000));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_slack_uses_channel_as_recipient() {
        let handler = NotificationHandler::new(Arc::new(SimulatedSideEffects), NotificationChannel::Slack);
        let out = run(
            &handler,
            StepType::Slack,
            json!({"channel": "#onboarding", "message": "New hire"}),
            json!({}),
        )
        .await
        .unwrap();

        assert_eq!(out["delivered"], json!(1));
    }

    #[tokio::test]
    async fn test_api_call_requires_endpoint() {
        let handler = ApiHandler::api_call(Arc::new(SimulatedSideEffects));
        let err = run(&handler, StepType::ApiCall, json!({}), json!({})).await.unwrap_err();
        assert!(err.to_string().contains("endpoint"));

        let out = run(&handler, StepType::ApiCall, json!({"url": "/v1/users"}), json!({}))
            .await
            .unwrap();
        assert_eq!(out["status"], json!(200));
    }
}
