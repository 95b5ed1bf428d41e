//! Contracts for the external systems steps and actions talk to.
//!
//! The engine never sends email or calls webhooks itself; it builds one of the request
//! shapes below and hands it to the injected collaborator. `SimulatedSideEffects` is a
//! stand-in that only logs, used by default and in development.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Confirmation returned by message-style collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub accepted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    InApp,
    Slack,
    Push,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub channel: NotificationChannel,
    pub recipients: Vec<String>,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRequest {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsRequest {
    pub to: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Logical service name (e.g. `crm`, `billing`)
    pub service: String,
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRequest {
    pub operation: String,
    pub table: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseResult {
    pub rows_affected: u64,
    #[serde(default)]
    pub rows: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUploadRequest {
    pub file_name: String,
    pub destination: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFile {
    pub location: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub variables: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    #[serde(default)]
    pub output: Value,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> Result<DeliveryReceipt>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, request: EmailRequest) -> Result<DeliveryReceipt>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_sms(&self, request: SmsRequest) -> Result<DeliveryReceipt>;
}

#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn call_webhook(&self, request: WebhookRequest) -> Result<HttpResponse>;
}

#[async_trait]
pub trait ApiCaller: Send + Sync {
    async fn call_api(&self, request: ApiRequest) -> Result<HttpResponse>;
}

#[async_trait]
pub trait DatabaseExecutor: Send + Sync {
    async fn execute(&self, request: DatabaseRequest) -> Result<DatabaseResult>;
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn store_file(&self, request: FileUploadRequest) -> Result<StoredFile>;
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run_script(&self, request: ScriptRequest) -> Result<ScriptResult>;
}

/// The full set of collaborators injected into step handlers and the action dispatcher
#[derive(Clone)]
pub struct SideEffects {
    pub notifications: Arc<dyn NotificationSender>,
    pub email: Arc<dyn EmailSender>,
    pub sms: Arc<dyn SmsSender>,
    pub webhooks: Arc<dyn WebhookCaller>,
    pub api: Arc<dyn ApiCaller>,
    pub database: Arc<dyn DatabaseExecutor>,
    pub files: Arc<dyn FileStore>,
    pub scripts: Arc<dyn ScriptRunner>,
}

impl SideEffects {
    /// Every collaborator backed by `SimulatedSideEffects`
    pub fn simulated() -> Self {
        let sim = Arc::new(SimulatedSideEffects);
        Self {
            notifications: sim.clone(),
            email: sim.clone(),
            sms: sim.clone(),
            webhooks: sim.clone(),
            api: sim.clone(),
            database: sim.clone(),
            files: sim.clone(),
            scripts: sim,
        }
    }
}

impl Default for SideEffects {
    fn default() -> Self {
        Self::simulated()
    }
}

/// Logs each request and reports success without contacting anything
pub struct SimulatedSideEffects;

fn receipt(accepted: usize) -> DeliveryReceipt {
    DeliveryReceipt {
        message_id: uuid::Uuid::new_v4().to_string(),
        accepted,
    }
}

#[async_trait]
impl NotificationSender for SimulatedSideEffects {
    async fn notify(&self, request: NotificationRequest) -> Result<DeliveryReceipt> {
        tracing::info!(
            "Would send {:?} notification '{}' to {} recipient(s)",
            request.channel,
            request.title,
            request.recipients.len()
        );
        Ok(receipt(request.recipients.len()))
    }
}

#[async_trait]
impl EmailSender for SimulatedSideEffects {
    async fn send_email(&self, request: EmailRequest) -> Result<DeliveryReceipt> {
        tracing::info!("Would send email '{}' to {:?}", request.subject, request.to);
        Ok(receipt(request.to.len()))
    }
}

#[async_trait]
impl SmsSender for SimulatedSideEffects {
    async fn send_sms(&self, request: SmsRequest) -> Result<DeliveryReceipt> {
        tracing::info!("Would send SMS to {:?}", request.to);
        Ok(receipt(request.to.len()))
    }
}

#[async_trait]
impl WebhookCaller for SimulatedSideEffects {
    async fn call_webhook(&self, request: WebhookRequest) -> Result<HttpResponse> {
        tracing::info!("Would call webhook {} {}", request.method, request.url);
        Ok(HttpResponse {
            status: 200,
            body: serde_json::json!({ "received": true }),
        })
    }
}

#[async_trait]
impl ApiCaller for SimulatedSideEffects {
    async fn call_api(&self, request: ApiRequest) -> Result<HttpResponse> {
        tracing::info!(
            "Would call {} API: {} {}",
            request.service,
            request.method,
            request.endpoint
        );
        Ok(HttpResponse {
            status: 200,
            body: serde_json::json!({ "service": request.service }),
        })
    }
}

#[async_trait]
impl DatabaseExecutor for SimulatedSideEffects {
    async fn execute(&self, request: DatabaseRequest) -> Result<DatabaseResult> {
        tracing::info!("Would run {} on table {}", request.operation, request.table);
        Ok(DatabaseResult {
            rows_affected: 0,
            rows: Vec::new(),
        })
    }
}

#[async_trait]
impl FileStore for SimulatedSideEffects {
    async fn store_file(&self, request: FileUploadRequest) -> Result<StoredFile> {
        tracing::info!("Would store {} in {}", request.file_name, request.destination);
        Ok(StoredFile {
            location: format!(
                "{}/{}",
                request.destination.trim_end_matches('/'),
                request.file_name
            ),
            size_bytes: 0,
        })
    }
}

#[async_trait]
impl ScriptRunner for SimulatedSideEffects {
    async fn run_script(&self, request: ScriptRequest) -> Result<ScriptResult> {
        tracing::info!("Would run {} script ({} bytes)", request.language, request.source.len());
        Ok(ScriptResult {
            output: Value::Null,
        })
    }
}
