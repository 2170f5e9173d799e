//! External processing pipeline and notification seams.
//!
//! The plan/generate/apply stages live out of process. This crate only
//! hands a task over and records what came back; the pipeline drives
//! task status itself through the task service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// What a pipeline run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// Human-readable response to surface to the requester.
    pub response: String,
    /// True when the pipeline paused the task for user input.
    #[serde(default)]
    pub awaiting_input: bool,
    /// Kind of input expected, e.g. "approval" or "answer".
    #[serde(default)]
    pub input_type: Option<String>,
}

/// The external processor for change-request tasks.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Process a task, either from its initial input or a follow-up
    /// user message.
    async fn process(
        &self,
        task_id: Uuid,
        user_input: &str,
    ) -> Result<ProcessOutcome, PipelineError>;
}

/// Delivery of task responses to an external callback.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        webhook_url: &str,
        task_id: Uuid,
        response: &str,
    ) -> Result<(), PipelineError>;
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    task_id: Uuid,
    user_input: &'a str,
}

/// HTTP pipeline client.
pub struct HttpPipeline {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPipeline {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Pipeline for HttpPipeline {
    async fn process(
        &self,
        task_id: Uuid,
        user_input: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        let url = format!("{}/process", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&ProcessRequest { task_id, user_input })
            .send()
            .await
            .map_err(|e| PipelineError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PipelineError::Request(format!(
                "processor returned {}",
                resp.status()
            )));
        }

        resp.json::<ProcessOutcome>()
            .await
            .map_err(|e| PipelineError::InvalidResponse(e.to_string()))
    }
}

/// Pushes task responses to per-task webhook URLs.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(
        &self,
        webhook_url: &str,
        task_id: Uuid,
        response: &str,
    ) -> Result<(), PipelineError> {
        let payload = serde_json::json!({
            "task_id": task_id,
            "response": response,
        });
        let resp = self
            .client
            .post(webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::Notify(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PipelineError::Notify(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
