//! Capability seams consumed by the orchestrator.
//!
//! Each trait is the whole contract between the policy code and a backend.
//! The daemon wires real backends; tests wire fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::message::{ConfidentResultNotification, RefinementRequest, RefinementResponse};
use tether_core::Payload;
use tether_link::{LinkError, RemoteConnection};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode backend response: {0}")]
    Decode(String),

    #[error("{0} is not available")]
    Unavailable(String),
}

// ── Local generation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Backend response body, passed through to command replies.
    pub raw_response: Value,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// `params` entries override the backend's default request fields.
    async fn generate(&self, prompt: &str, params: Option<&Payload>) -> Result<Generation, BackendError>;

    async fn health(&self) -> bool;

    /// Identifier reported in status snapshots.
    fn model(&self) -> &str;
}

// ── Agentic tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Error,
}

/// Structured result of one agentic task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentOutcome {
    pub fn success(outcome: Value) -> Self {
        Self {
            status: AgentStatus::Success,
            outcome: Some(outcome),
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Error,
            outcome: None,
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        task_description: &str,
        config_override: Option<&Payload>,
    ) -> Result<AgentOutcome, BackendError>;

    /// Free-form status record for status snapshots.
    async fn health(&self) -> Value;
}

// ── Similarity ────────────────────────────────────────────────────────────────

/// A score plus whatever component scores the scorer reports.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreDetail {
    pub score: f64,
    pub raw: Option<Value>,
}

/// Pure text similarity in [0, 1].
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, candidate: &str, reference: &str) -> f64;

    fn score_with_detail(&self, candidate: &str, reference: &str) -> ScoreDetail {
        ScoreDetail {
            score: self.score(candidate, reference),
            raw: None,
        }
    }
}

// ── Cloud link ────────────────────────────────────────────────────────────────

/// The two send primitives the orchestrator needs from the remote connection.
#[async_trait]
pub trait CloudLink: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn request_refinement(
        &self,
        request: RefinementRequest,
        timeout: Option<Duration>,
    ) -> Result<RefinementResponse, LinkError>;

    /// Fire-and-forget. `false` means the notification was not written.
    async fn send_confident_result(&self, notification: ConfidentResultNotification) -> bool;
}

#[async_trait]
impl CloudLink for RemoteConnection {
    fn is_connected(&self) -> bool {
        RemoteConnection::is_connected(self)
    }

    async fn request_refinement(
        &self,
        request: RefinementRequest,
        timeout: Option<Duration>,
    ) -> Result<RefinementResponse, LinkError> {
        self.request_cloud_refinement(request, timeout).await
    }

    async fn send_confident_result(&self, notification: ConfidentResultNotification) -> bool {
        self.send_confident_result_notification(notification).await
    }
}
