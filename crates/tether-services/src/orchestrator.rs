//! Task orchestrator.
//!
//! User requests run local generation → confidence gate → (accept and notify
//! | escalate to the cloud, falling back to the local draft on any cloud
//! failure). Commands from the cloud are dispatched to the local
//! capabilities. Batches run local generation only, one task per prompt.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};

use tether_core::config::TetherConfig;
use tether_core::message::{
    CommandDetails, ConfidentResultNotification, ContractError, LocalResponse, Message,
    RefinementRequest, RemoteCommand,
};
use tether_core::{Envelope, MessageKind, Payload};
use tether_link::{CommandHandler, ConnectionWriter, Reply};

use crate::capability::{AgentExecutor, AgentStatus, BackendError, CloudLink, Generation, TextGenerator};
use crate::confidence::ConfidenceGate;

/// Characters of prompt or output kept in logs and stage previews.
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("local generation failed: {0}")]
    Generation(#[from] BackendError),

    #[error("local model returned empty content")]
    EmptyResult,
}

// ── Result records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    LocalHighConfidence,
    CloudRefined,
    LocalFallback,
    ErrorOrchestration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Error,
    /// The cloud did not answer in time.
    Timeout,
    /// The request never reached the cloud or the link dropped mid-request.
    TransportError,
    /// The cloud answered without a usable refined result.
    CloudFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stage-specific fields, flattened into the record.
    #[serde(flatten)]
    pub extra: Payload,
}

impl StageRecord {
    fn finished(name: &str, status: StageStatus, started: Instant) -> Self {
        Self {
            name: name.to_string(),
            status,
            duration_ms: elapsed_ms(started),
            error: None,
            extra: Payload::new(),
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowDetails {
    pub stages: Vec<StageRecord>,
    pub total_duration_ms: u64,
}

/// What a user request always gets back, success or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutcome {
    pub request_id: String,
    /// `None` only when nothing could be generated.
    pub result_text: Option<String>,
    pub source: ResultSource,
    pub error: Option<String>,
    pub details: FlowDetails,
}

impl RequestOutcome {
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.details.stages.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub request_id: String,
    pub index: usize,
    pub prompt: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BatchItem {
    fn failed(index: usize, prompt: String, error: String) -> Self {
        Self {
            request_id: new_request_id(),
            index,
            prompt,
            status: ItemStatus::Error,
            generated_text: None,
            raw_response: None,
            error_message: Some(error),
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Identity and remote summary reported in status snapshots.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub node_id: String,
    pub remote_host: String,
    pub remote_port: u16,
    /// `None` uses the remote connection's default.
    pub cloud_timeout: Option<Duration>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &TetherConfig) -> Self {
        Self {
            node_id: config.node.node_id.clone(),
            remote_host: config.remote.host.clone(),
            remote_port: config.remote.port,
            cloud_timeout: None,
        }
    }
}

/// Counts one tracked operation for as long as it lives.
struct ActiveTask(Arc<AtomicUsize>);

impl ActiveTask {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TaskOrchestrator {
    settings: OrchestratorSettings,
    generator: Arc<dyn TextGenerator>,
    gate: Arc<ConfidenceGate>,
    agent: Arc<dyn AgentExecutor>,
    cloud: Arc<dyn CloudLink>,
    active: Arc<AtomicUsize>,
}

impl TaskOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        generator: Arc<dyn TextGenerator>,
        gate: Arc<ConfidenceGate>,
        agent: Arc<dyn AgentExecutor>,
        cloud: Arc<dyn CloudLink>,
    ) -> Self {
        Self {
            settings,
            generator,
            gate,
            agent,
            cloud,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    // ── User requests ─────────────────────────────────────────────────────────

    pub async fn process_user_request(&self, prompt: &str) -> RequestOutcome {
        let _active = ActiveTask::enter(&self.active);
        let started = Instant::now();
        let request_id = new_request_id();
        tracing::info!(%request_id, prompt = %preview(prompt), "user request started");

        let mut stages = Vec::new();
        let (result_text, source, error) = match self.run_flow(prompt, started, &mut stages).await {
            Ok((text, source)) => (Some(text), source, None),
            Err(e) => {
                tracing::error!(%request_id, error = %e, "user request failed");
                (None, ResultSource::ErrorOrchestration, Some(e.to_string()))
            }
        };

        let total_duration_ms = elapsed_ms(started);
        tracing::info!(%request_id, ?source, total_duration_ms, "user request finished");
        RequestOutcome {
            request_id,
            result_text,
            source,
            error,
            details: FlowDetails {
                stages,
                total_duration_ms,
            },
        }
    }

    async fn run_flow(
        &self,
        prompt: &str,
        started: Instant,
        stages: &mut Vec<StageRecord>,
    ) -> Result<(String, ResultSource), OrchestrationError> {
        let t = Instant::now();
        let draft = match generate_checked(self.generator.as_ref(), prompt, None).await {
            Ok(generation) => {
                stages.push(
                    StageRecord::finished("local_generation", StageStatus::Success, t)
                        .with("output_preview", Value::String(preview(&generation.text))),
                );
                generation.text
            }
            Err(e) => {
                stages.push(
                    StageRecord::finished("local_generation", StageStatus::Error, t)
                        .with_error(e.to_string()),
                );
                return Err(e);
            }
        };

        let t = Instant::now();
        let assessment = self.gate.assess(&draft, prompt);
        stages.push(
            StageRecord::finished("confidence_assessment", StageStatus::Success, t)
                .with("assessment", serde_json::to_value(&assessment).unwrap_or(Value::Null)),
        );

        if !assessment.requires_cloud_refinement {
            self.notify_confident(ConfidentResultNotification {
                original_user_prompt: prompt.to_string(),
                local_model_final_result: draft.clone(),
                confidence_assessment: assessment,
                local_processing_time_ms: Some(elapsed_ms(started)),
            });
            return Ok((draft, ResultSource::LocalHighConfidence));
        }

        let t = Instant::now();
        let request = RefinementRequest {
            original_user_prompt: prompt.to_string(),
            local_model_draft_result: draft.clone(),
            confidence_assessment: assessment,
            refinement_hints: None,
        };
        let response = self
            .cloud
            .request_refinement(request, self.settings.cloud_timeout)
            .await;

        match response {
            Ok(response) => match response.usable_result() {
                Some(refined) => {
                    let refined = refined.to_string();
                    stages.push(
                        StageRecord::finished("cloud_refinement", StageStatus::Success, t)
                            .with("cloud_tokens_consumed", json!(response.cloud_tokens_consumed)),
                    );
                    Ok((refined, ResultSource::CloudRefined))
                }
                None => {
                    let reason = response
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "cloud returned no usable refined result".into());
                    tracing::warn!(%reason, status = ?response.status, "cloud refinement unusable, using local draft");
                    stages.push(
                        StageRecord::finished("cloud_refinement", StageStatus::CloudFailure, t)
                            .with_error(reason)
                            .with("cloud_response", serde_json::to_value(&response).unwrap_or(Value::Null)),
                    );
                    Ok((draft, ResultSource::LocalFallback))
                }
            },
            Err(e) => {
                let status = if e.is_timeout() {
                    StageStatus::Timeout
                } else {
                    StageStatus::TransportError
                };
                tracing::warn!(error = %e, ?status, "cloud refinement failed, using local draft");
                stages.push(StageRecord::finished("cloud_refinement", status, t).with_error(e.to_string()));
                Ok((draft, ResultSource::LocalFallback))
            }
        }
    }

    /// Detached send; failure is logged only.
    fn notify_confident(&self, notification: ConfidentResultNotification) {
        let cloud = Arc::clone(&self.cloud);
        tokio::spawn(async move {
            if !cloud.send_confident_result(notification).await {
                tracing::debug!("confident result notification not delivered");
            }
        });
    }

    // ── Batches ───────────────────────────────────────────────────────────────

    /// Local generation for every prompt, concurrently. Results come back in
    /// input order; one failed item never affects the others.
    pub async fn process_batch(&self, prompts: &[String], params: Option<&Payload>) -> Vec<BatchItem> {
        if prompts.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = prompts.len(), "batch started");

        let handles: Vec<_> = prompts
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, prompt)| {
                let generator = Arc::clone(&self.generator);
                let active = Arc::clone(&self.active);
                let params = params.cloned();
                tokio::spawn(async move {
                    let _active = ActiveTask::enter(&active);
                    batch_item(generator.as_ref(), index, prompt, params.as_ref()).await
                })
            })
            .collect();

        let items = join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| {
                joined.unwrap_or_else(|e| {
                    BatchItem::failed(index, prompts[index].clone(), format!("batch task failed: {e}"))
                })
            })
            .collect();
        tracing::info!(count = prompts.len(), "batch finished");
        items
    }

    // ── Cloud commands ────────────────────────────────────────────────────────

    /// Answer one envelope from the cloud. Only `remote_command_to_local`
    /// gets a response payload.
    pub async fn handle_remote_command(&self, envelope: &Envelope) -> Option<Payload> {
        let _active = ActiveTask::enter(&self.active);
        if envelope.kind != MessageKind::RemoteCommandToLocal {
            tracing::warn!(kind = %envelope.kind, correlation_id = %envelope.correlation_id, "unhandled message kind, no response");
            return None;
        }

        let action = envelope
            .payload
            .get("command_action")
            .and_then(Value::as_str)
            .unwrap_or("unknown_action")
            .to_string();
        tracing::info!(%action, correlation_id = %envelope.correlation_id, "cloud command received");

        let response = match envelope.message() {
            Ok(Message::RemoteCommand(command)) => {
                match AssertUnwindSafe(self.dispatch_command(&action, &command))
                    .catch_unwind()
                    .await
                {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::error!(%action, "command dispatch panicked");
                        LocalResponse::error(action, "internal error while processing command")
                    }
                }
            }
            Ok(_) => return None,
            Err(ContractError::UnknownCommandAction(value)) => {
                LocalResponse::error(value.clone(), format!("unknown command_action: {value}"))
            }
            Err(e) => LocalResponse::error(action, format!("invalid command: {e}")),
        };
        Some(response_payload(response))
    }

    async fn dispatch_command(&self, action: &str, command: &RemoteCommand) -> LocalResponse {
        let details = match command.details() {
            Ok(details) => details,
            Err(e) => return LocalResponse::error(action, format!("invalid command: {e}")),
        };

        match details {
            CommandDetails::ExecuteTask(task) => {
                tracing::info!(task = %preview(&task.task_description), "executing agent task");
                match self
                    .agent
                    .execute(&task.task_description, task.config_override.as_ref())
                    .await
                {
                    Ok(outcome) => {
                        let data = to_payload(&outcome);
                        match outcome.status {
                            AgentStatus::Success => LocalResponse::success(action, data),
                            AgentStatus::Error => LocalResponse {
                                error_message: Some(
                                    outcome
                                        .error_message
                                        .unwrap_or_else(|| "agent task failed".into()),
                                ),
                                data: Some(data),
                                ..LocalResponse::error(action, String::new())
                            },
                        }
                    }
                    Err(e) => LocalResponse::error(action, format!("agent executor error: {e}")),
                }
            }

            CommandDetails::QueryLocalModel(query) => {
                tracing::info!(prompt = %preview(&query.prompt), "direct local model query");
                match self.generator.generate(&query.prompt, query.params.as_ref()).await {
                    Ok(generation) if !generation.text.trim().is_empty() => {
                        let mut data = Payload::new();
                        data.insert("generated_text".into(), Value::String(generation.text));
                        data.insert("raw_response".into(), generation.raw_response);
                        LocalResponse::success(action, data)
                    }
                    Ok(generation) => {
                        let mut data = Payload::new();
                        data.insert("raw_response".into(), generation.raw_response);
                        LocalResponse {
                            data: Some(data),
                            ..LocalResponse::error(action, "local model returned empty content")
                        }
                    }
                    Err(e) => LocalResponse::error(action, format!("local model query failed: {e}")),
                }
            }

            CommandDetails::GetLocalStatus => LocalResponse::success(action, self.status_snapshot().await),
        }
    }

    /// Node identity, capability health, load and a configuration summary.
    pub async fn status_snapshot(&self) -> Payload {
        let (generation_healthy, agent_health) =
            tokio::join!(self.generator.health(), self.agent.health());
        let snapshot = json!({
            "node_id": self.settings.node_id,
            "generation_backend": if generation_healthy { "healthy" } else { "unhealthy" },
            "agent_executor": agent_health,
            "active_tasks": self.active_tasks(),
            "remote_connected": self.cloud.is_connected(),
            "config": {
                "model": self.generator.model(),
                "confidence_threshold": self.gate.threshold(),
                "remote_host": self.settings.remote_host,
                "remote_port": self.settings.remote_port,
            },
        });
        match snapshot {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }
}

#[async_trait]
impl CommandHandler for TaskOrchestrator {
    async fn handle(&self, envelope: &Envelope, _conn: &ConnectionWriter) -> anyhow::Result<Option<Reply>> {
        Ok(self.handle_remote_command(envelope).await.map(Reply::response))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn generate_checked(
    generator: &dyn TextGenerator,
    prompt: &str,
    params: Option<&Payload>,
) -> Result<Generation, OrchestrationError> {
    let generation = generator.generate(prompt, params).await?;
    if generation.text.trim().is_empty() {
        return Err(OrchestrationError::EmptyResult);
    }
    Ok(generation)
}

async fn batch_item(
    generator: &dyn TextGenerator,
    index: usize,
    prompt: String,
    params: Option<&Payload>,
) -> BatchItem {
    let request_id = new_request_id();
    match generate_checked(generator, &prompt, params).await {
        Ok(generation) => BatchItem {
            request_id,
            index,
            prompt,
            status: ItemStatus::Success,
            generated_text: Some(generation.text),
            raw_response: Some(generation.raw_response),
            error_message: None,
        },
        Err(e) => {
            tracing::warn!(%request_id, index, error = %e, "batch item failed");
            BatchItem {
                request_id,
                error_message: Some(e.to_string()),
                ..BatchItem::failed(index, prompt, String::new())
            }
        }
    }
}

fn response_payload(response: LocalResponse) -> Payload {
    match Message::LocalResponse(response).to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode local response");
            let mut payload = Payload::new();
            payload.insert("original_command_action".into(), Value::String("unknown_action".into()));
            payload.insert("status".into(), Value::String("error".into()));
            payload.insert("error_message".into(), Value::String(e.to_string()));
            payload
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Payload {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Payload::new(),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
