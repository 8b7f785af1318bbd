//! Message contract for edge ↔ cloud traffic.
//!
//! Every frame on the wire is an [`Envelope`]: a correlation id, a kind tag,
//! a UTC timestamp and an open JSON payload. The payload shape is fixed by the
//! kind alone. [`Envelope::message`] validates the payload against that kind's
//! schema and yields a typed [`Message`]; nothing downstream touches the raw
//! map before that check has passed.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Open, kind-dependent payload mapping.
pub type Payload = Map<String, Value>;

// ── Kinds ─────────────────────────────────────────────────────────────────────

/// Message kind discriminator. Serialized as the `message_type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    RemoteCommandToLocal,
    LocalResponseToRemote,
    LocalRequestCloudRefinement,
    CloudRefinementResponseToLocal,
    LocalConfidentResultNotification,
    Heartbeat,
    ErrorResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        Self::RemoteCommandToLocal,
        Self::LocalResponseToRemote,
        Self::LocalRequestCloudRefinement,
        Self::CloudRefinementResponseToLocal,
        Self::LocalConfidentResultNotification,
        Self::Heartbeat,
        Self::ErrorResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteCommandToLocal => "remote_command_to_local",
            Self::LocalResponseToRemote => "local_response_to_remote",
            Self::LocalRequestCloudRefinement => "local_request_cloud_refinement",
            Self::CloudRefinementResponseToLocal => "cloud_refinement_response_to_local",
            Self::LocalConfidentResultNotification => "local_confident_result_notification",
            Self::Heartbeat => "heartbeat",
            Self::ErrorResponse => "error_response",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == value)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A payload or envelope that does not match its kind's schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("{kind}: missing required field `{field}`")]
    MissingField { kind: MessageKind, field: String },

    #[error("{kind}: invalid payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },

    #[error("{kind}: payload must be a JSON object")]
    NotAnObject { kind: MessageKind },

    #[error("unknown message_type `{0}`")]
    UnknownKind(String),

    #[error("unknown command_action: {0}")]
    UnknownCommandAction(String),
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// The on-wire frame. Field names are part of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Links a request to its response. Generated when the sender omits it.
    #[serde(rename = "task_id", default = "new_correlation_id")]
    pub correlation_id: String,

    #[serde(rename = "message_type")]
    pub kind: MessageKind,

    /// ISO-8601 UTC with an explicit `Z` suffix.
    #[serde(default = "utc_timestamp")]
    pub timestamp: String,

    pub payload: Payload,
}

impl Envelope {
    /// Build an envelope from a raw payload, validating it against `kind`.
    pub fn new(kind: MessageKind, payload: Payload) -> Result<Self, ContractError> {
        Message::parse(kind, &payload)?;
        Ok(Self {
            correlation_id: new_correlation_id(),
            kind,
            timestamp: utc_timestamp(),
            payload,
        })
    }

    /// Build an envelope from a typed message. Gets a fresh correlation id.
    pub fn from_message(message: &Message) -> Result<Self, ContractError> {
        Ok(Self {
            correlation_id: new_correlation_id(),
            kind: message.kind(),
            timestamp: utc_timestamp(),
            payload: message.to_payload()?,
        })
    }

    /// Response envelope reusing this envelope's correlation id. The payload
    /// is not validated: replies may carry handler-defined shapes.
    pub fn reply(&self, kind: MessageKind, payload: Payload) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            kind,
            timestamp: utc_timestamp(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Validate the payload against this envelope's kind.
    pub fn message(&self) -> Result<Message, ContractError> {
        Message::parse(self.kind, &self.payload)
    }

    /// `error_response` envelope carrying `{"error", "details"}`.
    pub fn error_response(correlation_id: impl Into<String>, error: &str, details: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert("error".into(), Value::String(error.to_string()));
        payload.insert("details".into(), Value::String(details.to_string()));
        Self {
            correlation_id: correlation_id.into(),
            kind: MessageKind::ErrorResponse,
            timestamp: utc_timestamp(),
            payload,
        }
    }
}

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── Typed messages ────────────────────────────────────────────────────────────

/// Sum type over every payload schema, one variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RemoteCommand(RemoteCommand),
    LocalResponse(LocalResponse),
    RefinementRequest(RefinementRequest),
    RefinementResponse(RefinementResponse),
    ConfidentResult(ConfidentResultNotification),
    Heartbeat(Heartbeat),
    Error(ErrorReport),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RemoteCommand(_) => MessageKind::RemoteCommandToLocal,
            Self::LocalResponse(_) => MessageKind::LocalResponseToRemote,
            Self::RefinementRequest(_) => MessageKind::LocalRequestCloudRefinement,
            Self::RefinementResponse(_) => MessageKind::CloudRefinementResponseToLocal,
            Self::ConfidentResult(_) => MessageKind::LocalConfidentResultNotification,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
            Self::Error(_) => MessageKind::ErrorResponse,
        }
    }

    /// Validate `payload` against the schema selected by `kind`.
    pub fn parse(kind: MessageKind, payload: &Payload) -> Result<Self, ContractError> {
        match kind {
            MessageKind::RemoteCommandToLocal => {
                let command = RemoteCommand::parse(payload)?;
                // Details are checked here so a bad command never gets past the boundary.
                command.details()?;
                Ok(Self::RemoteCommand(command))
            }
            MessageKind::LocalResponseToRemote => {
                require(kind, payload, &["original_command_action", "status"])?;
                decode(kind, payload).map(Self::LocalResponse)
            }
            MessageKind::LocalRequestCloudRefinement => {
                require(
                    kind,
                    payload,
                    &["original_user_prompt", "local_model_draft_result", "confidence_assessment"],
                )?;
                decode(kind, payload).map(Self::RefinementRequest)
            }
            MessageKind::CloudRefinementResponseToLocal => {
                require(kind, payload, &["status"])?;
                decode(kind, payload).map(Self::RefinementResponse)
            }
            MessageKind::LocalConfidentResultNotification => {
                require(
                    kind,
                    payload,
                    &["original_user_prompt", "local_model_final_result", "confidence_assessment"],
                )?;
                decode(kind, payload).map(Self::ConfidentResult)
            }
            MessageKind::Heartbeat => {
                require(kind, payload, &["local_server_id"])?;
                decode(kind, payload).map(Self::Heartbeat)
            }
            MessageKind::ErrorResponse => {
                require(kind, payload, &["error"])?;
                decode(kind, payload).map(Self::Error)
            }
        }
    }

    pub fn to_payload(&self) -> Result<Payload, ContractError> {
        let kind = self.kind();
        match self {
            Self::RemoteCommand(m) => encode(kind, m),
            Self::LocalResponse(m) => encode(kind, m),
            Self::RefinementRequest(m) => encode(kind, m),
            Self::RefinementResponse(m) => encode(kind, m),
            Self::ConfidentResult(m) => encode(kind, m),
            Self::Heartbeat(m) => encode(kind, m),
            Self::Error(m) => encode(kind, m),
        }
    }
}

fn require(kind: MessageKind, payload: &Payload, fields: &[&str]) -> Result<(), ContractError> {
    for field in fields {
        match payload.get(*field) {
            Some(Value::Null) | None => {
                return Err(ContractError::MissingField {
                    kind,
                    field: (*field).to_string(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(kind: MessageKind, payload: &Payload) -> Result<T, ContractError> {
    serde_json::from_value(Value::Object(payload.clone())).map_err(|e| {
        ContractError::InvalidPayload {
            kind,
            reason: e.to_string(),
        }
    })
}

fn encode<T: Serialize>(kind: MessageKind, value: &T) -> Result<Payload, ContractError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ContractError::NotAnObject { kind }),
        Err(e) => Err(ContractError::InvalidPayload {
            kind,
            reason: e.to_string(),
        }),
    }
}

// ── remote_command_to_local ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    #[serde(alias = "execute_owl_task")]
    ExecuteTask,
    #[serde(alias = "query_local_model_direct")]
    QueryLocalModel,
    GetLocalStatus,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteTask => "execute_task",
            Self::QueryLocalModel => "query_local_model",
            Self::GetLocalStatus => "get_local_status",
        }
    }

    /// Canonical names plus the legacy aliases still sent by older cloud nodes.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "execute_task" | "execute_owl_task" => Some(Self::ExecuteTask),
            "query_local_model" | "query_local_model_direct" => Some(Self::QueryLocalModel),
            "get_local_status" => Some(Self::GetLocalStatus),
            _ => None,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub command_action: CommandAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_details: Option<Payload>,
}

impl RemoteCommand {
    pub fn new(command_action: CommandAction, command_details: Option<Payload>) -> Self {
        Self {
            command_action,
            command_details,
        }
    }

    fn parse(payload: &Payload) -> Result<Self, ContractError> {
        let kind = MessageKind::RemoteCommandToLocal;
        let action = match payload.get("command_action") {
            None | Some(Value::Null) => {
                return Err(ContractError::MissingField {
                    kind,
                    field: "command_action".into(),
                })
            }
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(ContractError::InvalidPayload {
                    kind,
                    reason: format!("command_action must be a string, got {other}"),
                })
            }
        };
        if CommandAction::parse(action).is_none() {
            return Err(ContractError::UnknownCommandAction(action.clone()));
        }
        decode(kind, payload)
    }

    /// Typed view of `command_details` for this command's action.
    pub fn details(&self) -> Result<CommandDetails, ContractError> {
        let kind = MessageKind::RemoteCommandToLocal;
        let empty = Payload::new();
        let details = self.command_details.as_ref().unwrap_or(&empty);
        let nested = |field: &str| ContractError::MissingField {
            kind,
            field: format!("command_details.{field}"),
        };
        match self.command_action {
            CommandAction::ExecuteTask => {
                if !details.contains_key("task_description")
                    && !details.contains_key("agent_task_description")
                {
                    return Err(nested("task_description"));
                }
                decode(kind, details).map(CommandDetails::ExecuteTask)
            }
            CommandAction::QueryLocalModel => {
                if !details.contains_key("prompt") {
                    return Err(nested("prompt"));
                }
                decode(kind, details).map(CommandDetails::QueryLocalModel)
            }
            CommandAction::GetLocalStatus => Ok(CommandDetails::GetLocalStatus),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandDetails {
    ExecuteTask(ExecuteTaskDetails),
    QueryLocalModel(QueryLocalModelDetails),
    GetLocalStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTaskDetails {
    #[serde(alias = "agent_task_description")]
    pub task_description: String,
    #[serde(default, alias = "owl_agent_config", skip_serializing_if = "Option::is_none")]
    pub config_override: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLocalModelDetails {
    pub prompt: String,
    #[serde(default = "default_query_params", alias = "vllm_params")]
    pub params: Option<Payload>,
}

/// Parameters used when a query names none: `max_tokens: 256, temperature: 0.7`.
pub fn default_query_params() -> Option<Payload> {
    let mut params = Payload::new();
    params.insert("max_tokens".into(), Value::from(256));
    params.insert("temperature".into(), Value::from(0.7));
    Some(params)
}

// ── local_response_to_remote ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    ProcessingAsync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalResponse {
    /// Echo of the command action (raw string, so unknown actions echo too).
    pub original_command_action: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LocalResponse {
    pub fn success(action: impl Into<String>, data: Payload) -> Self {
        Self {
            original_command_action: action.into(),
            status: ResponseStatus::Success,
            data: Some(data),
            error_message: None,
        }
    }

    pub fn error(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            original_command_action: action.into(),
            status: ResponseStatus::Error,
            data: None,
            error_message: Some(message.into()),
        }
    }
}

// ── Confidence assessment (embedded) ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    #[serde(default, alias = "rouge_l_score", skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
    /// Matched trigger keywords, in keyword-list order.
    #[serde(default)]
    pub keyword_triggers_found: Vec<String>,
    /// Authoritative escalation decision.
    pub requires_cloud_refinement: bool,
    #[serde(default)]
    pub details: Payload,
}

// ── local_request_cloud_refinement ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRequest {
    pub original_user_prompt: String,
    pub local_model_draft_result: String,
    pub confidence_assessment: ConfidenceAssessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement_hints: Option<Payload>,
}

// ── cloud_refinement_response_to_local ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStatus {
    Success,
    Error,
    PartialSuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementDiagnostics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_for_error_or_partial: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementResponse {
    pub status: RefinementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_local_draft_preserved: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_tokens_consumed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<RefinementDiagnostics>,
}

impl RefinementResponse {
    pub fn success(refined: impl Into<String>) -> Self {
        Self {
            status: RefinementStatus::Success,
            refined_result: Some(refined.into()),
            original_local_draft_preserved: None,
            cloud_tokens_consumed: None,
            error_message: None,
            diagnostics: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: RefinementStatus::Error,
            refined_result: None,
            original_local_draft_preserved: None,
            cloud_tokens_consumed: None,
            error_message: Some(message.into()),
            diagnostics: None,
        }
    }

    /// The refined text, only when the cloud reported full success with a
    /// non-empty result.
    pub fn usable_result(&self) -> Option<&str> {
        match (&self.status, self.refined_result.as_deref()) {
            (RefinementStatus::Success, Some(text)) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }
}

// ── local_confident_result_notification ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidentResultNotification {
    pub original_user_prompt: String,
    pub local_model_final_result: String,
    pub confidence_assessment: ConfidenceAssessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_processing_time_ms: Option<u64>,
}

// ── heartbeat ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    #[default]
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub local_server_id: String,
    #[serde(default)]
    pub status: HeartbeatStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tasks_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, alias = "vllm_health_status", skip_serializing_if = "Option::is_none")]
    pub backend_healthy: Option<bool>,
}

impl Heartbeat {
    pub fn ok(node_id: impl Into<String>, model_name: Option<String>) -> Self {
        Self {
            local_server_id: node_id.into(),
            status: HeartbeatStatus::Ok,
            gpu_usage_percent: None,
            active_tasks_count: None,
            model_name,
            backend_healthy: None,
        }
    }
}

// ── error_response ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
