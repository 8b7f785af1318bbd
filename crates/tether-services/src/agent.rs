use async_trait::async_trait;
use serde_json::{json, Value};

use tether_core::Payload;

use crate::capability::{AgentExecutor, AgentOutcome, BackendError};

/// Stand-in wired when no agentic backend is configured. Every task fails
/// with [`BackendError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredAgent;

#[async_trait]
impl AgentExecutor for UnconfiguredAgent {
    async fn execute(
        &self,
        task_description: &str,
        _config_override: Option<&Payload>,
    ) -> Result<AgentOutcome, BackendError> {
        tracing::warn!(
            task = %task_description.chars().take(100).collect::<String>(),
            "agent task rejected: no agent executor configured"
        );
        Err(BackendError::Unavailable("agent executor".into()))
    }

    async fn health(&self) -> Value {
        json!({"status": "unavailable"})
    }
}
