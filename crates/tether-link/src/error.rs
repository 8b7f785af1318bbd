use std::time::Duration;

use tether_core::ContractError;

/// Failure of one call on the remote connection. The connection itself
/// recovers on its own; these only describe the affected call.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("not connected to the cloud node")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection lost while request {0} was pending")]
    ConnectionLost(String),

    #[error("request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("invalid response to {correlation_id}: {reason}")]
    InvalidResponse {
        correlation_id: String,
        reason: String,
    },

    #[error("cloud rejected {correlation_id}: {error}")]
    Rejected {
        correlation_id: String,
        error: String,
    },

    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl LinkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
