//! tether-services: escalation policy and the capabilities it drives.
//!
//! The confidence gate decides whether a local answer is good enough. The
//! orchestrator sequences generation, assessment, escalation and fallback,
//! and answers commands from the cloud node.

pub mod agent;
pub mod capability;
pub mod confidence;
pub mod generation;
pub mod orchestrator;
pub mod rouge;

pub use agent::UnconfiguredAgent;
pub use capability::{
    AgentExecutor, AgentOutcome, AgentStatus, BackendError, CloudLink, Generation,
    ScoreDetail, SimilarityScorer, TextGenerator,
};
pub use confidence::{ConfidenceGate, KeywordSet};
pub use generation::OpenAiGenerator;
pub use orchestrator::{
    BatchItem, OrchestrationError, RequestOutcome, ResultSource, TaskOrchestrator,
};
pub use rouge::RougeL;
