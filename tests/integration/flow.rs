//! Full request flow: orchestrator, real cloud link, scripted cloud node.

use crate::*;

use async_trait::async_trait;
use serde_json::json;
use tether_core::Payload;
use tether_link::{CommandListener, RemoteConnection};
use tether_services::orchestrator::{OrchestratorSettings, StageStatus};
use tether_services::{
    BackendError, CloudLink, ConfidenceGate, Generation, KeywordSet, ResultSource, RougeL,
    TaskOrchestrator, TextGenerator, UnconfiguredAgent,
};

/// Answers with the prompt itself, or a fixed draft.
struct ScriptedModel(Option<&'static str>);

#[async_trait]
impl TextGenerator for ScriptedModel {
    async fn generate(&self, prompt: &str, _params: Option<&Payload>) -> Result<Generation, BackendError> {
        let text = self.0.map(str::to_string).unwrap_or_else(|| prompt.to_string());
        Ok(Generation {
            raw_response: json!({"choices": [{"message": {"content": text}}]}),
            text,
        })
    }

    async fn health(&self) -> bool {
        true
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

struct Node {
    remote: RemoteConnection,
    orchestrator: Arc<TaskOrchestrator>,
}

async fn node(cloud: &FakeCloud, model: ScriptedModel, cloud_timeout: Option<Duration>) -> Node {
    let remote = RemoteConnection::new(link_settings(cloud.port()));
    assert!(remote.connect().await);
    let gate = ConfidenceGate::new(0.3, KeywordSet::new(["urgent"]), Arc::new(RougeL));
    let settings = OrchestratorSettings {
        node_id: NODE_ID.into(),
        remote_host: "127.0.0.1".into(),
        remote_port: cloud.port(),
        cloud_timeout,
    };
    let cloud_link: Arc<dyn CloudLink> = Arc::new(remote.clone());
    let orchestrator = Arc::new(TaskOrchestrator::new(
        settings,
        Arc::new(model),
        Arc::new(gate),
        Arc::new(UnconfiguredAgent),
        cloud_link,
    ));
    Node { remote, orchestrator }
}

#[tokio::test]
async fn confident_answer_notifies_cloud_once() {
    let mut cloud = FakeCloud::start(CloudMode::Refine("unused".into())).await;
    let node = node(&cloud, ScriptedModel(None), None).await;

    let prompt = "Write a short poem about spring";
    let out = node.orchestrator.process_user_request(prompt).await;
    assert_eq!(out.source, ResultSource::LocalHighConfidence);
    assert_eq!(out.result_text.as_deref(), Some(prompt));

    let n = cloud
        .next_of(MessageKind::LocalConfidentResultNotification, Duration::from_secs(2))
        .await
        .expect("notification delivered");
    assert_eq!(n.payload["local_model_final_result"], prompt);
    assert_eq!(n.payload["confidence_assessment"]["requires_cloud_refinement"], false);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let rest = cloud.drain();
    assert!(rest
        .iter()
        .all(|e| e.kind != MessageKind::LocalRequestCloudRefinement && e.kind != n.kind));

    node.remote.close().await;
}

#[tokio::test]
async fn keyword_prompt_is_refined_by_cloud() {
    let mut cloud = FakeCloud::start(CloudMode::Refine("X".into())).await;
    let node = node(&cloud, ScriptedModel(None), None).await;

    let out = node.orchestrator.process_user_request("urgent: restart the pump").await;
    assert_eq!(out.source, ResultSource::CloudRefined);
    assert_eq!(out.result_text.as_deref(), Some("X"));
    assert!(out.error.is_none());

    let req = cloud
        .next_of(MessageKind::LocalRequestCloudRefinement, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(req.payload["local_model_draft_result"], "urgent: restart the pump");
    assert_eq!(req.payload["confidence_assessment"]["keyword_triggers_found"], json!(["urgent"]));
    assert_eq!(node.remote.pending_requests(), 0);

    node.remote.close().await;
}

#[tokio::test]
async fn low_similarity_draft_is_refined() {
    let cloud = FakeCloud::start(CloudMode::EchoPrompt).await;
    let node = node(&cloud, ScriptedModel(Some("completely unrelated words")), None).await;

    let out = node.orchestrator.process_user_request("describe ocean tides").await;
    assert_eq!(out.source, ResultSource::CloudRefined);
    assert_eq!(out.result_text.as_deref(), Some("refined: describe ocean tides"));

    node.remote.close().await;
}

#[tokio::test]
async fn silent_cloud_falls_back_to_local_draft() {
    let cloud = FakeCloud::start(CloudMode::Silent).await;
    let node = node(
        &cloud,
        ScriptedModel(Some("local draft")),
        Some(Duration::from_millis(200)),
    )
    .await;

    let out = node.orchestrator.process_user_request("urgent question").await;
    assert_eq!(out.source, ResultSource::LocalFallback);
    assert_eq!(out.result_text.as_deref(), Some("local draft"));
    assert!(out.error.is_none());
    assert_eq!(out.stage("cloud_refinement").unwrap().status, StageStatus::Timeout);
    assert_eq!(node.remote.pending_requests(), 0);

    node.remote.close().await;
}

#[tokio::test]
async fn disconnected_link_falls_back_without_waiting() {
    let cloud = FakeCloud::start(CloudMode::Refine("X".into())).await;
    let node = node(&cloud, ScriptedModel(Some("local draft")), None).await;
    node.remote.close().await;

    let started = tokio::time::Instant::now();
    let out = node.orchestrator.process_user_request("urgent question").await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(out.source, ResultSource::LocalFallback);
    assert_eq!(out.result_text.as_deref(), Some("local draft"));
}

#[tokio::test]
async fn cloud_commands_over_the_listener() {
    let cloud = FakeCloud::start(CloudMode::Silent).await;
    let node = node(&cloud, ScriptedModel(Some("forty-two")), None).await;

    let listener = CommandListener::bind("127.0.0.1:0", node.orchestrator.clone())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, _) = broadcast::channel(1);
    let task = tokio::spawn(listener.run(shutdown.subscribe()));
    let mut client = CommandClient::connect(addr).await.unwrap();

    let query = command(json!({
        "command_action": "query_local_model",
        "command_details": {"prompt": "answer?"}
    }));
    client.send(&query).await.unwrap();
    let reply = client.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.kind, MessageKind::LocalResponseToRemote);
    assert_eq!(reply.correlation_id, query.correlation_id);
    assert_eq!(reply.payload["status"], "success");
    assert_eq!(reply.payload["data"]["generated_text"], "forty-two");

    let status = command(json!({"command_action": "get_local_status"}));
    client.send(&status).await.unwrap();
    let reply = client.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.payload["original_command_action"], "get_local_status");
    assert_eq!(reply.payload["data"]["node_id"], NODE_ID);
    assert_eq!(reply.payload["data"]["remote_connected"], true);

    let task_cmd = command(json!({
        "command_action": "execute_task",
        "command_details": {"task_description": "summarise logs"}
    }));
    client.send(&task_cmd).await.unwrap();
    let reply = client.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.payload["status"], "error");
    assert!(reply.payload["error_message"].as_str().unwrap().contains("agent executor"));

    let _ = shutdown.send(());
    let _ = task.await;
    node.remote.close().await;
}
