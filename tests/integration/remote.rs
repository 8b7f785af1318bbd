//! RemoteConnection against a live loopback cloud.

use crate::*;

use futures::FutureExt;
use tether_core::message::{
    ConfidenceAssessment, ConfidentResultNotification, Heartbeat, HeartbeatStatus, RefinementRequest,
};
use tether_link::{ConnectionState, LinkError, RemoteConnection};

fn refinement(prompt: &str) -> RefinementRequest {
    RefinementRequest {
        original_user_prompt: prompt.into(),
        local_model_draft_result: format!("draft for {prompt}"),
        confidence_assessment: ConfidenceAssessment {
            similarity_score: Some(0.1),
            keyword_triggers_found: Vec::new(),
            requires_cloud_refinement: true,
            details: Default::default(),
        },
        refinement_hints: None,
    }
}

async fn connected(cloud: &FakeCloud) -> RemoteConnection {
    let remote = RemoteConnection::new(link_settings(cloud.port()));
    assert!(remote.connect().await, "connect to fake cloud");
    remote
}

#[tokio::test]
async fn refinement_round_trip() {
    let mut cloud = FakeCloud::start(CloudMode::EchoPrompt).await;
    let remote = connected(&cloud).await;

    let response = remote
        .request_cloud_refinement(refinement("explain tides"), None)
        .await
        .unwrap();
    assert_eq!(response.usable_result(), Some("refined: explain tides"));
    assert_eq!(remote.pending_requests(), 0);

    let sent = cloud
        .next_of(MessageKind::LocalRequestCloudRefinement, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(sent.payload["original_user_prompt"], "explain tides");
    assert!(sent.payload["confidence_assessment"]["requires_cloud_refinement"]
        .as_bool()
        .unwrap());

    remote.close().await;
}

/// A cloud that holds two requests and answers them in reverse order.
async fn reversing_cloud() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read, mut write) = stream.into_split();
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut held = Vec::new();
        while held.len() < 2 {
            let n = read.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            decoder.extend(&buf[..n]);
            while let Some(line) = decoder.next_line() {
                let env = decode_line(&line.unwrap()).unwrap();
                if env.kind == MessageKind::LocalRequestCloudRefinement {
                    held.push(env);
                }
            }
        }
        for env in held.iter().rev() {
            let prompt = env.payload["original_user_prompt"].as_str().unwrap();
            let payload = Message::RefinementResponse(RefinementResponse::success(format!(
                "answer: {prompt}"
            )))
            .to_payload()
            .unwrap();
            let reply = env.reply(MessageKind::CloudRefinementResponseToLocal, payload);
            write.write_all(&encode_frame(&reply).unwrap()).await.unwrap();
        }
        // Keep the socket open until the client goes away.
        let _ = read.read(&mut buf).await;
    });
    port
}

#[tokio::test]
async fn interleaved_requests_resolve_by_correlation_id() {
    let port = reversing_cloud().await;
    let remote = RemoteConnection::new(link_settings(port));
    assert!(remote.connect().await);

    let (a, b) = tokio::join!(
        remote.request_cloud_refinement(refinement("first"), None),
        remote.request_cloud_refinement(refinement("second"), None),
    );
    assert_eq!(a.unwrap().usable_result(), Some("answer: first"));
    assert_eq!(b.unwrap().usable_result(), Some("answer: second"));
    assert_eq!(remote.pending_requests(), 0);

    remote.close().await;
}

#[tokio::test]
async fn silent_cloud_times_out_and_link_survives() {
    let cloud = FakeCloud::start(CloudMode::Silent).await;
    let remote = connected(&cloud).await;

    let err = remote
        .request_cloud_refinement(refinement("slow"), Some(Duration::from_millis(150)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err}");
    assert_eq!(remote.pending_requests(), 0);
    assert!(remote.is_connected());

    cloud.set_mode(CloudMode::Refine("recovered".into()));
    let ok = remote
        .request_cloud_refinement(refinement("again"), None)
        .await
        .unwrap();
    assert_eq!(ok.usable_result(), Some("recovered"));

    remote.close().await;
}

#[tokio::test]
async fn error_response_rejects_request() {
    let cloud = FakeCloud::start(CloudMode::Reject).await;
    let remote = connected(&cloud).await;

    match remote.request_cloud_refinement(refinement("x"), None).await {
        Err(LinkError::Rejected { error, .. }) => {
            assert!(error.contains("refinement unavailable"));
            assert!(error.contains("cloud model offline"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    remote.close().await;
}

#[tokio::test]
async fn requests_fail_fast_when_disconnected() {
    let remote = RemoteConnection::new(link_settings(free_port().await));
    assert!(matches!(
        remote.request_cloud_refinement(refinement("x"), None).await,
        Err(LinkError::NotConnected)
    ));
    assert!(!remote.send_heartbeat(None).await);
    assert_eq!(remote.pending_requests(), 0);
}

#[tokio::test]
async fn cloud_drop_fails_pending_request() {
    let cloud = FakeCloud::start(CloudMode::Silent).await;
    let remote = connected(&cloud).await;

    let pending = {
        let remote = remote.clone();
        tokio::spawn(async move {
            remote
                .request_cloud_refinement(refinement("doomed"), Some(Duration::from_secs(10)))
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(2), || remote.pending_requests() == 1).await);

    cloud.drop_connections();
    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending request resolved")
        .unwrap();
    assert!(matches!(result, Err(LinkError::ConnectionLost(_))));
    assert_eq!(remote.pending_requests(), 0);
    assert!(wait_until(Duration::from_secs(1), || !remote.is_connected()).await);

    remote.close().await;
}

#[tokio::test]
async fn maintain_loop_reconnects_after_cloud_drop() {
    let cloud = FakeCloud::start(CloudMode::Silent).await;
    let remote = RemoteConnection::new(link_settings(cloud.port()));
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let drops = Arc::clone(&drops);
        remote.set_disconnect_handler(Arc::new(move || {
            drops.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        }));
    }
    remote.spawn_maintain_loop();

    assert!(wait_until(Duration::from_secs(2), || remote.is_connected()).await);
    assert_eq!(cloud.accepted(), 1);

    cloud.drop_connections();
    assert!(
        wait_until(Duration::from_secs(2), || {
            cloud.accepted() >= 2 && remote.is_connected()
        })
        .await,
        "link came back"
    );
    assert!(wait_until(Duration::from_secs(1), || drops.load(Ordering::SeqCst) == 1).await);
    assert_eq!(remote.reconnect_delay(), Duration::from_millis(50));

    remote.close().await;
    assert_eq!(remote.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn maintain_loop_backs_off_until_cloud_appears() {
    let port = free_port().await;
    let remote = RemoteConnection::new(link_settings(port));
    remote.spawn_maintain_loop();

    // 50 + 100 + 200 + 200 ms of failed attempts.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!remote.is_connected());
    let delay = remote.reconnect_delay();
    assert!(delay > Duration::from_millis(50), "delay grew: {delay:?}");
    assert!(delay <= Duration::from_millis(200), "delay capped: {delay:?}");

    let cloud = FakeCloud::start_on(&format!("127.0.0.1:{port}"), CloudMode::Silent).await;
    assert!(wait_until(Duration::from_secs(2), || remote.is_connected()).await);
    assert_eq!(cloud.accepted(), 1);
    assert_eq!(remote.reconnect_delay(), Duration::from_millis(50));

    remote.close().await;
}

#[tokio::test]
async fn heartbeats_carry_health_telemetry() {
    let mut cloud = FakeCloud::start(CloudMode::Silent).await;
    let remote = connected(&cloud).await;
    remote.start_heartbeat_loop(
        Some(Arc::new(|| async { false }.boxed())),
        Some(Arc::new(|| 3)),
    );

    let env = cloud
        .next_of(MessageKind::Heartbeat, Duration::from_secs(2))
        .await
        .expect("heartbeat delivered");
    let Ok(Message::Heartbeat(hb)) = env.message() else {
        panic!("heartbeat payload");
    };
    assert_eq!(hb.local_server_id, NODE_ID);
    assert_eq!(hb.active_tasks_count, Some(3));
    assert_eq!(hb.backend_healthy, Some(false));
    assert_eq!(hb.status, HeartbeatStatus::Warning);
    assert_eq!(hb.model_name.as_deref(), Some("test-model"));

    remote.close().await;
}

#[tokio::test]
async fn explicit_heartbeat_and_notification_are_written() {
    let mut cloud = FakeCloud::start(CloudMode::Silent).await;
    let remote = connected(&cloud).await;

    assert!(remote.send_heartbeat(Some(Heartbeat::ok("custom-node", None))).await);
    let hb = cloud
        .next_of(MessageKind::Heartbeat, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(hb.payload["local_server_id"], "custom-node");

    let notification = ConfidentResultNotification {
        original_user_prompt: "p".into(),
        local_model_final_result: "r".into(),
        confidence_assessment: refinement("p").confidence_assessment,
        local_processing_time_ms: Some(12),
    };
    assert!(remote.send_confident_result_notification(notification).await);
    let n = cloud
        .next_of(MessageKind::LocalConfidentResultNotification, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(n.payload["local_model_final_result"], "r");
    assert_eq!(remote.pending_requests(), 0);

    remote.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_final() {
    let cloud = FakeCloud::start(CloudMode::Silent).await;
    let remote = connected(&cloud).await;
    remote.spawn_maintain_loop();
    remote.start_heartbeat_loop(None, None);

    remote.close().await;
    remote.close().await;
    assert!(!remote.is_connected());
    assert!(!remote.connect().await, "no reconnect after close");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cloud.accepted(), 1);
}
