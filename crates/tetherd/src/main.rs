//! tetherd: edge inference node.
//!
//! Keeps a persistent link to the cloud node, serves cloud-issued commands,
//! and escalates low-confidence local answers.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use tracing_subscriber::EnvFilter;

use tether_core::config::TetherConfig;
use tether_core::Envelope;
use tether_link::{CommandListener, LinkSettings, RemoteConnection};
use tether_services::orchestrator::OrchestratorSettings;
use tether_services::{
    AgentExecutor, CloudLink, ConfidenceGate, OpenAiGenerator, RougeL, TaskOrchestrator,
    TextGenerator, UnconfiguredAgent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Config is read before logging exists; problems are reported once it does.
    let default_written = TetherConfig::write_default_if_missing();
    let loaded = TetherConfig::load();
    let config = loaded.as_ref().cloned().unwrap_or_default();

    let (filter, bad_level) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, None),
        Err(_) => match EnvFilter::try_new(&config.node.log_level) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new("info"), Some(e)),
        },
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = default_written {
        tracing::warn!(error = %e, "failed to write default config");
    }
    if let Err(e) = &loaded {
        tracing::warn!(error = %e, "failed to load config, using defaults");
    }
    if let Some(e) = bad_level {
        tracing::warn!(level = %config.node.log_level, error = %e, "invalid log level, using info");
    }
    tracing::info!(
        node_id = %config.node.node_id,
        remote = %format!("{}:{}", config.remote.host, config.remote.port),
        listener = %config.listener.bind_addr(),
        "tetherd starting"
    );

    // ── Capabilities ─────────────────────────────────────────────────────────

    let generator: Arc<dyn TextGenerator> = Arc::new(
        OpenAiGenerator::new(&config.generation).context("failed to build generation client")?,
    );
    let agent: Arc<dyn AgentExecutor> = Arc::new(UnconfiguredAgent);
    let gate = Arc::new(ConfidenceGate::from_config(&config.confidence, Arc::new(RougeL)));

    // ── Remote connection ────────────────────────────────────────────────────

    let remote = RemoteConnection::new(LinkSettings::from_config(&config));
    remote.set_unsolicited_handler(Arc::new(|envelope: Envelope| {
        async move {
            tracing::info!(
                kind = %envelope.kind,
                correlation_id = %envelope.correlation_id,
                "unsolicited message from cloud"
            );
        }
        .boxed()
    }));
    remote.set_disconnect_handler(Arc::new(|| {
        async {
            tracing::info!("cloud link down, maintain loop will reconnect");
        }
        .boxed()
    }));

    let cloud: Arc<dyn CloudLink> = Arc::new(remote.clone());
    let orchestrator = Arc::new(TaskOrchestrator::new(
        OrchestratorSettings::from_config(&config),
        Arc::clone(&generator),
        gate,
        agent,
        cloud,
    ));

    remote.spawn_maintain_loop();
    {
        let generator = Arc::clone(&generator);
        let orchestrator = Arc::clone(&orchestrator);
        remote.start_heartbeat_loop(
            Some(Arc::new(move || {
                let generator = Arc::clone(&generator);
                async move { generator.health().await }.boxed()
            })),
            Some(Arc::new(move || orchestrator.active_tasks())),
        );
    }

    // ── Shutdown signal ──────────────────────────────────────────────────────

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Command listener ─────────────────────────────────────────────────────

    let listener = CommandListener::bind(&config.listener.bind_addr(), orchestrator.clone())
        .await
        .with_context(|| format!("failed to bind command listener on {}", config.listener.bind_addr()))?;
    let mut listener_task = tokio::spawn(listener.run(shutdown_tx.subscribe()));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv()      => {
            tracing::info!("shutting down");
            // The listener saw the same broadcast; wait for its connections to wind down.
            if let Err(e) = (&mut listener_task).await {
                tracing::warn!(error = %e, "command listener task failed");
            }
        }
        r = &mut listener_task      => tracing::error!("command listener exited: {:?}", r),
    }

    remote.close().await;
    tracing::info!("tetherd stopped");
    Ok(())
}
