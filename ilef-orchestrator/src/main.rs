use anyhow::Context;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ilef_orchestrator::bootstrap::SshCliConnector;
use ilef_orchestrator::events::{parse_command, publish_event};
use ilef_orchestrator::image_inspector::{DockerCli, ImageInspector};
use ilef_orchestrator::provider_manager::ProviderManager;
use ilef_orchestrator::provisioning::Orchestrator;
use ilef_orchestrator::settings::Settings;
use ilef_orchestrator::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let settings = Settings::from_env();

    let redis_url = settings
        .redis_url
        .clone()
        .context("REDIS_URL must be set")?;
    let redis_client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;

    let providers = ProviderManager::from_settings(&settings);
    let inspector = ImageInspector::new(
        Arc::new(DockerCli::default()),
        settings.primary_registry.clone(),
        settings.fallback_registry.clone(),
    );
    let orchestrator = Orchestrator::new(
        Arc::new(SshCliConnector::new(settings.ssh_command_timeout)),
        Arc::new(inspector),
        settings.runtime_registry.clone(),
        settings.policy,
    );
    let command_channel = settings.command_channel.clone();
    let result_channel = Arc::new(settings.result_channel.clone());
    let worker = Arc::new(Worker::new(providers, orchestrator, settings));

    let mut pubsub = redis_client
        .get_async_pubsub()
        .await
        .context("Failed to connect to Redis (subscriber)")?;
    pubsub.subscribe(&command_channel).await?;
    tracing::info!("🎧 Orchestrator listening on Redis channel '{}'...", command_channel);

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("⚠️ [Bus] unreadable payload: {}", e);
                continue;
            }
        };
        let command = match parse_command(&payload) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("⚠️ [Bus] {:#}", e);
                continue;
            }
        };

        let worker = worker.clone();
        let redis_client = redis_client.clone();
        let result_channel = result_channel.clone();
        tokio::spawn(async move {
            let request_id = command.request_id();
            if let Some(event) = worker.handle(command).await {
                if let Err(e) = publish_event(&redis_client, &result_channel, event).await {
                    tracing::error!("❌ [Bus] failed to publish result for {}: {:#}", request_id, e);
                }
            }
        });
    }

    tracing::warn!("⚠️ [Bus] subscription stream ended, {} requests in flight", worker.in_flight());
    Ok(())
}
