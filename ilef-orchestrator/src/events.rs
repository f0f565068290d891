use anyhow::Context;
use ilef_common::bus::{Command, Event, EventEnvelope};
use redis::AsyncCommands;

pub const EVENT_SOURCE: &str = "ilef-orchestrator";

pub async fn publish_event(redis_client: &redis::Client, channel: &str, event: Event) -> anyhow::Result<()> {
    let mut conn = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis (publisher)")?;
    let payload = serde_json::to_string(&EventEnvelope::new(event, EVENT_SOURCE))?;
    let _: () = conn.publish(channel, payload).await?;
    Ok(())
}

/// Parse one bus payload. Unknown `type`s and malformed bodies are errors.
pub fn parse_command(payload: &str) -> anyhow::Result<Command> {
    serde_json::from_str(payload).with_context(|| format!("invalid command payload: {}", payload))
}
