use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::settings_service::SettingsService;

pub const JOBS_CHANNEL: &str = "vpnshop:jobs";
pub const SETTINGS_CHANNEL: &str = "vpnshop:settings";

/// Cross-process wake-ups: new jobs for idle workers and settings cache drops.
pub struct PubSubService {
    redis_url: String,
    publisher: ConnectionManager,
}

impl PubSubService {
    pub async fn new(redis_url: String) -> Result<Arc<Self>> {
        let client = redis::Client::open(redis_url.clone())?;
        let publisher = ConnectionManager::new(client).await?;
        Ok(Arc::new(Self { redis_url, publisher }))
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Best-effort publish; workers also poll, so a lost message only delays.
    pub async fn announce(&self, channel: &str, message: &str) {
        if let Err(e) = self.publish(channel, message).await {
            warn!("Failed to publish on {}: {}", channel, e);
        }
    }

    /// Subscribes until canceled, reconnecting after failures.
    pub async fn listen(self: Arc<Self>, wake: Arc<Notify>, settings: SettingsService, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.subscription_loop(&wake, &settings) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        }
        info!("PubSub listener stopped");
    }

    async fn subscription_loop(&self, wake: &Notify, settings: &SettingsService) {
        info!("PubSub: connecting to Redis...");
        let client = match redis::Client::open(self.redis_url.clone()) {
            Ok(client) => client,
            Err(e) => {
                error!("Redis client error: {}", e);
                return;
            }
        };
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                error!("PubSub connection failed: {}", e);
                return;
            }
        };
        for channel in [JOBS_CHANNEL, SETTINGS_CHANNEL] {
            if let Err(e) = pubsub.subscribe(channel).await {
                error!("PubSub subscribe to {} failed: {}", channel, e);
                return;
            }
        }

        info!("PubSub: subscribed to {} and {}", JOBS_CHANNEL, SETTINGS_CHANNEL);
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_channel_name() {
                JOBS_CHANNEL => {
                    debug!("PubSub: job wake-up");
                    wake.notify_waiters();
                }
                SETTINGS_CHANNEL => {
                    debug!("PubSub: settings changed elsewhere");
                    settings.invalidate().await;
                }
                other => debug!("PubSub: ignoring message on {}", other),
            }
        }
        warn!("PubSub stream ended. Reconnecting...");
    }
}
