use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;
use vpnshop_db::Repositories;
use vpnshop_db::models::settings::Settings;

use super::pubsub_service::{PubSubService, SETTINGS_CHANNEL};

/// Read-mostly settings with a TTL cache; writes invalidate locally and
/// broadcast so other processes drop their copy too.
#[derive(Clone)]
pub struct SettingsService {
    repos: Repositories,
    cache: Arc<RwLock<Option<(Instant, Settings)>>>,
    ttl: Duration,
    pubsub: Option<Arc<PubSubService>>,
}

impl SettingsService {
    pub fn new(repos: Repositories, ttl: Duration, pubsub: Option<Arc<PubSubService>>) -> Self {
        Self {
            repos,
            cache: Arc::new(RwLock::new(None)),
            ttl,
            pubsub,
        }
    }

    pub async fn get(&self) -> Result<Settings> {
        if let Some((loaded_at, settings)) = self.cache.read().await.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(settings.clone());
            }
        }

        let settings = self.load().await?;
        *self.cache.write().await = Some((Instant::now(), settings.clone()));
        Ok(settings)
    }

    /// Applies `mutate` to a fresh copy and persists it.
    pub async fn update<F>(&self, mutate: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings) + Send,
    {
        let mut settings = self.load().await?;
        mutate(&mut settings);
        self.store(&settings).await?;
        Ok(settings)
    }

    pub async fn reset_to_defaults(&self) -> Result<Settings> {
        let settings = Settings::default();
        self.store(&settings).await?;
        info!("Settings reset to defaults");
        Ok(settings)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn load(&self) -> Result<Settings> {
        match self.repos.settings.load().await.context("Failed to load settings")? {
            Some(settings) => Ok(settings),
            None => {
                let settings = Settings::default();
                self.repos.settings.save(&settings).await?;
                info!("Initialized default settings");
                Ok(settings)
            }
        }
    }

    async fn store(&self, settings: &Settings) -> Result<()> {
        self.repos.settings.save(settings).await.context("Failed to save settings")?;
        self.invalidate().await;
        if let Some(pubsub) = &self.pubsub {
            pubsub.announce(SETTINGS_CHANNEL, "changed").await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnshop_db::memory::MemoryStore;
    use vpnshop_db::models::enums::AccessMode;

    #[tokio::test]
    async fn first_read_persists_defaults() {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let service = SettingsService::new(repos.clone(), Duration::from_secs(60), None);

        let settings = service.get().await.unwrap();
        assert_eq!(settings, Settings::default());
        assert!(repos.settings.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_is_visible_through_the_cache() {
        let repos = MemoryStore::new().repositories();
        let service = SettingsService::new(repos, Duration::from_secs(600), None);
        assert_eq!(service.get().await.unwrap().access_mode, AccessMode::Public);

        service.update(|s| s.access_mode = AccessMode::Invited).await.unwrap();
        assert_eq!(service.get().await.unwrap().access_mode, AccessMode::Invited);

        service.reset_to_defaults().await.unwrap();
        assert_eq!(service.get().await.unwrap().access_mode, AccessMode::Public);
    }
}
