use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::SettingsRepository;
use crate::models::settings::Settings;

#[derive(Debug, Clone)]
pub struct PgSettingsRepository {
    pool: PgPool,
}

impl PgSettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for PgSettingsRepository {
    async fn load(&self) -> Result<Option<Settings>> {
        let row: Option<(Json<Settings>,)> = sqlx::query_as("SELECT data FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load settings")?;
        Ok(row.map(|(data,)| data.0))
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (id, data, updated_at) VALUES (1, $1, NOW())
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()",
        )
        .bind(Json(settings))
        .execute(&self.pool)
        .await
        .context("Failed to save settings")?;
        Ok(())
    }
}
