use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use super::grants::{apply_grant, insert_promocode};
use super::{ActivationOutcome, PromocodeRepository};
use crate::models::grant::Grant;
use crate::models::promocode::{NewPromocode, Promocode, PromocodeActivation};

#[derive(Debug, Clone)]
pub struct PgPromocodeRepository {
    pool: PgPool,
}

impl PgPromocodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PromocodeRepository for PgPromocodeRepository {
    async fn create(&self, promocode: &NewPromocode) -> Result<Option<Promocode>> {
        let mut conn = self.pool.acquire().await?;
        insert_promocode(&mut conn, promocode).await
    }

    async fn get(&self, id: i32) -> Result<Option<Promocode>> {
        sqlx::query_as::<_, Promocode>("SELECT * FROM promocodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch promocode")
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<Promocode>> {
        sqlx::query_as::<_, Promocode>("SELECT * FROM promocodes WHERE code = $1")
            .bind(Promocode::normalize_code(code))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch promocode by code")
    }

    async fn list(&self) -> Result<Vec<Promocode>> {
        sqlx::query_as::<_, Promocode>("SELECT * FROM promocodes ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list promocodes")
    }

    async fn update(&self, promocode: &Promocode) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE promocodes SET code = $1, reward_type = $2, availability = $3, allowed_user_ids = $4,
                reward = $5, plan = $6, lifetime = $7, max_activations = $8, is_active = $9, updated_at = NOW()
             WHERE id = $10",
        )
        .bind(Promocode::normalize_code(&promocode.code))
        .bind(promocode.reward_type)
        .bind(promocode.availability)
        .bind(&promocode.allowed_user_ids)
        .bind(promocode.reward)
        .bind(&promocode.plan)
        .bind(promocode.lifetime)
        .bind(promocode.max_activations)
        .bind(promocode.is_active)
        .bind(promocode.id)
        .execute(&self.pool)
        .await
        .context("Failed to update promocode")?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: i32) -> Result<bool> {
        let result = sqlx::query("DELETE FROM promocodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete promocode")?;
        Ok(result.rows_affected() == 1)
    }

    async fn activations(&self, promocode_id: i32) -> Result<Vec<PromocodeActivation>> {
        sqlx::query_as::<_, PromocodeActivation>(
            "SELECT * FROM promocode_activations WHERE promocode_id = $1 ORDER BY activated_at",
        )
        .bind(promocode_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list activations")
    }

    async fn count_activations(&self, promocode_id: i32) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM promocode_activations WHERE promocode_id = $1")
                .bind(promocode_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn has_activation(&self, promocode_id: i32, telegram_id: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM promocode_activations WHERE promocode_id = $1 AND user_telegram_id = $2)",
        )
        .bind(promocode_id)
        .bind(telegram_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn activate(&self, promocode_id: i32, telegram_id: i64, grant: Grant) -> Result<ActivationOutcome> {
        let mut tx = self.pool.begin().await?;

        let max_activations: i32 =
            sqlx::query_scalar("SELECT max_activations FROM promocodes WHERE id = $1 FOR UPDATE")
                .bind(promocode_id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to lock promocode")?;

        if max_activations >= 0 {
            let used: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM promocode_activations WHERE promocode_id = $1")
                    .bind(promocode_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if used >= max_activations as i64 {
                tx.rollback().await?;
                return Ok(ActivationOutcome::Depleted);
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO promocode_activations (promocode_id, user_telegram_id) VALUES ($1, $2)
             ON CONFLICT (promocode_id, user_telegram_id) DO NOTHING",
        )
        .bind(promocode_id)
        .bind(telegram_id)
        .execute(&mut *tx)
        .await
        .context("Failed to record activation")?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(ActivationOutcome::AlreadyActivated);
        }

        match apply_grant(&mut tx, telegram_id, grant).await? {
            Ok(applied) => {
                tx.commit().await?;
                Ok(ActivationOutcome::Applied(applied))
            }
            Err(rejection) => {
                tx.rollback().await?;
                Ok(ActivationOutcome::Rejected(rejection))
            }
        }
    }
}
