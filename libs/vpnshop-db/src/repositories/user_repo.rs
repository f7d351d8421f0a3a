use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use super::UserRepository;
use crate::models::enums::UserRole;
use crate::models::user::{NewUser, User};

#[derive(Debug, Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn get(&self, telegram_id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE telegram_id = $1")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")
    }

    async fn get_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by referral code")
    }

    async fn referral_code_exists(&self, code: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE referral_code = $1)")
                .bind(code)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn create(&self, user: &NewUser) -> Result<User> {
        sqlx::query(
            "INSERT INTO users (telegram_id, username, name, language, role, referral_code)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (telegram_id) DO NOTHING",
        )
        .bind(user.telegram_id)
        .bind(&user.username)
        .bind(&user.name)
        .bind(&user.language)
        .bind(user.role)
        .bind(&user.referral_code)
        .execute(&self.pool)
        .await
        .context("Failed to create user")?;

        self.get(user.telegram_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User {} vanished after insert", user.telegram_id))
    }

    async fn list_by_min_role(&self, role: UserRole) -> Result<Vec<User>> {
        let roles: Vec<&str> = UserRole::ALL
            .iter()
            .filter(|r| **r >= role)
            .map(|r| r.as_str())
            .collect();
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE role = ANY($1) ORDER BY telegram_id")
            .bind(roles)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list users by role")
    }

    async fn set_invited_by(&self, telegram_id: i64, inviter: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET invited_by = $1, updated_at = NOW()
             WHERE telegram_id = $2 AND invited_by IS NULL AND telegram_id <> $1",
        )
        .bind(inviter)
        .bind(telegram_id)
        .execute(&self.pool)
        .await
        .context("Failed to set inviter")?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_role(&self, telegram_id: i64, role: UserRole) -> Result<()> {
        sqlx::query("UPDATE users SET role = $1, updated_at = NOW() WHERE telegram_id = $2")
            .bind(role)
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_blocked(&self, telegram_id: i64, blocked: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_blocked = $1, updated_at = NOW() WHERE telegram_id = $2")
            .bind(blocked)
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_discounts(&self, telegram_id: i64, personal: i32, purchase: i32) -> Result<()> {
        sqlx::query(
            "UPDATE users SET personal_discount = $1, purchase_discount = $2, updated_at = NOW() WHERE telegram_id = $3",
        )
        .bind(personal.clamp(0, 100))
        .bind(purchase.clamp(0, 100))
        .bind(telegram_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_max_subscriptions(&self, telegram_id: i64, value: Option<i32>) -> Result<()> {
        sqlx::query("UPDATE users SET max_subscriptions = $1, updated_at = NOW() WHERE telegram_id = $2")
            .bind(value)
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_current_subscription(&self, telegram_id: i64, subscription_id: Option<i64>) -> Result<()> {
        sqlx::query(
            "UPDATE users SET current_subscription_id = $1, updated_at = NOW() WHERE telegram_id = $2",
        )
        .bind(subscription_id)
        .bind(telegram_id)
        .execute(&self.pool)
        .await
        .context("Failed to set current subscription")?;
        Ok(())
    }

    async fn mark_trial_used(&self, telegram_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET is_trial_used = TRUE, updated_at = NOW() WHERE telegram_id = $1 AND is_trial_used = FALSE",
        )
        .bind(telegram_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn adjust_points(&self, telegram_id: i64, delta: i64) -> Result<Option<i64>> {
        let points: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET points = points + $1, updated_at = NOW()
             WHERE telegram_id = $2 AND points + $1 >= 0
             RETURNING points",
        )
        .bind(delta)
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to adjust points")?;
        Ok(points)
    }
}
