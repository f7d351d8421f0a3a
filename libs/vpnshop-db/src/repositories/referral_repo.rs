use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use super::grants::apply_grant;
use super::{ExchangeOutcome, ReferralRepository, RewardOutcome};
use crate::models::grant::Grant;
use crate::models::referral::{NewPointsExchange, NewReferralReward, Referral, ReferralReward};

#[derive(Debug, Clone)]
pub struct PgReferralRepository {
    pool: PgPool,
}

impl PgReferralRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferralRepository for PgReferralRepository {
    async fn create(&self, referrer: i64, referred: i64) -> Result<Option<Referral>> {
        sqlx::query_as::<_, Referral>(
            "INSERT INTO referrals (referrer_telegram_id, referred_telegram_id) VALUES ($1, $2)
             ON CONFLICT (referred_telegram_id) DO NOTHING
             RETURNING *",
        )
        .bind(referrer)
        .bind(referred)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to create referral")
    }

    async fn get_by_referred(&self, referred: i64) -> Result<Option<Referral>> {
        sqlx::query_as::<_, Referral>("SELECT * FROM referrals WHERE referred_telegram_id = $1")
            .bind(referred)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch referral")
    }

    async fn list_by_referrer(&self, referrer: i64) -> Result<Vec<Referral>> {
        sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals WHERE referrer_telegram_id = $1 ORDER BY created_at",
        )
        .bind(referrer)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list referrals")
    }

    async fn has_reward_for(&self, inviter: i64, referred: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM referral_rewards WHERE user_telegram_id = $1 AND referred_telegram_id = $2)",
        )
        .bind(inviter)
        .bind(referred)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn rewards_for(&self, inviter: i64) -> Result<Vec<ReferralReward>> {
        sqlx::query_as::<_, ReferralReward>(
            "SELECT * FROM referral_rewards WHERE user_telegram_id = $1 ORDER BY created_at",
        )
        .bind(inviter)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list referral rewards")
    }

    async fn record_reward(&self, reward: &NewReferralReward, grant: Option<Grant>) -> Result<RewardOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO referral_rewards (user_telegram_id, referred_telegram_id, level, reward_type, amount, payment_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (payment_id, user_telegram_id, level) DO NOTHING",
        )
        .bind(reward.user_telegram_id)
        .bind(reward.referred_telegram_id)
        .bind(reward.level)
        .bind(reward.reward_type)
        .bind(reward.amount)
        .bind(reward.payment_id)
        .execute(&mut *tx)
        .await
        .context("Failed to record referral reward")?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(RewardOutcome::Duplicate);
        }

        let applied = match grant {
            Some(grant) => match apply_grant(&mut tx, reward.user_telegram_id, grant).await? {
                Ok(applied) => applied,
                Err(rejection) => {
                    tx.rollback().await?;
                    return Ok(RewardOutcome::Rejected(rejection));
                }
            },
            None => Default::default(),
        };

        tx.commit().await?;
        Ok(RewardOutcome::Recorded(applied))
    }

    async fn exchange_points(&self, exchange: &NewPointsExchange, grant: Grant) -> Result<ExchangeOutcome> {
        let mut tx = self.pool.begin().await?;

        let balance: i64 =
            sqlx::query_scalar("SELECT points FROM users WHERE telegram_id = $1 FOR UPDATE")
                .bind(exchange.user_telegram_id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to lock user points")?;

        if balance < exchange.points_spent {
            tx.rollback().await?;
            return Ok(ExchangeOutcome::InsufficientPoints { balance });
        }

        sqlx::query("UPDATE users SET points = points - $1, updated_at = NOW() WHERE telegram_id = $2")
            .bind(exchange.points_spent)
            .bind(exchange.user_telegram_id)
            .execute(&mut *tx)
            .await
            .context("Failed to debit points")?;

        let applied = match apply_grant(&mut tx, exchange.user_telegram_id, grant).await? {
            Ok(applied) => applied,
            Err(rejection) => {
                tx.rollback().await?;
                return Ok(ExchangeOutcome::Rejected(rejection));
            }
        };

        sqlx::query(
            "INSERT INTO points_exchanges (user_telegram_id, exchange_type, points_spent, quantity) VALUES ($1, $2, $3, $4)",
        )
        .bind(exchange.user_telegram_id)
        .bind(exchange.exchange_type)
        .bind(exchange.points_spent)
        .bind(exchange.quantity)
        .execute(&mut *tx)
        .await
        .context("Failed to log points exchange")?;

        tx.commit().await?;
        Ok(ExchangeOutcome::Applied {
            applied,
            points_left: balance - exchange.points_spent,
        })
    }
}
