use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::SubscriptionRepository;
use super::grants::insert_subscription_within_limit;
use crate::models::enums::SubscriptionStatus;
use crate::models::subscription::{NewSubscription, PanelView, Subscription, renewed_expiry};

#[derive(Debug, Clone)]
pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn get(&self, id: i64) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscription")
    }

    async fn list_by_user(&self, telegram_id: i64) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_telegram_id = $1 AND status <> 'DELETED' ORDER BY id",
        )
        .bind(telegram_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list subscriptions")
    }

    async fn count_by_user(&self, telegram_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE user_telegram_id = $1 AND status <> 'DELETED'",
        )
        .bind(telegram_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_by_source_payment(&self, payment_id: Uuid) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE source_payment_id = $1 ORDER BY id",
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list subscriptions by payment")
    }

    async fn create_within_limit(
        &self,
        subscription: &NewSubscription,
        max_subscriptions: i32,
        replacing: Option<i64>,
        make_current: bool,
    ) -> Result<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let created = insert_subscription_within_limit(
            &mut tx,
            subscription,
            max_subscriptions,
            replacing,
            make_current,
        )
        .await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn store_panel_view(&self, id: i64, view: &PanelView) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "UPDATE subscriptions SET
                status = CASE WHEN status = 'DELETED' OR expire_at > $2 THEN status ELSE $4 END,
                expire_at = GREATEST(expire_at, $2),
                url = COALESCE($3, url),
                updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(view.expire_at)
        .bind(view.url.as_deref())
        .bind(view.status)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to store panel view")
    }

    async fn set_status(&self, id: i64, status: SubscriptionStatus) -> Result<bool> {
        // DELETED is terminal.
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $1, updated_at = NOW() WHERE id = $2 AND status <> 'DELETED'",
        )
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to set subscription status")?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_renewal(
        &self,
        id: i64,
        payment_id: Uuid,
        days: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<(Subscription, bool)>> {
        let mut tx = self.pool.begin().await?;

        let Some(mut sub) = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock subscription")?
        else {
            return Ok(None);
        };

        let inserted = sqlx::query(
            "INSERT INTO subscription_renewals (payment_id, subscription_id, days) VALUES ($1, $2, $3)
             ON CONFLICT (payment_id, subscription_id) DO NOTHING",
        )
        .bind(payment_id)
        .bind(id)
        .bind(days)
        .execute(&mut *tx)
        .await
        .context("Failed to record renewal")?
        .rows_affected()
            == 1;

        if inserted {
            sub = sqlx::query_as::<_, Subscription>(
                "UPDATE subscriptions SET expire_at = $1,
                    status = CASE WHEN status = 'EXPIRED' THEN 'ACTIVE' ELSE status END,
                    updated_at = NOW()
                 WHERE id = $2
                 RETURNING *",
            )
            .bind(renewed_expiry(sub.expire_at, now, days))
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to extend subscription")?;
        }

        tx.commit().await?;
        Ok(Some((sub, inserted)))
    }

    async fn list_expired_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE status = 'EXPIRED' AND expire_at < $1 ORDER BY expire_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list expired subscriptions")
    }
}
