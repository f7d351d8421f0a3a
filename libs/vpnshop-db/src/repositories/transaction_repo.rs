use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::TransactionRepository;
use super::job_repo::insert_job;
use crate::models::enums::TransactionStatus;
use crate::models::job::NewJob;
use crate::models::transaction::{NewTransaction, Transaction};

#[derive(Debug, Clone)]
pub struct PgTransactionRepository {
    pool: PgPool,
}

impl PgTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionRepository for PgTransactionRepository {
    async fn create(&self, transaction: &NewTransaction) -> Result<Transaction> {
        sqlx::query_as::<_, Transaction>(
            "INSERT INTO transactions (payment_id, user_telegram_id, status, is_test, purchase_type, gateway_type, currency,
                original_amount, discount_percent, final_amount, plan, renew_subscription_id, renew_subscription_ids, device_types)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             RETURNING *",
        )
        .bind(transaction.payment_id)
        .bind(transaction.user_telegram_id)
        .bind(transaction.status)
        .bind(transaction.is_test)
        .bind(transaction.purchase_type)
        .bind(transaction.gateway_type)
        .bind(transaction.currency)
        .bind(transaction.pricing.original_amount)
        .bind(transaction.pricing.discount_percent)
        .bind(transaction.pricing.final_amount)
        .bind(Json(&transaction.plan))
        .bind(transaction.renew_subscription_id)
        .bind(&transaction.renew_subscription_ids)
        .bind(transaction.device_types.as_ref().map(Json))
        .fetch_one(&self.pool)
        .await
        .context("Failed to create transaction")
    }

    async fn get(&self, payment_id: Uuid) -> Result<Option<Transaction>> {
        sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE payment_id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch transaction")
    }

    async fn list_by_user(&self, telegram_id: i64) -> Result<Vec<Transaction>> {
        sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE user_telegram_id = $1 ORDER BY created_at DESC",
        )
        .bind(telegram_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions")
    }

    async fn set_payment_url(&self, payment_id: Uuid, url: &str) -> Result<()> {
        sqlx::query("UPDATE transactions SET payment_url = $1, updated_at = NOW() WHERE payment_id = $2")
            .bind(url)
            .bind(payment_id)
            .execute(&self.pool)
            .await
            .context("Failed to store payment url")?;
        Ok(())
    }

    async fn transition(
        &self,
        payment_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transactions SET status = $1, updated_at = NOW(),
                 completed_at = CASE WHEN $1 = 'COMPLETED' THEN NOW() ELSE completed_at END
             WHERE payment_id = $2 AND status = $3",
        )
        .bind(to)
        .bind(payment_id)
        .bind(from)
        .execute(&self.pool)
        .await
        .context("Failed to update transaction status")?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_and_enqueue(&self, payment_id: Uuid, jobs: &[NewJob]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE transactions SET status = 'COMPLETED', updated_at = NOW(), completed_at = NOW()
             WHERE payment_id = $1 AND status = 'PENDING'",
        )
        .bind(payment_id)
        .execute(&mut *tx)
        .await
        .context("Failed to complete transaction")?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for job in jobs {
            insert_job(&mut tx, job).await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}
