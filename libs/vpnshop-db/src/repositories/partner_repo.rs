use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::PartnerRepository;
use crate::models::enums::WithdrawalStatus;
use crate::models::partner::{
    NewPartnerReferral, NewPartnerTransaction, NewWithdrawal, Partner, PartnerIndividualSettings,
    PartnerReferral, PartnerTransaction, PartnerWithdrawal, WithdrawalRequestOutcome,
    WithdrawalResolveOutcome,
};

#[derive(Debug, Clone)]
pub struct PgPartnerRepository {
    pool: PgPool,
}

impl PgPartnerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PartnerRepository for PgPartnerRepository {
    async fn create(&self, telegram_id: i64) -> Result<(Partner, bool)> {
        let created = sqlx::query_as::<_, Partner>(
            "INSERT INTO partners (user_telegram_id) VALUES ($1)
             ON CONFLICT (user_telegram_id) DO NOTHING
             RETURNING *",
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to create partner")?;

        if let Some(partner) = created {
            return Ok((partner, true));
        }

        let existing = self
            .get_by_user(telegram_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Partner for user {} not found", telegram_id))?;
        Ok((existing, false))
    }

    async fn get(&self, id: i64) -> Result<Option<Partner>> {
        sqlx::query_as::<_, Partner>("SELECT * FROM partners WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch partner")
    }

    async fn get_by_user(&self, telegram_id: i64) -> Result<Option<Partner>> {
        sqlx::query_as::<_, Partner>("SELECT * FROM partners WHERE user_telegram_id = $1")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch partner by user")
    }

    async fn list(&self) -> Result<Vec<Partner>> {
        sqlx::query_as::<_, Partner>("SELECT * FROM partners ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list partners")
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE partners SET is_active = $1, updated_at = NOW() WHERE id = $2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_individual_settings(&self, id: i64, settings: &PartnerIndividualSettings) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE partners SET individual_settings = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(Json(settings))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update partner settings")?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_referrals(&self, referrals: &[NewPartnerReferral]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0;

        for referral in referrals {
            let inserted = sqlx::query(
                "INSERT INTO partner_referrals (partner_id, referral_telegram_id, level, parent_partner_id)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (partner_id, referral_telegram_id) DO NOTHING",
            )
            .bind(referral.partner_id)
            .bind(referral.referral_telegram_id)
            .bind(referral.level)
            .bind(referral.parent_partner_id)
            .execute(&mut *tx)
            .await
            .context("Failed to insert partner referral")?
            .rows_affected();

            if inserted == 0 {
                continue;
            }

            let counter = match referral.level {
                1 => "referrals_count",
                2 => "level2_referrals_count",
                _ => "level3_referrals_count",
            };
            sqlx::query(&format!(
                "UPDATE partners SET {counter} = {counter} + 1, updated_at = NOW() WHERE id = $1"
            ))
            .bind(referral.partner_id)
            .execute(&mut *tx)
            .await
            .context("Failed to bump referral counter")?;
            added += 1;
        }

        tx.commit().await?;
        Ok(added)
    }

    async fn get_referral(&self, referral_telegram_id: i64, level: i16) -> Result<Option<PartnerReferral>> {
        sqlx::query_as::<_, PartnerReferral>(
            "SELECT * FROM partner_referrals WHERE referral_telegram_id = $1 AND level = $2 ORDER BY id LIMIT 1",
        )
        .bind(referral_telegram_id)
        .bind(level)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch partner referral")
    }

    async fn list_referrals(&self, partner_id: i64) -> Result<Vec<PartnerReferral>> {
        sqlx::query_as::<_, PartnerReferral>(
            "SELECT * FROM partner_referrals WHERE partner_id = $1 ORDER BY level, created_at",
        )
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list partner referrals")
    }

    async fn has_transaction_for(&self, partner_id: i64, referral_telegram_id: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM partner_transactions WHERE partner_id = $1 AND referral_telegram_id = $2)",
        )
        .bind(partner_id)
        .bind(referral_telegram_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_transactions(&self, partner_id: i64) -> Result<Vec<PartnerTransaction>> {
        sqlx::query_as::<_, PartnerTransaction>(
            "SELECT * FROM partner_transactions WHERE partner_id = $1 ORDER BY created_at DESC",
        )
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list partner transactions")
    }

    async fn credit(&self, transaction: &NewPartnerTransaction) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO partner_transactions (partner_id, referral_telegram_id, level, payment_amount, percent, earned_amount, source_payment_id, description)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (partner_id, source_payment_id) WHERE source_payment_id IS NOT NULL DO NOTHING",
        )
        .bind(transaction.partner_id)
        .bind(transaction.referral_telegram_id)
        .bind(transaction.level)
        .bind(transaction.payment_amount)
        .bind(transaction.percent)
        .bind(transaction.earned_amount)
        .bind(transaction.source_payment_id)
        .bind(&transaction.description)
        .execute(&mut *tx)
        .await
        .context("Failed to insert partner transaction")?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE partners SET balance = balance + $1, total_earned = total_earned + $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(transaction.earned_amount)
        .bind(transaction.partner_id)
        .execute(&mut *tx)
        .await
        .context("Failed to credit partner balance")?;

        tx.commit().await?;
        Ok(true)
    }

    async fn adjust_balance(&self, id: i64, delta: i64) -> Result<Option<Partner>> {
        sqlx::query_as::<_, Partner>(
            "UPDATE partners SET balance = balance + $1, total_earned = total_earned + $1, updated_at = NOW()
             WHERE id = $2 AND balance + $1 >= 0
             RETURNING *",
        )
        .bind(delta)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to adjust partner balance")
    }

    async fn request_withdrawal(&self, request: &NewWithdrawal) -> Result<WithdrawalRequestOutcome> {
        if request.amount < request.min_amount || request.amount <= 0 {
            return Ok(WithdrawalRequestOutcome::BelowMinimum);
        }

        let mut tx = self.pool.begin().await?;

        let partner = sqlx::query_as::<_, Partner>("SELECT * FROM partners WHERE id = $1 FOR UPDATE")
            .bind(request.partner_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to lock partner")?
            .ok_or_else(|| anyhow::anyhow!("Partner {} not found", request.partner_id))?;

        if !partner.is_active {
            tx.rollback().await?;
            return Ok(WithdrawalRequestOutcome::PartnerInactive);
        }
        if request.amount > partner.balance {
            tx.rollback().await?;
            return Ok(WithdrawalRequestOutcome::InsufficientBalance {
                balance: partner.balance,
            });
        }

        sqlx::query("UPDATE partners SET balance = balance - $1, updated_at = NOW() WHERE id = $2")
            .bind(request.amount)
            .bind(request.partner_id)
            .execute(&mut *tx)
            .await
            .context("Failed to hold withdrawal amount")?;

        let withdrawal = sqlx::query_as::<_, PartnerWithdrawal>(
            "INSERT INTO partner_withdrawals (partner_id, amount, status, method, requisites)
             VALUES ($1, $2, 'PENDING', $3, $4)
             RETURNING *",
        )
        .bind(request.partner_id)
        .bind(request.amount)
        .bind(&request.method)
        .bind(&request.requisites)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert withdrawal")?;

        tx.commit().await?;
        Ok(WithdrawalRequestOutcome::Created(withdrawal))
    }

    async fn resolve_withdrawal(
        &self,
        id: i64,
        to: WithdrawalStatus,
        processed_by: Option<i64>,
        comment: Option<&str>,
    ) -> Result<WithdrawalResolveOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(withdrawal) = sqlx::query_as::<_, PartnerWithdrawal>(
            "SELECT * FROM partner_withdrawals WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock withdrawal")?
        else {
            tx.rollback().await?;
            return Ok(WithdrawalResolveOutcome::NotFound);
        };

        if withdrawal.status != WithdrawalStatus::Pending || to == WithdrawalStatus::Pending {
            tx.rollback().await?;
            return Ok(WithdrawalResolveOutcome::NotPending(withdrawal.status));
        }

        let partner_update = match to {
            WithdrawalStatus::Completed => {
                "UPDATE partners SET total_withdrawn = total_withdrawn + $1, updated_at = NOW() WHERE id = $2 RETURNING *"
            }
            _ => "UPDATE partners SET balance = balance + $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        };
        let partner = sqlx::query_as::<_, Partner>(partner_update)
            .bind(withdrawal.amount)
            .bind(withdrawal.partner_id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to settle partner balance")?;

        let withdrawal = sqlx::query_as::<_, PartnerWithdrawal>(
            "UPDATE partner_withdrawals SET status = $1, processed_by = $2, admin_comment = $3, updated_at = NOW()
             WHERE id = $4
             RETURNING *",
        )
        .bind(to)
        .bind(processed_by)
        .bind(comment)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to update withdrawal")?;

        tx.commit().await?;
        Ok(WithdrawalResolveOutcome::Resolved { withdrawal, partner })
    }

    async fn get_withdrawal(&self, id: i64) -> Result<Option<PartnerWithdrawal>> {
        sqlx::query_as::<_, PartnerWithdrawal>("SELECT * FROM partner_withdrawals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch withdrawal")
    }

    async fn list_withdrawals(&self, partner_id: i64) -> Result<Vec<PartnerWithdrawal>> {
        sqlx::query_as::<_, PartnerWithdrawal>(
            "SELECT * FROM partner_withdrawals WHERE partner_id = $1 ORDER BY created_at DESC",
        )
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list withdrawals")
    }

    async fn list_withdrawals_by_status(&self, status: WithdrawalStatus) -> Result<Vec<PartnerWithdrawal>> {
        sqlx::query_as::<_, PartnerWithdrawal>(
            "SELECT * FROM partner_withdrawals WHERE status = $1 ORDER BY created_at",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list withdrawals by status")
    }
}
