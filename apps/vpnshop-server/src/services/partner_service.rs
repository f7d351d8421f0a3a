use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpnshop_db::Repositories;
use vpnshop_db::models::enums::{
    AccrualStrategy, Currency, PartnerRewardType, PaymentGatewayType, WithdrawalStatus,
};
use vpnshop_db::models::partner::{
    NewPartnerReferral, NewPartnerTransaction, NewWithdrawal, PARTNER_LEVELS, Partner, PartnerIndividualSettings,
    PartnerWithdrawal, WithdrawalRequestOutcome, WithdrawalResolveOutcome,
};
use vpnshop_db::models::settings::PartnerSettings;

use super::notification_service::{Notification, Notifier};
use super::settings_service::SettingsService;
use crate::error::{CommerceError, CommerceResult, PolicyViolation};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

fn floor_minor(value: Decimal) -> i64 {
    value.floor().to_i64().unwrap_or(0)
}

/// `amount` reduced by `percent`, unrounded.
fn deduct(amount: Decimal, percent: Decimal) -> Decimal {
    amount * (HUNDRED - percent) / HUNDRED
}

/// `percent` of `amount`, floored to whole minor units.
fn share(amount: Decimal, percent: Decimal) -> i64 {
    floor_minor(amount * percent / HUNDRED)
}

/// Converts a payment amount into kopecks. RUB passes through; other
/// currencies need a configured rate per major unit.
pub fn to_kopecks(settings: &PartnerSettings, amount: i64, currency: Currency) -> Option<i64> {
    if currency == Currency::Rub {
        return Some(amount);
    }
    let rate = settings.currency_rates.get(&currency)?;
    Some(floor_minor(
        Decimal::from(amount) / Decimal::from(currency.minor_units()) * rate,
    ))
}

/// Amount left for commissions after the gateway fee and tax. Kept exact;
/// only the final per-level earning is floored.
pub fn net_amount(settings: &PartnerSettings, amount: i64, gateway: PaymentGatewayType) -> Decimal {
    let amount = Decimal::from(amount);
    if !settings.auto_calculate_commission {
        return amount;
    }
    deduct(
        deduct(amount, settings.gateway_commission(gateway)),
        settings.tax_percent,
    )
}

/// Percent applied and earning for one level.
pub fn level_earning(
    global: &PartnerSettings,
    individual: &PartnerIndividualSettings,
    level: i16,
    amount: i64,
    gateway: PaymentGatewayType,
) -> (Decimal, i64) {
    let percent = if individual.use_global_settings {
        global.level_percent(level)
    } else {
        match individual.reward_type {
            PartnerRewardType::FixedAmount => match individual.level_fixed_amount(level) {
                Some(fixed) => return (Decimal::ZERO, fixed.max(0)),
                None => global.level_percent(level),
            },
            PartnerRewardType::Percent => individual
                .level_percent(level)
                .unwrap_or_else(|| global.level_percent(level)),
        }
    };
    (percent, share(net_amount(global, amount, gateway), percent))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarningBreakdown {
    pub amount: i64,
    pub gateway_fee: i64,
    pub tax_fee: i64,
    pub net: i64,
    pub levels: [i64; 3],
    pub owner_profit: i64,
}

/// Display figures for an operator. `levels` match what `level_earning`
/// credits; the fee and net columns are floored views of the exact amounts.
pub fn earning_breakdown(settings: &PartnerSettings, amount: i64, gateway: PaymentGatewayType) -> EarningBreakdown {
    let gross = Decimal::from(amount);
    let (after_gateway, net) = if settings.auto_calculate_commission {
        let after_gateway = deduct(gross, settings.gateway_commission(gateway));
        (after_gateway, deduct(after_gateway, settings.tax_percent))
    } else {
        (gross, gross)
    };
    let levels = PARTNER_LEVELS.map(|level| share(net, settings.level_percent(level)));
    let (after_gateway, net) = (floor_minor(after_gateway), floor_minor(net));
    EarningBreakdown {
        amount,
        gateway_fee: amount - after_gateway,
        tax_fee: after_gateway - net,
        net,
        levels,
        owner_profit: net - levels.iter().sum::<i64>(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerStatistics {
    pub balance: i64,
    pub total_earned: i64,
    pub total_withdrawn: i64,
    pub referrals: [i32; 3],
    pub earnings: [i64; 3],
    pub pending_withdrawals: i64,
}

#[derive(Clone)]
pub struct PartnerService {
    repos: Repositories,
    settings: SettingsService,
    notifier: Arc<dyn Notifier>,
}

impl PartnerService {
    pub fn new(repos: Repositories, settings: SettingsService, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            repos,
            settings,
            notifier,
        }
    }

    pub async fn get(&self, partner_id: i64) -> CommerceResult<Partner> {
        self.repos
            .partners
            .get(partner_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("partner {}", partner_id)))
    }

    pub async fn get_by_user(&self, telegram_id: i64) -> CommerceResult<Option<Partner>> {
        Ok(self.repos.partners.get_by_user(telegram_id).await?)
    }

    pub async fn list_partners(&self) -> CommerceResult<Vec<Partner>> {
        Ok(self.repos.partners.list().await?)
    }

    /// Idempotent: an existing partner record is returned as-is.
    pub async fn create_partner(&self, telegram_id: i64) -> CommerceResult<Partner> {
        if self.repos.users.get(telegram_id).await?.is_none() {
            return Err(CommerceError::not_found(format!("user {}", telegram_id)));
        }
        let (partner, created) = self.repos.partners.create(telegram_id).await?;
        if created {
            info!("User {} is now partner {}", telegram_id, partner.id);
        }
        Ok(partner)
    }

    pub async fn set_active(&self, partner_id: i64, active: bool) -> CommerceResult<()> {
        if !self.repos.partners.set_active(partner_id, active).await? {
            return Err(CommerceError::not_found(format!("partner {}", partner_id)));
        }
        info!("Partner {} active = {}", partner_id, active);
        Ok(())
    }

    pub async fn update_individual_settings(
        &self,
        partner_id: i64,
        settings: PartnerIndividualSettings,
    ) -> CommerceResult<()> {
        for level in PARTNER_LEVELS {
            if let Some(percent) = settings.level_percent(level) {
                if percent < Decimal::ZERO || percent > HUNDRED {
                    return Err(CommerceError::validation(format!(
                        "level {} percent {} is outside 0..=100",
                        level, percent
                    )));
                }
            }
            if settings.level_fixed_amount(level).is_some_and(|amount| amount < 0) {
                return Err(CommerceError::validation(format!("level {} fixed amount is negative", level)));
            }
        }
        if !self
            .repos
            .partners
            .update_individual_settings(partner_id, &settings)
            .await?
        {
            return Err(CommerceError::not_found(format!("partner {}", partner_id)));
        }
        Ok(())
    }

    /// Manual correction; moves balance and total_earned together.
    pub async fn adjust_balance(&self, partner_id: i64, delta: i64, reason: &str) -> CommerceResult<Partner> {
        let current = self.get(partner_id).await?;
        match self.repos.partners.adjust_balance(partner_id, delta).await? {
            Some(partner) => {
                info!(
                    "Partner {} balance {:+} -> {} ({})",
                    partner_id, delta, partner.balance, reason
                );
                Ok(partner)
            }
            None => Err(PolicyViolation::InsufficientBalance {
                balance: current.balance,
            }
            .into()),
        }
    }

    /// Records the partner chain of a user who registered through `inviter`.
    /// Only active partners take part.
    pub async fn register_referral_chain(&self, new_user: i64, inviter: i64) -> CommerceResult<usize> {
        let Some(first) = self.active_partner_of_user(inviter).await? else {
            debug!("Inviter {} is not an active partner", inviter);
            return Ok(0);
        };

        let mut rows = vec![NewPartnerReferral {
            partner_id: first.id,
            referral_telegram_id: new_user,
            level: 1,
            parent_partner_id: None,
        }];
        let mut visited = HashSet::from([first.id]);
        let mut child = first;

        for level in [2, 3] {
            let Some(link) = self.repos.partners.get_referral(child.user_telegram_id, 1).await? else {
                break;
            };
            let Some(upper) = self.repos.partners.get(link.partner_id).await? else {
                break;
            };
            if !upper.is_active || !visited.insert(upper.id) || upper.user_telegram_id == new_user {
                break;
            }
            rows.push(NewPartnerReferral {
                partner_id: upper.id,
                referral_telegram_id: new_user,
                level,
                parent_partner_id: Some(child.id),
            });
            child = upper;
        }

        let added = self.repos.partners.add_referrals(&rows).await?;
        info!(
            "User {} joined partner chain of {} ({} level(s))",
            new_user, inviter, added
        );
        Ok(added)
    }

    async fn active_partner_of_user(&self, telegram_id: i64) -> CommerceResult<Option<Partner>> {
        Ok(self
            .repos
            .partners
            .get_by_user(telegram_id)
            .await?
            .filter(|p| p.is_active))
    }

    /// Job handler for `partner_accrual`. Returns the number of credits.
    pub async fn accrue_for_payment(&self, payment_id: Uuid) -> CommerceResult<usize> {
        let Some(transaction) = self.repos.transactions.get(payment_id).await? else {
            warn!("Partner accrual: transaction {} not found", payment_id);
            return Ok(0);
        };
        if !transaction.was_completed()
            || transaction.is_test
            || transaction.pricing.final_amount <= 0
        {
            return Ok(0);
        }

        let settings = self.settings.get().await?;
        let global = &settings.partner;
        if !global.enabled {
            debug!("Partner program disabled, skipping {}", payment_id);
            return Ok(0);
        }
        let Some(amount) = to_kopecks(global, transaction.pricing.final_amount, transaction.currency) else {
            warn!(
                "No partner rate for {}; payment {} earns no commissions",
                transaction.currency, payment_id
            );
            return Ok(0);
        };

        let payer = transaction.user_telegram_id;
        let mut visited = HashSet::new();
        let mut credited = 0;

        for level in PARTNER_LEVELS {
            let Some(link) = self.repos.partners.get_referral(payer, level).await? else {
                continue;
            };
            if !visited.insert(link.partner_id) {
                continue;
            }
            let Some(partner) = self.repos.partners.get(link.partner_id).await? else {
                continue;
            };
            if !partner.is_active || partner.user_telegram_id == payer {
                continue;
            }

            let individual = &partner.individual_settings.0;
            if !individual.use_global_settings
                && individual.accrual_strategy == AccrualStrategy::OnFirstPayment
                && self.repos.partners.has_transaction_for(partner.id, payer).await?
            {
                debug!("Partner {} already earned from {}", partner.id, payer);
                continue;
            }

            let (percent, earned) = level_earning(global, individual, level, amount, transaction.gateway_type);
            if earned <= 0 {
                debug!("Zero earning for partner {} at level {}", partner.id, level);
                continue;
            }

            let record = NewPartnerTransaction {
                partner_id: partner.id,
                referral_telegram_id: payer,
                level,
                payment_amount: amount,
                percent,
                earned_amount: earned,
                source_payment_id: Some(payment_id),
                description: Some(format!(
                    "Referral payment via {} (level {})",
                    transaction.gateway_type, level
                )),
            };
            if !self.repos.partners.credit(&record).await? {
                debug!("Partner {} was already credited for {}", partner.id, payment_id);
                continue;
            }
            credited += 1;
            info!(
                "Partner {} earned {} kopecks at level {} from {}",
                partner.id, earned, level, payment_id
            );
            if settings.user_notifications.partner_earning {
                self.notifier
                    .notify_user(
                        partner.user_telegram_id,
                        Notification::new("ntf-partner-earning")
                            .with("amount", Currency::Rub.format_major(earned))
                            .with("level", level),
                    )
                    .await;
            }
        }
        Ok(credited)
    }

    pub async fn earning_breakdown(&self, amount: i64, gateway: PaymentGatewayType) -> CommerceResult<EarningBreakdown> {
        Ok(earning_breakdown(&self.settings.get().await?.partner, amount, gateway))
    }

    pub async fn partner_statistics(&self, partner_id: i64) -> CommerceResult<PartnerStatistics> {
        let partner = self.get(partner_id).await?;
        let transactions = self.repos.partners.list_transactions(partner_id).await?;
        let withdrawals = self.repos.partners.list_withdrawals(partner_id).await?;

        let earnings = PARTNER_LEVELS.map(|level| {
            transactions
                .iter()
                .filter(|t| t.level == level)
                .map(|t| t.earned_amount)
                .sum::<i64>()
        });
        Ok(PartnerStatistics {
            balance: partner.balance,
            total_earned: partner.total_earned,
            total_withdrawn: partner.total_withdrawn,
            referrals: [
                partner.referrals_count,
                partner.level2_referrals_count,
                partner.level3_referrals_count,
            ],
            earnings,
            pending_withdrawals: withdrawals
                .iter()
                .filter(|w| w.status == WithdrawalStatus::Pending)
                .map(|w| w.amount)
                .sum(),
        })
    }

    pub async fn list_pending_withdrawals(&self) -> CommerceResult<Vec<PartnerWithdrawal>> {
        Ok(self
            .repos
            .partners
            .list_withdrawals_by_status(WithdrawalStatus::Pending)
            .await?)
    }

    /// Holds `amount` from the balance until an operator resolves the request.
    pub async fn request_withdrawal(
        &self,
        telegram_id: i64,
        amount: i64,
        method: &str,
        requisites: &str,
    ) -> CommerceResult<PartnerWithdrawal> {
        if amount <= 0 {
            return Err(CommerceError::validation("withdrawal amount must be positive"));
        }
        if method.trim().is_empty() || requisites.trim().is_empty() {
            return Err(CommerceError::validation("withdrawal method and requisites are required"));
        }
        let partner = self
            .repos
            .partners
            .get_by_user(telegram_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("partner for user {}", telegram_id)))?;
        let settings = self.settings.get().await?;
        let min_amount = settings.partner.min_withdrawal_amount;

        let request = NewWithdrawal {
            partner_id: partner.id,
            amount,
            method: method.trim().to_string(),
            requisites: requisites.trim().to_string(),
            min_amount,
        };
        let withdrawal = match self.repos.partners.request_withdrawal(&request).await? {
            WithdrawalRequestOutcome::Created(withdrawal) => withdrawal,
            WithdrawalRequestOutcome::BelowMinimum => {
                return Err(PolicyViolation::WithdrawalBelowMinimum { min: min_amount }.into());
            }
            WithdrawalRequestOutcome::InsufficientBalance { balance } => {
                return Err(PolicyViolation::InsufficientBalance { balance }.into());
            }
            WithdrawalRequestOutcome::PartnerInactive => return Err(PolicyViolation::PartnerInactive.into()),
        };

        info!(
            "Partner {} requested withdrawal {} of {}",
            partner.id, withdrawal.id, amount
        );
        if settings.system_notifications.partner_withdrawal {
            self.notifier
                .notify_operators(
                    Notification::new("ntf-event-partner-withdrawal")
                        .with("user", telegram_id)
                        .with("partner", partner.id)
                        .with("withdrawal", withdrawal.id)
                        .with("amount", Currency::Rub.format_major(amount))
                        .with("method", &withdrawal.method),
                )
                .await;
        }
        Ok(withdrawal)
    }

    pub async fn approve_withdrawal(
        &self,
        withdrawal_id: i64,
        operator: i64,
        comment: Option<&str>,
    ) -> CommerceResult<PartnerWithdrawal> {
        self.resolve(withdrawal_id, WithdrawalStatus::Completed, Some(operator), comment)
            .await
    }

    pub async fn reject_withdrawal(
        &self,
        withdrawal_id: i64,
        operator: i64,
        comment: Option<&str>,
    ) -> CommerceResult<PartnerWithdrawal> {
        self.resolve(withdrawal_id, WithdrawalStatus::Rejected, Some(operator), comment)
            .await
    }

    /// Partner-side cancel of their own pending request.
    pub async fn cancel_withdrawal(&self, telegram_id: i64, withdrawal_id: i64) -> CommerceResult<PartnerWithdrawal> {
        let withdrawal = self
            .repos
            .partners
            .get_withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("withdrawal {}", withdrawal_id)))?;
        let owner = self.get(withdrawal.partner_id).await?;
        if owner.user_telegram_id != telegram_id {
            return Err(CommerceError::not_found(format!("withdrawal {}", withdrawal_id)));
        }
        self.resolve(withdrawal_id, WithdrawalStatus::Canceled, None, None).await
    }

    async fn resolve(
        &self,
        withdrawal_id: i64,
        to: WithdrawalStatus,
        processed_by: Option<i64>,
        comment: Option<&str>,
    ) -> CommerceResult<PartnerWithdrawal> {
        match self
            .repos
            .partners
            .resolve_withdrawal(withdrawal_id, to, processed_by, comment)
            .await?
        {
            WithdrawalResolveOutcome::Resolved { withdrawal, partner } => {
                info!(
                    "Withdrawal {} of partner {} -> {}",
                    withdrawal.id, partner.id, withdrawal.status
                );
                if processed_by.is_some() && self.settings.get().await?.user_notifications.withdrawal_resolved {
                    let mut notification = Notification::new(match to {
                        WithdrawalStatus::Completed => "ntf-partner-withdrawal-approved",
                        _ => "ntf-partner-withdrawal-rejected",
                    })
                    .with("amount", Currency::Rub.format_major(withdrawal.amount))
                    .with("balance", Currency::Rub.format_major(partner.balance));
                    if let Some(comment) = &withdrawal.admin_comment {
                        notification = notification.with("comment", comment);
                    }
                    self.notifier.notify_user(partner.user_telegram_id, notification).await;
                }
                Ok(withdrawal)
            }
            WithdrawalResolveOutcome::NotPending(status) => Err(CommerceError::Conflict(format!(
                "withdrawal {} is already {}",
                withdrawal_id, status
            ))),
            WithdrawalResolveOutcome::NotFound => Err(CommerceError::not_found(format!("withdrawal {}", withdrawal_id))),
        }
    }
}
