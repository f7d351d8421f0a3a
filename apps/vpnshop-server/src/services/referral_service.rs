use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;
use vpnshop_db::Repositories;
use vpnshop_db::models::enums::{
    AccrualStrategy, PointsExchangeType, PromocodeAvailability, PromocodeRewardType, ReferralRewardStrategy,
    ReferralRewardType,
};
use vpnshop_db::models::grant::{Grant, GrantRejection};
use vpnshop_db::models::plan::GIB;
use vpnshop_db::models::promocode::{NewPromocode, Promocode};
use vpnshop_db::models::referral::{NewPointsExchange, NewReferralReward};
use vpnshop_db::models::settings::{ExchangeTypeSettings, ReferralSettings};
use vpnshop_db::models::subscription::Subscription;
use vpnshop_db::repositories::{ExchangeOutcome, RewardOutcome};

use super::notification_service::{Notification, Notifier};
use super::plan_service::PlanService;
use super::random_code;
use super::settings_service::SettingsService;
use super::subscription_service::SubscriptionService;
use crate::error::{CommerceError, CommerceResult, PolicyViolation};

const GIFT_CODE_LEN: usize = 10;
const GIFT_CODE_ATTEMPTS: usize = 5;

/// Quantity bought by an exchange and what it costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeQuote {
    pub exchange_type: PointsExchangeType,
    pub quantity: i64,
    pub points_spent: i64,
}

/// Largest exchange `points` can pay for under `config`, or `None` when
/// it does not reach the minimum or one unit.
pub fn quote_exchange(
    exchange_type: PointsExchangeType,
    config: &ExchangeTypeSettings,
    points: i64,
) -> Option<ExchangeQuote> {
    let cost = config.points_cost.max(1);
    if points < config.min_points.max(1) {
        return None;
    }
    let points = if config.max_points >= 0 {
        points.min(config.max_points)
    } else {
        points
    };

    let units = points / cost;
    let quantity = match exchange_type {
        PointsExchangeType::SubscriptionDays => units,
        PointsExchangeType::GiftSubscription => units.min(1),
        PointsExchangeType::Discount => units.min(config.max_discount_percent.max(0) as i64),
        PointsExchangeType::Traffic => units.min(config.max_traffic_gb.max(0)),
    };
    (quantity > 0).then_some(ExchangeQuote {
        exchange_type,
        quantity,
        points_spent: quantity * cost,
    })
}

/// Reward owed at one level of the inviter chain.
pub fn reward_value(settings: &ReferralSettings, level: i16, final_amount: i64) -> i64 {
    let Some(&configured) = settings.reward.config.get(&level) else {
        return 0;
    };
    match settings.reward.strategy {
        ReferralRewardStrategy::Amount => configured,
        ReferralRewardStrategy::Percent => final_amount * configured / 100,
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeResult {
    pub quote: ExchangeQuote,
    pub points_left: i64,
    pub subscription: Option<Subscription>,
    pub promocode: Option<Promocode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralSummary {
    pub referral_code: String,
    pub invited: usize,
    pub points_earned: i64,
    pub days_earned: i64,
    pub points: i64,
}

#[derive(Clone)]
pub struct ReferralService {
    repos: Repositories,
    settings: SettingsService,
    plans: PlanService,
    subscriptions: SubscriptionService,
    notifier: Arc<dyn Notifier>,
}

impl ReferralService {
    pub fn new(
        repos: Repositories,
        settings: SettingsService,
        plans: PlanService,
        subscriptions: SubscriptionService,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            repos,
            settings,
            plans,
            subscriptions,
            notifier,
        }
    }

    /// One-shot: a user that already has an inviter keeps it.
    pub async fn attach(&self, inviter: i64, invitee: i64) -> CommerceResult<bool> {
        if inviter == invitee {
            warn!("User {} tried to invite themselves", invitee);
            return Ok(false);
        }
        if !self.repos.users.set_invited_by(invitee, inviter).await? {
            debug!("User {} already has an inviter", invitee);
            return Ok(false);
        }
        self.repos.referrals.create(inviter, invitee).await?;
        info!("Referral attached: {} invited {}", inviter, invitee);

        let settings = self.settings.get().await?;
        if settings.user_notifications.referral_attached {
            self.notifier
                .notify_user(inviter, Notification::new("ntf-referral-attached").with("user", invitee))
                .await;
        }
        if settings.system_notifications.referral_attached {
            self.notifier
                .notify_operators(
                    Notification::new("ntf-event-referral-attached")
                        .with("inviter", inviter)
                        .with("user", invitee),
                )
                .await;
        }
        Ok(true)
    }

    /// Job handler for `referral_accrual`. Returns the number of rewards recorded.
    pub async fn accrue_for_payment(&self, payment_id: Uuid) -> CommerceResult<usize> {
        let Some(transaction) = self.repos.transactions.get(payment_id).await? else {
            warn!("Referral accrual: transaction {} not found", payment_id);
            return Ok(0);
        };
        if !transaction.was_completed()
            || transaction.is_test
            || transaction.pricing.final_amount <= 0
        {
            debug!("Referral accrual skipped for {}", payment_id);
            return Ok(0);
        }

        let settings = self.settings.get().await?;
        let referral = &settings.referral;
        if !referral.enable {
            return Ok(0);
        }
        if !referral.is_plan_eligible(transaction.plan.id) {
            debug!(
                "Plan {} is not eligible for referral rewards ({})",
                transaction.plan.id, payment_id
            );
            return Ok(0);
        }

        let payer = transaction.user_telegram_id;
        let mut visited = HashSet::from([payer]);
        let mut current = payer;
        let mut recorded = 0;

        for level in 1..=referral.max_level() {
            let Some(link) = self.repos.referrals.get_by_referred(current).await? else {
                break;
            };
            let inviter = link.referrer_telegram_id;
            if !visited.insert(inviter) {
                warn!("Referral cycle at user {} while accruing {}", inviter, payment_id);
                break;
            }
            current = inviter;

            let value = reward_value(referral, level, transaction.pricing.final_amount);
            if value <= 0 {
                continue;
            }
            if referral.accrual_strategy == AccrualStrategy::OnFirstPayment
                && self.repos.referrals.has_reward_for(inviter, payer).await?
            {
                debug!("Inviter {} was already rewarded for {}", inviter, payer);
                continue;
            }

            let grant = match referral.reward.reward_type {
                ReferralRewardType::Points => Some(Grant::AddPoints { points: value }),
                ReferralRewardType::ExtraDays => self.extra_days_target(inviter).await?.map(|id| {
                    Grant::ExtendSubscription {
                        subscription_id: id,
                        days: value.min(i32::MAX as i64) as i32,
                    }
                }),
            };
            if grant.is_none() {
                info!(
                    "Inviter {} has no extendable subscription; reward for {} recorded without effect",
                    inviter, payment_id
                );
            }

            let reward = NewReferralReward {
                user_telegram_id: inviter,
                referred_telegram_id: payer,
                level,
                reward_type: referral.reward.reward_type,
                amount: value,
                payment_id,
            };
            match self.repos.referrals.record_reward(&reward, grant).await? {
                RewardOutcome::Recorded(applied) => {
                    recorded += 1;
                    info!(
                        "Referral reward L{} {} {} to {} for {}",
                        level, value, reward.reward_type, inviter, payment_id
                    );
                    if let Some(subscription) = applied.subscription {
                        self.subscriptions.sync_or_enqueue(subscription).await?;
                    }
                    self.notify_reward(inviter, &reward, settings.user_notifications.referral_reward)
                        .await;
                }
                RewardOutcome::Duplicate => {
                    debug!("Referral reward L{} for {} already recorded", level, payment_id);
                }
                RewardOutcome::Rejected(reason) => {
                    warn!("Referral reward for {} rejected: {}", inviter, reason);
                }
            }
        }
        Ok(recorded)
    }

    /// Current, extendable subscription of the inviter.
    async fn extra_days_target(&self, inviter: i64) -> CommerceResult<Option<i64>> {
        let Some(user) = self.repos.users.get(inviter).await? else {
            return Ok(None);
        };
        let Some(id) = user.current_subscription_id else {
            return Ok(None);
        };
        Ok(self
            .repos
            .subscriptions
            .get(id)
            .await?
            .filter(|s| !s.is_deleted() && !s.is_lifetime())
            .map(|s| s.id))
    }

    async fn notify_reward(&self, inviter: i64, reward: &NewReferralReward, enabled: bool) {
        if !enabled {
            return;
        }
        let key = match reward.reward_type {
            ReferralRewardType::Points => "ntf-referral-reward-points",
            ReferralRewardType::ExtraDays => "ntf-referral-reward-days",
        };
        self.notifier
            .notify_user(
                inviter,
                Notification::new(key)
                    .with("value", reward.amount)
                    .with("level", reward.level),
            )
            .await;
    }

    pub async fn referral_summary(&self, telegram_id: i64) -> CommerceResult<ReferralSummary> {
        let user = self
            .repos
            .users
            .get(telegram_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("user {}", telegram_id)))?;
        let invited = self.repos.referrals.list_by_referrer(telegram_id).await?.len();
        let rewards = self.repos.referrals.rewards_for(telegram_id).await?;
        let earned = |kind: ReferralRewardType| {
            rewards
                .iter()
                .filter(|r| r.reward_type == kind)
                .map(|r| r.amount)
                .sum::<i64>()
        };
        Ok(ReferralSummary {
            referral_code: user.referral_code.clone(),
            invited,
            points_earned: earned(ReferralRewardType::Points),
            days_earned: earned(ReferralRewardType::ExtraDays),
            points: user.points,
        })
    }

    /// Best affordable quote per enabled exchange type.
    pub async fn exchange_options(&self, telegram_id: i64) -> CommerceResult<Vec<ExchangeQuote>> {
        let user = self
            .repos
            .users
            .get(telegram_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("user {}", telegram_id)))?;
        let settings = self.settings.get().await?;
        let exchange = &settings.referral.points_exchange;
        Ok(exchange
            .enabled_types()
            .into_iter()
            .filter_map(|t| quote_exchange(t, exchange.for_type(t), user.points))
            .collect())
    }

    /// Spends up to `points` on one exchange type, atomically with its effect.
    pub async fn exchange(
        &self,
        telegram_id: i64,
        exchange_type: PointsExchangeType,
        points: i64,
        target_subscription: Option<i64>,
    ) -> CommerceResult<ExchangeResult> {
        let settings = self.settings.get().await?;
        let exchange = &settings.referral.points_exchange;
        if !exchange.enabled_types().contains(&exchange_type) {
            return Err(PolicyViolation::ExchangeDisabled.into());
        }
        let config = exchange.for_type(exchange_type);

        let user = self
            .repos
            .users
            .get(telegram_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("user {}", telegram_id)))?;
        if points > user.points {
            return Err(PolicyViolation::InsufficientPoints { balance: user.points }.into());
        }
        let quote = quote_exchange(exchange_type, config, points).ok_or_else(|| {
            CommerceError::validation(format!(
                "{} points do not buy any {} (minimum {})",
                points, exchange_type, config.min_points
            ))
        })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let grant = self
                .exchange_grant(telegram_id, quote, config, target_subscription)
                .await?;
            let record = NewPointsExchange {
                user_telegram_id: telegram_id,
                exchange_type,
                points_spent: quote.points_spent,
                quantity: quote.quantity,
            };

            match self.repos.referrals.exchange_points(&record, grant).await? {
                ExchangeOutcome::Applied { applied, points_left } => {
                    info!(
                        "User {} exchanged {} points for {} x{}",
                        telegram_id, quote.points_spent, exchange_type, quote.quantity
                    );
                    let subscription = match applied.subscription {
                        Some(sub) => Some(self.subscriptions.sync_or_enqueue(sub).await?),
                        None => None,
                    };
                    return Ok(ExchangeResult {
                        quote,
                        points_left,
                        subscription,
                        promocode: applied.promocode,
                    });
                }
                ExchangeOutcome::InsufficientPoints { balance } => {
                    return Err(PolicyViolation::InsufficientPoints { balance }.into());
                }
                ExchangeOutcome::Rejected(GrantRejection::CodeConflict) if attempts < GIFT_CODE_ATTEMPTS => {
                    debug!("Gift code collision, retrying");
                }
                ExchangeOutcome::Rejected(reason) => {
                    return Err(CommerceError::validation(reason.to_string()));
                }
            }
        }
    }

    async fn exchange_grant(
        &self,
        telegram_id: i64,
        quote: ExchangeQuote,
        config: &ExchangeTypeSettings,
        target_subscription: Option<i64>,
    ) -> CommerceResult<Grant> {
        Ok(match quote.exchange_type {
            PointsExchangeType::SubscriptionDays => Grant::ExtendSubscription {
                subscription_id: self
                    .exchange_target(telegram_id, target_subscription, |s| !s.is_lifetime())
                    .await?,
                days: quote.quantity as i32,
            },
            PointsExchangeType::Traffic => Grant::AddTraffic {
                subscription_id: self
                    .exchange_target(telegram_id, target_subscription, |s| s.traffic_limit >= 0)
                    .await?,
                bytes: quote.quantity * GIB,
            },
            PointsExchangeType::Discount => Grant::AddPurchaseDiscount {
                percent: quote.quantity as i32,
            },
            PointsExchangeType::GiftSubscription => {
                let plan_id = config
                    .gift_plan_id
                    .ok_or_else(|| CommerceError::validation("gift plan is not configured"))?;
                let plan = self.plans.get(plan_id).await?;
                Grant::CreatePromocode {
                    promocode: Box::new(NewPromocode {
                        code: random_code(GIFT_CODE_LEN),
                        reward_type: PromocodeRewardType::Subscription,
                        availability: PromocodeAvailability::All,
                        allowed_user_ids: Vec::new(),
                        reward: None,
                        plan: Some(plan.snapshot(config.gift_duration_days)),
                        lifetime: -1,
                        max_activations: 1,
                        is_active: true,
                    }),
                }
            }
        })
    }

    /// The explicit target, or the user's current subscription.
    async fn exchange_target<F>(&self, telegram_id: i64, explicit: Option<i64>, eligible: F) -> CommerceResult<i64>
    where
        F: Fn(&Subscription) -> bool,
    {
        let id = match explicit {
            Some(id) => id,
            None => self
                .repos
                .users
                .get(telegram_id)
                .await?
                .and_then(|u| u.current_subscription_id)
                .ok_or_else(|| CommerceError::not_found("subscription"))?,
        };
        let subscription = self.subscriptions.get_owned(telegram_id, id).await?;
        if !eligible(&subscription) {
            return Err(CommerceError::validation(format!(
                "subscription {} cannot take this exchange",
                id
            )));
        }
        Ok(subscription.id)
    }
}
