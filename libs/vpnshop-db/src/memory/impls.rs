use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::MemoryStore;
use crate::models::enums::{
    JobStatus, PaymentGatewayType, SubscriptionStatus, TransactionStatus, UserRole, WithdrawalStatus,
};
use crate::models::gateway::PaymentGateway;
use crate::models::grant::Grant;
use crate::models::job::{Job, NewJob};
use crate::models::partner::{
    NewPartnerReferral, NewPartnerTransaction, NewWithdrawal, Partner, PartnerIndividualSettings,
    PartnerReferral, PartnerTransaction, PartnerWithdrawal, WithdrawalRequestOutcome,
    WithdrawalResolveOutcome,
};
use crate::models::plan::{NewPlan, Plan};
use crate::models::promocode::{NewPromocode, Promocode, PromocodeActivation};
use crate::models::referral::{
    NewPointsExchange, NewReferralReward, PointsExchange, Referral, ReferralReward,
};
use crate::models::settings::Settings;
use crate::models::subscription::{NewSubscription, PanelView, Subscription, renewed_expiry};
use crate::models::transaction::{NewTransaction, Transaction};
use crate::models::user::{NewUser, User};
use crate::repositories::{
    ActivationOutcome, ExchangeOutcome, GatewayRepository, JobRepository, PartnerRepository,
    PlanRepository, PromocodeRepository, ReferralRepository, RewardOutcome, SettingsRepository,
    SubscriptionRepository, TransactionRepository, UserRepository,
};

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn load(&self) -> Result<Option<Settings>> {
        Ok(self.state.lock().await.settings.clone())
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        self.state.lock().await.settings = Some(settings.clone());
        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get(&self, telegram_id: i64) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&telegram_id).cloned())
    }

    async fn get_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        let state = self.state.lock().await;
        Ok(state.users.values().find(|u| u.referral_code == code).cloned())
    }

    async fn referral_code_exists(&self, code: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.users.values().any(|u| u.referral_code == code))
    }

    async fn create(&self, user: &NewUser) -> Result<User> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = state.users.entry(user.telegram_id).or_insert_with(|| User {
            telegram_id: user.telegram_id,
            username: user.username.clone(),
            name: user.name.clone(),
            language: user.language.clone(),
            role: user.role,
            is_blocked: false,
            referral_code: user.referral_code.clone(),
            invited_by: None,
            points: 0,
            personal_discount: 0,
            purchase_discount: 0,
            current_subscription_id: None,
            max_subscriptions: None,
            is_trial_used: false,
            created_at: now,
            updated_at: now,
        });
        Ok(row.clone())
    }

    async fn list_by_min_role(&self, role: UserRole) -> Result<Vec<User>> {
        let state = self.state.lock().await;
        Ok(state.users.values().filter(|u| u.role >= role).cloned().collect())
    }

    async fn set_invited_by(&self, telegram_id: i64, inviter: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.users.get_mut(&telegram_id) {
            Some(user) if user.invited_by.is_none() && telegram_id != inviter => {
                user.invited_by = Some(inviter);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_role(&self, telegram_id: i64, role: UserRole) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&telegram_id) {
            user.role = role;
        }
        Ok(())
    }

    async fn set_blocked(&self, telegram_id: i64, blocked: bool) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&telegram_id) {
            user.is_blocked = blocked;
        }
        Ok(())
    }

    async fn set_discounts(&self, telegram_id: i64, personal: i32, purchase: i32) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&telegram_id) {
            user.personal_discount = personal.clamp(0, 100);
            user.purchase_discount = purchase.clamp(0, 100);
        }
        Ok(())
    }

    async fn set_max_subscriptions(&self, telegram_id: i64, value: Option<i32>) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&telegram_id) {
            user.max_subscriptions = value;
        }
        Ok(())
    }

    async fn set_current_subscription(&self, telegram_id: i64, subscription_id: Option<i64>) -> Result<()> {
        if let Some(user) = self.state.lock().await.users.get_mut(&telegram_id) {
            user.current_subscription_id = subscription_id;
        }
        Ok(())
    }

    async fn mark_trial_used(&self, telegram_id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.users.get_mut(&telegram_id) {
            Some(user) if !user.is_trial_used => {
                user.is_trial_used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn adjust_points(&self, telegram_id: i64, delta: i64) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        match state.users.get_mut(&telegram_id) {
            Some(user) if user.points + delta >= 0 => {
                user.points += delta;
                Ok(Some(user.points))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl PlanRepository for MemoryStore {
    async fn get(&self, id: i32) -> Result<Option<Plan>> {
        Ok(self.state.lock().await.plans.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Plan>> {
        let state = self.state.lock().await;
        let mut plans: Vec<Plan> = state.plans.values().cloned().collect();
        plans.sort_by_key(|p| (p.order_index, p.id));
        Ok(plans)
    }

    async fn list_active(&self) -> Result<Vec<Plan>> {
        Ok(PlanRepository::list(self)
            .await?
            .into_iter()
            .filter(|p| p.is_active)
            .collect())
    }

    async fn create(&self, plan: &NewPlan) -> Result<Plan> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let order_index = state.plans.values().map(|p| p.order_index).max().unwrap_or(0) + 1;
        let row = Plan {
            id: state.next_id() as i32,
            order_index,
            name: plan.name.clone(),
            description: plan.description.clone(),
            plan_type: plan.plan_type,
            availability: plan.availability,
            allowed_user_ids: plan.allowed_user_ids.clone(),
            traffic_limit: plan.traffic_limit,
            device_limit: plan.device_limit,
            subscription_count: plan.subscription_count,
            durations: Json(plan.durations.clone()),
            internal_squads: plan.internal_squads.clone(),
            external_squad: plan.external_squad,
            is_active: plan.is_active,
            created_at: now,
            updated_at: now,
        };
        state.plans.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update(&self, plan: &Plan) -> Result<()> {
        self.state.lock().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn set_active(&self, id: i32, active: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .plans
            .get_mut(&id)
            .map(|p| p.is_active = active)
            .is_some())
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn get(&self, id: i64) -> Result<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn list_by_user(&self, telegram_id: i64) -> Result<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_telegram_id == telegram_id && !s.is_deleted())
            .cloned()
            .collect())
    }

    async fn count_by_user(&self, telegram_id: i64) -> Result<i64> {
        Ok(self.state.lock().await.count_live_subscriptions(telegram_id, None))
    }

    async fn list_by_source_payment(&self, payment_id: Uuid) -> Result<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.source_payment_id == Some(payment_id))
            .cloned()
            .collect())
    }

    async fn create_within_limit(
        &self,
        subscription: &NewSubscription,
        max_subscriptions: i32,
        replacing: Option<i64>,
        make_current: bool,
    ) -> Result<Option<Subscription>> {
        let mut state = self.state.lock().await;
        Ok(state.insert_subscription_within_limit(subscription, max_subscriptions, replacing, make_current))
    }

    async fn store_panel_view(&self, id: i64, view: &PanelView) -> Result<Option<Subscription>> {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if !sub.is_deleted() && sub.expire_at <= view.expire_at {
            sub.status = view.status;
        }
        sub.expire_at = sub.expire_at.max(view.expire_at);
        if let Some(url) = &view.url {
            sub.url = url.clone();
        }
        sub.updated_at = Utc::now();
        Ok(Some(sub.clone()))
    }

    async fn set_status(&self, id: i64, status: SubscriptionStatus) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&id) {
            Some(sub) if !sub.is_deleted() => {
                sub.status = status;
                sub.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_renewal(
        &self,
        id: i64,
        payment_id: Uuid,
        days: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<(Subscription, bool)>> {
        let mut state = self.state.lock().await;
        if !state.subscriptions.contains_key(&id) {
            return Ok(None);
        }
        let applied = state.renewals.insert((payment_id, id));
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if applied {
            sub.expire_at = renewed_expiry(sub.expire_at, now, days);
            if sub.status == SubscriptionStatus::Expired {
                sub.status = SubscriptionStatus::Active;
            }
            sub.updated_at = now;
        }
        Ok(Some((sub.clone(), applied)))
    }

    async fn list_expired_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Expired && s.expire_at < cutoff)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.expire_at);
        Ok(rows)
    }
}

fn new_job_row(id: i64, job: &NewJob) -> Job {
    let now = Utc::now();
    Job {
        id,
        kind: job.payload.kind().to_string(),
        dedupe_key: job.dedupe_key.clone(),
        payload: Json(job.payload.clone()),
        status: JobStatus::Pending,
        attempts: 0,
        run_at: now,
        locked_until: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

impl super::State {
    fn insert_job(&mut self, job: &NewJob) -> bool {
        if self.jobs.values().any(|j| j.dedupe_key == job.dedupe_key) {
            return false;
        }
        let id = self.next_id();
        self.jobs.insert(id, new_job_row(id, job));
        true
    }
}

#[async_trait]
impl TransactionRepository for MemoryStore {
    async fn create(&self, transaction: &NewTransaction) -> Result<Transaction> {
        let mut state = self.state.lock().await;
        if state.transactions.contains_key(&transaction.payment_id) {
            return Err(anyhow!("Duplicate payment_id {}", transaction.payment_id));
        }
        let now = Utc::now();
        let row = Transaction {
            id: state.next_id(),
            payment_id: transaction.payment_id,
            user_telegram_id: transaction.user_telegram_id,
            status: transaction.status,
            is_test: transaction.is_test,
            purchase_type: transaction.purchase_type,
            gateway_type: transaction.gateway_type,
            currency: transaction.currency,
            pricing: transaction.pricing,
            plan: Json(transaction.plan.clone()),
            renew_subscription_id: transaction.renew_subscription_id,
            renew_subscription_ids: transaction.renew_subscription_ids.clone(),
            device_types: transaction.device_types.clone().map(Json),
            payment_url: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.transactions.insert(row.payment_id, row.clone());
        Ok(row)
    }

    async fn get(&self, payment_id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.state.lock().await.transactions.get(&payment_id).cloned())
    }

    async fn list_by_user(&self, telegram_id: i64) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.user_telegram_id == telegram_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn set_payment_url(&self, payment_id: Uuid, url: &str) -> Result<()> {
        if let Some(row) = self.state.lock().await.transactions.get_mut(&payment_id) {
            row.payment_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn transition(
        &self,
        payment_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.transactions.get_mut(&payment_id) {
            Some(row) if row.status == from => {
                row.status = to;
                row.updated_at = Utc::now();
                if to == TransactionStatus::Completed {
                    row.completed_at = Some(row.updated_at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_and_enqueue(&self, payment_id: Uuid, jobs: &[NewJob]) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.transactions.get_mut(&payment_id) {
            Some(row) if row.status == TransactionStatus::Pending => {
                row.status = TransactionStatus::Completed;
                row.updated_at = Utc::now();
                row.completed_at = Some(row.updated_at);
            }
            _ => return Ok(false),
        }
        for job in jobs {
            state.insert_job(job);
        }
        Ok(true)
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn enqueue(&self, job: &NewJob) -> Result<bool> {
        Ok(self.state.lock().await.insert_job(job))
    }

    async fn claim(&self, limit: i64, lease_secs: i64) -> Result<Vec<Job>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut claimed = Vec::new();
        for job in state.jobs.values_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            let due = (job.status == JobStatus::Pending && job.run_at <= now)
                || (job.status == JobStatus::Running
                    && job.locked_until.is_some_and(|until| until < now));
            if due {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.locked_until = Some(now + Duration::seconds(lease_secs));
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: i64) -> Result<()> {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&id) {
            job.status = JobStatus::Done;
            job.locked_until = None;
            job.last_error = None;
        }
        Ok(())
    }

    async fn reschedule(&self, id: i64, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&id) {
            job.status = JobStatus::Pending;
            job.run_at = run_at;
            job.last_error = Some(error.to_string());
            job.locked_until = None;
        }
        Ok(())
    }

    async fn bury(&self, id: i64, error: &str) -> Result<()> {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&id) {
            job.status = JobStatus::Dead;
            job.last_error = Some(error.to_string());
            job.locked_until = None;
        }
        Ok(())
    }

    async fn get_by_key(&self, dedupe_key: &str) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.values().find(|j| j.dedupe_key == dedupe_key).cloned())
    }
}

#[async_trait]
impl GatewayRepository for MemoryStore {
    async fn list(&self) -> Result<Vec<PaymentGateway>> {
        let state = self.state.lock().await;
        let mut rows = state.gateways.clone();
        rows.sort_by_key(|g| (g.order_index, g.id));
        Ok(rows)
    }

    async fn get(&self, gateway_type: PaymentGatewayType) -> Result<Option<PaymentGateway>> {
        let state = self.state.lock().await;
        Ok(state.gateways.iter().find(|g| g.gateway_type == gateway_type).cloned())
    }

    async fn ensure_defaults(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for (index, gateway_type) in PaymentGatewayType::ALL.iter().enumerate() {
            if state.gateways.iter().any(|g| g.gateway_type == *gateway_type) {
                continue;
            }
            let id = state.next_id() as i32;
            state.gateways.push(PaymentGateway {
                id,
                order_index: index as i32 + 1,
                gateway_type: *gateway_type,
                currency: gateway_type.currency(),
                is_active: *gateway_type == PaymentGatewayType::TelegramStars,
                updated_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn update(&self, gateway_type: PaymentGatewayType, is_active: bool, order_index: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.gateways.iter_mut().find(|g| g.gateway_type == gateway_type) {
            row.is_active = is_active;
            row.order_index = order_index;
            row.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl PromocodeRepository for MemoryStore {
    async fn create(&self, promocode: &NewPromocode) -> Result<Option<Promocode>> {
        Ok(self.state.lock().await.insert_promocode(promocode))
    }

    async fn get(&self, id: i32) -> Result<Option<Promocode>> {
        Ok(self.state.lock().await.promocodes.get(&id).cloned())
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<Promocode>> {
        let code = Promocode::normalize_code(code);
        let state = self.state.lock().await;
        Ok(state.promocodes.values().find(|p| p.code == code).cloned())
    }

    async fn list(&self) -> Result<Vec<Promocode>> {
        Ok(self.state.lock().await.promocodes.values().cloned().collect())
    }

    async fn update(&self, promocode: &Promocode) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.promocodes.get_mut(&promocode.id) {
            Some(row) => {
                *row = Promocode {
                    code: Promocode::normalize_code(&promocode.code),
                    updated_at: Utc::now(),
                    ..promocode.clone()
                };
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: i32) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.activations.retain(|a| a.promocode_id != id);
        Ok(state.promocodes.remove(&id).is_some())
    }

    async fn activations(&self, promocode_id: i32) -> Result<Vec<PromocodeActivation>> {
        let state = self.state.lock().await;
        Ok(state
            .activations
            .iter()
            .filter(|a| a.promocode_id == promocode_id)
            .cloned()
            .collect())
    }

    async fn count_activations(&self, promocode_id: i32) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.activations.iter().filter(|a| a.promocode_id == promocode_id).count() as i64)
    }

    async fn has_activation(&self, promocode_id: i32, telegram_id: i64) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .activations
            .iter()
            .any(|a| a.promocode_id == promocode_id && a.user_telegram_id == telegram_id))
    }

    async fn activate(&self, promocode_id: i32, telegram_id: i64, grant: Grant) -> Result<ActivationOutcome> {
        let mut state = self.state.lock().await;
        let max_activations = state
            .promocodes
            .get(&promocode_id)
            .map(|p| p.max_activations)
            .ok_or_else(|| anyhow!("Promocode {} not found", promocode_id))?;

        let used = state.activations.iter().filter(|a| a.promocode_id == promocode_id).count() as i64;
        if max_activations >= 0 && used >= max_activations as i64 {
            return Ok(ActivationOutcome::Depleted);
        }
        if state
            .activations
            .iter()
            .any(|a| a.promocode_id == promocode_id && a.user_telegram_id == telegram_id)
        {
            return Ok(ActivationOutcome::AlreadyActivated);
        }

        match state.apply_grant(telegram_id, grant) {
            Ok(applied) => {
                let id = state.next_id();
                state.activations.push(PromocodeActivation {
                    id,
                    promocode_id,
                    user_telegram_id: telegram_id,
                    activated_at: Utc::now(),
                });
                Ok(ActivationOutcome::Applied(applied))
            }
            Err(rejection) => Ok(ActivationOutcome::Rejected(rejection)),
        }
    }
}

#[async_trait]
impl ReferralRepository for MemoryStore {
    async fn create(&self, referrer: i64, referred: i64) -> Result<Option<Referral>> {
        let mut state = self.state.lock().await;
        if state.referrals.iter().any(|r| r.referred_telegram_id == referred) {
            return Ok(None);
        }
        let row = Referral {
            id: state.next_id(),
            referrer_telegram_id: referrer,
            referred_telegram_id: referred,
            created_at: Utc::now(),
        };
        state.referrals.push(row.clone());
        Ok(Some(row))
    }

    async fn get_by_referred(&self, referred: i64) -> Result<Option<Referral>> {
        let state = self.state.lock().await;
        Ok(state
            .referrals
            .iter()
            .find(|r| r.referred_telegram_id == referred)
            .cloned())
    }

    async fn list_by_referrer(&self, referrer: i64) -> Result<Vec<Referral>> {
        let state = self.state.lock().await;
        Ok(state
            .referrals
            .iter()
            .filter(|r| r.referrer_telegram_id == referrer)
            .cloned()
            .collect())
    }

    async fn has_reward_for(&self, inviter: i64, referred: i64) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .rewards
            .iter()
            .any(|r| r.user_telegram_id == inviter && r.referred_telegram_id == referred))
    }

    async fn rewards_for(&self, inviter: i64) -> Result<Vec<ReferralReward>> {
        let state = self.state.lock().await;
        Ok(state
            .rewards
            .iter()
            .filter(|r| r.user_telegram_id == inviter)
            .cloned()
            .collect())
    }

    async fn record_reward(&self, reward: &NewReferralReward, grant: Option<Grant>) -> Result<RewardOutcome> {
        let mut state = self.state.lock().await;
        if state.rewards.iter().any(|r| {
            r.payment_id == reward.payment_id
                && r.user_telegram_id == reward.user_telegram_id
                && r.level == reward.level
        }) {
            return Ok(RewardOutcome::Duplicate);
        }

        let applied = match grant {
            Some(grant) => match state.apply_grant(reward.user_telegram_id, grant) {
                Ok(applied) => applied,
                Err(rejection) => return Ok(RewardOutcome::Rejected(rejection)),
            },
            None => Default::default(),
        };

        let id = state.next_id();
        state.rewards.push(ReferralReward {
            id,
            user_telegram_id: reward.user_telegram_id,
            referred_telegram_id: reward.referred_telegram_id,
            level: reward.level,
            reward_type: reward.reward_type,
            amount: reward.amount,
            payment_id: reward.payment_id,
            created_at: Utc::now(),
        });
        Ok(RewardOutcome::Recorded(applied))
    }

    async fn exchange_points(&self, exchange: &NewPointsExchange, grant: Grant) -> Result<ExchangeOutcome> {
        let mut state = self.state.lock().await;
        let balance = state
            .users
            .get(&exchange.user_telegram_id)
            .map(|u| u.points)
            .ok_or_else(|| anyhow!("User {} not found", exchange.user_telegram_id))?;
        if balance < exchange.points_spent {
            return Ok(ExchangeOutcome::InsufficientPoints { balance });
        }

        let applied = match state.apply_grant(exchange.user_telegram_id, grant) {
            Ok(applied) => applied,
            Err(rejection) => return Ok(ExchangeOutcome::Rejected(rejection)),
        };

        if let Some(user) = state.users.get_mut(&exchange.user_telegram_id) {
            user.points -= exchange.points_spent;
        }
        let id = state.next_id();
        state.exchanges.push(PointsExchange {
            id,
            user_telegram_id: exchange.user_telegram_id,
            exchange_type: exchange.exchange_type,
            points_spent: exchange.points_spent,
            quantity: exchange.quantity,
            created_at: Utc::now(),
        });
        Ok(ExchangeOutcome::Applied {
            applied,
            points_left: balance - exchange.points_spent,
        })
    }
}

#[async_trait]
impl PartnerRepository for MemoryStore {
    async fn create(&self, telegram_id: i64) -> Result<(Partner, bool)> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.partners.values().find(|p| p.user_telegram_id == telegram_id) {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let partner = Partner {
            id: state.next_id(),
            user_telegram_id: telegram_id,
            balance: 0,
            total_earned: 0,
            total_withdrawn: 0,
            referrals_count: 0,
            level2_referrals_count: 0,
            level3_referrals_count: 0,
            is_active: true,
            individual_settings: Json(PartnerIndividualSettings::default()),
            created_at: now,
            updated_at: now,
        };
        state.partners.insert(partner.id, partner.clone());
        Ok((partner, true))
    }

    async fn get(&self, id: i64) -> Result<Option<Partner>> {
        Ok(self.state.lock().await.partners.get(&id).cloned())
    }

    async fn get_by_user(&self, telegram_id: i64) -> Result<Option<Partner>> {
        let state = self.state.lock().await;
        Ok(state
            .partners
            .values()
            .find(|p| p.user_telegram_id == telegram_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Partner>> {
        Ok(self.state.lock().await.partners.values().cloned().collect())
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.partners.get_mut(&id).map(|p| p.is_active = active).is_some())
    }

    async fn update_individual_settings(&self, id: i64, settings: &PartnerIndividualSettings) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .partners
            .get_mut(&id)
            .map(|p| p.individual_settings = Json(settings.clone()))
            .is_some())
    }

    async fn add_referrals(&self, referrals: &[NewPartnerReferral]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for referral in referrals {
            if state.partner_referrals.iter().any(|r| {
                r.partner_id == referral.partner_id
                    && r.referral_telegram_id == referral.referral_telegram_id
            }) {
                continue;
            }
            let id = state.next_id();
            state.partner_referrals.push(PartnerReferral {
                id,
                partner_id: referral.partner_id,
                referral_telegram_id: referral.referral_telegram_id,
                level: referral.level,
                parent_partner_id: referral.parent_partner_id,
                created_at: Utc::now(),
            });
            if let Some(partner) = state.partners.get_mut(&referral.partner_id) {
                match referral.level {
                    1 => partner.referrals_count += 1,
                    2 => partner.level2_referrals_count += 1,
                    _ => partner.level3_referrals_count += 1,
                }
            }
            added += 1;
        }
        Ok(added)
    }

    async fn get_referral(&self, referral_telegram_id: i64, level: i16) -> Result<Option<PartnerReferral>> {
        let state = self.state.lock().await;
        Ok(state
            .partner_referrals
            .iter()
            .find(|r| r.referral_telegram_id == referral_telegram_id && r.level == level)
            .cloned())
    }

    async fn list_referrals(&self, partner_id: i64) -> Result<Vec<PartnerReferral>> {
        let state = self.state.lock().await;
        Ok(state
            .partner_referrals
            .iter()
            .filter(|r| r.partner_id == partner_id)
            .cloned()
            .collect())
    }

    async fn has_transaction_for(&self, partner_id: i64, referral_telegram_id: i64) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .partner_transactions
            .iter()
            .any(|t| t.partner_id == partner_id && t.referral_telegram_id == referral_telegram_id))
    }

    async fn list_transactions(&self, partner_id: i64) -> Result<Vec<PartnerTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .partner_transactions
            .iter()
            .rev()
            .filter(|t| t.partner_id == partner_id)
            .cloned()
            .collect())
    }

    async fn credit(&self, transaction: &NewPartnerTransaction) -> Result<bool> {
        let mut state = self.state.lock().await;
        if transaction.source_payment_id.is_some()
            && state.partner_transactions.iter().any(|t| {
                t.partner_id == transaction.partner_id
                    && t.source_payment_id == transaction.source_payment_id
            })
        {
            return Ok(false);
        }
        let partner = state
            .partners
            .get_mut(&transaction.partner_id)
            .ok_or_else(|| anyhow!("Partner {} not found", transaction.partner_id))?;
        partner.balance += transaction.earned_amount;
        partner.total_earned += transaction.earned_amount;

        let id = state.next_id();
        state.partner_transactions.push(PartnerTransaction {
            id,
            partner_id: transaction.partner_id,
            referral_telegram_id: transaction.referral_telegram_id,
            level: transaction.level,
            payment_amount: transaction.payment_amount,
            percent: transaction.percent,
            earned_amount: transaction.earned_amount,
            source_payment_id: transaction.source_payment_id,
            description: transaction.description.clone(),
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn adjust_balance(&self, id: i64, delta: i64) -> Result<Option<Partner>> {
        let mut state = self.state.lock().await;
        match state.partners.get_mut(&id) {
            Some(partner) if partner.balance + delta >= 0 => {
                partner.balance += delta;
                partner.total_earned += delta;
                Ok(Some(partner.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn request_withdrawal(&self, request: &NewWithdrawal) -> Result<WithdrawalRequestOutcome> {
        if request.amount < request.min_amount || request.amount <= 0 {
            return Ok(WithdrawalRequestOutcome::BelowMinimum);
        }
        let mut state = self.state.lock().await;
        let partner = state
            .partners
            .get_mut(&request.partner_id)
            .ok_or_else(|| anyhow!("Partner {} not found", request.partner_id))?;
        if !partner.is_active {
            return Ok(WithdrawalRequestOutcome::PartnerInactive);
        }
        if request.amount > partner.balance {
            return Ok(WithdrawalRequestOutcome::InsufficientBalance {
                balance: partner.balance,
            });
        }
        partner.balance -= request.amount;

        let now = Utc::now();
        let withdrawal = PartnerWithdrawal {
            id: state.next_id(),
            partner_id: request.partner_id,
            amount: request.amount,
            status: WithdrawalStatus::Pending,
            method: request.method.clone(),
            requisites: request.requisites.clone(),
            admin_comment: None,
            processed_by: None,
            created_at: now,
            updated_at: now,
        };
        state.withdrawals.insert(withdrawal.id, withdrawal.clone());
        Ok(WithdrawalRequestOutcome::Created(withdrawal))
    }

    async fn resolve_withdrawal(
        &self,
        id: i64,
        to: WithdrawalStatus,
        processed_by: Option<i64>,
        comment: Option<&str>,
    ) -> Result<WithdrawalResolveOutcome> {
        let mut state = self.state.lock().await;
        let Some(withdrawal) = state.withdrawals.get(&id).cloned() else {
            return Ok(WithdrawalResolveOutcome::NotFound);
        };
        if withdrawal.status != WithdrawalStatus::Pending || to == WithdrawalStatus::Pending {
            return Ok(WithdrawalResolveOutcome::NotPending(withdrawal.status));
        }

        let partner = state
            .partners
            .get_mut(&withdrawal.partner_id)
            .ok_or_else(|| anyhow!("Partner {} not found", withdrawal.partner_id))?;
        match to {
            WithdrawalStatus::Completed => partner.total_withdrawn += withdrawal.amount,
            _ => partner.balance += withdrawal.amount,
        }
        let partner = partner.clone();

        let row = state
            .withdrawals
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Withdrawal {} vanished", id))?;
        row.status = to;
        row.processed_by = processed_by;
        row.admin_comment = comment.map(str::to_string);
        row.updated_at = Utc::now();

        Ok(WithdrawalResolveOutcome::Resolved {
            withdrawal: row.clone(),
            partner,
        })
    }

    async fn get_withdrawal(&self, id: i64) -> Result<Option<PartnerWithdrawal>> {
        Ok(self.state.lock().await.withdrawals.get(&id).cloned())
    }

    async fn list_withdrawals(&self, partner_id: i64) -> Result<Vec<PartnerWithdrawal>> {
        let state = self.state.lock().await;
        Ok(state
            .withdrawals
            .values()
            .filter(|w| w.partner_id == partner_id)
            .cloned()
            .collect())
    }

    async fn list_withdrawals_by_status(&self, status: WithdrawalStatus) -> Result<Vec<PartnerWithdrawal>> {
        let state = self.state.lock().await;
        Ok(state
            .withdrawals
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect())
    }
}
