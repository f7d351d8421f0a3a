//! Repository seams. Each trait is implemented over PostgreSQL in the
//! sibling modules and, behind the `memory` feature, over an in-process
//! store for tests. Operations that must be atomic are single trait
//! methods; callers never hold a database transaction themselves.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::enums::{PaymentGatewayType, SubscriptionStatus, TransactionStatus, UserRole, WithdrawalStatus};
use crate::models::gateway::PaymentGateway;
use crate::models::grant::{Grant, GrantApplied, GrantRejection};
use crate::models::job::{Job, NewJob};
use crate::models::partner::{
    NewPartnerReferral, NewPartnerTransaction, NewWithdrawal, Partner, PartnerIndividualSettings,
    PartnerReferral, PartnerTransaction, PartnerWithdrawal, WithdrawalRequestOutcome,
    WithdrawalResolveOutcome,
};
use crate::models::plan::{NewPlan, Plan};
use crate::models::promocode::{NewPromocode, Promocode, PromocodeActivation};
use crate::models::referral::{NewPointsExchange, NewReferralReward, Referral, ReferralReward};
use crate::models::settings::Settings;
use crate::models::subscription::{NewSubscription, PanelView, Subscription};
use crate::models::transaction::{NewTransaction, Transaction};
use crate::models::user::{NewUser, User};

pub mod gateway_repo;
pub mod grants;
pub mod job_repo;
pub mod partner_repo;
pub mod plan_repo;
pub mod promocode_repo;
pub mod referral_repo;
pub mod settings_repo;
pub mod subscription_repo;
pub mod transaction_repo;
pub mod user_repo;

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn load(&self) -> Result<Option<Settings>>;
    async fn save(&self, settings: &Settings) -> Result<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, telegram_id: i64) -> Result<Option<User>>;
    async fn get_by_referral_code(&self, code: &str) -> Result<Option<User>>;
    async fn referral_code_exists(&self, code: &str) -> Result<bool>;
    /// Inserts the user; an existing row with the same id is returned unchanged.
    async fn create(&self, user: &NewUser) -> Result<User>;
    async fn list_by_min_role(&self, role: UserRole) -> Result<Vec<User>>;
    /// One-shot: only succeeds while `invited_by` is still empty.
    async fn set_invited_by(&self, telegram_id: i64, inviter: i64) -> Result<bool>;
    async fn set_role(&self, telegram_id: i64, role: UserRole) -> Result<()>;
    async fn set_blocked(&self, telegram_id: i64, blocked: bool) -> Result<()>;
    async fn set_discounts(&self, telegram_id: i64, personal: i32, purchase: i32) -> Result<()>;
    async fn set_max_subscriptions(&self, telegram_id: i64, value: Option<i32>) -> Result<()>;
    async fn set_current_subscription(&self, telegram_id: i64, subscription_id: Option<i64>) -> Result<()>;
    async fn mark_trial_used(&self, telegram_id: i64) -> Result<bool>;
    /// Adds `delta` points; returns the new balance, or `None` when it would go negative.
    async fn adjust_points(&self, telegram_id: i64, delta: i64) -> Result<Option<i64>>;
}

#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn get(&self, id: i32) -> Result<Option<Plan>>;
    async fn list(&self) -> Result<Vec<Plan>>;
    async fn list_active(&self) -> Result<Vec<Plan>>;
    async fn create(&self, plan: &NewPlan) -> Result<Plan>;
    async fn update(&self, plan: &Plan) -> Result<()>;
    async fn set_active(&self, id: i32, active: bool) -> Result<bool>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Subscription>>;
    /// Non-deleted subscriptions of a user, oldest first.
    async fn list_by_user(&self, telegram_id: i64) -> Result<Vec<Subscription>>;
    async fn count_by_user(&self, telegram_id: i64) -> Result<i64>;
    async fn list_by_source_payment(&self, payment_id: Uuid) -> Result<Vec<Subscription>>;
    /// Inserts under the per-user cap (`-1` unlimited), serialized on the user
    /// row. `replacing` is left out of the count and retired to DELETED in the
    /// same unit. Returns `None` when the cap would be exceeded.
    async fn create_within_limit(
        &self,
        subscription: &NewSubscription,
        max_subscriptions: i32,
        replacing: Option<i64>,
        make_current: bool,
    ) -> Result<Option<Subscription>>;
    /// Records the panel's answer to an update without regressing newer
    /// local state: `expire_at := greatest(expire_at, view.expire_at)`, the
    /// url when present, and the panel status unless the row is DELETED or
    /// already ahead of the view.
    async fn store_panel_view(&self, id: i64, view: &PanelView) -> Result<Option<Subscription>>;
    async fn set_status(&self, id: i64, status: SubscriptionStatus) -> Result<bool>;
    /// Applies a paid renewal once per `(payment_id, subscription)`:
    /// `expire_at := max(expire_at, now) + days` (negative days mean lifetime)
    /// and EXPIRED becomes ACTIVE, under the row lock. Returns the row and
    /// whether this call applied it.
    async fn apply_renewal(
        &self,
        id: i64,
        payment_id: Uuid,
        days: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<(Subscription, bool)>>;
    async fn list_expired_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscription>>;
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn create(&self, transaction: &NewTransaction) -> Result<Transaction>;
    async fn get(&self, payment_id: Uuid) -> Result<Option<Transaction>>;
    async fn list_by_user(&self, telegram_id: i64) -> Result<Vec<Transaction>>;
    async fn set_payment_url(&self, payment_id: Uuid, url: &str) -> Result<()>;
    /// Compare-and-set on status; false when the row was not in `from`.
    async fn transition(
        &self,
        payment_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool>;
    /// PENDING -> COMPLETED and the effect enqueues, in one unit.
    async fn complete_and_enqueue(&self, payment_id: Uuid, jobs: &[NewJob]) -> Result<bool>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn enqueue(&self, job: &NewJob) -> Result<bool>;
    /// Leases up to `limit` due jobs; expired leases are reclaimed.
    async fn claim(&self, limit: i64, lease_secs: i64) -> Result<Vec<Job>>;
    async fn complete(&self, id: i64) -> Result<()>;
    async fn reschedule(&self, id: i64, error: &str, run_at: DateTime<Utc>) -> Result<()>;
    async fn bury(&self, id: i64, error: &str) -> Result<()>;
    async fn get_by_key(&self, dedupe_key: &str) -> Result<Option<Job>>;
}

#[async_trait]
pub trait GatewayRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<PaymentGateway>>;
    async fn get(&self, gateway_type: PaymentGatewayType) -> Result<Option<PaymentGateway>>;
    /// Creates a row per gateway type that is not yet present; only Stars starts active.
    async fn ensure_defaults(&self) -> Result<()>;
    async fn update(&self, gateway_type: PaymentGatewayType, is_active: bool, order_index: i32) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    Applied(GrantApplied),
    Depleted,
    AlreadyActivated,
    Rejected(GrantRejection),
}

#[async_trait]
pub trait PromocodeRepository: Send + Sync {
    /// `None` when the code is taken.
    async fn create(&self, promocode: &NewPromocode) -> Result<Option<Promocode>>;
    async fn get(&self, id: i32) -> Result<Option<Promocode>>;
    async fn get_by_code(&self, code: &str) -> Result<Option<Promocode>>;
    async fn list(&self) -> Result<Vec<Promocode>>;
    async fn update(&self, promocode: &Promocode) -> Result<bool>;
    async fn delete(&self, id: i32) -> Result<bool>;
    async fn activations(&self, promocode_id: i32) -> Result<Vec<PromocodeActivation>>;
    async fn count_activations(&self, promocode_id: i32) -> Result<i64>;
    async fn has_activation(&self, promocode_id: i32, telegram_id: i64) -> Result<bool>;
    /// Records the activation and applies the grant in one unit, re-checking
    /// depletion and uniqueness under a lock on the promocode row.
    async fn activate(&self, promocode_id: i32, telegram_id: i64, grant: Grant) -> Result<ActivationOutcome>;
}

#[derive(Debug, Clone)]
pub enum RewardOutcome {
    Recorded(GrantApplied),
    Duplicate,
    Rejected(GrantRejection),
}

#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
    Applied { applied: GrantApplied, points_left: i64 },
    InsufficientPoints { balance: i64 },
    Rejected(GrantRejection),
}

#[async_trait]
pub trait ReferralRepository: Send + Sync {
    async fn create(&self, referrer: i64, referred: i64) -> Result<Option<Referral>>;
    async fn get_by_referred(&self, referred: i64) -> Result<Option<Referral>>;
    async fn list_by_referrer(&self, referrer: i64) -> Result<Vec<Referral>>;
    async fn has_reward_for(&self, inviter: i64, referred: i64) -> Result<bool>;
    async fn rewards_for(&self, inviter: i64) -> Result<Vec<ReferralReward>>;
    /// Inserts the reward (unique per payment, inviter and level) and applies
    /// the grant to the inviter in one unit.
    async fn record_reward(&self, reward: &NewReferralReward, grant: Option<Grant>) -> Result<RewardOutcome>;
    /// Debits points, applies the grant and logs the exchange in one unit.
    async fn exchange_points(&self, exchange: &NewPointsExchange, grant: Grant) -> Result<ExchangeOutcome>;
}

#[async_trait]
pub trait PartnerRepository: Send + Sync {
    /// Returns the partner and whether it was created by this call.
    async fn create(&self, telegram_id: i64) -> Result<(Partner, bool)>;
    async fn get(&self, id: i64) -> Result<Option<Partner>>;
    async fn get_by_user(&self, telegram_id: i64) -> Result<Option<Partner>>;
    async fn list(&self) -> Result<Vec<Partner>>;
    async fn set_active(&self, id: i64, active: bool) -> Result<bool>;
    async fn update_individual_settings(&self, id: i64, settings: &PartnerIndividualSettings) -> Result<bool>;
    /// Inserts chain rows and bumps the per-level counters; existing rows are kept.
    async fn add_referrals(&self, referrals: &[NewPartnerReferral]) -> Result<usize>;
    async fn get_referral(&self, referral_telegram_id: i64, level: i16) -> Result<Option<PartnerReferral>>;
    async fn list_referrals(&self, partner_id: i64) -> Result<Vec<PartnerReferral>>;
    async fn has_transaction_for(&self, partner_id: i64, referral_telegram_id: i64) -> Result<bool>;
    async fn list_transactions(&self, partner_id: i64) -> Result<Vec<PartnerTransaction>>;
    /// Inserts the earning and credits balance and total_earned atomically;
    /// false when this payment was already credited to the partner.
    async fn credit(&self, transaction: &NewPartnerTransaction) -> Result<bool>;
    /// Moves balance and total_earned together; `None` when balance would go negative.
    async fn adjust_balance(&self, id: i64, delta: i64) -> Result<Option<Partner>>;
    async fn request_withdrawal(&self, request: &NewWithdrawal) -> Result<WithdrawalRequestOutcome>;
    async fn resolve_withdrawal(
        &self,
        id: i64,
        to: WithdrawalStatus,
        processed_by: Option<i64>,
        comment: Option<&str>,
    ) -> Result<WithdrawalResolveOutcome>;
    async fn get_withdrawal(&self, id: i64) -> Result<Option<PartnerWithdrawal>>;
    async fn list_withdrawals(&self, partner_id: i64) -> Result<Vec<PartnerWithdrawal>>;
    async fn list_withdrawals_by_status(&self, status: WithdrawalStatus) -> Result<Vec<PartnerWithdrawal>>;
}

/// Shared handles to every repository, cheap to clone into services.
#[derive(Clone)]
pub struct Repositories {
    pub settings: Arc<dyn SettingsRepository>,
    pub users: Arc<dyn UserRepository>,
    pub plans: Arc<dyn PlanRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub transactions: Arc<dyn TransactionRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub gateways: Arc<dyn GatewayRepository>,
    pub promocodes: Arc<dyn PromocodeRepository>,
    pub referrals: Arc<dyn ReferralRepository>,
    pub partners: Arc<dyn PartnerRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            settings: Arc::new(settings_repo::PgSettingsRepository::new(pool.clone())),
            users: Arc::new(user_repo::PgUserRepository::new(pool.clone())),
            plans: Arc::new(plan_repo::PgPlanRepository::new(pool.clone())),
            subscriptions: Arc::new(subscription_repo::PgSubscriptionRepository::new(pool.clone())),
            transactions: Arc::new(transaction_repo::PgTransactionRepository::new(pool.clone())),
            jobs: Arc::new(job_repo::PgJobRepository::new(pool.clone())),
            gateways: Arc::new(gateway_repo::PgGatewayRepository::new(pool.clone())),
            promocodes: Arc::new(promocode_repo::PgPromocodeRepository::new(pool.clone())),
            referrals: Arc::new(referral_repo::PgReferralRepository::new(pool.clone())),
            partners: Arc::new(partner_repo::PgPartnerRepository::new(pool)),
        }
    }
}
