//! In-process store implementing every repository trait. All data sits
//! behind one `tokio::sync::Mutex`, so each trait call is trivially atomic
//! and linearizable. Used by tests and local dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::types::Json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::enums::SubscriptionStatus;
use crate::models::gateway::PaymentGateway;
use crate::models::grant::{Grant, GrantApplied, GrantRejection};
use crate::models::job::Job;
use crate::models::partner::{Partner, PartnerReferral, PartnerTransaction, PartnerWithdrawal};
use crate::models::plan::Plan;
use crate::models::promocode::{NewPromocode, Promocode, PromocodeActivation};
use crate::models::referral::{PointsExchange, Referral, ReferralReward};
use crate::models::settings::Settings;
use crate::models::subscription::{NewSubscription, Subscription};
use crate::models::transaction::Transaction;
use crate::models::user::User;
use crate::repositories::Repositories;

mod impls;

#[derive(Default)]
pub(crate) struct State {
    pub settings: Option<Settings>,
    pub users: BTreeMap<i64, User>,
    pub plans: BTreeMap<i32, Plan>,
    pub subscriptions: BTreeMap<i64, Subscription>,
    pub renewals: HashSet<(Uuid, i64)>,
    pub transactions: BTreeMap<Uuid, Transaction>,
    pub jobs: BTreeMap<i64, Job>,
    pub gateways: Vec<PaymentGateway>,
    pub promocodes: BTreeMap<i32, Promocode>,
    pub activations: Vec<PromocodeActivation>,
    pub referrals: Vec<Referral>,
    pub rewards: Vec<ReferralReward>,
    pub exchanges: Vec<PointsExchange>,
    pub partners: BTreeMap<i64, Partner>,
    pub partner_referrals: Vec<PartnerReferral>,
    pub partner_transactions: Vec<PartnerTransaction>,
    pub withdrawals: BTreeMap<i64, PartnerWithdrawal>,
    next_id: i64,
}

impl State {
    pub fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn count_live_subscriptions(&self, telegram_id: i64, excluding: Option<i64>) -> i64 {
        self.subscriptions
            .values()
            .filter(|s| s.user_telegram_id == telegram_id && !s.is_deleted())
            .filter(|s| Some(s.id) != excluding)
            .count() as i64
    }

    pub fn insert_subscription_within_limit(
        &mut self,
        new: &NewSubscription,
        max_subscriptions: i32,
        replacing: Option<i64>,
        make_current: bool,
    ) -> Option<Subscription> {
        if max_subscriptions >= 0
            && self.count_live_subscriptions(new.user_telegram_id, replacing) + 1
                > max_subscriptions as i64
        {
            return None;
        }

        let now = Utc::now();
        let sub = Subscription {
            id: self.next_id(),
            user_telegram_id: new.user_telegram_id,
            panel_uuid: new.panel_uuid,
            panel_username: new.panel_username.clone(),
            status: new.status,
            is_trial: new.is_trial,
            traffic_limit: new.traffic_limit,
            device_limit: new.device_limit,
            internal_squads: new.internal_squads.clone(),
            external_squad: new.external_squad,
            expire_at: new.expire_at,
            url: new.url.clone(),
            device_type: new.device_type,
            plan: Json(new.plan.clone()),
            source_payment_id: new.source_payment_id,
            created_at: now,
            updated_at: now,
        };
        self.subscriptions.insert(sub.id, sub.clone());

        if let Some(replaced) = replacing {
            if let Some(old) = self
                .subscriptions
                .get_mut(&replaced)
                .filter(|s| s.user_telegram_id == new.user_telegram_id)
            {
                old.status = SubscriptionStatus::Deleted;
                old.updated_at = now;
            }
        }

        if make_current {
            if let Some(user) = self.users.get_mut(&new.user_telegram_id) {
                user.current_subscription_id = Some(sub.id);
                user.updated_at = now;
            }
        }
        Some(sub)
    }

    pub fn insert_promocode(&mut self, new: &NewPromocode) -> Option<Promocode> {
        let code = Promocode::normalize_code(&new.code);
        if self.promocodes.values().any(|p| p.code == code) {
            return None;
        }
        let now = Utc::now();
        let promocode = Promocode {
            id: self.next_id() as i32,
            code,
            reward_type: new.reward_type,
            availability: new.availability,
            allowed_user_ids: new.allowed_user_ids.clone(),
            reward: new.reward,
            plan: new.plan.clone().map(Json),
            lifetime: new.lifetime,
            max_activations: new.max_activations,
            is_active: new.is_active,
            created_at: now,
            updated_at: now,
        };
        self.promocodes.insert(promocode.id, promocode.clone());
        Some(promocode)
    }

    fn owned_subscription(&mut self, id: i64, telegram_id: i64) -> Option<&mut Subscription> {
        self.subscriptions
            .get_mut(&id)
            .filter(|s| s.user_telegram_id == telegram_id && s.status != SubscriptionStatus::Deleted)
    }

    /// Mirrors the PostgreSQL grant semantics; leaves state untouched on rejection.
    pub fn apply_grant(&mut self, telegram_id: i64, grant: Grant) -> Result<GrantApplied, GrantRejection> {
        let now = Utc::now();
        match grant {
            Grant::SetPersonalDiscount { percent } => {
                let user = self.users.get_mut(&telegram_id).ok_or(GrantRejection::UserMissing)?;
                user.personal_discount = percent.clamp(0, 100);
                Ok(GrantApplied::default())
            }
            Grant::SetPurchaseDiscount { percent } => {
                let user = self.users.get_mut(&telegram_id).ok_or(GrantRejection::UserMissing)?;
                user.purchase_discount = percent.clamp(0, 100);
                Ok(GrantApplied::default())
            }
            Grant::AddPurchaseDiscount { percent } => {
                let user = self.users.get_mut(&telegram_id).ok_or(GrantRejection::UserMissing)?;
                user.purchase_discount = (user.purchase_discount + percent.max(0)).min(100);
                Ok(GrantApplied::default())
            }
            Grant::AddPoints { points } => {
                let user = self.users.get_mut(&telegram_id).ok_or(GrantRejection::UserMissing)?;
                user.points += points;
                Ok(GrantApplied::default())
            }
            Grant::ExtendSubscription {
                subscription_id,
                days,
            } => {
                let sub = self
                    .owned_subscription(subscription_id, telegram_id)
                    .filter(|s| !s.is_lifetime())
                    .ok_or(GrantRejection::SubscriptionUnavailable)?;
                sub.expire_at = sub.expire_at.max(now) + Duration::days(days as i64);
                sub.updated_at = now;
                Ok(GrantApplied {
                    subscription: Some(sub.clone()),
                    promocode: None,
                })
            }
            Grant::AddTraffic {
                subscription_id,
                bytes,
            } => {
                let sub = self
                    .owned_subscription(subscription_id, telegram_id)
                    .filter(|s| s.traffic_limit >= 0)
                    .ok_or(GrantRejection::SubscriptionUnavailable)?;
                sub.traffic_limit += bytes;
                sub.plan.traffic_limit = sub.traffic_limit;
                sub.updated_at = now;
                Ok(GrantApplied {
                    subscription: Some(sub.clone()),
                    promocode: None,
                })
            }
            Grant::AddDevices {
                subscription_id,
                count,
            } => {
                let sub = self
                    .owned_subscription(subscription_id, telegram_id)
                    .filter(|s| s.device_limit >= 0)
                    .ok_or(GrantRejection::SubscriptionUnavailable)?;
                sub.device_limit += count;
                sub.plan.device_limit = sub.device_limit;
                sub.updated_at = now;
                Ok(GrantApplied {
                    subscription: Some(sub.clone()),
                    promocode: None,
                })
            }
            Grant::CreateSubscription {
                subscription,
                max_subscriptions,
                make_current,
            } => self
                .insert_subscription_within_limit(&subscription, max_subscriptions, None, make_current)
                .map(|sub| GrantApplied {
                    subscription: Some(sub),
                    promocode: None,
                })
                .ok_or(GrantRejection::SubscriptionLimit),
            Grant::CreatePromocode { promocode } => self
                .insert_promocode(&promocode)
                .map(|code| GrantApplied {
                    subscription: None,
                    promocode: Some(code),
                })
                .ok_or(GrantRejection::CodeConflict),
        }
    }
}

/// Handle shared by every in-memory repository.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub(crate) state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repositories(&self) -> Repositories {
        Repositories {
            settings: Arc::new(self.clone()),
            users: Arc::new(self.clone()),
            plans: Arc::new(self.clone()),
            subscriptions: Arc::new(self.clone()),
            transactions: Arc::new(self.clone()),
            jobs: Arc::new(self.clone()),
            gateways: Arc::new(self.clone()),
            promocodes: Arc::new(self.clone()),
            referrals: Arc::new(self.clone()),
            partners: Arc::new(self.clone()),
        }
    }

    /// All jobs ever enqueued, in insertion order.
    pub async fn jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    /// Overwrites a subscription row as-is; lets tests age rows.
    pub async fn put_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }
}
