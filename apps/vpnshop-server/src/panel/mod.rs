//! Client seam to the VPN control panel. The adapter maps requests and
//! responses only; every policy decision lives in the provisioner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vpnshop_db::models::enums::SubscriptionStatus;
use vpnshop_db::models::plan::PlanSnapshot;
use vpnshop_db::models::subscription::Subscription;

use crate::context::CallContext;
use crate::error::PanelError;

pub mod remnawave;

pub use remnawave::RemnawaveClient;

/// Desired panel-side state of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelUserSpec {
    pub username: String,
    pub telegram_id: i64,
    pub status: SubscriptionStatus,
    pub expire_at: DateTime<Utc>,
    /// Bytes; `-1` unlimited.
    pub traffic_limit: i64,
    /// `-1` unlimited.
    pub device_limit: i32,
    pub internal_squads: Vec<Uuid>,
    pub external_squad: Option<Uuid>,
    pub description: Option<String>,
}

impl PanelUserSpec {
    pub fn from_plan(
        username: String,
        telegram_id: i64,
        plan: &PlanSnapshot,
        expire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            username,
            telegram_id,
            status: SubscriptionStatus::Active,
            expire_at,
            traffic_limit: plan.traffic_limit,
            device_limit: plan.device_limit,
            internal_squads: plan.internal_squads.clone(),
            external_squad: plan.external_squad,
            description: Some(plan.name.clone()),
        }
    }

    pub fn from_subscription(subscription: &Subscription) -> Self {
        Self {
            username: subscription.panel_username.clone(),
            telegram_id: subscription.user_telegram_id,
            status: subscription.status,
            expire_at: subscription.expire_at,
            traffic_limit: subscription.traffic_limit,
            device_limit: subscription.device_limit,
            internal_squads: subscription.internal_squads.clone(),
            external_squad: subscription.external_squad,
            description: Some(subscription.plan.name.clone()),
        }
    }
}

/// Canonical panel view of a user after any call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PanelUser {
    pub uuid: Uuid,
    pub username: String,
    pub status: SubscriptionStatus,
    pub expire_at: DateTime<Utc>,
    pub subscription_url: String,
    pub traffic_limit: i64,
    pub device_limit: i32,
    pub internal_squads: Vec<Uuid>,
    pub external_squad: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InternalSquad {
    pub uuid: Uuid,
    pub name: String,
}

#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn create_user(&self, ctx: &CallContext, spec: &PanelUserSpec) -> Result<PanelUser, PanelError>;
    async fn update_user(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
        spec: &PanelUserSpec,
        reset_traffic: bool,
    ) -> Result<PanelUser, PanelError>;
    /// Succeeds when the user is already gone.
    async fn delete_user(&self, ctx: &CallContext, uuid: Uuid) -> Result<(), PanelError>;
    async fn get_user(&self, ctx: &CallContext, uuid: Uuid) -> Result<Option<PanelUser>, PanelError>;
    async fn get_user_by_username(&self, ctx: &CallContext, username: &str) -> Result<Option<PanelUser>, PanelError>;
    async fn list_internal_squads(&self, ctx: &CallContext) -> Result<Vec<InternalSquad>, PanelError>;
}
