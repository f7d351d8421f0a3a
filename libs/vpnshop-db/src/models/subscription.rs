use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use super::enums::{DeviceType, SubscriptionStatus};
use super::plan::PlanSnapshot;

/// Lifetime plans are stored with a far-future expiry.
pub const LIFETIME_DAYS: i64 = 36_500;

/// Expiry after a paid renewal of `days`; negative means lifetime. Never
/// earlier than `current`.
pub fn renewed_expiry(current: DateTime<Utc>, now: DateTime<Utc>, days: i32) -> DateTime<Utc> {
    if days < 0 {
        current.max(now + Duration::days(LIFETIME_DAYS))
    } else {
        current.max(now) + Duration::days(days as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_telegram_id: i64,
    pub panel_uuid: Uuid,
    pub panel_username: String,
    pub status: SubscriptionStatus,
    pub is_trial: bool,
    pub traffic_limit: i64,
    pub device_limit: i32,
    pub internal_squads: Vec<Uuid>,
    pub external_squad: Option<Uuid>,
    pub expire_at: DateTime<Utc>,
    pub url: String,
    pub device_type: Option<DeviceType>,
    pub plan: Json<PlanSnapshot>,
    pub source_payment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    pub fn is_deleted(&self) -> bool {
        self.status == SubscriptionStatus::Deleted
    }

    pub fn is_lifetime(&self) -> bool {
        self.plan.is_lifetime()
    }
}

/// What the panel reported after an update. Stored without moving the
/// expiry backwards; see `SubscriptionRepository::store_panel_view`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelView {
    pub expire_at: DateTime<Utc>,
    pub url: Option<String>,
    pub status: SubscriptionStatus,
}

/// Row to insert once the panel has accepted the user.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_telegram_id: i64,
    pub panel_uuid: Uuid,
    pub panel_username: String,
    pub status: SubscriptionStatus,
    pub is_trial: bool,
    pub traffic_limit: i64,
    pub device_limit: i32,
    pub internal_squads: Vec<Uuid>,
    pub external_squad: Option<Uuid>,
    pub expire_at: DateTime<Utc>,
    pub url: String,
    pub device_type: Option<DeviceType>,
    pub plan: PlanSnapshot,
    pub source_payment_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_extends_from_the_later_of_expiry_and_now() {
        let now = Utc::now();
        let ahead = now + Duration::days(10);
        assert_eq!(renewed_expiry(ahead, now, 30), ahead + Duration::days(30));

        let lapsed = now - Duration::days(3);
        assert_eq!(renewed_expiry(lapsed, now, 30), now + Duration::days(30));
    }

    #[test]
    fn lifetime_renewal_never_shortens() {
        let now = Utc::now();
        assert_eq!(renewed_expiry(now, now, -1), now + Duration::days(LIFETIME_DAYS));
        let further = now + Duration::days(LIFETIME_DAYS + 5);
        assert_eq!(renewed_expiry(further, now, -1), further);
    }
}
