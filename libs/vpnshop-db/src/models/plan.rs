use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use super::enums::{Currency, PlanAvailability, PlanType};

/// Sentinel for "no limit" on traffic, devices, activations and lifetimes.
pub const UNLIMITED: i64 = -1;

pub const GIB: i64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPrice {
    pub currency: Currency,
    /// Minor units.
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDuration {
    /// Days of access; `-1` for a lifetime plan.
    pub days: i32,
    #[serde(default)]
    pub prices: Vec<PlanPrice>,
}

impl PlanDuration {
    pub fn price(&self, currency: Currency) -> Option<i64> {
        self.prices
            .iter()
            .find(|p| p.currency == currency)
            .map(|p| p.amount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: i32,
    pub order_index: i32,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub availability: PlanAvailability,
    pub allowed_user_ids: Vec<i64>,
    pub traffic_limit: i64,
    pub device_limit: i32,
    pub subscription_count: i32,
    pub durations: Json<Vec<PlanDuration>>,
    pub internal_squads: Vec<Uuid>,
    pub external_squad: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn duration(&self, days: i32) -> Option<&PlanDuration> {
        self.durations.iter().find(|d| d.days == days)
    }

    pub fn price(&self, days: i32, currency: Currency) -> Option<i64> {
        self.duration(days).and_then(|d| d.price(currency))
    }

    pub fn snapshot(&self, days: i32) -> PlanSnapshot {
        PlanSnapshot {
            id: self.id,
            name: self.name.clone(),
            plan_type: self.plan_type,
            traffic_limit: self.traffic_limit,
            device_limit: self.device_limit,
            duration: days,
            subscription_count: self.subscription_count,
            internal_squads: self.internal_squads.clone(),
            external_squad: self.external_squad,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub name: String,
    pub description: Option<String>,
    pub plan_type: PlanType,
    pub availability: PlanAvailability,
    pub allowed_user_ids: Vec<i64>,
    pub traffic_limit: i64,
    pub device_limit: i32,
    pub subscription_count: i32,
    pub durations: Vec<PlanDuration>,
    pub internal_squads: Vec<Uuid>,
    pub external_squad: Option<Uuid>,
    pub is_active: bool,
}

/// Point-in-time copy of a plan stored with transactions, subscriptions and
/// promocodes. Missing fields decode to defaults so older rows stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanSnapshot {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type", alias = "plan_type")]
    pub plan_type: PlanType,
    #[serde(alias = "traffic_limit_bytes")]
    pub traffic_limit: i64,
    pub device_limit: i32,
    #[serde(alias = "duration_days")]
    pub duration: i32,
    pub subscription_count: i32,
    pub internal_squads: Vec<Uuid>,
    pub external_squad: Option<Uuid>,
}

impl Default for PlanSnapshot {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            plan_type: PlanType::Unlimited,
            traffic_limit: UNLIMITED,
            device_limit: UNLIMITED as i32,
            duration: 30,
            subscription_count: 1,
            internal_squads: Vec::new(),
            external_squad: None,
        }
    }
}

impl PlanSnapshot {
    /// Snapshot used by operator test payments.
    pub fn test() -> Self {
        Self {
            id: -1,
            name: "test".to_string(),
            duration: 1,
            ..Self::default()
        }
    }

    pub fn is_lifetime(&self) -> bool {
        self.duration < 0
    }

    pub fn is_unlimited_traffic(&self) -> bool {
        self.traffic_limit < 0
    }

    pub fn is_unlimited_devices(&self) -> bool {
        self.device_limit < 0
    }

    /// Structural equality ignoring name, id and duration; used to re-home
    /// a subscription whose plan was deactivated.
    pub fn same_shape(&self, other: &PlanSnapshot) -> bool {
        let mut a = self.internal_squads.clone();
        let mut b = other.internal_squads.clone();
        a.sort();
        b.sort();
        self.plan_type == other.plan_type
            && self.traffic_limit == other.traffic_limit
            && self.device_limit == other.device_limit
            && self.external_squad == other.external_squad
            && a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_decodes_with_missing_and_renamed_fields() {
        let raw = r#"{"id": 4, "name": "Pro", "type": "TRAFFIC", "traffic_limit_bytes": 1024, "duration_days": 90}"#;
        let snapshot: PlanSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.id, 4);
        assert_eq!(snapshot.plan_type, PlanType::Traffic);
        assert_eq!(snapshot.traffic_limit, 1024);
        assert_eq!(snapshot.duration, 90);
        assert_eq!(snapshot.subscription_count, 1);
        assert_eq!(snapshot.device_limit, -1);
        assert!(snapshot.internal_squads.is_empty());
    }

    #[test]
    fn shape_ignores_squad_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let left = PlanSnapshot {
            internal_squads: vec![a, b],
            ..PlanSnapshot::default()
        };
        let right = PlanSnapshot {
            id: 9,
            name: "other".into(),
            internal_squads: vec![b, a],
            ..PlanSnapshot::default()
        };
        assert!(left.same_shape(&right));
    }
}
