use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

use super::enums::{PromocodeAvailability, PromocodeRewardType};
use super::plan::PlanSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Promocode {
    pub id: i32,
    pub code: String,
    pub reward_type: PromocodeRewardType,
    pub availability: PromocodeAvailability,
    pub allowed_user_ids: Vec<i64>,
    pub reward: Option<i32>,
    pub plan: Option<Json<PlanSnapshot>>,
    /// Days; `-1` never expires.
    pub lifetime: i32,
    /// `-1` never depletes.
    pub max_activations: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Promocode {
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_uppercase()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lifetime >= 0 && now > self.created_at + Duration::days(self.lifetime as i64)
    }

    pub fn is_depleted(&self, activations: i64) -> bool {
        self.max_activations >= 0 && activations >= self.max_activations as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromocodeActivation {
    pub id: i64,
    pub promocode_id: i32,
    pub user_telegram_id: i64,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPromocode {
    pub code: String,
    pub reward_type: PromocodeRewardType,
    pub availability: PromocodeAvailability,
    pub allowed_user_ids: Vec<i64>,
    pub reward: Option<i32>,
    pub plan: Option<PlanSnapshot>,
    pub lifetime: i32,
    pub max_activations: i32,
    pub is_active: bool,
}
