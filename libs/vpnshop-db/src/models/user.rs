use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::enums::UserRole;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub name: String,
    pub language: String,
    pub role: UserRole,
    pub is_blocked: bool,
    pub referral_code: String,
    pub invited_by: Option<i64>,
    pub points: i64,
    pub personal_discount: i32,
    pub purchase_discount: i32,
    pub current_subscription_id: Option<i64>,
    pub max_subscriptions: Option<i32>,
    pub is_trial_used: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_privileged(&self) -> bool {
        self.role >= UserRole::Admin
    }

    /// The larger of the two discounts; they never stack.
    pub fn effective_discount(&self) -> i32 {
        self.personal_discount.max(self.purchase_discount).clamp(0, 100)
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub name: String,
    pub language: String,
    pub role: UserRole,
    pub referral_code: String,
}
