use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::enums::{PointsExchangeType, ReferralRewardType};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Referral {
    pub id: i64,
    pub referrer_telegram_id: i64,
    pub referred_telegram_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReferralReward {
    pub id: i64,
    /// Inviter that received the reward.
    pub user_telegram_id: i64,
    /// Payer whose payment produced it.
    pub referred_telegram_id: i64,
    pub level: i16,
    pub reward_type: ReferralRewardType,
    pub amount: i64,
    pub payment_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReferralReward {
    pub user_telegram_id: i64,
    pub referred_telegram_id: i64,
    pub level: i16,
    pub reward_type: ReferralRewardType,
    pub amount: i64,
    pub payment_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PointsExchange {
    pub id: i64,
    pub user_telegram_id: i64,
    pub exchange_type: PointsExchangeType,
    pub points_spent: i64,
    /// Days, percent or GiB depending on the type; the gift code id for gifts.
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPointsExchange {
    pub user_telegram_id: i64,
    pub exchange_type: PointsExchangeType,
    pub points_spent: i64,
    pub quantity: i64,
}
