use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use super::enums::{AccrualStrategy, PartnerRewardType, WithdrawalStatus};

pub const PARTNER_LEVELS: [i16; 3] = [1, 2, 3];

/// Per-partner override of the global partner policy. With
/// `use_global_settings` the remaining fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnerIndividualSettings {
    pub use_global_settings: bool,
    pub accrual_strategy: AccrualStrategy,
    pub reward_type: PartnerRewardType,
    pub level1_percent: Option<Decimal>,
    pub level2_percent: Option<Decimal>,
    pub level3_percent: Option<Decimal>,
    /// Minor units.
    pub level1_fixed_amount: Option<i64>,
    pub level2_fixed_amount: Option<i64>,
    pub level3_fixed_amount: Option<i64>,
}

impl Default for PartnerIndividualSettings {
    fn default() -> Self {
        Self {
            use_global_settings: true,
            accrual_strategy: AccrualStrategy::OnEachPayment,
            reward_type: PartnerRewardType::Percent,
            level1_percent: None,
            level2_percent: None,
            level3_percent: None,
            level1_fixed_amount: None,
            level2_fixed_amount: None,
            level3_fixed_amount: None,
        }
    }
}

impl PartnerIndividualSettings {
    pub fn level_percent(&self, level: i16) -> Option<Decimal> {
        match level {
            1 => self.level1_percent,
            2 => self.level2_percent,
            3 => self.level3_percent,
            _ => None,
        }
    }

    pub fn level_fixed_amount(&self, level: i16) -> Option<i64> {
        match level {
            1 => self.level1_fixed_amount,
            2 => self.level2_fixed_amount,
            3 => self.level3_fixed_amount,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Partner {
    pub id: i64,
    pub user_telegram_id: i64,
    pub balance: i64,
    pub total_earned: i64,
    pub total_withdrawn: i64,
    pub referrals_count: i32,
    pub level2_referrals_count: i32,
    pub level3_referrals_count: i32,
    pub is_active: bool,
    pub individual_settings: Json<PartnerIndividualSettings>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Partner {
    pub fn total_referrals(&self) -> i32 {
        self.referrals_count + self.level2_referrals_count + self.level3_referrals_count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PartnerReferral {
    pub id: i64,
    pub partner_id: i64,
    pub referral_telegram_id: i64,
    pub level: i16,
    pub parent_partner_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPartnerReferral {
    pub partner_id: i64,
    pub referral_telegram_id: i64,
    pub level: i16,
    pub parent_partner_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PartnerTransaction {
    pub id: i64,
    pub partner_id: i64,
    pub referral_telegram_id: i64,
    pub level: i16,
    pub payment_amount: i64,
    pub percent: Decimal,
    pub earned_amount: i64,
    pub source_payment_id: Option<Uuid>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPartnerTransaction {
    pub partner_id: i64,
    pub referral_telegram_id: i64,
    pub level: i16,
    pub payment_amount: i64,
    pub percent: Decimal,
    pub earned_amount: i64,
    pub source_payment_id: Option<Uuid>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PartnerWithdrawal {
    pub id: i64,
    pub partner_id: i64,
    pub amount: i64,
    pub status: WithdrawalStatus,
    pub method: String,
    pub requisites: String,
    pub admin_comment: Option<String>,
    pub processed_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub partner_id: i64,
    pub amount: i64,
    pub method: String,
    pub requisites: String,
    pub min_amount: i64,
}

/// Result of the atomic hold performed when a partner requests a payout.
#[derive(Debug, Clone)]
pub enum WithdrawalRequestOutcome {
    Created(PartnerWithdrawal),
    BelowMinimum,
    InsufficientBalance { balance: i64 },
    PartnerInactive,
}

#[derive(Debug, Clone)]
pub enum WithdrawalResolveOutcome {
    Resolved {
        withdrawal: PartnerWithdrawal,
        partner: Partner,
    },
    NotPending(WithdrawalStatus),
    NotFound,
}
