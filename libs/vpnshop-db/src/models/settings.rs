use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{
    AccessMode, AccrualStrategy, Currency, PaymentGatewayType, PointsExchangeType,
    ReferralRewardStrategy, ReferralRewardType,
};

/// Global policy document, persisted as a single JSONB row. Every struct
/// decodes with defaults so new fields never break older rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub access_mode: AccessMode,
    pub default_currency: Currency,
    pub system_notifications: SystemNotificationSettings,
    pub user_notifications: UserNotificationSettings,
    pub referral: ReferralSettings,
    pub partner: PartnerSettings,
    pub multi_subscription: MultiSubscriptionSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::Public,
            default_currency: Currency::Xtr,
            system_notifications: SystemNotificationSettings::default(),
            user_notifications: UserNotificationSettings::default(),
            referral: ReferralSettings::default(),
            partner: PartnerSettings::default(),
            multi_subscription: MultiSubscriptionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemNotificationSettings {
    pub user_registered: bool,
    pub subscription: bool,
    pub promocode_activated: bool,
    pub trial_getted: bool,
    pub referral_attached: bool,
    pub partner_withdrawal: bool,
}

impl Default for SystemNotificationSettings {
    fn default() -> Self {
        Self {
            user_registered: true,
            subscription: true,
            promocode_activated: true,
            trial_getted: true,
            referral_attached: true,
            partner_withdrawal: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserNotificationSettings {
    pub referral_attached: bool,
    pub referral_reward: bool,
    pub partner_earning: bool,
    pub withdrawal_resolved: bool,
}

impl Default for UserNotificationSettings {
    fn default() -> Self {
        Self {
            referral_attached: true,
            referral_reward: true,
            partner_earning: true,
            withdrawal_resolved: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralRewardSettings {
    #[serde(rename = "type")]
    pub reward_type: ReferralRewardType,
    pub strategy: ReferralRewardStrategy,
    /// Reward per level; levels without an entry earn nothing.
    pub config: BTreeMap<i16, i64>,
}

impl Default for ReferralRewardSettings {
    fn default() -> Self {
        Self {
            reward_type: ReferralRewardType::ExtraDays,
            strategy: ReferralRewardStrategy::Amount,
            config: BTreeMap::from([(1, 5)]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralSettings {
    pub enable: bool,
    pub level: i16,
    pub accrual_strategy: AccrualStrategy,
    pub reward: ReferralRewardSettings,
    pub eligible_plan_ids: Vec<i32>,
    pub points_exchange: PointsExchangeSettings,
}

impl Default for ReferralSettings {
    fn default() -> Self {
        Self {
            enable: true,
            level: 1,
            accrual_strategy: AccrualStrategy::OnFirstPayment,
            reward: ReferralRewardSettings::default(),
            eligible_plan_ids: Vec::new(),
            points_exchange: PointsExchangeSettings::default(),
        }
    }
}

impl ReferralSettings {
    pub fn max_level(&self) -> i16 {
        self.level.clamp(1, 3)
    }

    pub fn is_plan_eligible(&self, plan_id: i32) -> bool {
        self.eligible_plan_ids.is_empty() || self.eligible_plan_ids.contains(&plan_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeTypeSettings {
    pub enabled: bool,
    pub points_cost: i64,
    pub min_points: i64,
    /// `-1` means no cap.
    pub max_points: i64,
    pub gift_plan_id: Option<i32>,
    pub gift_duration_days: i32,
    pub max_discount_percent: i32,
    pub max_traffic_gb: i64,
}

impl Default for ExchangeTypeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            points_cost: 1,
            min_points: 1,
            max_points: -1,
            gift_plan_id: None,
            gift_duration_days: 30,
            max_discount_percent: 50,
            max_traffic_gb: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointsExchangeSettings {
    pub exchange_enabled: bool,
    pub subscription_days: ExchangeTypeSettings,
    pub gift_subscription: ExchangeTypeSettings,
    pub discount: ExchangeTypeSettings,
    pub traffic: ExchangeTypeSettings,
}

impl Default for PointsExchangeSettings {
    fn default() -> Self {
        Self {
            exchange_enabled: true,
            subscription_days: ExchangeTypeSettings::default(),
            gift_subscription: ExchangeTypeSettings {
                enabled: false,
                points_cost: 30,
                min_points: 30,
                max_points: 30,
                ..ExchangeTypeSettings::default()
            },
            discount: ExchangeTypeSettings {
                enabled: false,
                points_cost: 10,
                min_points: 10,
                max_points: 500,
                ..ExchangeTypeSettings::default()
            },
            traffic: ExchangeTypeSettings {
                enabled: false,
                points_cost: 5,
                min_points: 5,
                ..ExchangeTypeSettings::default()
            },
        }
    }
}

impl PointsExchangeSettings {
    pub fn for_type(&self, exchange_type: PointsExchangeType) -> &ExchangeTypeSettings {
        match exchange_type {
            PointsExchangeType::SubscriptionDays => &self.subscription_days,
            PointsExchangeType::GiftSubscription => &self.gift_subscription,
            PointsExchangeType::Discount => &self.discount,
            PointsExchangeType::Traffic => &self.traffic,
        }
    }

    pub fn enabled_types(&self) -> Vec<PointsExchangeType> {
        if !self.exchange_enabled {
            return Vec::new();
        }
        PointsExchangeType::ALL
            .iter()
            .copied()
            .filter(|t| self.for_type(*t).enabled)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnerSettings {
    pub enabled: bool,
    pub level1_percent: Decimal,
    pub level2_percent: Decimal,
    pub level3_percent: Decimal,
    pub tax_percent: Decimal,
    /// Kopecks.
    pub min_withdrawal_amount: i64,
    pub auto_calculate_commission: bool,
    pub gateway_commissions: HashMap<PaymentGatewayType, Decimal>,
    /// Kopecks credited per one major unit of a non-RUB payment currency.
    pub currency_rates: HashMap<Currency, Decimal>,
}

impl Default for PartnerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level1_percent: Decimal::new(10, 0),
            level2_percent: Decimal::new(3, 0),
            level3_percent: Decimal::new(1, 0),
            tax_percent: Decimal::new(6, 0),
            min_withdrawal_amount: 50_000,
            auto_calculate_commission: true,
            gateway_commissions: HashMap::from([
                (PaymentGatewayType::Yookassa, Decimal::new(35, 1)),
                (PaymentGatewayType::TelegramStars, Decimal::new(30, 0)),
                (PaymentGatewayType::Cryptopay, Decimal::new(1, 0)),
                (PaymentGatewayType::Heleket, Decimal::new(1, 0)),
                (PaymentGatewayType::Pal24, Decimal::new(5, 0)),
                (PaymentGatewayType::Wata, Decimal::new(3, 0)),
                (PaymentGatewayType::Platega, Decimal::new(35, 1)),
            ]),
            currency_rates: HashMap::new(),
        }
    }
}

impl PartnerSettings {
    pub fn level_percent(&self, level: i16) -> Decimal {
        match level {
            1 => self.level1_percent,
            2 => self.level2_percent,
            3 => self.level3_percent,
            _ => Decimal::ZERO,
        }
    }

    pub fn gateway_commission(&self, gateway: PaymentGatewayType) -> Decimal {
        self.gateway_commissions
            .get(&gateway)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiSubscriptionSettings {
    pub enabled: bool,
    pub default_max_subscriptions: i32,
}

impl Default for MultiSubscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_subscriptions: 5,
        }
    }
}

impl MultiSubscriptionSettings {
    /// Effective cap for one user; `-1` is unlimited.
    pub fn max_for(&self, user_override: Option<i32>) -> i32 {
        match user_override {
            Some(value) => value,
            None if self.enabled => self.default_max_subscriptions,
            None => 1,
        }
    }
}
