use super::promocode::{NewPromocode, Promocode};
use super::subscription::{NewSubscription, Subscription};

/// A local state change granted to one user, applied inside the same
/// database transaction as the record that justifies it (promocode
/// activation, referral reward, points exchange).
#[derive(Debug, Clone)]
pub enum Grant {
    SetPersonalDiscount { percent: i32 },
    SetPurchaseDiscount { percent: i32 },
    /// Adds to the purchase discount, capped at 100.
    AddPurchaseDiscount { percent: i32 },
    AddPoints { points: i64 },
    ExtendSubscription { subscription_id: i64, days: i32 },
    AddTraffic { subscription_id: i64, bytes: i64 },
    AddDevices { subscription_id: i64, count: i32 },
    CreateSubscription {
        subscription: Box<NewSubscription>,
        max_subscriptions: i32,
        make_current: bool,
    },
    CreatePromocode { promocode: Box<NewPromocode> },
}

/// What a successfully applied grant produced.
#[derive(Debug, Clone, Default)]
pub struct GrantApplied {
    pub subscription: Option<Subscription>,
    pub promocode: Option<Promocode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GrantRejection {
    #[error("target subscription is missing or not eligible")]
    SubscriptionUnavailable,
    #[error("subscription limit reached")]
    SubscriptionLimit,
    #[error("promocode already exists")]
    CodeConflict,
    #[error("user not found")]
    UserMissing,
}
