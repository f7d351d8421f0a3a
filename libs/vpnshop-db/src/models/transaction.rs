use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use super::enums::{Currency, DeviceType, PaymentGatewayType, PurchaseType, TransactionStatus};
use super::plan::PlanSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PriceDetails {
    pub original_amount: i64,
    pub discount_percent: i32,
    pub final_amount: i64,
}

impl PriceDetails {
    pub fn is_free(&self) -> bool {
        self.final_amount == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: i64,
    pub payment_id: Uuid,
    pub user_telegram_id: i64,
    pub status: TransactionStatus,
    pub is_test: bool,
    pub purchase_type: PurchaseType,
    pub gateway_type: PaymentGatewayType,
    pub currency: Currency,
    #[sqlx(flatten)]
    pub pricing: PriceDetails,
    pub plan: Json<PlanSnapshot>,
    pub renew_subscription_id: Option<i64>,
    pub renew_subscription_ids: Option<Vec<i64>>,
    pub device_types: Option<Json<Vec<DeviceType>>>,
    pub payment_url: Option<String>,
    /// When the payment reached COMPLETED. Kept if provisioning later fails it.
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// True once the payment was paid, regardless of how provisioning went.
    pub fn was_completed(&self) -> bool {
        self.completed_at.is_some()
            && matches!(self.status, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    pub fn device_type_at(&self, index: usize) -> Option<DeviceType> {
        self.device_types
            .as_ref()
            .and_then(|types| types.get(index).copied())
    }

    /// Subscriptions this renewal targets, in the order they were selected.
    /// An empty result means "the user's current subscription".
    pub fn renewal_targets(&self) -> Vec<i64> {
        match (&self.renew_subscription_ids, self.renew_subscription_id) {
            (Some(ids), _) if ids.len() > 1 => ids.clone(),
            (_, Some(id)) => vec![id],
            (Some(ids), None) if ids.len() == 1 => ids.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub payment_id: Uuid,
    pub user_telegram_id: i64,
    pub status: TransactionStatus,
    pub is_test: bool,
    pub purchase_type: PurchaseType,
    pub gateway_type: PaymentGatewayType,
    pub currency: Currency,
    pub pricing: PriceDetails,
    pub plan: PlanSnapshot,
    pub renew_subscription_id: Option<i64>,
    pub renew_subscription_ids: Option<Vec<i64>>,
    pub device_types: Option<Vec<DeviceType>>,
}
