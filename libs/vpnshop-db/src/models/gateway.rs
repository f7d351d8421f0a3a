use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::enums::{Currency, PaymentGatewayType};

/// Storefront presentation of a gateway. Credentials live in the
/// process configuration, not in this row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentGateway {
    pub id: i32,
    pub order_index: i32,
    pub gateway_type: PaymentGatewayType,
    pub currency: Currency,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}
