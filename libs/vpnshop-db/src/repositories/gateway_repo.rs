use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use super::GatewayRepository;
use crate::models::enums::PaymentGatewayType;
use crate::models::gateway::PaymentGateway;

#[derive(Debug, Clone)]
pub struct PgGatewayRepository {
    pool: PgPool,
}

impl PgGatewayRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GatewayRepository for PgGatewayRepository {
    async fn list(&self) -> Result<Vec<PaymentGateway>> {
        sqlx::query_as::<_, PaymentGateway>("SELECT * FROM payment_gateways ORDER BY order_index, id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list payment gateways")
    }

    async fn get(&self, gateway_type: PaymentGatewayType) -> Result<Option<PaymentGateway>> {
        sqlx::query_as::<_, PaymentGateway>("SELECT * FROM payment_gateways WHERE gateway_type = $1")
            .bind(gateway_type)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment gateway")
    }

    async fn ensure_defaults(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (index, gateway_type) in PaymentGatewayType::ALL.iter().enumerate() {
            sqlx::query(
                "INSERT INTO payment_gateways (order_index, gateway_type, currency, is_active)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (gateway_type) DO NOTHING",
            )
            .bind(index as i32 + 1)
            .bind(gateway_type)
            .bind(gateway_type.currency())
            .bind(*gateway_type == PaymentGatewayType::TelegramStars)
            .execute(&mut *tx)
            .await
            .context("Failed to seed payment gateways")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, gateway_type: PaymentGatewayType, is_active: bool, order_index: i32) -> Result<()> {
        sqlx::query(
            "UPDATE payment_gateways SET is_active = $1, order_index = $2, updated_at = NOW() WHERE gateway_type = $3",
        )
        .bind(is_active)
        .bind(order_index)
        .bind(gateway_type)
        .execute(&self.pool)
        .await
        .context("Failed to update payment gateway")?;
        Ok(())
    }
}
