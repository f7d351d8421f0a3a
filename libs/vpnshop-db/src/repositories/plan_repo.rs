use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::PlanRepository;
use crate::models::plan::{NewPlan, Plan};

#[derive(Debug, Clone)]
pub struct PgPlanRepository {
    pool: PgPool,
}

impl PgPlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanRepository for PgPlanRepository {
    async fn get(&self, id: i32) -> Result<Option<Plan>> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch plan")
    }

    async fn list(&self) -> Result<Vec<Plan>> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans ORDER BY order_index, id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list plans")
    }

    async fn list_active(&self) -> Result<Vec<Plan>> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE is_active = TRUE ORDER BY order_index, id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list active plans")
    }

    async fn create(&self, plan: &NewPlan) -> Result<Plan> {
        sqlx::query_as::<_, Plan>(
            "INSERT INTO plans (order_index, name, description, type, availability, allowed_user_ids, traffic_limit, device_limit, subscription_count, durations, internal_squads, external_squad, is_active)
             VALUES ((SELECT COALESCE(MAX(order_index), 0) + 1 FROM plans), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING *",
        )
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.plan_type)
        .bind(plan.availability)
        .bind(&plan.allowed_user_ids)
        .bind(plan.traffic_limit)
        .bind(plan.device_limit)
        .bind(plan.subscription_count)
        .bind(Json(&plan.durations))
        .bind(&plan.internal_squads)
        .bind(plan.external_squad)
        .bind(plan.is_active)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create plan")
    }

    async fn update(&self, plan: &Plan) -> Result<()> {
        sqlx::query(
            "UPDATE plans SET order_index = $1, name = $2, description = $3, type = $4, availability = $5,
                allowed_user_ids = $6, traffic_limit = $7, device_limit = $8, subscription_count = $9,
                durations = $10, internal_squads = $11, external_squad = $12, is_active = $13, updated_at = NOW()
             WHERE id = $14",
        )
        .bind(plan.order_index)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.plan_type)
        .bind(plan.availability)
        .bind(&plan.allowed_user_ids)
        .bind(plan.traffic_limit)
        .bind(plan.device_limit)
        .bind(plan.subscription_count)
        .bind(&plan.durations)
        .bind(&plan.internal_squads)
        .bind(plan.external_squad)
        .bind(plan.is_active)
        .bind(plan.id)
        .execute(&self.pool)
        .await
        .context("Failed to update plan")?;
        Ok(())
    }

    async fn set_active(&self, id: i32, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE plans SET is_active = $1, updated_at = NOW() WHERE id = $2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
