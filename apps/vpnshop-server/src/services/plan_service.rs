use std::collections::HashSet;

use tracing::info;
use vpnshop_db::Repositories;
use vpnshop_db::models::enums::{PlanAvailability, PlanType};
use vpnshop_db::models::plan::{NewPlan, Plan, PlanSnapshot};
use vpnshop_db::models::transaction::PriceDetails;
use vpnshop_db::models::user::User;

use crate::error::{CommerceError, CommerceResult};

/// Applies a whole-percent discount, flooring to the minor unit.
pub fn apply_discount(original: i64, discount_percent: i32) -> PriceDetails {
    let discount_percent = discount_percent.clamp(0, 100);
    let final_amount = original.max(0) * (100 - discount_percent) as i64 / 100;
    PriceDetails {
        original_amount: original.max(0),
        discount_percent,
        final_amount,
    }
}

/// Availability predicate shared by the storefront and purchase validation.
/// TRIAL plans are granted, never sold.
pub fn is_available_for(plan: &Plan, user: &User, subscription_count: i64) -> bool {
    match plan.availability {
        PlanAvailability::All => true,
        PlanAvailability::New => subscription_count == 0,
        PlanAvailability::Existing => subscription_count > 0,
        PlanAvailability::Invited => user.invited_by.is_some(),
        PlanAvailability::Allowed => plan.allowed_user_ids.contains(&user.telegram_id),
        PlanAvailability::Trial => false,
    }
}

/// Exact id when that plan is still active, otherwise the lowest-id active
/// plan with the same shape.
pub fn find_matching_plan<'a>(plans: &'a [Plan], snapshot: &PlanSnapshot) -> Option<&'a Plan> {
    if let Some(plan) = plans.iter().find(|p| p.id == snapshot.id && p.is_active) {
        return Some(plan);
    }
    plans
        .iter()
        .filter(|p| p.is_active && p.availability != PlanAvailability::Trial)
        .filter(|p| p.snapshot(snapshot.duration).same_shape(snapshot))
        .min_by_key(|p| p.id)
}

#[derive(Clone)]
pub struct PlanService {
    repos: Repositories,
}

impl PlanService {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    pub async fn get(&self, id: i32) -> CommerceResult<Plan> {
        self.repos
            .plans
            .get(id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("plan {}", id)))
    }

    pub async fn list(&self) -> CommerceResult<Vec<Plan>> {
        Ok(self.repos.plans.list().await?)
    }

    /// Active plans this user may buy.
    pub async fn available_for(&self, user: &User) -> CommerceResult<Vec<Plan>> {
        let count = self.repos.subscriptions.count_by_user(user.telegram_id).await?;
        Ok(self
            .repos
            .plans
            .list_active()
            .await?
            .into_iter()
            .filter(|plan| is_available_for(plan, user, count))
            .collect())
    }

    pub async fn trial_plan(&self) -> CommerceResult<Option<Plan>> {
        Ok(self
            .repos
            .plans
            .list_active()
            .await?
            .into_iter()
            .find(|p| p.availability == PlanAvailability::Trial))
    }

    pub async fn find_matching(&self, snapshot: &PlanSnapshot) -> CommerceResult<Option<Plan>> {
        let plans = self.repos.plans.list().await?;
        Ok(find_matching_plan(&plans, snapshot).cloned())
    }

    pub async fn create(&self, plan: NewPlan) -> CommerceResult<Plan> {
        validate(&plan)?;
        let plan = self.repos.plans.create(&plan).await?;
        info!("Created plan {} '{}'", plan.id, plan.name);
        Ok(plan)
    }

    pub async fn update(&self, plan: Plan) -> CommerceResult<()> {
        validate(&NewPlan {
            name: plan.name.clone(),
            description: plan.description.clone(),
            plan_type: plan.plan_type,
            availability: plan.availability,
            allowed_user_ids: plan.allowed_user_ids.clone(),
            traffic_limit: plan.traffic_limit,
            device_limit: plan.device_limit,
            subscription_count: plan.subscription_count,
            durations: plan.durations.0.clone(),
            internal_squads: plan.internal_squads.clone(),
            external_squad: plan.external_squad,
            is_active: plan.is_active,
        })?;
        self.repos.plans.update(&plan).await?;
        Ok(())
    }

    pub async fn set_active(&self, id: i32, active: bool) -> CommerceResult<()> {
        if !self.repos.plans.set_active(id, active).await? {
            return Err(CommerceError::not_found(format!("plan {}", id)));
        }
        info!("Plan {} active = {}", id, active);
        Ok(())
    }
}

fn validate(plan: &NewPlan) -> CommerceResult<()> {
    if plan.name.trim().is_empty() {
        return Err(CommerceError::validation("plan name is empty"));
    }
    if plan.durations.is_empty() {
        return Err(CommerceError::validation("plan has no durations"));
    }
    let mut seen = HashSet::new();
    for duration in &plan.durations {
        if duration.days == 0 || duration.days < -1 {
            return Err(CommerceError::validation(format!("invalid duration {}", duration.days)));
        }
        if !seen.insert(duration.days) {
            return Err(CommerceError::validation(format!("duplicate duration {}", duration.days)));
        }
        if duration.prices.iter().any(|p| p.amount < 0) {
            return Err(CommerceError::validation("negative price"));
        }
    }
    if plan.subscription_count < 1 {
        return Err(CommerceError::validation("subscription_count must be at least 1"));
    }
    if plan.traffic_limit < -1 || plan.device_limit < -1 {
        return Err(CommerceError::validation("limits must be -1 or non-negative"));
    }
    let traffic_limited = plan.traffic_limit >= 0;
    let devices_limited = plan.device_limit >= 0;
    let consistent = match plan.plan_type {
        PlanType::Traffic => traffic_limited && !devices_limited,
        PlanType::Devices => devices_limited && !traffic_limited,
        PlanType::Both => traffic_limited && devices_limited,
        PlanType::Unlimited => !traffic_limited && !devices_limited,
    };
    if !consistent {
        return Err(CommerceError::validation(format!(
            "limits do not match plan type {}",
            plan.plan_type
        )));
    }
    if plan.availability == PlanAvailability::Allowed && plan.allowed_user_ids.is_empty() {
        return Err(CommerceError::validation("ALLOWED plan lists no users"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vpnshop_db::sqlx::types::Json;
    use uuid::Uuid;
    use vpnshop_db::models::enums::{Currency, UserRole};
    use vpnshop_db::models::plan::{PlanDuration, PlanPrice};

    fn plan(id: i32, active: bool, squads: Vec<Uuid>) -> Plan {
        Plan {
            id,
            order_index: id,
            name: format!("plan-{id}"),
            description: None,
            plan_type: PlanType::Unlimited,
            availability: PlanAvailability::All,
            allowed_user_ids: vec![],
            traffic_limit: -1,
            device_limit: -1,
            subscription_count: 1,
            durations: Json(vec![PlanDuration {
                days: 30,
                prices: vec![PlanPrice {
                    currency: Currency::Rub,
                    amount: 30_000,
                }],
            }]),
            internal_squads: squads,
            external_squad: None,
            is_active: active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn user(invited_by: Option<i64>) -> User {
        User {
            telegram_id: 7,
            username: None,
            name: "u".into(),
            language: "en".into(),
            role: UserRole::User,
            is_blocked: false,
            referral_code: "ABCDEFGH".into(),
            invited_by,
            points: 0,
            personal_discount: 0,
            purchase_discount: 0,
            current_subscription_id: None,
            max_subscriptions: None,
            is_trial_used: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn discount_floors_to_minor_units() {
        let price = apply_discount(999, 15);
        assert_eq!(price.final_amount, 849);
        assert_eq!(apply_discount(500, 100).final_amount, 0);
        assert!(apply_discount(0, 0).is_free());
    }

    #[test]
    fn availability_rules() {
        let mut p = plan(1, true, vec![]);
        p.availability = PlanAvailability::New;
        assert!(is_available_for(&p, &user(None), 0));
        assert!(!is_available_for(&p, &user(None), 1));

        p.availability = PlanAvailability::Invited;
        assert!(!is_available_for(&p, &user(None), 0));
        assert!(is_available_for(&p, &user(Some(3)), 0));

        p.availability = PlanAvailability::Allowed;
        p.allowed_user_ids = vec![7];
        assert!(is_available_for(&p, &user(None), 0));

        p.availability = PlanAvailability::Trial;
        assert!(!is_available_for(&p, &user(None), 0));
    }

    #[test]
    fn matching_prefers_exact_then_lowest_id_shape() {
        let squad = Uuid::new_v4();
        let plans = vec![plan(5, true, vec![squad]), plan(3, true, vec![squad]), plan(1, false, vec![squad])];
        let snapshot = plans[2].snapshot(30);

        // Plan 1 is inactive; 3 and 5 share its shape, 3 wins.
        assert_eq!(find_matching_plan(&plans, &snapshot).map(|p| p.id), Some(3));

        let exact = plans[0].snapshot(30);
        assert_eq!(find_matching_plan(&plans, &exact).map(|p| p.id), Some(5));

        let other = PlanSnapshot {
            internal_squads: vec![Uuid::new_v4()],
            ..snapshot
        };
        assert!(find_matching_plan(&plans, &other).is_none());
    }
}
