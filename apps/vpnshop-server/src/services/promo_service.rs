use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;
use vpnshop_db::Repositories;
use vpnshop_db::models::enums::{PromocodeAvailability, PromocodeRewardType, SubscriptionStatus};
use vpnshop_db::models::grant::{Grant, GrantRejection};
use vpnshop_db::models::plan::GIB;
use vpnshop_db::models::promocode::{NewPromocode, Promocode};
use vpnshop_db::models::subscription::Subscription;
use vpnshop_db::models::user::User;
use vpnshop_db::repositories::ActivationOutcome;

use super::notification_service::{Notification, Notifier};
use super::random_code;
use super::settings_service::SettingsService;
use super::subscription_service::{SubscriptionService, new_subscription};
use crate::error::{ActivationError, CommerceError, CommerceResult, NotAvailableReason, PolicyViolation};

pub const PROMOCODE_LEN: usize = 10;
const GENERATE_ATTEMPTS: usize = 16;

/// Availability predicate for promocodes.
pub fn is_available_for(promocode: &Promocode, user: &User, subscription_count: i64) -> bool {
    match promocode.availability {
        PromocodeAvailability::All => true,
        PromocodeAvailability::New => subscription_count == 0,
        PromocodeAvailability::Existing => subscription_count > 0,
        PromocodeAvailability::Invited => user.invited_by.is_some(),
        PromocodeAvailability::Allowed => promocode.allowed_user_ids.contains(&user.telegram_id),
    }
}

/// Result message shown after a successful activation.
pub fn activated_message_key(reward_type: PromocodeRewardType) -> &'static str {
    match reward_type {
        PromocodeRewardType::Duration => "ntf-promocode-activated-duration",
        PromocodeRewardType::Traffic => "ntf-promocode-activated-traffic",
        PromocodeRewardType::Devices => "ntf-promocode-activated-devices",
        PromocodeRewardType::Subscription => "ntf-promocode-activated-subscription",
        PromocodeRewardType::PersonalDiscount => "ntf-promocode-activated-personal-discount",
        PromocodeRewardType::PurchaseDiscount => "ntf-promocode-activated-purchase-discount",
    }
}

fn validate(promocode: &NewPromocode) -> CommerceResult<()> {
    if promocode.code.is_empty() || !promocode.code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CommerceError::validation(format!("invalid code '{}'", promocode.code)));
    }
    if promocode.lifetime < -1 {
        return Err(CommerceError::validation("lifetime must be -1 or non-negative"));
    }
    if promocode.max_activations == 0 || promocode.max_activations < -1 {
        return Err(CommerceError::validation("max_activations must be -1 or positive"));
    }
    if promocode.availability == PromocodeAvailability::Allowed && promocode.allowed_user_ids.is_empty() {
        return Err(CommerceError::validation("ALLOWED promocode lists no users"));
    }
    match promocode.reward_type {
        PromocodeRewardType::Subscription => {
            if promocode.plan.is_none() {
                return Err(CommerceError::validation("SUBSCRIPTION promocode needs a plan"));
            }
        }
        PromocodeRewardType::PersonalDiscount | PromocodeRewardType::PurchaseDiscount => match promocode.reward {
            Some(percent) if (1..=100).contains(&percent) => {}
            _ => return Err(CommerceError::validation("discount must be 1..=100")),
        },
        PromocodeRewardType::Duration | PromocodeRewardType::Traffic | PromocodeRewardType::Devices => {
            if !promocode.reward.is_some_and(|r| r > 0) {
                return Err(CommerceError::validation("reward must be positive"));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub promocode: Promocode,
    pub message_key: &'static str,
    pub subscription: Option<Subscription>,
}

#[derive(Clone)]
pub struct PromoService {
    repos: Repositories,
    settings: SettingsService,
    subscriptions: SubscriptionService,
    notifier: Arc<dyn Notifier>,
}

impl PromoService {
    pub fn new(
        repos: Repositories,
        settings: SettingsService,
        subscriptions: SubscriptionService,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            repos,
            settings,
            subscriptions,
            notifier,
        }
    }

    /// Validates the code for this user and applies its reward together
    /// with the activation record.
    pub async fn activate(
        &self,
        telegram_id: i64,
        code: &str,
        target: Option<i64>,
    ) -> Result<Activation, ActivationError> {
        let promocode = self
            .repos
            .promocodes
            .get_by_code(&Promocode::normalize_code(code))
            .await?
            .ok_or(ActivationError::NotFound)?;
        if !promocode.is_active {
            return Err(ActivationError::Inactive);
        }
        if promocode.is_expired_at(Utc::now()) {
            return Err(ActivationError::Expired);
        }
        let activations = self.repos.promocodes.count_activations(promocode.id).await?;
        if promocode.is_depleted(activations) {
            return Err(ActivationError::Depleted);
        }
        if self.repos.promocodes.has_activation(promocode.id, telegram_id).await? {
            return Err(ActivationError::AlreadyActivated);
        }

        let user = self
            .repos
            .users
            .get(telegram_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("user {}", telegram_id)))?;
        let subscriptions = self.repos.subscriptions.list_by_user(telegram_id).await?;
        if !is_available_for(&promocode, &user, subscriptions.len() as i64) {
            return Err(ActivationError::NotAvailable(NotAvailableReason::Availability));
        }

        let (grant, created_panel_user) = self.grant_for(&promocode, &user, &subscriptions, target).await?;
        let outcome = match self.repos.promocodes.activate(promocode.id, telegram_id, grant).await {
            Ok(outcome) => outcome,
            Err(err) => return self.refuse(created_panel_user, err.into()).await,
        };
        let applied = match outcome {
            ActivationOutcome::Applied(applied) => applied,
            ActivationOutcome::Depleted => return self.refuse(created_panel_user, ActivationError::Depleted).await,
            ActivationOutcome::AlreadyActivated => {
                return self.refuse(created_panel_user, ActivationError::AlreadyActivated).await;
            }
            ActivationOutcome::Rejected(reason) => {
                let err = match reason {
                    GrantRejection::SubscriptionLimit => {
                        ActivationError::NotAvailable(NotAvailableReason::SubscriptionLimit)
                    }
                    GrantRejection::SubscriptionUnavailable => {
                        ActivationError::NotAvailable(NotAvailableReason::NoEligibleSubscription)
                    }
                    other => CommerceError::validation(other.to_string()).into(),
                };
                return self.refuse(created_panel_user, err).await;
            }
        };

        let subscription = match applied.subscription {
            Some(sub) if created_panel_user.is_none() => Some(self.subscriptions.sync_or_enqueue(sub).await?),
            other => other,
        };

        info!(
            "User {} activated promocode {} ({})",
            telegram_id, promocode.code, promocode.reward_type
        );
        if self.settings.get().await?.system_notifications.promocode_activated {
            self.notifier
                .notify_operators(
                    Notification::new("ntf-event-promocode")
                        .with("user", telegram_id)
                        .with("code", &promocode.code)
                        .with("reward_type", promocode.reward_type)
                        .with("reward", promocode.reward.unwrap_or_default()),
                )
                .await;
        }

        Ok(Activation {
            message_key: activated_message_key(promocode.reward_type),
            promocode,
            subscription,
        })
    }

    async fn refuse<T>(&self, created_panel_user: Option<Uuid>, err: ActivationError) -> Result<T, ActivationError> {
        if let Some(uuid) = created_panel_user {
            self.subscriptions.discard_panel_user(uuid).await;
        }
        Err(err)
    }

    /// Builds the grant. For a new subscription the panel user is created
    /// here and returned so a refused activation can remove it again.
    async fn grant_for(
        &self,
        promocode: &Promocode,
        user: &User,
        subscriptions: &[Subscription],
        target: Option<i64>,
    ) -> Result<(Grant, Option<Uuid>), ActivationError> {
        let reward = promocode.reward.unwrap_or_default();
        let grant = match promocode.reward_type {
            PromocodeRewardType::PersonalDiscount => Grant::SetPersonalDiscount { percent: reward },
            PromocodeRewardType::PurchaseDiscount => Grant::SetPurchaseDiscount { percent: reward },
            PromocodeRewardType::Duration => Grant::ExtendSubscription {
                subscription_id: select_target(subscriptions, target, |s| !s.is_lifetime())?,
                days: reward,
            },
            PromocodeRewardType::Traffic => Grant::AddTraffic {
                subscription_id: select_target(subscriptions, target, |s| s.traffic_limit >= 0)?,
                bytes: reward as i64 * GIB,
            },
            PromocodeRewardType::Devices => Grant::AddDevices {
                subscription_id: select_target(subscriptions, target, |s| s.device_limit >= 0)?,
                count: reward,
            },
            PromocodeRewardType::Subscription => {
                let snapshot = promocode
                    .plan
                    .as_ref()
                    .map(|p| p.0.clone())
                    .ok_or_else(|| CommerceError::validation("promocode has no plan"))?;

                if let Some(id) = target.filter(|_| !snapshot.is_lifetime()) {
                    Grant::ExtendSubscription {
                        subscription_id: select_target(subscriptions, Some(id), |s| !s.is_lifetime())?,
                        days: snapshot.duration,
                    }
                } else {
                    match self.subscriptions.check_limit(user, 1).await {
                        Err(CommerceError::Policy(PolicyViolation::SubscriptionLimit { .. })) => {
                            return Err(ActivationError::NotAvailable(NotAvailableReason::SubscriptionLimit));
                        }
                        other => other?,
                    }
                    let max = self.subscriptions.max_subscriptions_for(user).await?;
                    let panel_user = self.subscriptions.create_panel_user(user, &snapshot).await?;
                    let uuid = panel_user.uuid;
                    let new = new_subscription(user.telegram_id, &panel_user, &snapshot, false);
                    return Ok((
                        Grant::CreateSubscription {
                            subscription: Box::new(new),
                            max_subscriptions: max,
                            make_current: user.current_subscription_id.is_none(),
                        },
                        Some(uuid),
                    ));
                }
            }
        };
        Ok((grant, None))
    }

    pub async fn get(&self, id: i32) -> CommerceResult<Promocode> {
        self.repos
            .promocodes
            .get(id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("promocode {}", id)))
    }

    /// Every promocode with its activation count.
    pub async fn list(&self) -> CommerceResult<Vec<(Promocode, i64)>> {
        let mut rows = Vec::new();
        for promocode in self.repos.promocodes.list().await? {
            let count = self.repos.promocodes.count_activations(promocode.id).await?;
            rows.push((promocode, count));
        }
        Ok(rows)
    }

    pub async fn create(&self, mut promocode: NewPromocode) -> CommerceResult<Promocode> {
        promocode.code = if promocode.code.trim().is_empty() {
            self.generate_code().await?
        } else {
            Promocode::normalize_code(&promocode.code)
        };
        validate(&promocode)?;
        let created = self
            .repos
            .promocodes
            .create(&promocode)
            .await?
            .ok_or_else(|| CommerceError::Conflict(format!("promocode {} already exists", promocode.code)))?;
        info!("Created promocode {} ({})", created.code, created.reward_type);
        Ok(created)
    }

    pub async fn update(&self, mut promocode: Promocode) -> CommerceResult<()> {
        promocode.code = Promocode::normalize_code(&promocode.code);
        validate(&NewPromocode {
            code: promocode.code.clone(),
            reward_type: promocode.reward_type,
            availability: promocode.availability,
            allowed_user_ids: promocode.allowed_user_ids.clone(),
            reward: promocode.reward,
            plan: promocode.plan.as_ref().map(|p| p.0.clone()),
            lifetime: promocode.lifetime,
            max_activations: promocode.max_activations,
            is_active: promocode.is_active,
        })?;
        if !self.repos.promocodes.update(&promocode).await? {
            return Err(CommerceError::not_found(format!("promocode {}", promocode.id)));
        }
        Ok(())
    }

    pub async fn set_active(&self, id: i32, active: bool) -> CommerceResult<()> {
        let mut promocode = self.get(id).await?;
        promocode.is_active = active;
        self.repos.promocodes.update(&promocode).await?;
        info!("Promocode {} active = {}", promocode.code, active);
        Ok(())
    }

    pub async fn delete(&self, id: i32) -> CommerceResult<()> {
        if !self.repos.promocodes.delete(id).await? {
            return Err(CommerceError::not_found(format!("promocode {}", id)));
        }
        info!("Deleted promocode {}", id);
        Ok(())
    }

    /// Fresh `A-Z0-9` code that no promocode uses yet.
    pub async fn generate_code(&self) -> CommerceResult<String> {
        for _ in 0..GENERATE_ATTEMPTS {
            let code = random_code(PROMOCODE_LEN);
            if self.repos.promocodes.get_by_code(&code).await?.is_none() {
                return Ok(code);
            }
        }
        warn!("Could not find a free promocode after {} attempts", GENERATE_ATTEMPTS);
        Err(CommerceError::Conflict("could not generate a unique code".into()))
    }
}

/// Picks the subscription a reward applies to among the user's active,
/// eligible ones. Several candidates without a choice need the caller to pick.
fn select_target<F>(subscriptions: &[Subscription], explicit: Option<i64>, eligible: F) -> Result<i64, ActivationError>
where
    F: Fn(&Subscription) -> bool,
{
    let candidates: Vec<i64> = subscriptions
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Active && eligible(s))
        .map(|s| s.id)
        .collect();
    match (explicit, candidates.as_slice()) {
        (Some(id), _) if candidates.contains(&id) => Ok(id),
        (Some(_), _) | (None, []) => Err(ActivationError::NotAvailable(NotAvailableReason::NoEligibleSubscription)),
        (None, [only]) => Ok(*only),
        (None, _) => Err(ActivationError::TargetRequired { candidates }),
    }
}
