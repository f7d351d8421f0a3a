use std::sync::Arc;

use tracing::{info, warn};
use vpnshop_db::Repositories;
use vpnshop_db::models::enums::{AccessMode, UserRole};
use vpnshop_db::models::user::{NewUser, User};

use super::notification_service::{Notification, Notifier};
use super::partner_service::PartnerService;
use super::random_code;
use super::referral_service::ReferralService;
use super::settings_service::SettingsService;
use crate::error::{CommerceError, CommerceResult, PolicyViolation};

const REFERRAL_CODE_LEN: usize = 8;
const REFERRAL_CODE_ATTEMPTS: usize = 16;

/// First-contact data delivered by the chat layer.
#[derive(Debug, Clone)]
pub struct Registration {
    pub telegram_id: i64,
    pub name: String,
    pub username: Option<String>,
    pub language: String,
    pub invite_code: Option<String>,
}

#[derive(Clone)]
pub struct UserService {
    repos: Repositories,
    settings: SettingsService,
    referrals: ReferralService,
    partners: PartnerService,
    notifier: Arc<dyn Notifier>,
    developer_ids: Arc<Vec<i64>>,
}

impl UserService {
    pub fn new(
        repos: Repositories,
        settings: SettingsService,
        referrals: ReferralService,
        partners: PartnerService,
        notifier: Arc<dyn Notifier>,
        developer_ids: Vec<i64>,
    ) -> Self {
        Self {
            repos,
            settings,
            referrals,
            partners,
            notifier,
            developer_ids: Arc::new(developer_ids),
        }
    }

    pub async fn get(&self, telegram_id: i64) -> CommerceResult<User> {
        self.repos
            .users
            .get(telegram_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("user {}", telegram_id)))
    }

    /// Loads the user, registering them on first contact under the access mode.
    pub async fn get_or_create(&self, registration: Registration) -> CommerceResult<User> {
        let settings = self.settings.get().await?;

        if let Some(user) = self.repos.users.get(registration.telegram_id).await? {
            if user.is_blocked {
                return Err(PolicyViolation::UserBlocked.into());
            }
            if settings.access_mode == AccessMode::Restricted && !user.is_privileged() {
                return Err(PolicyViolation::AccessRestricted.into());
            }
            return Ok(user);
        }

        let is_developer = self.developer_ids.contains(&registration.telegram_id);
        let inviter = match registration.invite_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => self
                .repos
                .users
                .get_by_referral_code(code)
                .await?
                .filter(|u| u.telegram_id != registration.telegram_id),
            _ => None,
        };

        if !is_developer {
            match settings.access_mode {
                AccessMode::RegBlocked => return Err(PolicyViolation::RegistrationClosed.into()),
                AccessMode::Restricted => return Err(PolicyViolation::AccessRestricted.into()),
                AccessMode::Invited if inviter.is_none() => {
                    return Err(PolicyViolation::InviteRequired.into());
                }
                _ => {}
            }
        }

        let referral_code = self.unique_referral_code().await?;
        let user = self
            .repos
            .users
            .create(&NewUser {
                telegram_id: registration.telegram_id,
                username: registration.username.clone(),
                name: registration.name.clone(),
                language: registration.language.clone(),
                role: if is_developer { UserRole::Dev } else { UserRole::User },
                referral_code,
            })
            .await?;
        info!("Registered user {} ({})", user.telegram_id, user.name);

        if let Some(inviter) = &inviter {
            self.referrals.attach(inviter.telegram_id, user.telegram_id).await?;
            self.partners
                .register_referral_chain(user.telegram_id, inviter.telegram_id)
                .await?;
        }

        if settings.system_notifications.user_registered {
            let mut notification = Notification::new("ntf-event-new-user")
                .with("user", user.telegram_id)
                .with("name", &user.name)
                .with("username", user.username.as_deref().unwrap_or("-"));
            if let Some(inviter) = &inviter {
                notification = notification.with("inviter", inviter.telegram_id);
            }
            self.notifier.notify_operators(notification).await;
        }

        self.get(user.telegram_id).await
    }

    async fn unique_referral_code(&self) -> CommerceResult<String> {
        for _ in 0..REFERRAL_CODE_ATTEMPTS {
            let code = random_code(REFERRAL_CODE_LEN);
            if !self.repos.users.referral_code_exists(&code).await? {
                return Ok(code);
            }
        }
        Err(CommerceError::Conflict("could not allocate a referral code".into()))
    }

    /// Purchase gate applied before any pricing work.
    pub async fn ensure_can_purchase(&self, user: &User) -> CommerceResult<()> {
        if user.is_blocked {
            return Err(PolicyViolation::UserBlocked.into());
        }
        if user.is_privileged() {
            return Ok(());
        }
        match self.settings.get().await?.access_mode {
            AccessMode::Restricted => Err(PolicyViolation::AccessRestricted.into()),
            AccessMode::PurchaseBlocked => Err(PolicyViolation::PurchasesBlocked.into()),
            _ => Ok(()),
        }
    }

    pub async fn set_role(&self, telegram_id: i64, role: UserRole) -> CommerceResult<()> {
        self.get(telegram_id).await?;
        self.repos.users.set_role(telegram_id, role).await?;
        info!("User {} role set to {}", telegram_id, role);
        Ok(())
    }

    pub async fn set_blocked(&self, telegram_id: i64, blocked: bool) -> CommerceResult<()> {
        let user = self.get(telegram_id).await?;
        if blocked && self.developer_ids.contains(&user.telegram_id) {
            return Err(CommerceError::validation("developers cannot be blocked"));
        }
        self.repos.users.set_blocked(telegram_id, blocked).await?;
        info!("User {} blocked = {}", telegram_id, blocked);
        Ok(())
    }

    pub async fn set_personal_discount(&self, telegram_id: i64, percent: i32) -> CommerceResult<()> {
        let user = self.get(telegram_id).await?;
        check_percent(percent)?;
        self.repos
            .users
            .set_discounts(telegram_id, percent, user.purchase_discount)
            .await?;
        Ok(())
    }

    pub async fn set_purchase_discount(&self, telegram_id: i64, percent: i32) -> CommerceResult<()> {
        let user = self.get(telegram_id).await?;
        check_percent(percent)?;
        self.repos
            .users
            .set_discounts(telegram_id, user.personal_discount, percent)
            .await?;
        Ok(())
    }

    /// `None` restores the global default; `-1` is unlimited.
    pub async fn set_max_subscriptions(&self, telegram_id: i64, value: Option<i32>) -> CommerceResult<()> {
        self.get(telegram_id).await?;
        if let Some(max) = value {
            if max == 0 || max < -1 {
                return Err(CommerceError::validation(format!("invalid subscription cap {}", max)));
            }
        }
        self.repos.users.set_max_subscriptions(telegram_id, value).await?;
        Ok(())
    }

    /// Returns the new balance; a debit past zero is refused.
    pub async fn adjust_points(&self, telegram_id: i64, delta: i64) -> CommerceResult<i64> {
        let user = self.get(telegram_id).await?;
        match self.repos.users.adjust_points(telegram_id, delta).await? {
            Some(balance) => {
                info!("User {} points {:+} -> {}", telegram_id, delta, balance);
                Ok(balance)
            }
            None => {
                warn!("Refused points debit {} for user {}", delta, telegram_id);
                Err(PolicyViolation::InsufficientPoints { balance: user.points }.into())
            }
        }
    }
}

fn check_percent(percent: i32) -> CommerceResult<()> {
    if (0..=100).contains(&percent) {
        Ok(())
    } else {
        Err(CommerceError::validation(format!("discount {} is outside 0..=100", percent)))
    }
}
