use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vpnshop_db::Repositories;
use vpnshop_db::models::enums::{PlanAvailability, PurchaseType, SubscriptionStatus, TransactionStatus};
use vpnshop_db::models::job::{JobPayload, NewJob};
use vpnshop_db::models::plan::PlanSnapshot;
use vpnshop_db::models::subscription::{LIFETIME_DAYS, NewSubscription, PanelView, Subscription};
use vpnshop_db::models::transaction::Transaction;
use vpnshop_db::models::user::User;

use super::notification_service::{Notification, Notifier};
use super::plan_service::PlanService;
use super::settings_service::SettingsService;
use crate::context::{CallContext, PANEL_TIMEOUT};
use crate::error::{CommerceError, CommerceResult, PanelError, PolicyViolation};
use crate::panel::{PanelApi, PanelUser, PanelUserSpec};

/// Expired subscriptions are purged from the panel after this grace period.
pub const CLEANUP_GRACE_DAYS: i64 = 30;

pub fn expiry_from(base: DateTime<Utc>, days: i32) -> DateTime<Utc> {
    if days < 0 {
        base + Duration::days(LIFETIME_DAYS)
    } else {
        base + Duration::days(days as i64)
    }
}

/// True when the panel and the stored row disagree after a push: the row
/// moved on while the call was in flight, or the panel holds an older expiry.
fn drifted(sent: &Subscription, stored: &Subscription, view: &PanelView) -> bool {
    stored.expire_at.timestamp() > view.expire_at.timestamp()
        || stored.traffic_limit != sent.traffic_limit
        || stored.device_limit != sent.device_limit
        || stored.internal_squads != sent.internal_squads
        || stored.external_squad != sent.external_squad
}

/// `<prefix><id>` for the first live subscription, then `<prefix><id>_subN`.
pub fn next_panel_username(prefix: &str, telegram_id: i64, taken: &HashSet<String>) -> String {
    let base = format!("{}{}", prefix, telegram_id);
    if !taken.contains(&base) {
        return base;
    }
    (1..)
        .map(|n| format!("{}_sub{}", base, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    Created(Vec<Subscription>),
    Renewed(Vec<Subscription>),
    AlreadyApplied,
    Skipped(&'static str),
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
    pub interrupted: bool,
}

/// Applies completed payments to the subscription portfolio and the panel.
/// The panel is never called while a database transaction is open.
#[derive(Clone)]
pub struct SubscriptionService {
    repos: Repositories,
    settings: SettingsService,
    plans: PlanService,
    panel: Arc<dyn PanelApi>,
    notifier: Arc<dyn Notifier>,
    username_prefix: String,
    shutdown: CancellationToken,
}

impl SubscriptionService {
    pub fn new(
        repos: Repositories,
        settings: SettingsService,
        plans: PlanService,
        panel: Arc<dyn PanelApi>,
        notifier: Arc<dyn Notifier>,
        username_prefix: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repos,
            settings,
            plans,
            panel,
            notifier,
            username_prefix,
            shutdown,
        }
    }

    fn ctx(&self) -> CallContext {
        CallContext::new(PANEL_TIMEOUT, self.shutdown.child_token())
    }

    pub async fn list_for_user(&self, telegram_id: i64) -> CommerceResult<Vec<Subscription>> {
        Ok(self.repos.subscriptions.list_by_user(telegram_id).await?)
    }

    /// A live subscription owned by the user.
    pub async fn get_owned(&self, telegram_id: i64, id: i64) -> CommerceResult<Subscription> {
        self.repos
            .subscriptions
            .get(id)
            .await?
            .filter(|s| s.user_telegram_id == telegram_id && !s.is_deleted())
            .ok_or_else(|| CommerceError::not_found(format!("subscription {}", id)))
    }

    pub async fn max_subscriptions_for(&self, user: &User) -> CommerceResult<i32> {
        let settings = self.settings.get().await?;
        Ok(settings.multi_subscription.max_for(user.max_subscriptions))
    }

    /// Rejects when `adding` more live subscriptions would exceed the cap.
    pub async fn check_limit(&self, user: &User, adding: i64) -> CommerceResult<()> {
        let max = self.max_subscriptions_for(user).await?;
        if max < 0 || adding <= 0 {
            return Ok(());
        }
        let live = self.repos.subscriptions.count_by_user(user.telegram_id).await?;
        if live + adding > max as i64 {
            return Err(PolicyViolation::SubscriptionLimit { max }.into());
        }
        Ok(())
    }

    /// Trial that a NEW purchase takes over: any live trial, current first.
    pub async fn outstanding_trial(&self, user: &User) -> CommerceResult<Option<Subscription>> {
        let mut trials: Vec<Subscription> = self
            .repos
            .subscriptions
            .list_by_user(user.telegram_id)
            .await?
            .into_iter()
            .filter(|s| s.is_trial)
            .collect();
        trials.sort_by_key(|s| Some(s.id) != user.current_subscription_id);
        Ok(trials.into_iter().next())
    }

    /// Job handler for a completed payment. Permanent failures mark the
    /// transaction FAILED and alert; transient ones bubble up for retry.
    pub async fn provision(&self, payment_id: Uuid) -> CommerceResult<ProvisionOutcome> {
        let transaction = self
            .repos
            .transactions
            .get(payment_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("transaction {}", payment_id)))?;

        if transaction.is_test {
            return Ok(ProvisionOutcome::Skipped("test payment"));
        }
        if transaction.status != TransactionStatus::Completed {
            info!(
                "Skipping provisioning for {}: status is {}",
                payment_id, transaction.status
            );
            return Ok(ProvisionOutcome::Skipped("transaction not completed"));
        }

        let user = self
            .repos
            .users
            .get(transaction.user_telegram_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("user {}", transaction.user_telegram_id)))?;

        let result = match transaction.purchase_type {
            PurchaseType::New | PurchaseType::Additional => self.provision_new(&transaction, &user).await,
            PurchaseType::Renew => self.provision_renewal(&transaction, &user).await,
        };

        match result {
            Ok(outcome) => {
                self.notify_provisioned(&user, &outcome).await;
                Ok(outcome)
            }
            Err(e) if e.is_transient() => {
                warn!("Provisioning {} hit a transient failure: {}", payment_id, e);
                Err(e)
            }
            Err(e) => {
                self.fail_provisioning(payment_id, &e).await?;
                Ok(ProvisionOutcome::Failed(e.to_string()))
            }
        }
    }

    /// COMPLETED -> FAILED plus user and operator notifications. No refund.
    pub async fn fail_provisioning(&self, payment_id: Uuid, err: &CommerceError) -> CommerceResult<()> {
        let Some(transaction) = self.repos.transactions.get(payment_id).await? else {
            return Ok(());
        };
        let moved = self
            .repos
            .transactions
            .transition(payment_id, TransactionStatus::Completed, TransactionStatus::Failed)
            .await?;
        if !moved {
            return Ok(());
        }

        error!(
            payment_id = %payment_id,
            user = transaction.user_telegram_id,
            purchase_type = %transaction.purchase_type,
            "Provisioning failed: {}",
            err
        );
        self.notifier
            .notify_user(
                transaction.user_telegram_id,
                Notification::new(err.message_key()).with("payment_id", payment_id),
            )
            .await;
        self.notifier
            .notify_operators(
                Notification::new("ntf-event-error-provisioning")
                    .with("user", transaction.user_telegram_id)
                    .with("payment_id", payment_id)
                    .with("purchase_type", transaction.purchase_type)
                    .with("plan", &transaction.plan.name)
                    .with("amount", transaction.currency.format_major(transaction.pricing.final_amount))
                    .with("currency", transaction.currency)
                    .with("error", err),
            )
            .await;
        Ok(())
    }

    async fn provision_new(&self, transaction: &Transaction, user: &User) -> CommerceResult<ProvisionOutcome> {
        let snapshot = &transaction.plan.0;
        let wanted = snapshot.subscription_count.max(1) as usize;
        let existing = self
            .repos
            .subscriptions
            .list_by_source_payment(transaction.payment_id)
            .await?;
        if existing.len() >= wanted {
            debug!("Payment {} already provisioned", transaction.payment_id);
            return Ok(ProvisionOutcome::AlreadyApplied);
        }

        let trial = if transaction.purchase_type == PurchaseType::New && existing.is_empty() {
            self.outstanding_trial(user).await?
        } else {
            None
        };

        let fresh = wanted - existing.len() - usize::from(trial.is_some());
        self.check_limit(user, fresh as i64).await?;
        let max = self.max_subscriptions_for(user).await?;

        let mut created = Vec::with_capacity(wanted);
        let mut next_index = existing.len();
        if let Some(trial) = trial {
            created.push(self.replace_trial(transaction, user, &trial, max).await?);
            next_index += 1;
        }
        for index in next_index..wanted {
            let make_current = index == 0
                && (transaction.purchase_type == PurchaseType::New || user.current_subscription_id.is_none());
            created.push(
                self.create_subscription(user, snapshot, max, make_current, |new| {
                    new.device_type = transaction.device_type_at(index);
                    new.source_payment_id = Some(transaction.payment_id);
                })
                .await?,
            );
        }

        info!(
            "Provisioned {} subscription(s) for user {} from payment {}",
            created.len(),
            user.telegram_id,
            transaction.payment_id
        );
        Ok(ProvisionOutcome::Created(created))
    }

    async fn replace_trial(
        &self,
        transaction: &Transaction,
        user: &User,
        trial: &Subscription,
        max: i32,
    ) -> CommerceResult<Subscription> {
        self.repos
            .subscriptions
            .set_status(trial.id, SubscriptionStatus::Disabled)
            .await?;

        let result = self.take_over_trial(transaction, user, trial, max).await;

        match result {
            Ok(subscription) => {
                info!(
                    "Trial {} of user {} replaced by paid subscription {}",
                    trial.id, user.telegram_id, subscription.id
                );
                Ok(subscription)
            }
            Err(e) => {
                if let Err(restore) = self
                    .repos
                    .subscriptions
                    .set_status(trial.id, trial.status)
                    .await
                {
                    warn!("Failed to restore trial {}: {:#}", trial.id, restore);
                }
                Err(e)
            }
        }
    }

    async fn take_over_trial(
        &self,
        transaction: &Transaction,
        user: &User,
        trial: &Subscription,
        max: i32,
    ) -> CommerceResult<Subscription> {
        let snapshot = &transaction.plan.0;
        let spec = PanelUserSpec::from_plan(
            trial.panel_username.clone(),
            user.telegram_id,
            snapshot,
            expiry_from(Utc::now(), snapshot.duration),
        );
        let panel_user = self
            .panel
            .update_user(&self.ctx(), trial.panel_uuid, &spec, true)
            .await?;

        let mut new = new_subscription(user.telegram_id, &panel_user, snapshot, false);
        new.device_type = transaction.device_type_at(0).or(trial.device_type);
        new.source_payment_id = Some(transaction.payment_id);
        self.repos
            .subscriptions
            .create_within_limit(&new, max, Some(trial.id), true)
            .await?
            .ok_or_else(|| PolicyViolation::SubscriptionLimit { max }.into())
    }

    /// Creates (or adopts) the panel user, then inserts the row under the cap.
    /// A cap violation at insert time removes the panel user again.
    async fn create_subscription<F>(
        &self,
        user: &User,
        snapshot: &PlanSnapshot,
        max: i32,
        make_current: bool,
        customize: F,
    ) -> CommerceResult<Subscription>
    where
        F: FnOnce(&mut NewSubscription),
    {
        let username = self.next_username(user.telegram_id).await?;
        let spec = PanelUserSpec::from_plan(
            username,
            user.telegram_id,
            snapshot,
            expiry_from(Utc::now(), snapshot.duration),
        );
        let ctx = self.ctx();
        let panel_user = self.create_or_adopt(&ctx, &spec).await?;

        let mut new = new_subscription(user.telegram_id, &panel_user, snapshot, false);
        customize(&mut new);

        match self
            .repos
            .subscriptions
            .create_within_limit(&new, max, None, make_current)
            .await?
        {
            Some(subscription) => Ok(subscription),
            None => {
                warn!(
                    "Subscription cap {} hit for user {} after panel create; removing {}",
                    max, user.telegram_id, panel_user.username
                );
                if let Err(e) = self.panel.delete_user(&ctx, panel_user.uuid).await {
                    error!("Failed to remove orphaned panel user {}: {}", panel_user.uuid, e);
                }
                Err(PolicyViolation::SubscriptionLimit { max }.into())
            }
        }
    }

    /// Creates a panel user without a local row; the caller owns the row insert.
    pub async fn create_panel_user(&self, user: &User, snapshot: &PlanSnapshot) -> CommerceResult<PanelUser> {
        let username = self.next_username(user.telegram_id).await?;
        let spec = PanelUserSpec::from_plan(
            username,
            user.telegram_id,
            snapshot,
            expiry_from(Utc::now(), snapshot.duration),
        );
        self.create_or_adopt(&self.ctx(), &spec).await
    }

    /// Compensation for [`Self::create_panel_user`] when the local insert was refused.
    pub async fn discard_panel_user(&self, uuid: Uuid) {
        if let Err(e) = self.panel.delete_user(&self.ctx(), uuid).await {
            error!("Failed to discard panel user {}: {}", uuid, e);
        }
    }

    async fn create_or_adopt(&self, ctx: &CallContext, spec: &PanelUserSpec) -> CommerceResult<PanelUser> {
        match self.panel.create_user(ctx, spec).await {
            Ok(user) => Ok(user),
            Err(PanelError::UsernameTaken(username)) => {
                warn!("Panel username {} already exists, adopting it", username);
                let existing = self
                    .panel
                    .get_user_by_username(ctx, &username)
                    .await?
                    .ok_or_else(|| PanelError::NotFound(username.clone()))?;
                Ok(self.panel.update_user(ctx, existing.uuid, spec, false).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn next_username(&self, telegram_id: i64) -> CommerceResult<String> {
        let taken: HashSet<String> = self
            .repos
            .subscriptions
            .list_by_user(telegram_id)
            .await?
            .into_iter()
            .map(|s| s.panel_username)
            .collect();
        Ok(next_panel_username(&self.username_prefix, telegram_id, &taken))
    }

    async fn provision_renewal(&self, transaction: &Transaction, user: &User) -> CommerceResult<ProvisionOutcome> {
        let mut targets = transaction.renewal_targets();
        if targets.is_empty() {
            targets.extend(user.current_subscription_id);
        }
        if targets.is_empty() {
            return Err(CommerceError::not_found("subscription to renew"));
        }

        let days = transaction.plan.duration;
        let now = Utc::now();
        let mut renewed = Vec::with_capacity(targets.len());

        for id in targets {
            let Some(current) = self
                .repos
                .subscriptions
                .get(id)
                .await?
                .filter(|s| s.user_telegram_id == user.telegram_id && !s.is_deleted())
            else {
                warn!(
                    "Renewal {} skips subscription {}: missing or not owned by {}",
                    transaction.payment_id, id, user.telegram_id
                );
                continue;
            };

            let Some((subscription, applied)) = self
                .repos
                .subscriptions
                .apply_renewal(current.id, transaction.payment_id, days, now)
                .await?
            else {
                continue;
            };

            if applied {
                info!(
                    "Subscription {} renewed until {} by {}",
                    subscription.id, subscription.expire_at, transaction.payment_id
                );
            } else {
                debug!(
                    "Renewal {} already applied to subscription {}",
                    transaction.payment_id, subscription.id
                );
            }

            renewed.push(self.sync_or_enqueue(subscription).await?);
        }

        if renewed.is_empty() {
            return Err(CommerceError::not_found("renewable subscription"));
        }
        Ok(ProvisionOutcome::Renewed(renewed))
    }

    /// Pushes the stored row to the panel and records what the panel reports.
    /// The row is re-read first so a concurrent change is never overwritten;
    /// one that lands during the call is queued for another sync.
    pub async fn push_to_panel(&self, subscription_id: i64) -> CommerceResult<Subscription> {
        let sent = self
            .repos
            .subscriptions
            .get(subscription_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("subscription {}", subscription_id)))?;
        let spec = PanelUserSpec::from_subscription(&sent);
        let panel_user = self
            .panel
            .update_user(&self.ctx(), sent.panel_uuid, &spec, false)
            .await?;

        let view = PanelView {
            expire_at: panel_user.expire_at,
            url: Some(panel_user.subscription_url).filter(|url| !url.is_empty()),
            status: panel_user.status,
        };
        let stored = self
            .repos
            .subscriptions
            .store_panel_view(subscription_id, &view)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("subscription {}", subscription_id)))?;

        if !stored.is_deleted() && drifted(&sent, &stored, &view) {
            debug!(
                "Subscription {} changed during panel sync, queueing another",
                subscription_id
            );
            self.repos
                .jobs
                .enqueue(&NewJob::from(JobPayload::PanelSync { subscription_id }))
                .await?;
        }
        Ok(stored)
    }

    /// Like [`Self::push_to_panel`], but a panel failure leaves a retry job behind.
    pub async fn sync_or_enqueue(&self, subscription: Subscription) -> CommerceResult<Subscription> {
        let id = subscription.id;
        match self.push_to_panel(id).await {
            Ok(synced) => Ok(synced),
            Err(CommerceError::Panel(e)) => {
                warn!("Panel sync of subscription {} failed, queued for retry: {}", id, e);
                self.repos
                    .jobs
                    .enqueue(&NewJob::from(JobPayload::PanelSync { subscription_id: id }))
                    .await?;
                Ok(subscription)
            }
            Err(e) => Err(e),
        }
    }

    /// Job handler for `panel_sync`.
    pub async fn sync_subscription(&self, subscription_id: i64) -> CommerceResult<()> {
        match self.repos.subscriptions.get(subscription_id).await? {
            Some(subscription) if !subscription.is_deleted() => {
                self.push_to_panel(subscription.id).await?;
                debug!("Subscription {} synced to panel", subscription_id);
            }
            Some(_) => debug!("Subscription {} is deleted, nothing to sync", subscription_id),
            None => warn!("Subscription {} vanished before panel sync", subscription_id),
        }
        Ok(())
    }

    /// One trial per user, from the given TRIAL plan or the first active one.
    pub async fn grant_trial(&self, telegram_id: i64, plan_id: Option<i32>) -> CommerceResult<Subscription> {
        let user = self
            .repos
            .users
            .get(telegram_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("user {}", telegram_id)))?;
        if user.is_trial_used {
            return Err(PolicyViolation::TrialAlreadyUsed.into());
        }

        let plan = match plan_id {
            Some(id) => Some(self.plans.get(id).await?)
                .filter(|p| p.is_active && p.availability == PlanAvailability::Trial),
            None => self.plans.trial_plan().await?,
        }
        .ok_or_else(|| CommerceError::not_found("trial plan"))?;
        let days = plan
            .durations
            .first()
            .map(|d| d.days)
            .ok_or_else(|| CommerceError::validation("trial plan has no duration"))?;
        let snapshot = plan.snapshot(days);

        self.check_limit(&user, 1).await?;
        let max = self.max_subscriptions_for(&user).await?;
        let make_current = user.current_subscription_id.is_none();
        let subscription = self
            .create_subscription(&user, &snapshot, max, make_current, |new| new.is_trial = true)
            .await?;

        if !self.repos.users.mark_trial_used(telegram_id).await? {
            warn!("Trial flag of user {} was already set", telegram_id);
        }

        info!("Trial subscription {} granted to {}", subscription.id, telegram_id);
        if self.settings.get().await?.system_notifications.trial_getted {
            self.notifier
                .notify_operators(
                    Notification::new("ntf-event-trial")
                        .with("user", telegram_id)
                        .with("plan", &snapshot.name)
                        .with("days", days),
                )
                .await;
        }
        Ok(subscription)
    }

    /// Deletes long-expired subscriptions from the panel, then locally.
    /// Stops between items once `cancel` fires.
    pub async fn cleanup_expired(&self, cancel: &CancellationToken) -> CommerceResult<CleanupReport> {
        let cutoff = Utc::now() - Duration::days(CLEANUP_GRACE_DAYS);
        let expired = self.repos.subscriptions.list_expired_before(cutoff).await?;
        let mut report = CleanupReport::default();
        info!("Cleanup: {} subscription(s) expired before {}", expired.len(), cutoff);

        for subscription in expired {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            match self.purge(&subscription).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Cleanup of subscription {} failed: {}", subscription.id, e);
                }
            }
        }

        info!(
            "Cleanup finished: {} deleted, {} failed{}",
            report.deleted,
            report.failed,
            if report.interrupted { " (interrupted)" } else { "" }
        );
        Ok(report)
    }

    async fn purge(&self, subscription: &Subscription) -> CommerceResult<()> {
        self.panel.delete_user(&self.ctx(), subscription.panel_uuid).await?;
        self.repos
            .subscriptions
            .set_status(subscription.id, SubscriptionStatus::Deleted)
            .await?;
        if let Some(user) = self.repos.users.get(subscription.user_telegram_id).await? {
            if user.current_subscription_id == Some(subscription.id) {
                self.repos
                    .users
                    .set_current_subscription(user.telegram_id, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn notify_provisioned(&self, user: &User, outcome: &ProvisionOutcome) {
        let (key, subscriptions) = match outcome {
            ProvisionOutcome::Created(subs) => ("ntf-subscription-created", subs),
            ProvisionOutcome::Renewed(subs) => ("ntf-subscription-renewed", subs),
            _ => return,
        };
        for subscription in subscriptions {
            self.notifier
                .notify_user(
                    user.telegram_id,
                    Notification::new(key)
                        .with("subscription", subscription.id)
                        .with("expire_at", subscription.expire_at.format("%Y-%m-%d %H:%M UTC"))
                        .with("url", &subscription.url),
                )
                .await;
        }
    }
}

pub(crate) fn new_subscription(
    telegram_id: i64,
    panel_user: &PanelUser,
    snapshot: &PlanSnapshot,
    is_trial: bool,
) -> NewSubscription {
    NewSubscription {
        user_telegram_id: telegram_id,
        panel_uuid: panel_user.uuid,
        panel_username: panel_user.username.clone(),
        status: panel_user.status,
        is_trial,
        traffic_limit: snapshot.traffic_limit,
        device_limit: snapshot.device_limit,
        internal_squads: snapshot.internal_squads.clone(),
        external_squad: snapshot.external_squad,
        expire_at: panel_user.expire_at,
        url: panel_user.subscription_url.clone(),
        device_type: None,
        plan: snapshot.clone(),
        source_payment_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_fill_the_first_free_suffix() {
        let mut taken = HashSet::new();
        assert_eq!(next_panel_username("tg_", 42, &taken), "tg_42");
        taken.insert("tg_42".to_string());
        assert_eq!(next_panel_username("tg_", 42, &taken), "tg_42_sub1");
        taken.insert("tg_42_sub1".to_string());
        taken.insert("tg_42_sub3".to_string());
        assert_eq!(next_panel_username("tg_", 42, &taken), "tg_42_sub2");
    }

    #[test]
    fn lifetime_expiry_is_far_away() {
        let now = Utc::now();
        assert_eq!(expiry_from(now, 30), now + Duration::days(30));
        assert!(expiry_from(now, -1) > now + Duration::days(365 * 50));
    }
}
