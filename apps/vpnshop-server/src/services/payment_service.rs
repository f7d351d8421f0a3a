use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vpnshop_db::Repositories;
use vpnshop_db::models::enums::{Currency, DeviceType, PaymentGatewayType, PurchaseType, TransactionStatus};
use vpnshop_db::models::gateway::PaymentGateway as GatewayRow;
use vpnshop_db::models::job::{JobPayload, NewJob};
use vpnshop_db::models::plan::PlanSnapshot;
use vpnshop_db::models::transaction::{NewTransaction, PriceDetails, Transaction};
use vpnshop_db::models::user::User;

use super::notification_service::{Notification, Notifier};
use super::payment::{CreatePaymentRequest, GatewayRegistry, PaymentGateway, WebhookOutcome, WebhookRequest};
use super::plan_service::{PlanService, apply_discount, find_matching_plan, is_available_for};
use super::pubsub_service::{JOBS_CHANNEL, PubSubService};
use super::settings_service::SettingsService;
use super::subscription_service::SubscriptionService;
use super::user_service::UserService;
use crate::context::{CREATE_PAYMENT_TIMEOUT, CallContext, WEBHOOK_TIMEOUT};
use crate::error::{CommerceError, CommerceResult, GatewayError, WebhookError};

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub user_telegram_id: i64,
    pub plan_id: i32,
    pub days: i32,
    pub gateway_type: PaymentGatewayType,
    pub purchase_type: PurchaseType,
    /// RENEW targets; empty renews the current subscription.
    pub renew_subscription_ids: Vec<i64>,
    pub device_types: Vec<DeviceType>,
}

#[derive(Debug, Clone)]
pub struct Invoice {
    pub payment_id: Uuid,
    /// `None` for free purchases; the UI offers the "get subscription" button.
    pub url: Option<String>,
    pub pricing: PriceDetails,
    pub transaction: Transaction,
}

/// Plain description sent to the gateway.
pub fn describe(snapshot: &PlanSnapshot, renewals: usize) -> String {
    let duration = if snapshot.is_lifetime() {
        "lifetime".to_string()
    } else {
        format!("{} days", snapshot.duration)
    };
    let mut text = format!("{}, {}", snapshot.name, duration);
    if snapshot.subscription_count > 1 {
        text.push_str(&format!(", {} subscriptions", snapshot.subscription_count));
    }
    if renewals > 1 {
        text.push_str(&format!(", renewal of {} subscriptions", renewals));
    }
    text
}

/// Drives transactions from creation to a terminal state and fires the
/// completed-payment effects exactly once.
#[derive(Clone)]
pub struct PaymentService {
    repos: Repositories,
    settings: SettingsService,
    plans: PlanService,
    subscriptions: SubscriptionService,
    users: UserService,
    gateways: Arc<GatewayRegistry>,
    notifier: Arc<dyn Notifier>,
    pubsub: Option<Arc<PubSubService>>,
    wake: Arc<Notify>,
    return_url: String,
    shutdown: CancellationToken,
}

impl PaymentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        settings: SettingsService,
        plans: PlanService,
        subscriptions: SubscriptionService,
        users: UserService,
        gateways: Arc<GatewayRegistry>,
        notifier: Arc<dyn Notifier>,
        pubsub: Option<Arc<PubSubService>>,
        wake: Arc<Notify>,
        return_url: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repos,
            settings,
            plans,
            subscriptions,
            users,
            gateways,
            notifier,
            pubsub,
            wake,
            return_url,
            shutdown,
        }
    }

    /// Gateways offered in the storefront: active rows with credentials, by order.
    pub async fn list_gateways(&self) -> CommerceResult<Vec<GatewayRow>> {
        let mut rows: Vec<GatewayRow> = self
            .repos
            .gateways
            .list()
            .await?
            .into_iter()
            .filter(|g| g.is_active && self.gateways.is_configured(g.gateway_type))
            .collect();
        rows.sort_by_key(|g| g.order_index);
        Ok(rows)
    }

    async fn usable_gateway(&self, gateway_type: PaymentGatewayType) -> CommerceResult<Arc<dyn PaymentGateway>> {
        let active = self
            .repos
            .gateways
            .get(gateway_type)
            .await?
            .is_some_and(|row| row.is_active);
        if !active {
            return Err(CommerceError::validation(format!("gateway {} is disabled", gateway_type)));
        }
        Ok(self.gateways.get(gateway_type)?)
    }

    /// Prices the purchase, records it PENDING, then asks the gateway for an invoice.
    pub async fn create_payment(&self, request: PurchaseRequest) -> CommerceResult<Invoice> {
        let user = self.users.get(request.user_telegram_id).await?;
        self.users.ensure_can_purchase(&user).await?;
        let gateway = self.usable_gateway(request.gateway_type).await?;
        let currency = request.gateway_type.currency();
        let plan = self.plans.get(request.plan_id).await?;
        let snapshot = plan.snapshot(request.days);

        let mut targets: Vec<i64> = Vec::new();
        let original = match request.purchase_type {
            PurchaseType::New | PurchaseType::Additional => {
                let count = self.repos.subscriptions.count_by_user(user.telegram_id).await?;
                if !plan.is_active || !is_available_for(&plan, &user, count) {
                    return Err(CommerceError::validation(format!("plan {} is not available", plan.id)));
                }
                let price = plan.price(request.days, currency).ok_or_else(|| {
                    CommerceError::validation(format!("plan {} has no {} price for {} days", plan.id, currency, request.days))
                })?;

                let mut adding = snapshot.subscription_count.max(1) as i64;
                if request.purchase_type == PurchaseType::New
                    && self.subscriptions.outstanding_trial(&user).await?.is_some()
                {
                    adding -= 1;
                }
                self.subscriptions.check_limit(&user, adding).await?;
                price
            }
            PurchaseType::Renew => {
                targets = if request.renew_subscription_ids.is_empty() {
                    user.current_subscription_id.into_iter().collect()
                } else {
                    request.renew_subscription_ids.clone()
                };
                let mut seen = HashSet::new();
                targets.retain(|id| seen.insert(*id));
                if targets.is_empty() {
                    return Err(CommerceError::not_found("subscription to renew"));
                }
                self.renewal_price(&user, &targets, request.days, currency).await?
            }
        };

        let pricing = apply_discount(original, user.effective_discount());
        let new = NewTransaction {
            payment_id: Uuid::new_v4(),
            user_telegram_id: user.telegram_id,
            status: TransactionStatus::Pending,
            is_test: false,
            purchase_type: request.purchase_type,
            gateway_type: request.gateway_type,
            currency,
            pricing,
            plan: snapshot,
            renew_subscription_id: (targets.len() == 1).then(|| targets[0]),
            renew_subscription_ids: (targets.len() > 1).then(|| targets.clone()),
            device_types: (!request.device_types.is_empty()).then(|| request.device_types.clone()),
        };
        let transaction = self.repos.transactions.create(&new).await?;
        info!(
            payment_id = %transaction.payment_id,
            user = user.telegram_id,
            "Created {} payment for '{}': {} {}",
            transaction.purchase_type,
            transaction.plan.name,
            pricing.final_amount,
            currency
        );

        if pricing.is_free() {
            return Ok(Invoice {
                payment_id: transaction.payment_id,
                url: None,
                pricing,
                transaction,
            });
        }
        self.invoice(&user, transaction, gateway, targets.len()).await
    }

    /// Sum over the targets of their matched plan's price at `days`.
    async fn renewal_price(
        &self,
        user: &User,
        targets: &[i64],
        days: i32,
        currency: Currency,
    ) -> CommerceResult<i64> {
        let catalog = self.plans.list().await?;
        let mut total = 0;
        for id in targets {
            let subscription = self.subscriptions.get_owned(user.telegram_id, *id).await?;
            let plan = find_matching_plan(&catalog, &subscription.plan).ok_or_else(|| {
                CommerceError::validation(format!("no active plan matches subscription {}", id))
            })?;
            total += plan.price(days, currency).ok_or_else(|| {
                CommerceError::validation(format!("plan {} has no {} price for {} days", plan.id, currency, days))
            })?;
        }
        Ok(total)
    }

    async fn invoice(
        &self,
        user: &User,
        transaction: Transaction,
        gateway: Arc<dyn PaymentGateway>,
        renewals: usize,
    ) -> CommerceResult<Invoice> {
        let request = CreatePaymentRequest {
            payment_id: transaction.payment_id,
            amount: transaction.pricing.final_amount,
            currency: transaction.currency,
            description: describe(&transaction.plan, renewals),
            return_url: self.return_url.clone(),
        };
        let ctx = CallContext::new(CREATE_PAYMENT_TIMEOUT, self.shutdown.child_token());

        match gateway.create_payment(&ctx, &request).await {
            Ok(link) => {
                if let Some(url) = &link.url {
                    self.repos
                        .transactions
                        .set_payment_url(transaction.payment_id, url)
                        .await?;
                }
                debug!(
                    "Invoice for {} issued (external id {:?})",
                    transaction.payment_id, link.external_id
                );
                Ok(Invoice {
                    payment_id: transaction.payment_id,
                    url: link.url,
                    pricing: transaction.pricing,
                    transaction,
                })
            }
            Err(GatewayError::Timeout) => {
                warn!(
                    "Gateway {} timed out creating {}; transaction stays pending",
                    transaction.gateway_type, transaction.payment_id
                );
                Err(GatewayError::Timeout.into())
            }
            Err(e) => {
                self.repos
                    .transactions
                    .transition(transaction.payment_id, TransactionStatus::Pending, TransactionStatus::Failed)
                    .await?;
                error!(
                    payment_id = %transaction.payment_id,
                    user = user.telegram_id,
                    "Gateway {} failed to create payment: {}",
                    transaction.gateway_type,
                    e
                );
                self.notifier
                    .notify_operators(
                        Notification::new("ntf-event-error-gateway")
                            .with("user", user.telegram_id)
                            .with("payment_id", transaction.payment_id)
                            .with("gateway", transaction.gateway_type)
                            .with("error", &e),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    /// Operator-only purchase of one major unit that provisions nothing.
    pub async fn create_test_payment(
        &self,
        operator_id: i64,
        gateway_type: PaymentGatewayType,
    ) -> CommerceResult<Invoice> {
        let operator = self.users.get(operator_id).await?;
        if !operator.is_privileged() {
            return Err(CommerceError::not_found(format!("user {}", operator_id)));
        }
        let gateway = self.gateways.get(gateway_type)?;
        let currency = gateway_type.currency();
        let amount = currency.minor_units();

        let transaction = self
            .repos
            .transactions
            .create(&NewTransaction {
                payment_id: Uuid::new_v4(),
                user_telegram_id: operator_id,
                status: TransactionStatus::Pending,
                is_test: true,
                purchase_type: PurchaseType::New,
                gateway_type,
                currency,
                pricing: PriceDetails {
                    original_amount: amount,
                    discount_percent: 0,
                    final_amount: amount,
                },
                plan: PlanSnapshot::test(),
                renew_subscription_id: None,
                renew_subscription_ids: None,
                device_types: None,
            })
            .await?;
        info!("Operator {} created test payment {} via {}", operator_id, transaction.payment_id, gateway_type);
        self.invoice(&operator, transaction, gateway, 0).await
    }

    /// The "get subscription" button of a zero-priced purchase.
    pub async fn complete_free_payment(&self, telegram_id: i64, payment_id: Uuid) -> CommerceResult<()> {
        let transaction = self.owned_transaction(telegram_id, payment_id).await?;
        if !transaction.pricing.is_free() {
            return Err(CommerceError::validation("payment is not free"));
        }
        if transaction.status != TransactionStatus::Pending {
            return Err(CommerceError::Conflict(format!(
                "payment {} is already {}",
                payment_id, transaction.status
            )));
        }
        self.on_payment_succeeded(&transaction).await
    }

    /// Owner or operator cancellation of a pending payment.
    pub async fn cancel_payment(&self, actor_id: i64, payment_id: Uuid) -> CommerceResult<()> {
        let transaction = self
            .repos
            .transactions
            .get(payment_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("payment {}", payment_id)))?;
        if transaction.user_telegram_id != actor_id && !self.users.get(actor_id).await?.is_privileged() {
            return Err(CommerceError::not_found(format!("payment {}", payment_id)));
        }
        if !self
            .repos
            .transactions
            .transition(payment_id, TransactionStatus::Pending, TransactionStatus::Canceled)
            .await?
        {
            return Err(CommerceError::Conflict(format!(
                "payment {} is already {}",
                payment_id, transaction.status
            )));
        }
        info!("Payment {} canceled by {}", payment_id, actor_id);
        Ok(())
    }

    async fn owned_transaction(&self, telegram_id: i64, payment_id: Uuid) -> CommerceResult<Transaction> {
        self.repos
            .transactions
            .get(payment_id)
            .await?
            .filter(|t| t.user_telegram_id == telegram_id)
            .ok_or_else(|| CommerceError::not_found(format!("payment {}", payment_id)))
    }

    /// Authenticates a gateway notification and applies its outcome.
    /// Replays against terminal transactions are acknowledged without effect.
    pub async fn handle_webhook(
        &self,
        gateway_type: PaymentGatewayType,
        request: WebhookRequest,
    ) -> Result<WebhookOutcome, WebhookError> {
        let gateway = self.gateways.get(gateway_type)?;
        let ctx = CallContext::new(WEBHOOK_TIMEOUT, self.shutdown.child_token());

        let outcome = match gateway.handle_webhook(&ctx, &request).await {
            Ok(outcome) => outcome,
            Err(GatewayError::SignatureMismatch) => {
                warn!(
                    remote = ?request.remote_addr,
                    "Rejected {} webhook: signature mismatch", gateway_type
                );
                return Err(WebhookError::SignatureMismatch);
            }
            Err(e) => {
                warn!(remote = ?request.remote_addr, "Rejected {} webhook: {}", gateway_type, e);
                return Err(e.into());
            }
        };

        self.apply_outcome(gateway_type, outcome).await?;
        Ok(outcome)
    }

    async fn apply_outcome(&self, gateway_type: PaymentGatewayType, outcome: WebhookOutcome) -> CommerceResult<()> {
        let transaction = self
            .repos
            .transactions
            .get(outcome.payment_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("payment {}", outcome.payment_id)))?;
        if transaction.gateway_type != gateway_type {
            return Err(CommerceError::validation(format!(
                "payment {} belongs to {}",
                outcome.payment_id, transaction.gateway_type
            )));
        }
        if transaction.status.is_terminal() {
            debug!(
                "Webhook replay for {} ignored: already {}",
                outcome.payment_id, transaction.status
            );
            return Ok(());
        }

        match outcome.status {
            TransactionStatus::Completed => self.on_payment_succeeded(&transaction).await,
            TransactionStatus::Canceled => self.on_payment_canceled(&transaction).await,
            other => {
                debug!("Payment {} still {}", outcome.payment_id, other);
                Ok(())
            }
        }
    }

    /// PENDING -> COMPLETED together with the three effect jobs.
    pub async fn on_payment_succeeded(&self, transaction: &Transaction) -> CommerceResult<()> {
        let payment_id = transaction.payment_id;

        if transaction.is_test {
            if self
                .repos
                .transactions
                .transition(payment_id, TransactionStatus::Pending, TransactionStatus::Completed)
                .await?
            {
                info!("Test payment {} completed", payment_id);
                self.notifier
                    .notify_operators(
                        Notification::new("ntf-event-test-payment")
                            .with("user", transaction.user_telegram_id)
                            .with("payment_id", payment_id)
                            .with("gateway", transaction.gateway_type)
                            .with("amount", transaction.currency.format_major(transaction.pricing.final_amount))
                            .with("currency", transaction.currency),
                    )
                    .await;
            }
            return Ok(());
        }

        let jobs: Vec<NewJob> = JobPayload::payment_effects(payment_id)
            .into_iter()
            .map(NewJob::from)
            .collect();
        if !self
            .repos
            .transactions
            .complete_and_enqueue(payment_id, &jobs)
            .await?
        {
            debug!("Payment {} was completed concurrently", payment_id);
            return Ok(());
        }

        info!(
            payment_id = %payment_id,
            user = transaction.user_telegram_id,
            "Payment completed: {} {} via {}",
            transaction.pricing.final_amount,
            transaction.currency,
            transaction.gateway_type
        );
        self.wake.notify_waiters();
        if let Some(pubsub) = &self.pubsub {
            pubsub.announce(JOBS_CHANNEL, &payment_id.to_string()).await;
        }

        if self.settings.get().await?.system_notifications.subscription {
            self.notifier
                .notify_operators(
                    Notification::new("ntf-event-subscription")
                        .with("user", transaction.user_telegram_id)
                        .with("payment_id", payment_id)
                        .with("purchase_type", transaction.purchase_type)
                        .with("plan", &transaction.plan.name)
                        .with("amount", transaction.currency.format_major(transaction.pricing.final_amount))
                        .with("currency", transaction.currency)
                        .with("gateway", transaction.gateway_type),
                )
                .await;
        }
        Ok(())
    }

    pub async fn on_payment_canceled(&self, transaction: &Transaction) -> CommerceResult<()> {
        if self
            .repos
            .transactions
            .transition(
                transaction.payment_id,
                TransactionStatus::Pending,
                TransactionStatus::Canceled,
            )
            .await?
        {
            info!("Payment {} canceled by gateway", transaction.payment_id);
            self.notifier
                .notify_user(
                    transaction.user_telegram_id,
                    Notification::new("ntf-payment-canceled").with("payment_id", transaction.payment_id),
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_mention_duration_and_counts() {
        let mut snapshot = PlanSnapshot {
            name: "Premium".into(),
            duration: 30,
            ..PlanSnapshot::default()
        };
        assert_eq!(describe(&snapshot, 1), "Premium, 30 days");

        snapshot.subscription_count = 2;
        assert_eq!(describe(&snapshot, 0), "Premium, 30 days, 2 subscriptions");

        snapshot.subscription_count = 1;
        snapshot.duration = -1;
        assert_eq!(describe(&snapshot, 3), "Premium, lifetime, renewal of 3 subscriptions");
    }
}
