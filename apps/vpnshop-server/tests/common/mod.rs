#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use axum::http::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vpnshop_db::memory::MemoryStore;
use vpnshop_db::models::enums::{
    Currency, PaymentGatewayType, PlanAvailability, PlanType, PurchaseType, SubscriptionStatus, TransactionStatus,
};
use vpnshop_db::models::plan::{GIB, NewPlan, Plan, PlanDuration, PlanPrice};
use vpnshop_db::models::user::User;
use vpnshop_server::config::AppConfig;
use vpnshop_server::context::CallContext;
use vpnshop_server::error::{GatewayError, PanelError};
use vpnshop_server::panel::{InternalSquad, PanelApi, PanelUser, PanelUserSpec};
use vpnshop_server::services::notification_service::{Notification, Notifier};
use vpnshop_server::services::payment::{
    CreatePaymentRequest, GatewayRegistry, PaymentGateway, PaymentLink, WebhookOutcome, WebhookRequest,
};
use vpnshop_server::services::payment_service::{Invoice, PurchaseRequest};
use vpnshop_server::services::user_service::Registration;
use vpnshop_server::state::{AppState, Backends};

pub const GATEWAY: PaymentGatewayType = PaymentGatewayType::Yookassa;
pub const SIGNATURE_HEADER: &str = "x-test-signature";
pub const SIGNATURE: &str = "valid";

/// In-process stand-in for the VPN panel.
#[derive(Default)]
pub struct FakePanel {
    pub users: Mutex<HashMap<Uuid, PanelUser>>,
    /// HTTP status every call fails with; `0` is healthy.
    pub failure: AtomicU16,
    /// Expiry the next update leaves on the panel instead of the requested
    /// one, as when an older push lands last.
    pub stale_expiry: Mutex<Option<DateTime<Utc>>>,
}

impl FakePanel {
    pub fn fail_with(&self, status: u16) {
        self.failure.store(status, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.fail_with(0);
    }

    pub async fn keep_stale_expiry_once(&self, expire_at: DateTime<Utc>) {
        *self.stale_expiry.lock().await = Some(expire_at);
    }

    fn check(&self) -> Result<(), PanelError> {
        match self.failure.load(Ordering::SeqCst) {
            0 => Ok(()),
            status => Err(PanelError::Http {
                status,
                body: "panel unavailable".into(),
            }),
        }
    }

    pub async fn user_count(&self) -> usize {
        self.users.lock().await.len()
    }

    pub async fn get(&self, uuid: Uuid) -> Option<PanelUser> {
        self.users.lock().await.get(&uuid).cloned()
    }
}

fn apply_spec(user: &mut PanelUser, spec: &PanelUserSpec) {
    user.username = spec.username.clone();
    user.status = spec.status;
    user.expire_at = spec.expire_at;
    user.traffic_limit = spec.traffic_limit;
    user.device_limit = spec.device_limit;
    user.internal_squads = spec.internal_squads.clone();
    user.external_squad = spec.external_squad;
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn create_user(&self, _ctx: &CallContext, spec: &PanelUserSpec) -> Result<PanelUser, PanelError> {
        self.check()?;
        let mut users = self.users.lock().await;
        if users.values().any(|u| u.username == spec.username) {
            return Err(PanelError::UsernameTaken(spec.username.clone()));
        }
        let uuid = Uuid::new_v4();
        let mut user = PanelUser {
            uuid,
            username: String::new(),
            status: SubscriptionStatus::Active,
            expire_at: spec.expire_at,
            subscription_url: format!("https://sub.test/{}", uuid),
            traffic_limit: 0,
            device_limit: 0,
            internal_squads: Vec::new(),
            external_squad: None,
        };
        apply_spec(&mut user, spec);
        users.insert(uuid, user.clone());
        Ok(user)
    }

    async fn update_user(
        &self,
        _ctx: &CallContext,
        uuid: Uuid,
        spec: &PanelUserSpec,
        _reset_traffic: bool,
    ) -> Result<PanelUser, PanelError> {
        self.check()?;
        let mut users = self.users.lock().await;
        let user = users
            .get_mut(&uuid)
            .ok_or_else(|| PanelError::NotFound(uuid.to_string()))?;
        apply_spec(user, spec);
        if let Some(stale) = self.stale_expiry.lock().await.take() {
            user.expire_at = stale;
        }
        Ok(user.clone())
    }

    async fn delete_user(&self, _ctx: &CallContext, uuid: Uuid) -> Result<(), PanelError> {
        self.check()?;
        self.users.lock().await.remove(&uuid);
        Ok(())
    }

    async fn get_user(&self, _ctx: &CallContext, uuid: Uuid) -> Result<Option<PanelUser>, PanelError> {
        self.check()?;
        Ok(self.users.lock().await.get(&uuid).cloned())
    }

    async fn get_user_by_username(&self, _ctx: &CallContext, username: &str) -> Result<Option<PanelUser>, PanelError> {
        self.check()?;
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn list_internal_squads(&self, _ctx: &CallContext) -> Result<Vec<InternalSquad>, PanelError> {
        Ok(Vec::new())
    }
}

/// Gateway whose webhooks are JSON `{payment_id, status}` signed by a fixed header.
pub struct FakeGateway {
    pub gateway_type: PaymentGatewayType,
    pub invoices: Mutex<Vec<CreatePaymentRequest>>,
    pub failing: AtomicBool,
}

impl FakeGateway {
    pub fn new(gateway_type: PaymentGatewayType) -> Self {
        Self {
            gateway_type,
            invoices: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn gateway_type(&self) -> PaymentGatewayType {
        self.gateway_type
    }

    async fn create_payment(
        &self,
        _ctx: &CallContext,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentLink, GatewayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Http {
                status: 400,
                body: "rejected".into(),
            });
        }
        self.invoices.lock().await.push(request.clone());
        Ok(PaymentLink {
            url: Some(format!("https://pay.test/{}", request.payment_id)),
            external_id: Some(format!("ext-{}", request.payment_id)),
        })
    }

    async fn handle_webhook(
        &self,
        _ctx: &CallContext,
        request: &WebhookRequest,
    ) -> Result<WebhookOutcome, GatewayError> {
        let signed = request
            .headers
            .get(SIGNATURE_HEADER)
            .is_some_and(|value| value.as_bytes() == SIGNATURE.as_bytes());
        if !signed {
            return Err(GatewayError::SignatureMismatch);
        }
        let body: Value =
            serde_json::from_slice(&request.body).map_err(|e| GatewayError::InvalidWebhook(e.to_string()))?;
        let payment_id = body["payment_id"]
            .as_str()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| GatewayError::InvalidWebhook("payment_id".into()))?;
        let status = body["status"]
            .as_str()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| GatewayError::InvalidWebhook("status".into()))?;
        Ok(WebhookOutcome { payment_id, status })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Option<i64>, Notification)>>,
}

impl RecordingNotifier {
    pub async fn user_keys(&self, telegram_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| *to == Some(telegram_id))
            .map(|(_, n)| n.key.clone())
            .collect()
    }

    pub async fn operator_keys(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| to.is_none())
            .map(|(_, n)| n.key.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user(&self, telegram_id: i64, notification: Notification) {
        self.sent.lock().await.push((Some(telegram_id), notification));
    }

    async fn notify_operators(&self, notification: Notification) {
        self.sent.lock().await.push((None, notification));
    }
}

pub fn test_config() -> AppConfig {
    let raw = r#"
        database_url = "postgres://localhost/vpnshop_test"
        public_url = "https://shop.test"
        settings_cache_ttl_secs = 0

        [bot]
        token = "1:test"
        username = "vpnshop_test_bot"
        developer_ids = [1]

        [panel]
        url = "https://panel.test"
        token = "panel-token"

        [worker]
        concurrency = 8
        poll_interval_secs = 1
        max_attempts = 3
        lease_secs = 60
    "#;
    AppConfig::from_toml(raw).expect("test config parses")
}

pub struct Harness {
    pub store: MemoryStore,
    pub state: AppState,
    pub panel: Arc<FakePanel>,
    pub gateway: Arc<FakeGateway>,
    pub stars: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn new() -> Self {
        let store = MemoryStore::new();
        let repos = store.repositories();
        repos.gateways.ensure_defaults().await.unwrap();
        repos.gateways.update(GATEWAY, true, 1).await.unwrap();

        let panel = Arc::new(FakePanel::default());
        let gateway = Arc::new(FakeGateway::new(GATEWAY));
        let stars = Arc::new(FakeGateway::new(PaymentGatewayType::TelegramStars));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut gateways = GatewayRegistry::new();
        gateways.insert(gateway.clone());
        gateways.insert(stars.clone());

        let state = AppState::build(
            test_config(),
            Backends {
                repos,
                panel: panel.clone(),
                gateways,
                notifier: notifier.clone(),
                pubsub: None,
            },
            CancellationToken::new(),
        );
        Self {
            store,
            state,
            panel,
            gateway,
            stars,
            notifier,
        }
    }

    pub async fn register(&self, telegram_id: i64, invite_code: Option<&str>) -> User {
        self.state
            .users
            .get_or_create(Registration {
                telegram_id,
                name: format!("user{}", telegram_id),
                username: None,
                language: "en".into(),
                invite_code: invite_code.map(str::to_string),
            })
            .await
            .unwrap()
    }

    pub async fn user(&self, telegram_id: i64) -> User {
        self.state.users.get(telegram_id).await.unwrap()
    }

    pub async fn plan(&self, name: &str, days: i32, rub_kopecks: i64, subscription_count: i32) -> Plan {
        self.plan_with(name, days, rub_kopecks, subscription_count, PlanAvailability::All)
            .await
    }

    pub async fn plan_with(
        &self,
        name: &str,
        days: i32,
        rub_kopecks: i64,
        subscription_count: i32,
        availability: PlanAvailability,
    ) -> Plan {
        self.state
            .repos
            .plans
            .create(&NewPlan {
                name: name.into(),
                description: None,
                plan_type: PlanType::Both,
                availability,
                allowed_user_ids: Vec::new(),
                traffic_limit: 100 * GIB,
                device_limit: 3,
                subscription_count,
                durations: vec![PlanDuration {
                    days,
                    prices: vec![
                        PlanPrice {
                            currency: Currency::Rub,
                            amount: rub_kopecks,
                        },
                        PlanPrice {
                            currency: Currency::Xtr,
                            amount: rub_kopecks / 100,
                        },
                    ],
                }],
                internal_squads: Vec::new(),
                external_squad: None,
                is_active: true,
            })
            .await
            .unwrap()
    }

    pub async fn invoice(&self, telegram_id: i64, plan: &Plan, purchase_type: PurchaseType, renew: Vec<i64>) -> Invoice {
        self.state
            .payments
            .create_payment(PurchaseRequest {
                user_telegram_id: telegram_id,
                plan_id: plan.id,
                days: plan.durations.0[0].days,
                gateway_type: GATEWAY,
                purchase_type,
                renew_subscription_ids: renew,
                device_types: Vec::new(),
            })
            .await
            .unwrap()
    }

    pub fn signed_webhook(&self, payment_id: Uuid, status: TransactionStatus) -> WebhookRequest {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static(SIGNATURE));
        WebhookRequest {
            headers,
            body: Bytes::from(json!({ "payment_id": payment_id, "status": status.as_str() }).to_string()),
            remote_addr: None,
        }
    }

    pub async fn webhook(&self, payment_id: Uuid, status: TransactionStatus) -> WebhookOutcome {
        self.webhook_via(GATEWAY, payment_id, status).await
    }

    pub async fn webhook_via(
        &self,
        gateway_type: PaymentGatewayType,
        payment_id: Uuid,
        status: TransactionStatus,
    ) -> WebhookOutcome {
        self.state
            .payments
            .handle_webhook(gateway_type, self.signed_webhook(payment_id, status))
            .await
            .unwrap()
    }

    /// Runs due jobs until the queue is idle.
    pub async fn drain_jobs(&self) -> usize {
        let worker = self.state.job_worker();
        let mut total = 0;
        for _ in 0..10 {
            let n = worker.run_once().await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    /// Invoice, successful webhook, then every effect job.
    pub async fn purchase(&self, telegram_id: i64, plan: &Plan, purchase_type: PurchaseType, renew: Vec<i64>) -> Uuid {
        let invoice = self.invoice(telegram_id, plan, purchase_type, renew).await;
        self.webhook(invoice.payment_id, TransactionStatus::Completed).await;
        self.drain_jobs().await;
        invoice.payment_id
    }

    /// Moves a subscription's expiry into the past and marks it EXPIRED.
    pub async fn expire(&self, subscription_id: i64, days_ago: i64) {
        let mut subscription = self
            .state
            .repos
            .subscriptions
            .get(subscription_id)
            .await
            .unwrap()
            .unwrap();
        subscription.status = SubscriptionStatus::Expired;
        subscription.expire_at = Utc::now() - chrono::Duration::days(days_ago);
        self.store.put_subscription(subscription).await;
    }

    pub async fn transaction_status(&self, payment_id: Uuid) -> TransactionStatus {
        self.state
            .repos
            .transactions
            .get(payment_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }
}
