mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Duration;
use common::{GATEWAY, Harness, SIGNATURE, SIGNATURE_HEADER};
use serde_json::json;
use tower::ServiceExt;
use vpnshop_db::models::enums::{JobStatus, PurchaseType, TransactionStatus};
use vpnshop_server::error::{CommerceError, PolicyViolation, WebhookError};
use vpnshop_server::handlers;
use vpnshop_server::services::payment_service::PurchaseRequest;

#[tokio::test]
async fn paid_purchase_provisions_a_subscription() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;

    let invoice = h.invoice(100, &plan, PurchaseType::New, vec![]).await;
    assert_eq!(invoice.pricing.final_amount, 50_000);
    assert!(invoice.url.as_deref().is_some_and(|u| u.starts_with("https://pay.test/")));
    assert_eq!(h.gateway.invoices.lock().await[0].amount, 50_000);
    assert_eq!(h.transaction_status(invoice.payment_id).await, TransactionStatus::Pending);

    let outcome = h.webhook(invoice.payment_id, TransactionStatus::Completed).await;
    assert_eq!(outcome.status, TransactionStatus::Completed);
    assert_eq!(h.store.jobs().await.len(), 3);

    h.drain_jobs().await;
    let user = h.user(100).await;
    let subscriptions = h.state.subscriptions.list_for_user(100).await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(user.current_subscription_id, Some(subscriptions[0].id));
    assert_eq!(subscriptions[0].source_payment_id, Some(invoice.payment_id));
    assert_eq!(h.panel.user_count().await, 1);
    assert!(h.store.jobs().await.iter().all(|j| j.status == JobStatus::Done));
    assert!(h.notifier.user_keys(100).await.contains(&"ntf-subscription-created".to_string()));
    assert!(h.notifier.operator_keys().await.contains(&"ntf-event-subscription".to_string()));
}

#[tokio::test]
async fn replayed_success_webhook_fires_effects_once() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    let invoice = h.invoice(100, &plan, PurchaseType::New, vec![]).await;

    h.webhook(invoice.payment_id, TransactionStatus::Completed).await;
    h.webhook(invoice.payment_id, TransactionStatus::Completed).await;
    h.drain_jobs().await;
    h.webhook(invoice.payment_id, TransactionStatus::Completed).await;
    h.drain_jobs().await;

    assert_eq!(h.store.jobs().await.len(), 3);
    assert_eq!(h.state.subscriptions.list_for_user(100).await.unwrap().len(), 1);
    assert_eq!(h.panel.user_count().await, 1);
}

#[tokio::test]
async fn unsigned_webhook_changes_nothing() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    let invoice = h.invoice(100, &plan, PurchaseType::New, vec![]).await;

    let mut request = h.signed_webhook(invoice.payment_id, TransactionStatus::Completed);
    request.headers.remove(SIGNATURE_HEADER);
    let err = h.state.payments.handle_webhook(GATEWAY, request).await.unwrap_err();

    assert!(matches!(err, WebhookError::SignatureMismatch));
    assert_eq!(h.transaction_status(invoice.payment_id).await, TransactionStatus::Pending);
    assert!(h.store.jobs().await.is_empty());
}

#[tokio::test]
async fn canceled_payment_ignores_later_success() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    let invoice = h.invoice(100, &plan, PurchaseType::New, vec![]).await;

    h.webhook(invoice.payment_id, TransactionStatus::Canceled).await;
    assert_eq!(h.transaction_status(invoice.payment_id).await, TransactionStatus::Canceled);
    assert!(h.notifier.user_keys(100).await.contains(&"ntf-payment-canceled".to_string()));

    h.webhook(invoice.payment_id, TransactionStatus::Completed).await;
    assert_eq!(h.transaction_status(invoice.payment_id).await, TransactionStatus::Canceled);
    assert!(h.store.jobs().await.is_empty());
}

#[tokio::test]
async fn user_cancel_only_applies_to_pending() {
    let h = Harness::new().await;
    h.register(100, None).await;
    h.register(200, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    let invoice = h.invoice(100, &plan, PurchaseType::New, vec![]).await;

    let foreign = h.state.payments.cancel_payment(200, invoice.payment_id).await;
    assert!(matches!(foreign, Err(CommerceError::NotFound(_))));

    h.state.payments.cancel_payment(100, invoice.payment_id).await.unwrap();
    let again = h.state.payments.cancel_payment(100, invoice.payment_id).await;
    assert!(matches!(again, Err(CommerceError::Conflict(_))));
}

#[tokio::test]
async fn larger_discount_wins_and_is_floored() {
    let h = Harness::new().await;
    h.register(100, None).await;
    h.state.users.set_personal_discount(100, 15).await.unwrap();
    h.state.users.set_purchase_discount(100, 33).await.unwrap();
    let plan = h.plan("Standard", 30, 10_001, 1).await;

    let invoice = h.invoice(100, &plan, PurchaseType::New, vec![]).await;
    assert_eq!(invoice.pricing.discount_percent, 33);
    assert_eq!(invoice.pricing.original_amount, 10_001);
    assert_eq!(invoice.pricing.final_amount, 6_700);
}

#[tokio::test]
async fn free_purchase_skips_the_gateway() {
    let h = Harness::new().await;
    h.register(100, None).await;
    h.state.users.set_personal_discount(100, 100).await.unwrap();
    let plan = h.plan("Standard", 30, 50_000, 1).await;

    let invoice = h.invoice(100, &plan, PurchaseType::New, vec![]).await;
    assert!(invoice.url.is_none());
    assert!(h.gateway.invoices.lock().await.is_empty());

    h.state
        .payments
        .complete_free_payment(100, invoice.payment_id)
        .await
        .unwrap();
    h.drain_jobs().await;
    assert_eq!(h.transaction_status(invoice.payment_id).await, TransactionStatus::Completed);
    assert_eq!(h.state.subscriptions.list_for_user(100).await.unwrap().len(), 1);
}

#[tokio::test]
async fn renewal_extends_from_current_expiry() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;
    let before = h.state.subscriptions.list_for_user(100).await.unwrap().remove(0);

    let payment_id = h.purchase(100, &plan, PurchaseType::Renew, vec![]).await;
    let after = h.state.subscriptions.get_owned(100, before.id).await.unwrap();

    assert_eq!(after.expire_at - before.expire_at, Duration::days(30));
    assert_eq!(h.state.subscriptions.list_for_user(100).await.unwrap().len(), 1);
    assert_eq!(h.transaction_status(payment_id).await, TransactionStatus::Completed);
    let panel_user = h.panel.get(before.panel_uuid).await.unwrap();
    assert_eq!(panel_user.expire_at, after.expire_at);
}

#[tokio::test]
async fn multi_renew_prices_every_target() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let pack = h.plan("Family", 30, 40_000, 2).await;
    h.purchase(100, &pack, PurchaseType::New, vec![]).await;
    let ids: Vec<i64> = h
        .state
        .subscriptions
        .list_for_user(100)
        .await
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids.len(), 2);

    let invoice = h
        .invoice(100, &pack, PurchaseType::Renew, vec![ids[0], ids[1], ids[0]])
        .await;
    assert_eq!(invoice.pricing.original_amount, 80_000);
    assert_eq!(invoice.transaction.renew_subscription_ids, Some(ids.clone()));
}

#[tokio::test]
async fn subscription_cap_is_checked_before_invoicing() {
    let h = Harness::new().await;
    h.register(100, None).await;
    h.state.users.set_max_subscriptions(100, Some(1)).await.unwrap();
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;

    let err = h
        .state
        .payments
        .create_payment(PurchaseRequest {
            user_telegram_id: 100,
            plan_id: plan.id,
            days: 30,
            gateway_type: GATEWAY,
            purchase_type: PurchaseType::Additional,
            renew_subscription_ids: vec![],
            device_types: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommerceError::Policy(PolicyViolation::SubscriptionLimit { max: 1 })
    ));
    assert_eq!(h.gateway.invoices.lock().await.len(), 1);
}

#[tokio::test]
async fn paid_purchase_replaces_outstanding_trial() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let trial_plan = h
        .plan_with("Trial", 3, 0, 1, vpnshop_db::models::enums::PlanAvailability::Trial)
        .await;
    let trial = h.state.subscriptions.grant_trial(100, Some(trial_plan.id)).await.unwrap();
    assert!(trial.is_trial);
    assert!(h.state.subscriptions.grant_trial(100, None).await.is_err());

    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;

    let subscriptions = h.state.subscriptions.list_for_user(100).await.unwrap();
    let live: Vec<_> = subscriptions.iter().filter(|s| !s.is_deleted()).collect();
    assert_eq!(live.len(), 1);
    assert!(!live[0].is_trial);
    assert_eq!(live[0].panel_uuid, trial.panel_uuid);
    assert_eq!(h.user(100).await.current_subscription_id, Some(live[0].id));
    assert_eq!(h.panel.user_count().await, 1);
}

#[tokio::test]
async fn transient_panel_failure_keeps_payment_completed_and_retries() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.panel.fail_with(503);

    let payment_id = h.purchase(100, &plan, PurchaseType::New, vec![]).await;

    assert_eq!(h.transaction_status(payment_id).await, TransactionStatus::Completed);
    let provision = h
        .store
        .jobs()
        .await
        .into_iter()
        .find(|j| j.dedupe_key == format!("provision:{payment_id}"))
        .unwrap();
    assert_eq!(provision.status, JobStatus::Pending);
    assert_eq!(provision.attempts, 1);
    assert!(provision.last_error.is_some());
    assert!(h.state.subscriptions.list_for_user(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn permanent_panel_failure_fails_the_payment() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.panel.fail_with(400);

    let payment_id = h.purchase(100, &plan, PurchaseType::New, vec![]).await;

    assert_eq!(h.transaction_status(payment_id).await, TransactionStatus::Failed);
    assert!(h.notifier.user_keys(100).await.contains(&"ntf-subscription-failed".to_string()));
    assert!(h
        .notifier
        .operator_keys()
        .await
        .contains(&"ntf-event-error-provisioning".to_string()));
}

#[tokio::test]
async fn gateway_refusal_marks_transaction_failed() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.gateway.failing.store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h
        .state
        .payments
        .create_payment(PurchaseRequest {
            user_telegram_id: 100,
            plan_id: plan.id,
            days: 30,
            gateway_type: GATEWAY,
            purchase_type: PurchaseType::New,
            renew_subscription_ids: vec![],
            device_types: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::Gateway(_)));

    let transactions = h.state.repos.transactions.list_by_user(100).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Failed);
    assert!(h.notifier.operator_keys().await.contains(&"ntf-event-error-gateway".to_string()));
}

#[tokio::test]
async fn operator_test_payment_provisions_nothing() {
    let h = Harness::new().await;
    h.register(1, None).await;

    let invoice = h.state.payments.create_test_payment(1, GATEWAY).await.unwrap();
    assert!(invoice.transaction.is_test);
    assert_eq!(invoice.pricing.final_amount, 100);

    h.webhook(invoice.payment_id, TransactionStatus::Completed).await;
    assert_eq!(h.transaction_status(invoice.payment_id).await, TransactionStatus::Completed);
    assert!(h.store.jobs().await.is_empty());
    assert!(h.notifier.operator_keys().await.contains(&"ntf-event-test-payment".to_string()));

    h.register(100, None).await;
    assert!(h.state.payments.create_test_payment(100, GATEWAY).await.is_err());
}

#[tokio::test]
async fn webhook_route_maps_results_to_status_codes() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    let invoice = h.invoice(100, &plan, PurchaseType::New, vec![]).await;
    let body = json!({ "payment_id": invoice.payment_id, "status": "COMPLETED" }).to_string();
    let app = handlers::router(h.state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::post("/webhooks/yookassa")
                .header(SIGNATURE_HEADER, SIGNATURE)
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::post("/webhooks/yookassa").body(Body::from(body.clone())).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::post("/webhooks/paypal")
                .header(SIGNATURE_HEADER, SIGNATURE)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.transaction_status(invoice.payment_id).await, TransactionStatus::Completed);
}
