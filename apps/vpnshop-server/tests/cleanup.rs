mod common;

use common::Harness;
use tokio_util::sync::CancellationToken;
use vpnshop_db::models::enums::{PurchaseType, SubscriptionStatus};
use vpnshop_db::models::subscription::Subscription;

async fn subscribed(h: &Harness, telegram_id: i64) -> Subscription {
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.register(telegram_id, None).await;
    h.purchase(telegram_id, &plan, PurchaseType::New, vec![]).await;
    h.state
        .subscriptions
        .list_for_user(telegram_id)
        .await
        .unwrap()
        .remove(0)
}

async fn status_of(h: &Harness, id: i64) -> SubscriptionStatus {
    h.state.repos.subscriptions.get(id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn only_subscriptions_past_the_grace_period_are_purged() {
    let h = Harness::new().await;
    let stale = subscribed(&h, 100).await;
    let recent = subscribed(&h, 200).await;
    let live = subscribed(&h, 300).await;
    h.expire(stale.id, 31).await;
    h.expire(recent.id, 29).await;

    let report = h
        .state
        .cleanup_scheduler()
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((report.deleted, report.failed, report.interrupted), (1, 0, false));

    assert_eq!(status_of(&h, stale.id).await, SubscriptionStatus::Deleted);
    assert!(h.panel.get(stale.panel_uuid).await.is_none());
    assert_eq!(h.user(100).await.current_subscription_id, None);

    assert_eq!(status_of(&h, recent.id).await, SubscriptionStatus::Expired);
    assert!(h.panel.get(recent.panel_uuid).await.is_some());
    assert_eq!(status_of(&h, live.id).await, SubscriptionStatus::Active);
    assert_eq!(h.user(300).await.current_subscription_id, Some(live.id));

    let rerun = h
        .state
        .cleanup_scheduler()
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((rerun.deleted, rerun.failed), (0, 0));
    assert_eq!(h.panel.user_count().await, 2);
}

#[tokio::test]
async fn panel_failures_are_counted_and_retried_next_run() {
    let h = Harness::new().await;
    let first = subscribed(&h, 100).await;
    let second = subscribed(&h, 200).await;
    h.expire(first.id, 45).await;
    h.expire(second.id, 60).await;
    h.panel.fail_with(503);

    let report = h
        .state
        .cleanup_scheduler()
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((report.deleted, report.failed), (0, 2));
    assert_eq!(status_of(&h, first.id).await, SubscriptionStatus::Expired);
    assert!(h
        .notifier
        .operator_keys()
        .await
        .contains(&"ntf-event-error-cleanup".to_string()));

    h.panel.recover();
    let retry = h
        .state
        .cleanup_scheduler()
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((retry.deleted, retry.failed), (2, 0));
    assert_eq!(status_of(&h, first.id).await, SubscriptionStatus::Deleted);
    assert_eq!(status_of(&h, second.id).await, SubscriptionStatus::Deleted);
    assert_eq!(h.panel.user_count().await, 0);
}

#[tokio::test]
async fn cancellation_stops_between_items() {
    let h = Harness::new().await;
    let subscription = subscribed(&h, 100).await;
    h.expire(subscription.id, 40).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.state.cleanup_scheduler().run(&cancel).await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.deleted, 0);
    assert_eq!(status_of(&h, subscription.id).await, SubscriptionStatus::Expired);
    assert!(h.panel.get(subscription.panel_uuid).await.is_some());
}
