mod common;

use std::collections::BTreeMap;

use chrono::Duration;
use common::Harness;
use vpnshop_db::models::enums::{
    AccrualStrategy, PointsExchangeType, PurchaseType, ReferralRewardType, TransactionStatus,
};
use vpnshop_db::models::plan::GIB;
use vpnshop_server::error::{CommerceError, PolicyViolation};

#[tokio::test]
async fn inviter_earns_extra_days_on_first_payment_only() {
    let h = Harness::new().await;
    let inviter = h.register(100, None).await;
    let invitee = h.register(200, Some(&inviter.referral_code)).await;
    assert_eq!(invitee.invited_by, Some(100));
    assert!(h.notifier.user_keys(100).await.contains(&"ntf-referral-attached".to_string()));

    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;
    let before = h.state.subscriptions.list_for_user(100).await.unwrap().remove(0);

    h.purchase(200, &plan, PurchaseType::New, vec![]).await;
    let after = h.state.subscriptions.get_owned(100, before.id).await.unwrap();
    assert_eq!(after.expire_at - before.expire_at, Duration::days(5));
    assert_eq!(h.panel.get(after.panel_uuid).await.unwrap().expire_at, after.expire_at);
    assert!(h.notifier.user_keys(100).await.contains(&"ntf-referral-reward-days".to_string()));

    h.purchase(200, &plan, PurchaseType::New, vec![]).await;
    let unchanged = h.state.subscriptions.get_owned(100, before.id).await.unwrap();
    assert_eq!(unchanged.expire_at, after.expire_at);

    let summary = h.state.referrals.referral_summary(100).await.unwrap();
    assert_eq!(summary.invited, 1);
    assert_eq!(summary.days_earned, 5);
    assert_eq!(summary.referral_code, inviter.referral_code);
}

#[tokio::test]
async fn unknown_invite_code_registers_without_inviter() {
    let h = Harness::new().await;
    let user = h.register(200, Some("NOSUCHCODE")).await;
    assert_eq!(user.invited_by, None);
    assert_eq!(h.state.referrals.referral_summary(200).await.unwrap().invited, 0);
}

#[tokio::test]
async fn reward_without_subscription_is_still_recorded() {
    let h = Harness::new().await;
    let inviter = h.register(100, None).await;
    h.register(200, Some(&inviter.referral_code)).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;

    h.purchase(200, &plan, PurchaseType::New, vec![]).await;

    let summary = h.state.referrals.referral_summary(100).await.unwrap();
    assert_eq!(summary.days_earned, 5);
    assert!(h.state.subscriptions.list_for_user(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn ineligible_plan_earns_nothing() {
    let h = Harness::new().await;
    let inviter = h.register(100, None).await;
    h.register(200, Some(&inviter.referral_code)).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    let other = h.plan("Premium", 30, 90_000, 1).await;
    h.state
        .settings
        .update(move |s| s.referral.eligible_plan_ids = vec![other.id])
        .await
        .unwrap();

    h.purchase(200, &plan, PurchaseType::New, vec![]).await;

    assert_eq!(h.state.referrals.referral_summary(100).await.unwrap().days_earned, 0);
}

async fn points_program(h: &Harness) {
    h.state
        .settings
        .update(|s| {
            s.referral.level = 2;
            s.referral.accrual_strategy = AccrualStrategy::OnEachPayment;
            s.referral.reward.reward_type = ReferralRewardType::Points;
            s.referral.reward.config = BTreeMap::from([(1, 10), (2, 4)]);
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn points_flow_up_two_levels_on_every_payment() {
    let h = Harness::new().await;
    points_program(&h).await;
    let top = h.register(100, None).await;
    let middle = h.register(200, Some(&top.referral_code)).await;
    h.register(300, Some(&middle.referral_code)).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;

    h.purchase(200, &plan, PurchaseType::New, vec![]).await;
    h.purchase(300, &plan, PurchaseType::New, vec![]).await;
    h.purchase(300, &plan, PurchaseType::New, vec![]).await;

    assert_eq!(h.user(200).await.points, 20);
    assert_eq!(h.user(100).await.points, 10 + 4 + 4);
    assert_eq!(h.state.referrals.referral_summary(100).await.unwrap().points_earned, 18);
    assert!(h.notifier.user_keys(200).await.contains(&"ntf-referral-reward-points".to_string()));
}

#[tokio::test]
async fn points_buy_subscription_days() {
    let h = Harness::new().await;
    points_program(&h).await;
    let inviter = h.register(100, None).await;
    h.register(200, Some(&inviter.referral_code)).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;
    h.purchase(200, &plan, PurchaseType::New, vec![]).await;
    let before = h.state.subscriptions.list_for_user(100).await.unwrap().remove(0);

    let options = h.state.referrals.exchange_options(100).await.unwrap();
    assert_eq!(options.len(), 1);
    assert_eq!(options[0].exchange_type, PointsExchangeType::SubscriptionDays);
    assert_eq!(options[0].quantity, 10);

    let result = h
        .state
        .referrals
        .exchange(100, PointsExchangeType::SubscriptionDays, 7, None)
        .await
        .unwrap();
    assert_eq!(result.points_left, 3);
    let extended = result.subscription.unwrap();
    assert_eq!(extended.expire_at - before.expire_at, Duration::days(7));
    assert_eq!(h.user(100).await.points, 3);

    let err = h
        .state
        .referrals
        .exchange(100, PointsExchangeType::SubscriptionDays, 50, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommerceError::Policy(PolicyViolation::InsufficientPoints { balance: 3 })
    ));

    let err = h
        .state
        .referrals
        .exchange(100, PointsExchangeType::Discount, 3, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::Policy(PolicyViolation::ExchangeDisabled)));
}

#[tokio::test]
async fn points_buy_a_gift_promocode() {
    let h = Harness::new().await;
    points_program(&h).await;
    let gift_plan = h.plan("Gift", 30, 0, 1).await;
    let gift_plan_id = gift_plan.id;
    h.state
        .settings
        .update(move |s| {
            let gift = &mut s.referral.points_exchange.gift_subscription;
            gift.enabled = true;
            gift.points_cost = 10;
            gift.min_points = 10;
            gift.max_points = 10;
            gift.gift_plan_id = Some(gift_plan_id);
            gift.gift_duration_days = 14;
        })
        .await
        .unwrap();
    let inviter = h.register(100, None).await;
    h.register(200, Some(&inviter.referral_code)).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(200, &plan, PurchaseType::New, vec![]).await;

    let result = h
        .state
        .referrals
        .exchange(100, PointsExchangeType::GiftSubscription, 10, None)
        .await
        .unwrap();
    assert_eq!(result.points_left, 0);
    let promocode = result.promocode.unwrap();
    assert_eq!(promocode.max_activations, 1);

    h.register(300, None).await;
    let activation = h.state.promocodes.activate(300, &promocode.code, None).await.unwrap();
    assert_eq!(activation.subscription.unwrap().plan.duration, 14);
}

#[tokio::test]
async fn points_buy_traffic() {
    let h = Harness::new().await;
    points_program(&h).await;
    h.state
        .settings
        .update(|s| s.referral.points_exchange.traffic.enabled = true)
        .await
        .unwrap();
    let inviter = h.register(100, None).await;
    h.register(200, Some(&inviter.referral_code)).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;
    h.purchase(200, &plan, PurchaseType::New, vec![]).await;
    let before = h.state.subscriptions.list_for_user(100).await.unwrap().remove(0);

    // Five points per GiB.
    let result = h
        .state
        .referrals
        .exchange(100, PointsExchangeType::Traffic, 10, None)
        .await
        .unwrap();
    assert_eq!(result.quote.quantity, 2);
    assert_eq!(result.points_left, 0);

    let stored = h.state.subscriptions.get_owned(100, before.id).await.unwrap();
    assert_eq!(stored.traffic_limit, before.traffic_limit + 2 * GIB);
    assert_eq!(stored.plan.traffic_limit, stored.traffic_limit);
    assert_eq!(h.panel.get(before.panel_uuid).await.unwrap().traffic_limit, stored.traffic_limit);
    assert_eq!(h.user(100).await.points, 0);
}

#[tokio::test]
async fn points_accrue_even_when_provisioning_fails() {
    let h = Harness::new().await;
    points_program(&h).await;
    let inviter = h.register(100, None).await;
    h.register(200, Some(&inviter.referral_code)).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.panel.fail_with(400);

    let payment_id = h.purchase(200, &plan, PurchaseType::New, vec![]).await;

    assert_eq!(h.transaction_status(payment_id).await, TransactionStatus::Failed);
    assert_eq!(h.user(100).await.points, 10);
}
