mod common;

use chrono::Duration;
use common::Harness;
use vpnshop_db::models::enums::{PromocodeAvailability, PromocodeRewardType, PurchaseType};
use vpnshop_db::models::plan::GIB;
use vpnshop_db::models::promocode::{NewPromocode, Promocode};
use vpnshop_server::error::{ActivationError, CommerceError, NotAvailableReason};

fn promo(code: &str, reward_type: PromocodeRewardType, reward: Option<i32>) -> NewPromocode {
    NewPromocode {
        code: code.into(),
        reward_type,
        availability: PromocodeAvailability::All,
        allowed_user_ids: vec![],
        reward,
        plan: None,
        lifetime: -1,
        max_activations: -1,
        is_active: true,
    }
}

async fn create(h: &Harness, new: NewPromocode) -> Promocode {
    h.state.promocodes.create(new).await.unwrap()
}

#[tokio::test]
async fn duration_code_extends_the_only_subscription() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;
    let before = h.state.subscriptions.list_for_user(100).await.unwrap().remove(0);
    create(&h, promo("week", PromocodeRewardType::Duration, Some(7))).await;

    let activation = h.state.promocodes.activate(100, " Week ", None).await.unwrap();
    assert_eq!(activation.message_key, "ntf-promocode-activated-duration");
    let after = activation.subscription.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.expire_at - before.expire_at, Duration::days(7));
    assert_eq!(h.panel.get(before.panel_uuid).await.unwrap().expire_at, after.expire_at);
    assert!(h.notifier.operator_keys().await.contains(&"ntf-event-promocode".to_string()));

    let again = h.state.promocodes.activate(100, "WEEK", None).await.unwrap_err();
    assert!(matches!(again, ActivationError::AlreadyActivated));
}

#[tokio::test]
async fn validation_order_reports_the_first_failure() {
    let h = Harness::new().await;
    h.register(100, None).await;
    h.register(200, None).await;

    let missing = h.state.promocodes.activate(100, "NOPE", None).await.unwrap_err();
    assert!(matches!(missing, ActivationError::NotFound));

    let code = create(&h, promo("OFF", PromocodeRewardType::PersonalDiscount, Some(10))).await;
    h.state.promocodes.set_active(code.id, false).await.unwrap();
    let inactive = h.state.promocodes.activate(100, "OFF", None).await.unwrap_err();
    assert!(matches!(inactive, ActivationError::Inactive));

    let mut single = promo("ONCE", PromocodeRewardType::PersonalDiscount, Some(10));
    single.max_activations = 1;
    create(&h, single).await;
    h.state.promocodes.activate(100, "ONCE", None).await.unwrap();
    let depleted = h.state.promocodes.activate(200, "ONCE", None).await.unwrap_err();
    assert!(matches!(depleted, ActivationError::Depleted));
    assert_eq!(depleted.message_key(), "ntf-promocode-depleted");
}

#[tokio::test]
async fn discount_codes_set_user_discounts() {
    let h = Harness::new().await;
    h.register(100, None).await;
    create(&h, promo("VIP", PromocodeRewardType::PersonalDiscount, Some(25))).await;
    create(&h, promo("SALE", PromocodeRewardType::PurchaseDiscount, Some(40))).await;

    h.state.promocodes.activate(100, "VIP", None).await.unwrap();
    h.state.promocodes.activate(100, "SALE", None).await.unwrap();

    let user = h.user(100).await;
    assert_eq!(user.personal_discount, 25);
    assert_eq!(user.purchase_discount, 40);
    assert_eq!(user.effective_discount(), 40);
}

#[tokio::test]
async fn availability_is_checked_per_user() {
    let h = Harness::new().await;
    let inviter = h.register(100, None).await;
    h.register(200, Some(&inviter.referral_code)).await;
    h.register(300, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(300, &plan, PurchaseType::New, vec![]).await;

    let mut invited_only = promo("FRIENDS", PromocodeRewardType::PersonalDiscount, Some(5));
    invited_only.availability = PromocodeAvailability::Invited;
    create(&h, invited_only).await;
    assert!(h.state.promocodes.activate(200, "FRIENDS", None).await.is_ok());
    let err = h.state.promocodes.activate(100, "FRIENDS", None).await.unwrap_err();
    assert!(matches!(err, ActivationError::NotAvailable(NotAvailableReason::Availability)));

    let mut newcomers = promo("HELLO", PromocodeRewardType::PersonalDiscount, Some(5));
    newcomers.availability = PromocodeAvailability::New;
    create(&h, newcomers).await;
    let err = h.state.promocodes.activate(300, "HELLO", None).await.unwrap_err();
    assert!(matches!(err, ActivationError::NotAvailable(NotAvailableReason::Availability)));

    let mut listed = promo("LISTED", PromocodeRewardType::PersonalDiscount, Some(5));
    listed.availability = PromocodeAvailability::Allowed;
    listed.allowed_user_ids = vec![300];
    create(&h, listed).await;
    assert!(h.state.promocodes.activate(300, "LISTED", None).await.is_ok());
    assert!(h.state.promocodes.activate(100, "LISTED", None).await.is_err());
}

#[tokio::test]
async fn several_candidates_need_an_explicit_target() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let pack = h.plan("Family", 30, 40_000, 2).await;
    h.purchase(100, &pack, PurchaseType::New, vec![]).await;
    let mut ids: Vec<i64> = h
        .state
        .subscriptions
        .list_for_user(100)
        .await
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    ids.sort();
    create(&h, promo("GIGS", PromocodeRewardType::Traffic, Some(10))).await;

    match h.state.promocodes.activate(100, "GIGS", None).await.unwrap_err() {
        ActivationError::TargetRequired { mut candidates } => {
            candidates.sort();
            assert_eq!(candidates, ids);
        }
        other => panic!("unexpected {other:?}"),
    }

    let before = h.state.subscriptions.get_owned(100, ids[1]).await.unwrap();
    let activation = h.state.promocodes.activate(100, "GIGS", Some(ids[1])).await.unwrap();
    let after = activation.subscription.unwrap();
    assert_eq!(after.traffic_limit, before.traffic_limit + 10 * GIB);
    assert_eq!(h.panel.get(after.panel_uuid).await.unwrap().traffic_limit, after.traffic_limit);
}

#[tokio::test]
async fn subscription_reward_creates_a_subscription() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Gift", 14, 0, 1).await;
    let mut gift = promo("GIFT", PromocodeRewardType::Subscription, None);
    gift.plan = Some(plan.snapshot(14));
    create(&h, gift).await;

    let activation = h.state.promocodes.activate(100, "GIFT", None).await.unwrap();
    let created = activation.subscription.unwrap();
    assert_eq!(created.plan.duration, 14);
    assert_eq!(h.user(100).await.current_subscription_id, Some(created.id));
    assert_eq!(h.panel.user_count().await, 1);
}

#[tokio::test]
async fn subscription_reward_respects_the_cap() {
    let h = Harness::new().await;
    h.register(100, None).await;
    h.state.users.set_max_subscriptions(100, Some(1)).await.unwrap();
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;
    let existing = h.state.subscriptions.list_for_user(100).await.unwrap().remove(0);

    let mut gift = promo("GIFT", PromocodeRewardType::Subscription, None);
    gift.plan = Some(plan.snapshot(30));
    create(&h, gift).await;

    let err = h.state.promocodes.activate(100, "GIFT", None).await.unwrap_err();
    assert!(matches!(
        err,
        ActivationError::NotAvailable(NotAvailableReason::SubscriptionLimit)
    ));
    assert_eq!(h.panel.user_count().await, 1);

    let activation = h
        .state
        .promocodes
        .activate(100, "GIFT", Some(existing.id))
        .await
        .unwrap();
    let extended = activation.subscription.unwrap();
    assert_eq!(extended.expire_at - existing.expire_at, Duration::days(30));
}

#[tokio::test]
async fn duration_without_subscription_is_not_available() {
    let h = Harness::new().await;
    h.register(100, None).await;
    create(&h, promo("WEEK", PromocodeRewardType::Duration, Some(7))).await;

    let err = h.state.promocodes.activate(100, "WEEK", None).await.unwrap_err();
    assert!(matches!(
        err,
        ActivationError::NotAvailable(NotAvailableReason::NoEligibleSubscription)
    ));
    assert_eq!(h.state.promocodes.list().await.unwrap()[0].1, 0);
}

#[tokio::test]
async fn admin_codes_are_normalized_and_unique() {
    let h = Harness::new().await;

    let generated = create(&h, promo("", PromocodeRewardType::Devices, Some(1))).await;
    assert_eq!(generated.code.len(), 10);
    assert!(generated.code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

    let spring = create(&h, promo("spring", PromocodeRewardType::Duration, Some(3))).await;
    assert_eq!(spring.code, "SPRING");
    let duplicate = h
        .state
        .promocodes
        .create(promo("Spring", PromocodeRewardType::Duration, Some(3)))
        .await
        .unwrap_err();
    assert!(matches!(duplicate, CommerceError::Conflict(_)));

    let invalid = h
        .state
        .promocodes
        .create(promo("BROKEN", PromocodeRewardType::PurchaseDiscount, Some(150)))
        .await
        .unwrap_err();
    assert!(matches!(invalid, CommerceError::Validation(_)));

    h.state.promocodes.delete(spring.id).await.unwrap();
    assert_eq!(h.state.promocodes.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn traffic_and_device_codes_update_the_plan_snapshot() {
    let h = Harness::new().await;
    h.register(100, None).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.purchase(100, &plan, PurchaseType::New, vec![]).await;
    let before = h.state.subscriptions.list_for_user(100).await.unwrap().remove(0);
    create(&h, promo("GIGS", PromocodeRewardType::Traffic, Some(25))).await;
    create(&h, promo("SEATS", PromocodeRewardType::Devices, Some(2))).await;

    h.state.promocodes.activate(100, "GIGS", None).await.unwrap();
    h.state.promocodes.activate(100, "SEATS", None).await.unwrap();

    let stored = h.state.subscriptions.get_owned(100, before.id).await.unwrap();
    assert_eq!(stored.traffic_limit, before.traffic_limit + 25 * GIB);
    assert_eq!(stored.plan.traffic_limit, stored.traffic_limit);
    assert_eq!(stored.device_limit, before.device_limit + 2);
    assert_eq!(stored.plan.device_limit, stored.device_limit);
    assert_eq!(stored.expire_at, before.expire_at);

    let panel_user = h.panel.get(before.panel_uuid).await.unwrap();
    assert_eq!(panel_user.traffic_limit, stored.traffic_limit);
    assert_eq!(panel_user.device_limit, stored.device_limit);
}
