mod common;

use common::Harness;
use vpnshop_db::models::enums::{PurchaseType, TransactionStatus, WithdrawalStatus};
use vpnshop_db::models::partner::Partner;
use vpnshop_server::error::{CommerceError, PolicyViolation};

/// Partners 10 -> 20 -> 30, each invited by the previous one, and a
/// paying customer 40 invited by 30.
async fn three_level_chain(h: &Harness) -> [Partner; 3] {
    h.state.settings.update(|s| s.partner.enabled = true).await.unwrap();

    let top = h.register(10, None).await;
    let a = h.state.partners.create_partner(10).await.unwrap();
    let middle = h.register(20, Some(&top.referral_code)).await;
    let b = h.state.partners.create_partner(20).await.unwrap();
    let low = h.register(30, Some(&middle.referral_code)).await;
    let c = h.state.partners.create_partner(30).await.unwrap();
    h.register(40, Some(&low.referral_code)).await;
    [a, b, c]
}

#[tokio::test]
async fn payment_credits_three_levels_after_fees() {
    let h = Harness::new().await;
    let [a, b, c] = three_level_chain(&h).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;

    h.purchase(40, &plan, PurchaseType::New, vec![]).await;

    // 50000 less 3.5% gateway fee is 48250, less 6% tax is 45355.
    assert_eq!(h.state.partners.get(c.id).await.unwrap().balance, 4_535);
    assert_eq!(h.state.partners.get(b.id).await.unwrap().balance, 1_360);
    assert_eq!(h.state.partners.get(a.id).await.unwrap().balance, 453);
    assert!(h.notifier.user_keys(30).await.contains(&"ntf-partner-earning".to_string()));

    let stats = h.state.partners.partner_statistics(a.id).await.unwrap();
    assert_eq!(stats.referrals, [1, 1, 1]);
    assert_eq!(stats.earnings, [0, 0, 453]);
}

#[tokio::test]
async fn failed_provisioning_still_pays_partners() {
    let h = Harness::new().await;
    let [a, b, c] = three_level_chain(&h).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;
    h.panel.fail_with(400);

    let payment_id = h.purchase(40, &plan, PurchaseType::New, vec![]).await;

    assert_eq!(h.transaction_status(payment_id).await, TransactionStatus::Failed);
    assert_eq!(h.state.partners.get(c.id).await.unwrap().balance, 4_535);
    assert_eq!(h.state.partners.get(b.id).await.unwrap().balance, 1_360);
    assert_eq!(h.state.partners.get(a.id).await.unwrap().balance, 453);
}

#[tokio::test]
async fn canceled_payment_pays_no_partner() {
    let h = Harness::new().await;
    let [_, _, c] = three_level_chain(&h).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;

    let invoice = h.invoice(40, &plan, PurchaseType::New, vec![]).await;
    h.webhook(invoice.payment_id, TransactionStatus::Canceled).await;
    assert_eq!(h.state.partners.accrue_for_payment(invoice.payment_id).await.unwrap(), 0);
    assert_eq!(h.state.partners.get(c.id).await.unwrap().balance, 0);
}

#[tokio::test]
async fn replayed_accrual_does_not_double_credit() {
    let h = Harness::new().await;
    let [_, _, c] = three_level_chain(&h).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;

    let payment_id = h.purchase(40, &plan, PurchaseType::New, vec![]).await;
    assert_eq!(h.state.partners.accrue_for_payment(payment_id).await.unwrap(), 0);
    assert_eq!(h.state.partners.get(c.id).await.unwrap().total_earned, 4_535);
}

#[tokio::test]
async fn disabled_program_and_inactive_partners_earn_nothing() {
    let h = Harness::new().await;
    let [a, b, c] = three_level_chain(&h).await;
    let plan = h.plan("Standard", 30, 50_000, 1).await;

    h.state.partners.set_active(b.id, false).await.unwrap();
    h.purchase(40, &plan, PurchaseType::New, vec![]).await;
    assert_eq!(h.state.partners.get(b.id).await.unwrap().balance, 0);
    assert_eq!(h.state.partners.get(c.id).await.unwrap().balance, 4_535);
    assert_eq!(h.state.partners.get(a.id).await.unwrap().balance, 453);

    h.state.settings.update(|s| s.partner.enabled = false).await.unwrap();
    h.purchase(40, &plan, PurchaseType::New, vec![]).await;
    assert_eq!(h.state.partners.get(c.id).await.unwrap().balance, 4_535);
}

#[tokio::test]
async fn withdrawal_holds_then_settles_the_balance() {
    let h = Harness::new().await;
    h.register(10, None).await;
    let partner = h.state.partners.create_partner(10).await.unwrap();
    h.state
        .partners
        .adjust_balance(partner.id, 100_000, "bonus")
        .await
        .unwrap();

    let below = h
        .state
        .partners
        .request_withdrawal(10, 30_000, "card", "4242")
        .await
        .unwrap_err();
    assert!(matches!(
        below,
        CommerceError::Policy(PolicyViolation::WithdrawalBelowMinimum { min: 50_000 })
    ));

    let first = h
        .state
        .partners
        .request_withdrawal(10, 60_000, "card", "4242")
        .await
        .unwrap();
    assert_eq!(first.status, WithdrawalStatus::Pending);
    assert_eq!(h.state.partners.get(partner.id).await.unwrap().balance, 40_000);
    assert!(h.notifier.operator_keys().await.contains(&"ntf-event-partner-withdrawal".to_string()));

    let short = h
        .state
        .partners
        .request_withdrawal(10, 60_000, "card", "4242")
        .await
        .unwrap_err();
    assert!(matches!(
        short,
        CommerceError::Policy(PolicyViolation::InsufficientBalance { balance: 40_000 })
    ));

    let rejected = h
        .state
        .partners
        .reject_withdrawal(first.id, 1, Some("wrong card"))
        .await
        .unwrap();
    assert_eq!(rejected.status, WithdrawalStatus::Rejected);
    assert_eq!(h.state.partners.get(partner.id).await.unwrap().balance, 100_000);
    assert!(h.notifier.user_keys(10).await.contains(&"ntf-partner-withdrawal-rejected".to_string()));

    let again = h.state.partners.approve_withdrawal(first.id, 1, None).await.unwrap_err();
    assert!(matches!(again, CommerceError::Conflict(_)));

    let second = h
        .state
        .partners
        .request_withdrawal(10, 70_000, "card", "4242")
        .await
        .unwrap();
    h.state.partners.approve_withdrawal(second.id, 1, None).await.unwrap();
    let settled = h.state.partners.get(partner.id).await.unwrap();
    assert_eq!(settled.balance, 30_000);
    assert_eq!(settled.total_withdrawn, 70_000);
}

#[tokio::test]
async fn only_the_owner_cancels_a_withdrawal() {
    let h = Harness::new().await;
    h.register(10, None).await;
    h.register(20, None).await;
    let partner = h.state.partners.create_partner(10).await.unwrap();
    h.state.partners.create_partner(20).await.unwrap();
    h.state
        .partners
        .adjust_balance(partner.id, 60_000, "bonus")
        .await
        .unwrap();
    let withdrawal = h
        .state
        .partners
        .request_withdrawal(10, 60_000, "sbp", "+70000000000")
        .await
        .unwrap();

    let foreign = h.state.partners.cancel_withdrawal(20, withdrawal.id).await.unwrap_err();
    assert!(matches!(foreign, CommerceError::NotFound(_)));

    let canceled = h.state.partners.cancel_withdrawal(10, withdrawal.id).await.unwrap();
    assert_eq!(canceled.status, WithdrawalStatus::Canceled);
    assert_eq!(h.state.partners.get(partner.id).await.unwrap().balance, 60_000);
    assert!(h.state.partners.list_pending_withdrawals().await.unwrap().is_empty());
}

#[tokio::test]
async fn partner_creation_is_idempotent() {
    let h = Harness::new().await;
    h.register(10, None).await;
    let first = h.state.partners.create_partner(10).await.unwrap();
    let second = h.state.partners.create_partner(10).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.state.partners.list_partners().await.unwrap().len(), 1);

    let missing = h.state.partners.create_partner(99).await.unwrap_err();
    assert!(matches!(missing, CommerceError::NotFound(_)));
}

#[tokio::test]
async fn rejected_withdrawal_restores_the_exact_balance() {
    let h = Harness::new().await;
    h.state
        .settings
        .update(|s| s.partner.min_withdrawal_amount = 10_000)
        .await
        .unwrap();
    h.register(10, None).await;
    let partner = h.state.partners.create_partner(10).await.unwrap();
    h.state.partners.adjust_balance(partner.id, 50_000, "seed").await.unwrap();

    let first = h.state.partners.request_withdrawal(10, 30_000, "card", "4242").await.unwrap();
    assert_eq!(h.state.partners.get(partner.id).await.unwrap().balance, 20_000);
    assert_eq!(
        h.state.partners.partner_statistics(partner.id).await.unwrap().pending_withdrawals,
        30_000
    );
    h.state.partners.reject_withdrawal(first.id, 1, None).await.unwrap();
    assert_eq!(h.state.partners.get(partner.id).await.unwrap().balance, 50_000);

    let second = h.state.partners.request_withdrawal(10, 30_000, "card", "4242").await.unwrap();
    let approved = h.state.partners.approve_withdrawal(second.id, 1, None).await.unwrap();
    assert_eq!(approved.status, WithdrawalStatus::Completed);
    let settled = h.state.partners.get(partner.id).await.unwrap();
    assert_eq!(settled.balance, 20_000);
    assert_eq!(settled.total_withdrawn, 30_000);
    assert_eq!(settled.balance + settled.total_withdrawn, settled.total_earned);
}
