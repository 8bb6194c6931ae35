//! Webhook reconciliation integration tests.

mod common;

use chrono::Utc;
use serde_json::{json, Value};

use common::{
    checkout_session, deleted_subscription, failed_invoice, find_subscription, paid_event,
    sign_stripe, stripe_event, TestHarness,
};
use z_recon_core::{Provider, SubscriptionStatus, TemplateKind};
use z_recon_service::handlers::webhooks::WebhookResponse;
use z_recon_store::Store;

/// Provision alice and complete her pro-monthly checkout at `created`.
async fn subscribe_alice(harness: &TestHarness, created: i64) -> String {
    let customer_id = harness.provision("auth0|alice", "alice@example.com").await;
    let body = stripe_event(
        "evt_checkout",
        "checkout.session.completed",
        created,
        &checkout_session(&customer_id, "sub_alice"),
    );
    let response = harness.stripe(&body).await;
    response.assert_status_ok();
    let result: WebhookResponse = response.json();
    assert_eq!(result.outcome, "applied");
    customer_id
}

#[tokio::test]
async fn checkout_starts_a_trial() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    subscribe_alice(&harness, t0).await;

    let subscription = harness.subscription("sub_alice");
    assert_eq!(subscription.status, SubscriptionStatus::Trialing);
    assert_eq!(subscription.product_id, harness.product.id);

    harness
        .notifier
        .wait_for(TemplateKind::SubscriptionStarted, 1)
        .await;
    let sent = harness.notifier.sent();
    let started = sent
        .iter()
        .find(|n| n.template == TemplateKind::SubscriptionStarted)
        .unwrap();
    assert_eq!(started.to, "alice@example.com");
}

#[tokio::test]
async fn checkout_links_the_billing_account() {
    let harness = TestHarness::new();
    let customer_id = subscribe_alice(&harness, Utc::now().timestamp() - 300).await;

    let customer = harness
        .store
        .get_customer(&customer_id.parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(
        customer.billing_ref.map(|r| r.to_string()).as_deref(),
        Some("stripe:cus_alice")
    );
}

#[tokio::test]
async fn repeated_delivery_is_processed_once() {
    let harness = TestHarness::new();
    let customer_id = harness.provision("auth0|alice", "alice@example.com").await;
    let body = stripe_event(
        "evt_checkout",
        "checkout.session.completed",
        Utc::now().timestamp() - 300,
        &checkout_session(&customer_id, "sub_alice"),
    );

    let first: WebhookResponse = harness.stripe(&body).await.json();
    assert!(!first.duplicate);

    for _ in 0..3 {
        let again: WebhookResponse = harness.stripe(&body).await.json();
        assert!(again.duplicate);
        assert_eq!(again.outcome, "applied");
    }

    harness.notifier.settle().await;
    assert_eq!(harness.notifier.count(TemplateKind::SubscriptionStarted), 1);
}

#[tokio::test]
async fn concurrent_deliveries_apply_once() {
    let harness = TestHarness::new();
    let customer_id = harness.provision("auth0|alice", "alice@example.com").await;
    let body = stripe_event(
        "evt_checkout",
        "checkout.session.completed",
        Utc::now().timestamp() - 300,
        &checkout_session(&customer_id, "sub_alice"),
    );

    let deliveries = (0..8).map(|_| harness.stripe(&body));
    let responses = futures::future::join_all(deliveries).await;

    let fresh = responses
        .into_iter()
        .map(|r| {
            r.assert_status_ok();
            r.json::<WebhookResponse>()
        })
        .filter(|r| !r.duplicate)
        .count();
    assert_eq!(fresh, 1);

    harness.notifier.settle().await;
    assert_eq!(harness.notifier.count(TemplateKind::SubscriptionStarted), 1);
}

#[tokio::test]
async fn trial_to_active_to_past_due() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    subscribe_alice(&harness, t0).await;

    let paid = paid_event(t0 + 10);
    let result: WebhookResponse = harness.stripe(&paid).await.json();
    assert_eq!(result.outcome, "applied");
    assert_eq!(harness.subscription("sub_alice").status, SubscriptionStatus::Active);

    let failed = stripe_event(
        "evt_failed",
        "invoice.payment_failed",
        t0 + 20,
        &failed_invoice("in_2", "sub_alice"),
    );
    let first: WebhookResponse = harness.stripe(&failed).await.json();
    assert_eq!(first.outcome, "applied");
    assert!(!first.duplicate);

    let second: WebhookResponse = harness.stripe(&failed).await.json();
    assert!(second.duplicate);

    assert_eq!(harness.subscription("sub_alice").status, SubscriptionStatus::PastDue);

    harness.notifier.wait_for(TemplateKind::PaymentReceipt, 1).await;
    harness.notifier.wait_for(TemplateKind::PaymentFailed, 1).await;
    harness.notifier.settle().await;
    assert_eq!(harness.notifier.count(TemplateKind::PaymentFailed), 1);
}

#[tokio::test]
async fn older_event_is_refused() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    subscribe_alice(&harness, t0).await;

    let paid = paid_event(t0 + 60);
    harness.stripe(&paid).await.assert_status_ok();

    // Emitted before the invoice was paid, delivered after.
    let failed = stripe_event(
        "evt_failed_late",
        "invoice.payment_failed",
        t0 + 30,
        &failed_invoice("in_0", "sub_alice"),
    );
    let result: WebhookResponse = harness.stripe(&failed).await.json();
    assert_eq!(result.outcome, "illegal_transition");

    let subscription = harness.subscription("sub_alice");
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.last_event_at.timestamp(), t0 + 60);
}

#[tokio::test]
async fn cancelled_subscription_stays_cancelled() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    subscribe_alice(&harness, t0).await;

    let deleted = stripe_event(
        "evt_deleted",
        "customer.subscription.deleted",
        t0 + 10,
        &deleted_subscription("sub_alice"),
    );
    let result: WebhookResponse = harness.stripe(&deleted).await.json();
    assert_eq!(result.outcome, "applied");

    let paid = paid_event(t0 + 20);
    let result: WebhookResponse = harness.stripe(&paid).await.json();
    assert_eq!(result.outcome, "illegal_transition");

    assert_eq!(harness.subscription("sub_alice").status, SubscriptionStatus::Cancelled);
    harness
        .notifier
        .wait_for(TemplateKind::SubscriptionCancelled, 1)
        .await;
}

#[tokio::test]
async fn bad_signature_changes_nothing() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    subscribe_alice(&harness, t0).await;

    let deleted = stripe_event(
        "evt_forged",
        "customer.subscription.deleted",
        t0 + 10,
        &deleted_subscription("sub_alice"),
    );
    let forged = sign_stripe(&deleted, Utc::now().timestamp()).replace("v1=", "v1=00");
    let response = harness.stripe_with_signature(&deleted, &forged).await;
    response.assert_status_bad_request();

    assert_eq!(harness.subscription("sub_alice").status, SubscriptionStatus::Trialing);

    // The rejected delivery left no ledger entry, so a genuine one still applies.
    let result: WebhookResponse = harness.stripe(&deleted).await.json();
    assert!(!result.duplicate);
    assert_eq!(harness.subscription("sub_alice").status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn expired_signature_is_rejected() {
    let harness = TestHarness::new();
    let body = stripe_event("evt_old", "invoice.paid", 1_700_000_000, &json!({}));
    let stale = sign_stripe(&body, Utc::now().timestamp() - 3600);

    harness
        .stripe_with_signature(&body, &stale)
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn missing_signature_is_rejected() {
    let harness = TestHarness::new();
    let body = stripe_event("evt_1", "invoice.paid", 1_700_000_000, &json!({}));

    harness
        .server
        .post("/webhooks/stripe")
        .text(body)
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn unconfigured_provider_is_not_found() {
    let harness = TestHarness::with(|config| config.lago_webhook_secret = None, |state| state);

    harness
        .lago(r#"{"webhook_type":"subscription.started","object_type":"subscription"}"#, "k1")
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn unhandled_event_is_ignored() {
    let harness = TestHarness::new();
    let body = stripe_event("evt_ping", "customer.created", Utc::now().timestamp(), &json!({}));

    let result: WebhookResponse = harness.stripe(&body).await.json();
    assert_eq!(result.outcome, "ignored");

    let reviews = harness.store.list_audit(10).unwrap();
    assert!(reviews.is_empty());
}

#[tokio::test]
async fn unknown_customer_goes_to_review() {
    let harness = TestHarness::new();
    let stranger = z_recon_core::CustomerId::generate().to_string();
    let body = stripe_event(
        "evt_stranger",
        "checkout.session.completed",
        Utc::now().timestamp() - 60,
        &checkout_session(&stranger, "sub_stranger"),
    );

    let result: WebhookResponse = harness.stripe(&body).await.json();
    assert_eq!(result.outcome, "manual_review");

    let reviews = harness.store.list_audit(10).unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].event_id, "evt_stranger");
    assert_eq!(reviews[0].provider, Provider::Stripe);
    assert!(find_subscription(harness.store.as_ref(), Provider::Stripe, "sub_stranger").is_none());
}

#[tokio::test]
async fn second_checkout_for_live_plan_is_refused() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    let customer_id = subscribe_alice(&harness, t0).await;

    let again = stripe_event(
        "evt_checkout_again",
        "checkout.session.completed",
        t0 + 10,
        &checkout_session(&customer_id, "sub_alice_2"),
    );
    let result: WebhookResponse = harness.stripe(&again).await.json();
    assert_eq!(result.outcome, "illegal_transition");
    assert!(find_subscription(harness.store.as_ref(), Provider::Stripe, "sub_alice_2").is_none());
}

#[tokio::test]
async fn refund_is_recorded_on_the_payment() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    let customer_id = subscribe_alice(&harness, t0).await;

    let paid = paid_event(t0 + 10);
    harness.stripe(&paid).await.assert_status_ok();

    let charge = json!({
        "id": "ch_1",
        "object": "charge",
        "customer": "cus_alice",
        "payment_intent": "pi_in_1",
        "amount": 2000,
        "amount_refunded": 500,
        "currency": "usd",
        "refunds": { "data": [{ "id": "re_1", "amount": 500 }] }
    });
    let refunded = stripe_event("evt_refund", "charge.refunded", t0 + 20, &charge);
    let result: WebhookResponse = harness.stripe(&refunded).await.json();
    assert_eq!(result.outcome, "applied");

    let payments = harness
        .store
        .list_payments_by_customer(&customer_id.parse().unwrap(), 10)
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].refunded_minor, 500);

    harness.notifier.wait_for(TemplateKind::RefundIssued, 1).await;
}

#[tokio::test]
async fn lago_subscription_lifecycle() {
    let harness = TestHarness::new();
    let customer_id = harness.provision("auth0|bob", "bob@example.com").await;

    let started = json!({
        "webhook_type": "subscription.started",
        "object_type": "subscription",
        "subscription": {
            "lago_id": "lago_sub_1",
            "external_customer_id": customer_id,
            "plan_code": "pro-monthly",
            "status": "active",
            "started_at": "2024-03-01T00:00:00Z",
            "current_billing_period_started_at": "2024-03-01T00:00:00Z",
            "current_billing_period_ending_at": "2024-04-01T00:00:00Z"
        }
    })
    .to_string();
    let result: WebhookResponse = harness.lago(&started, "lago-evt-1").await.json();
    assert_eq!(result.outcome, "applied");

    let paid = json!({
        "webhook_type": "invoice.payment_status_updated",
        "object_type": "invoice",
        "invoice": {
            "lago_id": "lago_inv_1",
            "payment_status": "succeeded",
            "total_amount_cents": 2000,
            "currency": "USD",
            "updated_at": "2024-03-15T00:00:00Z",
            "customer": { "external_id": customer_id },
            "subscriptions": [{ "lago_id": "lago_sub_1" }]
        }
    })
    .to_string();
    let result: WebhookResponse = harness.lago(&paid, "lago-evt-2").await.json();
    assert_eq!(result.outcome, "applied");

    let subscription =
        find_subscription(harness.store.as_ref(), Provider::Lago, "lago_sub_1").unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(
        subscription.current_period.map(|p| p.end.to_rfc3339()).as_deref(),
        Some("2024-04-01T00:00:00+00:00")
    );

    // Same unique key, same event.
    let result: WebhookResponse = harness.lago(&paid, "lago-evt-2").await.json();
    assert!(result.duplicate);

    let terminated = json!({
        "webhook_type": "subscription.terminated",
        "object_type": "subscription",
        "subscription": {
            "lago_id": "lago_sub_1",
            "external_customer_id": customer_id,
            "plan_code": "pro-monthly",
            "status": "terminated",
            "terminated_at": "2024-03-20T00:00:00Z",
            "ending_at": "2024-04-01T00:00:00Z"
        }
    })
    .to_string();
    let result: WebhookResponse = harness.lago(&terminated, "lago-evt-3").await.json();
    assert_eq!(result.outcome, "applied");

    let subscription =
        find_subscription(harness.store.as_ref(), Provider::Lago, "lago_sub_1").unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn lago_bad_signature_is_rejected() {
    let harness = TestHarness::new();
    let body = r#"{"webhook_type":"invoice.created","object_type":"invoice","invoice":{}}"#;

    harness
        .server
        .post("/webhooks/lago")
        .add_header("x-lago-signature", "deadbeef")
        .text(body)
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn refused_events_are_audited() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    subscribe_alice(&harness, t0).await;

    let deleted = stripe_event(
        "evt_deleted",
        "customer.subscription.deleted",
        t0 + 10,
        &deleted_subscription("sub_alice"),
    );
    harness.stripe(&deleted).await.assert_status_ok();

    let paid = paid_event(t0 + 20);
    harness.stripe(&paid).await.assert_status_ok();

    let reviews = harness.store.list_audit(10).unwrap();
    assert_eq!(reviews.len(), 1);
    let review = serde_json::to_value(&reviews[0]).unwrap();
    assert_eq!(review["event_id"], "evt_paid");
    assert_eq!(review["outcome"]["outcome"], Value::from("illegal_transition"));
    let subscription_id = harness.subscription("sub_alice").id.to_string();
    assert_eq!(review["subscription_id"], Value::from(subscription_id));
}

#[tokio::test]
async fn declined_one_off_payment_is_failed() {
    let harness = TestHarness::new();
    let customer_id = harness.provision("auth0|alice", "alice@example.com").await;
    let t0 = Utc::now().timestamp() - 300;
    let intent = |status: &str| {
        json!({
            "id": "pi_once",
            "object": "payment_intent",
            "customer": "cus_alice",
            "amount": 4900,
            "currency": "usd",
            "status": status,
            "metadata": { "customer_id": customer_id, "product_code": "pro-monthly" },
            "last_payment_error": { "code": "card_declined" }
        })
    };

    let processing = stripe_event(
        "evt_pi_processing",
        "payment_intent.processing",
        t0,
        &intent("processing"),
    );
    let result: WebhookResponse = harness.stripe(&processing).await.json();
    assert_eq!(result.outcome, "applied");

    // Stripe hands a declined intent back for a new payment method.
    let declined = stripe_event(
        "evt_pi_failed",
        "payment_intent.payment_failed",
        t0 + 10,
        &intent("requires_payment_method"),
    );
    let result: WebhookResponse = harness.stripe(&declined).await.json();
    assert_eq!(result.outcome, "applied");

    let payments = harness
        .store
        .list_payments_by_customer(&customer_id.parse().unwrap(), 10)
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, z_recon_core::PaymentStatus::Failed);
    assert!(harness.store.list_audit(10).unwrap().is_empty());

    harness.notifier.wait_for(TemplateKind::PaymentFailed, 1).await;
}

#[tokio::test]
async fn shared_billing_account_goes_to_review() {
    let harness = TestHarness::new();
    let t0 = Utc::now().timestamp() - 300;
    subscribe_alice(&harness, t0).await;
    let bob = harness.provision("auth0|bob", "bob@example.com").await;

    // bob's session reports alice's Stripe customer.
    let checkout = stripe_event(
        "evt_checkout_bob",
        "checkout.session.completed",
        t0 + 10,
        &checkout_session(&bob, "sub_bob"),
    );
    let response = harness.stripe(&checkout).await;
    response.assert_status_ok();
    let first: WebhookResponse = response.json();
    assert_eq!(first.outcome, "manual_review");
    assert!(!first.duplicate);

    let again: WebhookResponse = harness.stripe(&checkout).await.json();
    assert!(again.duplicate);
    assert_eq!(again.outcome, "manual_review");

    assert!(find_subscription(harness.store.as_ref(), Provider::Stripe, "sub_bob").is_none());
    let reviews = harness.store.list_audit(10).unwrap();
    assert_eq!(reviews.len(), 1);
    let review = serde_json::to_value(&reviews[0]).unwrap();
    assert_eq!(review["event_id"], "evt_checkout_bob");
    assert_eq!(review["outcome"]["reason"]["reason"], "conflicting_reference");
}
