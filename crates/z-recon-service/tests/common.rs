//! Common test utilities for z-recon integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::request::Parts;
use axum_test::{TestResponse, TestServer};
use chrono::Utc;
use serde_json::{json, Value};

use z_recon_core::{
    BillingInterval, Notification, Product, ProductId, Provider, ProviderRef, Subscription,
    TemplateKind,
};
use z_recon_service::crypto::hmac_sha256_hex;
use z_recon_service::{
    create_router, ApiError, AppState, Dispatcher, Identity, IdentityResolver, Notifier,
    NotifyError, ServiceConfig,
};
use z_recon_store::{MemoryStore, Store};

pub const STRIPE_SECRET: &str = "whsec_test_secret";
pub const LAGO_SECRET: &str = "lago_test_secret";
pub const ADMIN_KEY: &str = "test-admin-key";

/// Records every notification it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

impl RecordingNotifier {
    /// Everything sent so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// How many notifications with `template` were sent.
    pub fn count(&self, template: TemplateKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.template == template)
            .count()
    }

    /// Wait until at least `n` notifications with `template` were sent.
    pub async fn wait_for(&self, template: TemplateKind, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count(template) < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("notification not delivered in time");
    }

    /// Give spawned deliveries a moment to run.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Identity from the `x-test-subject` and `x-test-email` headers.
pub struct HeaderIdentity;

#[async_trait]
impl IdentityResolver for HeaderIdentity {
    async fn resolve_identity(&self, parts: &Parts) -> Result<Identity, ApiError> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        Ok(Identity {
            subject: header("x-test-subject").ok_or(ApiError::Unauthorized)?,
            email: header("x-test-email"),
        })
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The store behind the server.
    pub store: Arc<MemoryStore>,
    /// Captures notifications.
    pub notifier: Arc<RecordingNotifier>,
    /// The seeded "pro-monthly" product (14-day trial).
    pub product: Product,
}

impl TestHarness {
    /// Create a new test harness with both providers enabled.
    pub fn new() -> Self {
        Self::with(|_| {}, |state| state)
    }

    /// Create a harness after adjusting the configuration and the state.
    pub fn with(
        configure: impl FnOnce(&mut ServiceConfig),
        customize: impl FnOnce(AppState) -> AppState,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let product = pro_monthly();
        store.put_product(&product).expect("Failed to seed product");

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            auth_base_url: "http://localhost".into(),
            admin_api_key: Some(ADMIN_KEY.into()),
            stripe_webhook_secret: Some(STRIPE_SECRET.into()),
            lago_webhook_secret: Some(LAGO_SECRET.into()),
            ..ServiceConfig::default()
        };
        configure(&mut config);

        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(notifier.clone(), Duration::from_secs(1), 1);
        let state = AppState::new(store.clone(), config)
            .with_dispatcher(dispatcher)
            .with_identity_resolver(Arc::new(HeaderIdentity));

        let server =
            TestServer::new(create_router(customize(state))).expect("Failed to create test server");

        Self {
            server,
            store,
            notifier,
            product,
        }
    }

    /// Provision a customer and return its ID.
    pub async fn provision(&self, subject: &str, email: &str) -> String {
        let response = self
            .server
            .post("/v1/customers")
            .add_header("x-test-subject", subject)
            .json(&json!({ "email": email }))
            .await;
        let body: Value = response.json();
        body["id"].as_str().expect("customer id").to_string()
    }

    /// Deliver a signed Stripe webhook.
    pub async fn stripe(&self, body: &str) -> TestResponse {
        self.server
            .post("/webhooks/stripe")
            .add_header("stripe-signature", sign_stripe(body, Utc::now().timestamp()))
            .text(body)
            .await
    }

    /// Deliver a Stripe webhook with an explicit signature header.
    pub async fn stripe_with_signature(&self, body: &str, signature: &str) -> TestResponse {
        self.server
            .post("/webhooks/stripe")
            .add_header("stripe-signature", signature)
            .text(body)
            .await
    }

    /// Deliver a signed Lago webhook.
    pub async fn lago(&self, body: &str, unique_key: &str) -> TestResponse {
        self.server
            .post("/webhooks/lago")
            .add_header("x-lago-signature", sign_lago(body))
            .add_header("x-lago-unique-key", unique_key)
            .text(body)
            .await
    }

    /// The Stripe subscription with provider id `provider_ref`.
    pub fn subscription(&self, provider_ref: &str) -> Subscription {
        find_subscription(self.store.as_ref(), Provider::Stripe, provider_ref)
            .expect("subscription exists")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// The "pro-monthly" product with a 14-day trial.
pub fn pro_monthly() -> Product {
    Product {
        id: ProductId::generate(),
        code: "pro-monthly".into(),
        name: "Pro".into(),
        is_active: true,
        sort_order: 1,
        price_minor: 2000,
        currency: "USD".parse().expect("currency"),
        interval: BillingInterval::Month,
        trial_days: 14,
    }
}

/// A Stripe event body.
pub fn stripe_event(id: &str, event_type: &str, created: i64, object: &Value) -> String {
    json!({
        "id": id,
        "type": event_type,
        "created": created,
        "livemode": false,
        "data": { "object": object }
    })
    .to_string()
}

/// A `Stripe-Signature` header for `body` signed at `t`.
pub fn sign_stripe(body: &str, t: i64) -> String {
    let mac = hmac_sha256_hex(STRIPE_SECRET.as_bytes(), format!("{t}.{body}").as_bytes())
        .expect("hmac");
    format!("t={t},v1={mac}")
}

/// An `X-Lago-Signature` header for `body`.
pub fn sign_lago(body: &str) -> String {
    hmac_sha256_hex(LAGO_SECRET.as_bytes(), body.as_bytes()).expect("hmac")
}

/// Completed checkout for `customer_id` subscribing to pro-monthly.
pub fn checkout_session(customer_id: &str, subscription: &str) -> Value {
    json!({
        "id": "cs_test_1",
        "object": "checkout.session",
        "mode": "subscription",
        "client_reference_id": customer_id,
        "customer": "cus_alice",
        "subscription": subscription,
        "payment_status": "no_payment_required",
        "metadata": { "product_code": "pro-monthly" }
    })
}

/// A paid recurring invoice.
pub fn paid_invoice(invoice: &str, subscription: &str) -> Value {
    json!({
        "id": invoice,
        "object": "invoice",
        "customer": "cus_alice",
        "subscription": subscription,
        "payment_intent": format!("pi_{invoice}"),
        "billing_reason": "subscription_cycle",
        "amount_paid": 2000,
        "currency": "usd"
    })
}

/// alice's first recurring invoice, paid at `created`.
pub fn paid_event(created: i64) -> String {
    stripe_event("evt_paid", "invoice.paid", created, &paid_invoice("in_1", "sub_alice"))
}

/// A failed first attempt at a recurring invoice.
pub fn failed_invoice(invoice: &str, subscription: &str) -> Value {
    json!({
        "id": invoice,
        "object": "invoice",
        "customer": "cus_alice",
        "subscription": subscription,
        "payment_intent": format!("pi_{invoice}"),
        "billing_reason": "subscription_cycle",
        "amount_due": 2000,
        "attempt_count": 1,
        "next_payment_attempt": 1_900_000_000,
        "currency": "usd"
    })
}

/// A deleted (cancelled) subscription.
pub fn deleted_subscription(subscription: &str) -> Value {
    json!({
        "id": subscription,
        "object": "subscription",
        "customer": "cus_alice",
        "status": "canceled"
    })
}

/// Look a subscription up by provider reference.
pub fn find_subscription(store: &dyn Store, provider: Provider, id: &str) -> Option<Subscription> {
    let provider_ref = ProviderRef::new(provider, id);
    z_recon_store::transact(store, |uow| uow.find_subscription_by_provider_ref(&provider_ref))
        .expect("lookup")
}
