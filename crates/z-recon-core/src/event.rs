//! Canonical provider events.
//!
//! Provider adapters translate native webhook payloads into a
//! [`NormalizedEvent`]. Nothing past the adapter layer ever sees a provider
//! status string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CustomerId, ProductId};
use crate::ledger::IdempotencyKey;
use crate::payment::{Currency, PaymentStatus};
use crate::provider::{Provider, ProviderRef};
use crate::subscription::{Period, SubscriptionStatus};

/// What happened, in canonical terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventKind {
    /// A checkout finished and a new subscription should start.
    CheckoutCompleted,
    /// A recurring invoice was paid.
    InvoicePaid,
    /// A recurring invoice payment failed; the provider will retry.
    InvoicePaymentFailed,
    /// The provider stopped retrying a failed payment.
    PaymentRetriesExhausted,
    /// The provider restated the subscription with a (mapped) status.
    SubscriptionUpdated {
        /// Canonical status reported by the provider.
        status: SubscriptionStatus,
    },
    /// Explicit cancellation.
    SubscriptionCancelled,
    /// The subscription reached the end of its term.
    SubscriptionExpired,
    /// Billing was paused.
    SubscriptionPaused,
    /// Billing was resumed.
    SubscriptionResumed,
    /// A one-off payment changed status; see [`EntityRefs::payment`].
    PaymentUpdated,
    /// Money was returned to the customer.
    RefundIssued {
        /// Refunded amount in minor units.
        amount_minor: i64,
    },
    /// A provider event type this system does not act on.
    Unhandled {
        /// Provider-native event type.
        event_type: String,
    },
}

impl EventKind {
    /// Short label for logs and ledger records.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::CheckoutCompleted => "checkout_completed",
            EventKind::InvoicePaid => "invoice_paid",
            EventKind::InvoicePaymentFailed => "invoice_payment_failed",
            EventKind::PaymentRetriesExhausted => "payment_retries_exhausted",
            EventKind::SubscriptionUpdated { .. } => "subscription_updated",
            EventKind::SubscriptionCancelled => "subscription_cancelled",
            EventKind::SubscriptionExpired => "subscription_expired",
            EventKind::SubscriptionPaused => "subscription_paused",
            EventKind::SubscriptionResumed => "subscription_resumed",
            EventKind::PaymentUpdated => "payment_updated",
            EventKind::RefundIssued { .. } => "refund_issued",
            EventKind::Unhandled { .. } => "unhandled",
        }
    }
}

/// Payment facts carried by an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    /// Provider payment reference.
    pub provider_ref: String,
    /// Amount in minor units.
    pub amount_minor: i64,
    /// Currency of the amount.
    pub currency: Currency,
    /// Canonical status.
    pub status: PaymentStatus,
}

/// Entity references extracted from the provider payload.
///
/// Every field is optional; which ones are present depends on the event kind
/// and the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRefs {
    /// Our customer ID, when the provider echoes it back.
    pub customer_id: Option<CustomerId>,
    /// Provider customer ID.
    pub provider_customer: Option<String>,
    /// Provider subscription ID.
    pub provider_subscription: Option<String>,
    /// Our product ID, from provider metadata.
    pub product_id: Option<ProductId>,
    /// Product code (Lago `plan_code`, Stripe `metadata.product_code`).
    pub product_code: Option<String>,
    /// Payment facts.
    pub payment: Option<PaymentDetails>,
    /// Billing period bounds.
    pub period: Option<Period>,
}

/// A verified provider event in canonical form. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Originating provider.
    pub provider: Provider,
    /// Provider event ID; the idempotency key within `provider`.
    pub event_id: String,
    /// Canonical kind.
    pub kind: EventKind,
    /// Provider-side time the event happened.
    pub occurred_at: DateTime<Utc>,
    /// Referenced entities.
    pub refs: EntityRefs,
    /// Verified raw payload, retained for audit.
    pub raw: serde_json::Value,
}

impl NormalizedEvent {
    /// The ledger key for this event.
    #[must_use]
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.provider, self.event_id.clone())
    }

    /// The provider customer reference, if present.
    #[must_use]
    pub fn provider_customer_ref(&self) -> Option<ProviderRef> {
        self.refs
            .provider_customer
            .as_ref()
            .map(|id| ProviderRef::new(self.provider, id.clone()))
    }

    /// The provider subscription reference, if present.
    #[must_use]
    pub fn provider_subscription_ref(&self) -> Option<ProviderRef> {
        self.refs
            .provider_subscription
            .as_ref()
            .map(|id| ProviderRef::new(self.provider, id.clone()))
    }

    /// The provider payment reference, if present.
    #[must_use]
    pub fn provider_payment_ref(&self) -> Option<ProviderRef> {
        self.refs
            .payment
            .as_ref()
            .map(|p| ProviderRef::new(self.provider, p.provider_ref.clone()))
    }
}
