//! Payment intents and the payment status lattice.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{CustomerId, PaymentIntentId, ProductId, SubscriptionId};
use crate::provider::{Provider, ProviderRef};

/// ISO 4217 currency code, stored uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// The code as a string slice (`"USD"`).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = CoreError;

    /// Parse a currency code. Providers disagree on case (Stripe sends `usd`,
    /// Lago sends `USD`), so input is uppercased first.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(CoreError::InvalidCurrency(s.to_string()))
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> Self {
        c.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Created, awaiting a payment method or confirmation.
    Pending,
    /// The provider is processing the charge.
    Processing,
    /// Funds captured.
    Completed,
    /// The charge failed.
    Failed,
    /// Funds returned after completion.
    Refunded,
    /// Abandoned before completion.
    Cancelled,
    /// The provider reported a status this system does not recognize.
    NeedsReview,
}

impl PaymentStatus {
    /// Whether the lattice permits moving from `self` to `next`.
    ///
    /// `pending → processing → {completed | failed}`, `completed → refunded`,
    /// `pending | processing → cancelled`. Forward skips are allowed and
    /// `failed → completed` covers a charge the provider retried successfully.
    /// Repeating the current status is not a transition and returns `false`.
    #[must_use]
    pub fn can_advance_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::{Cancelled, Completed, Failed, Pending, Processing, Refunded};
        matches!(
            (self, next),
            (Pending, Processing | Completed | Failed | Cancelled)
                | (Processing, Completed | Failed | Cancelled)
                | (Completed, Refunded)
                | (Failed, Completed)
        )
    }

    /// Lowercase status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::NeedsReview => "needs_review",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Internal ID.
    pub id: PaymentIntentId,

    /// Provider that processed the payment.
    pub provider: Provider,

    /// Provider payment reference (`pi_...`, Lago invoice `lago_id`).
    pub provider_ref: String,

    /// Amount in minor units.
    pub amount_minor: i64,

    /// Currency of `amount_minor`.
    pub currency: Currency,

    /// Current status.
    pub status: PaymentStatus,

    /// Paying customer.
    pub customer_id: CustomerId,

    /// Purchased product, when known.
    pub product_id: Option<ProductId>,

    /// Subscription this payment belongs to, when recurring.
    pub subscription_id: Option<SubscriptionId>,

    /// Amount refunded so far in minor units.
    #[serde(default)]
    pub refunded_minor: i64,

    /// Provider-opaque metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// The provider reference as a [`ProviderRef`].
    #[must_use]
    pub fn provider_ref(&self) -> ProviderRef {
        ProviderRef::new(self.provider, self.provider_ref.clone())
    }
}
