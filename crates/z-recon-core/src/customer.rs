//! Customer records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CustomerId;
use crate::provider::ProviderRef;

/// Optional profile data captured when a customer is first provisioned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
}

/// The identity anchor for everything billed to one person.
///
/// Exactly one customer exists per external auth identity. Records are never
/// hard-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    /// Internal customer ID.
    pub id: CustomerId,

    /// Subject of the external auth identity (unique).
    pub external_identity: String,

    /// Contact email for notifications.
    pub email: String,

    /// Display name, if known.
    pub name: Option<String>,

    /// Billing-provider customer reference, attached on first checkout.
    pub billing_ref: Option<ProviderRef>,

    /// When the welcome notification was claimed for sending.
    pub welcome_sent_at: Option<DateTime<Utc>>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// Create a customer for a freshly authenticated identity.
    #[must_use]
    pub fn new(
        external_identity: impl Into<String>,
        email: impl Into<String>,
        profile: CustomerProfile,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CustomerId::generate(),
            external_identity: external_identity.into(),
            email: email.into(),
            name: profile.name,
            billing_ref: None,
            welcome_sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record was created within `window` of `now`.
    ///
    /// This is the coarse gate for welcome notifications.
    #[must_use]
    pub fn created_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) <= window
    }

    /// Attach the billing-provider customer reference if none is set yet.
    ///
    /// Returns `true` when the record changed.
    pub fn attach_billing_ref(&mut self, billing_ref: ProviderRef, now: DateTime<Utc>) -> bool {
        if self.billing_ref.is_some() {
            return false;
        }
        self.billing_ref = Some(billing_ref);
        self.updated_at = now;
        true
    }
}
