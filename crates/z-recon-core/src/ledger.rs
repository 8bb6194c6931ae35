//! Idempotency ledger and audit records.
//!
//! Every processed `(provider, event id)` pair leaves exactly one
//! [`IdempotencyRecord`] holding the outcome of its first processing. A
//! redelivery finds the record and returns that outcome without re-applying
//! anything.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::NormalizedEvent;
use crate::ids::{AuditId, PaymentIntentId, SubscriptionId};
use crate::machine::IllegalTransition;
use crate::payment::PaymentStatus;
use crate::provider::Provider;
use crate::subscription::SubscriptionStatus;

/// Ledger key: one per provider event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// Originating provider.
    pub provider: Provider,
    /// Provider event ID.
    pub event_id: String,
}

impl IdempotencyKey {
    /// Create a ledger key.
    #[must_use]
    pub fn new(provider: Provider, event_id: impl Into<String>) -> Self {
        Self {
            provider,
            event_id: event_id.into(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.event_id)
    }
}

/// Result of reserving a ledger key.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCheck {
    /// First time this key is seen; it is now reserved for the current unit of work.
    Fresh,
    /// Already processed; carries the recorded outcome.
    AlreadyProcessed(IdempotencyRecord),
}

/// A subscription status change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    /// Affected subscription.
    pub subscription_id: SubscriptionId,
    /// Previous status; `None` when the subscription was created.
    pub from: Option<SubscriptionStatus>,
    /// New status.
    pub to: SubscriptionStatus,
}

/// A payment status change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentChange {
    /// Affected payment intent.
    pub payment_id: PaymentIntentId,
    /// Previous status; `None` when the payment intent was created.
    pub from: Option<PaymentStatus>,
    /// New status.
    pub to: PaymentStatus,
}

/// Why an event needs an operator to look at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ReviewReason {
    /// The event references a customer we do not know.
    UnknownCustomer,
    /// The event references a product we do not know.
    UnknownProduct,
    /// The event references a subscription we do not know.
    UnknownSubscription,
    /// The event references a payment we do not know.
    UnknownPayment,
    /// The provider reported a status outside our vocabulary.
    UnrecognizedStatus,
    /// A reference required by this event kind is absent from the payload.
    MissingReference {
        /// Name of the missing field.
        field: String,
    },
    /// Applying the event would give a provider reference a second owner.
    ConflictingReference {
        /// The violated unique index.
        detail: String,
    },
}

impl fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewReason::UnknownCustomer => f.write_str("unknown customer"),
            ReviewReason::UnknownProduct => f.write_str("unknown product"),
            ReviewReason::UnknownSubscription => f.write_str("unknown subscription"),
            ReviewReason::UnknownPayment => f.write_str("unknown payment"),
            ReviewReason::UnrecognizedStatus => f.write_str("unrecognized provider status"),
            ReviewReason::MissingReference { field } => write!(f, "missing reference: {field}"),
            ReviewReason::ConflictingReference { detail } => {
                write!(f, "conflicting reference: {detail}")
            }
        }
    }
}

/// The result of processing one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    /// State was mutated.
    Applied {
        /// Subscription change, if any.
        subscription: Option<SubscriptionChange>,
        /// Payment change, if any.
        payment: Option<PaymentChange>,
    },
    /// The event would have moved state illegally; recorded, not applied.
    IllegalTransition {
        /// What was refused.
        transition: IllegalTransition,
    },
    /// The event could not be applied without an operator.
    ManualReview {
        /// Why.
        reason: ReviewReason,
    },
    /// Nothing to do for this event.
    Ignored {
        /// Why.
        reason: String,
    },
}

impl Outcome {
    /// Short label for logs and HTTP responses.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Outcome::Applied { .. } => "applied",
            Outcome::IllegalTransition { .. } => "illegal_transition",
            Outcome::ManualReview { .. } => "manual_review",
            Outcome::Ignored { .. } => "ignored",
        }
    }

    /// Whether operators should see this outcome in the review queue.
    #[must_use]
    pub const fn needs_attention(&self) -> bool {
        matches!(
            self,
            Outcome::IllegalTransition { .. } | Outcome::ManualReview { .. }
        )
    }
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Ledger key.
    pub key: IdempotencyKey,
    /// Canonical event kind label.
    pub event_kind: String,
    /// Outcome of the first processing.
    pub outcome: Outcome,
    /// When the event was processed.
    pub processed_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Record the outcome of processing `event`.
    #[must_use]
    pub fn new(event: &NormalizedEvent, outcome: Outcome, processed_at: DateTime<Utc>) -> Self {
        Self {
            key: event.key(),
            event_kind: event.kind.label().to_string(),
            outcome,
            processed_at,
        }
    }
}

/// An event kept for operators: illegal transitions and manual reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Audit ID (time-ordered).
    pub id: AuditId,
    /// Originating provider.
    pub provider: Provider,
    /// Provider event ID.
    pub event_id: String,
    /// Canonical event kind label.
    pub event_kind: String,
    /// Subscription the event targeted, when resolved.
    pub subscription_id: Option<SubscriptionId>,
    /// Recorded outcome.
    pub outcome: Outcome,
    /// Verified raw payload.
    pub raw: serde_json::Value,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Build an audit record for `event`.
    #[must_use]
    pub fn new(
        event: &NormalizedEvent,
        subscription_id: Option<SubscriptionId>,
        outcome: Outcome,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AuditId::generate(),
            provider: event.provider,
            event_id: event.event_id.clone(),
            event_kind: event.kind.label().to_string(),
            subscription_id,
            outcome,
            raw: event.raw.clone(),
            recorded_at,
        }
    }
}
