//! Subscriptions and the subscription status transition table.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CustomerId, ProductId, SubscriptionId};
use crate::provider::{Provider, ProviderRef};

/// Canonical subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// In a free trial.
    Trialing,
    /// Paid and current.
    Active,
    /// A renewal payment failed; the provider is retrying.
    PastDue,
    /// Billing paused on request.
    Paused,
    /// Ended by cancellation or exhausted retries. Terminal.
    Cancelled,
    /// Ended by the provider at the end of its term. Terminal.
    Expired,
    /// The provider reported a status this system does not recognize.
    /// Events carrying it go to manual review; it is never stored.
    NeedsReview,
}

impl SubscriptionStatus {
    /// Whether no outbound transition exists.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled
                | SubscriptionStatus::Expired
                | SubscriptionStatus::NeedsReview
        )
    }

    /// Whether the subscription still counts towards the one-live-subscription
    /// per `(customer, product)` invariant.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing
                | SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::Paused
        )
    }

    /// Lowercase status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::NeedsReview => "needs_review",
        }
    }

    /// Apply a command to an existing subscription in this status.
    ///
    /// # Errors
    ///
    /// Returns [`RejectedCommand`] when `self` is not an allowed source state
    /// for `command`.
    pub fn apply(self, command: SubscriptionCommand) -> Result<Self, RejectedCommand> {
        use SubscriptionCommand as C;
        use SubscriptionStatus::{Active, Cancelled, Expired, Paused, PastDue, Trialing};

        let next = match (command, self) {
            (C::InvoicePaid, Trialing | Active | PastDue) | (C::Resume, Paused) => Some(Active),
            (C::InvoicePaymentFailed, Active | Trialing) => Some(PastDue),
            (C::RetriesExhausted, PastDue) | (C::Cancel, Active | Trialing | PastDue | Paused) => {
                Some(Cancelled)
            }
            (C::Expire, current) if current.is_live() => Some(Expired),
            (C::Pause, Active) => Some(Paused),
            (C::Confirm(reported), current) if reported == current && current.is_live() => {
                Some(current)
            }
            _ => None,
        };

        next.ok_or(RejectedCommand {
            from: self,
            command,
        })
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state-changing request derived from a provider event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command", content = "status")]
pub enum SubscriptionCommand {
    /// A recurring invoice was paid.
    InvoicePaid,
    /// A recurring invoice payment failed.
    InvoicePaymentFailed,
    /// The provider gave up retrying a failed payment.
    RetriesExhausted,
    /// Explicit cancellation.
    Cancel,
    /// The provider reports the subscription reached its end.
    Expire,
    /// Pause billing.
    Pause,
    /// Resume a paused subscription.
    Resume,
    /// The provider restates the current status (period refresh only).
    Confirm(SubscriptionStatus),
}

impl fmt::Display for SubscriptionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionCommand::InvoicePaid => f.write_str("invoice paid"),
            SubscriptionCommand::InvoicePaymentFailed => f.write_str("invoice payment failed"),
            SubscriptionCommand::RetriesExhausted => f.write_str("payment retries exhausted"),
            SubscriptionCommand::Cancel => f.write_str("cancellation"),
            SubscriptionCommand::Expire => f.write_str("expiry"),
            SubscriptionCommand::Pause => f.write_str("pause"),
            SubscriptionCommand::Resume => f.write_str("resume"),
            SubscriptionCommand::Confirm(status) => write!(f, "confirm {status}"),
        }
    }
}

/// A command that is not allowed from the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{command} is not allowed from {from}")]
pub struct RejectedCommand {
    /// Status the subscription was in.
    pub from: SubscriptionStatus,
    /// The rejected command.
    pub command: SubscriptionCommand,
}

/// Bounds of the current billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    /// Period start.
    pub start: DateTime<Utc>,
    /// Period end.
    pub end: DateTime<Utc>,
}

/// A recurring billing relationship. Mutated only by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Internal ID.
    pub id: SubscriptionId,

    /// Subscribed customer.
    pub customer_id: CustomerId,

    /// Subscribed product.
    pub product_id: ProductId,

    /// Provider that bills this subscription.
    pub provider: Provider,

    /// Provider subscription reference (`sub_...`, Lago `lago_id`).
    pub provider_ref: String,

    /// Current status.
    pub status: SubscriptionStatus,

    /// Current billing period, when reported.
    pub current_period: Option<Period>,

    /// Provider timestamp of the newest event applied to this record.
    pub last_event_at: DateTime<Utc>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The provider reference as a [`ProviderRef`].
    #[must_use]
    pub fn provider_ref(&self) -> ProviderRef {
        ProviderRef::new(self.provider, self.provider_ref.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::SubscriptionCommand as C;
    use super::SubscriptionStatus::*;
    use super::*;

    const ALL: [SubscriptionStatus; 6] = [Trialing, Active, PastDue, Paused, Cancelled, Expired];

    #[test]
    fn invoice_paid_activates() {
        assert_eq!(Trialing.apply(C::InvoicePaid), Ok(Active));
        assert_eq!(Active.apply(C::InvoicePaid), Ok(Active));
        assert_eq!(PastDue.apply(C::InvoicePaid), Ok(Active));
        assert!(Paused.apply(C::InvoicePaid).is_err());
    }

    #[test]
    fn payment_failure_moves_to_past_due() {
        assert_eq!(Active.apply(C::InvoicePaymentFailed), Ok(PastDue));
        assert_eq!(Trialing.apply(C::InvoicePaymentFailed), Ok(PastDue));
        assert!(PastDue.apply(C::InvoicePaymentFailed).is_err());
    }

    #[test]
    fn exhausted_retries_cancel_only_from_past_due() {
        assert_eq!(PastDue.apply(C::RetriesExhausted), Ok(Cancelled));
        assert!(Active.apply(C::RetriesExhausted).is_err());
    }

    #[test]
    fn cancellation_sources() {
        for from in [Active, Trialing, PastDue, Paused] {
            assert_eq!(from.apply(C::Cancel), Ok(Cancelled));
        }
    }

    #[test]
    fn expiry_from_any_live_state() {
        for from in [Active, Trialing, PastDue, Paused] {
            assert_eq!(from.apply(C::Expire), Ok(Expired));
        }
    }

    #[test]
    fn pause_and_resume() {
        assert_eq!(Active.apply(C::Pause), Ok(Paused));
        assert_eq!(Paused.apply(C::Resume), Ok(Active));
        assert!(Trialing.apply(C::Pause).is_err());
        assert!(Active.apply(C::Resume).is_err());
    }

    #[test]
    fn confirm_only_restates_the_current_status() {
        assert_eq!(Trialing.apply(C::Confirm(Trialing)), Ok(Trialing));
        assert!(Active.apply(C::Confirm(Trialing)).is_err());
    }

    #[test]
    fn terminal_states_reject_every_command() {
        let commands = [
            C::InvoicePaid,
            C::InvoicePaymentFailed,
            C::RetriesExhausted,
            C::Cancel,
            C::Expire,
            C::Pause,
            C::Resume,
            C::Confirm(Active),
            C::Confirm(Cancelled),
        ];
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for command in commands {
                let err = from.apply(command).unwrap_err();
                assert_eq!(err.from, from);
            }
        }
    }

    #[test]
    fn rejected_command_message() {
        let err = Cancelled.apply(C::Resume).unwrap_err();
        assert_eq!(err.to_string(), "resume is not allowed from cancelled");
    }
}
