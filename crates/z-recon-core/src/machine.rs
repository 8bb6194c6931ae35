//! The reconciliation state machine.
//!
//! [`decide`] is a pure function from the current state of the records an
//! event touches (a [`Snapshot`]) and the event itself to a [`Decision`]: the
//! outcome to record in the ledger, the records to write and the
//! notifications to send after commit. It performs no I/O and never reads the
//! clock; `now` is an input.
//!
//! Refused events produce no record writes except an [`AuditRecord`]. This
//! holds for every part of the event: if the payment half of an invoice
//! event would move a payment backwards, the subscription half is not applied
//! either.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::catalog::Product;
use crate::customer::Customer;
use crate::event::{EventKind, NormalizedEvent, PaymentDetails};
use crate::ids::{CustomerId, PaymentIntentId, ProductId, SubscriptionId};
use crate::ledger::{AuditRecord, Outcome, PaymentChange, ReviewReason, SubscriptionChange};
use crate::notification::{Notification, TemplateKind};
use crate::payment::{PaymentIntent, PaymentStatus};
use crate::subscription::{RejectedCommand, Subscription, SubscriptionCommand, SubscriptionStatus};

/// A refused state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum IllegalTransition {
    /// The subscription status does not allow the command.
    #[error("subscription {subscription_id}: {rejected}")]
    Subscription {
        /// Affected subscription.
        subscription_id: SubscriptionId,
        /// The refused command.
        rejected: RejectedCommand,
    },

    /// The payment lattice does not allow the move.
    #[error("payment {payment_id}: {from} cannot move to {to}")]
    Payment {
        /// Affected payment intent.
        payment_id: PaymentIntentId,
        /// Current status.
        from: PaymentStatus,
        /// Requested status.
        to: PaymentStatus,
    },

    /// A newer event has already been applied to the subscription.
    #[error("subscription {subscription_id}: event from {occurred_at} is older than {last_event_at}")]
    StaleEvent {
        /// Affected subscription.
        subscription_id: SubscriptionId,
        /// Provider time of the newest applied event.
        last_event_at: DateTime<Utc>,
        /// Provider time of the refused event.
        occurred_at: DateTime<Utc>,
    },

    /// A checkout for a pair that already has a live subscription, or for a
    /// provider subscription that is already recorded.
    #[error("subscription {subscription_id} already exists")]
    SubscriptionExists {
        /// The existing subscription.
        subscription_id: SubscriptionId,
    },
}

/// Current state of every record an event may touch, read inside the unit of
/// work that will apply the decision.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// The customer the event belongs to.
    pub customer: Option<Customer>,
    /// The product the event refers to.
    pub product: Option<Product>,
    /// The subscription matching the event's provider subscription reference.
    pub subscription: Option<Subscription>,
    /// The live subscription for `(customer, product)`, loaded for checkouts.
    pub live_subscription: Option<Subscription>,
    /// The payment intent matching the event's provider payment reference.
    pub payment: Option<PaymentIntent>,
}

/// Records to write in the unit of work.
#[derive(Debug, Clone, Default)]
pub struct Writes {
    /// Customer upsert.
    pub customer: Option<Customer>,
    /// Subscription upsert.
    pub subscription: Option<Subscription>,
    /// Payment intent upsert.
    pub payment: Option<PaymentIntent>,
    /// Audit record insert.
    pub audit: Option<AuditRecord>,
}

impl Writes {
    /// Whether the decision writes nothing besides the ledger record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.customer.is_none()
            && self.subscription.is_none()
            && self.payment.is_none()
            && self.audit.is_none()
    }
}

/// What to do with one event.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Outcome for the ledger.
    pub outcome: Outcome,
    /// Records to persist.
    pub writes: Writes,
    /// Notifications to dispatch after commit.
    pub effects: Vec<Notification>,
}

enum Rejection {
    Illegal(IllegalTransition),
    Review(ReviewReason),
    Ignored(String),
}

impl From<IllegalTransition> for Rejection {
    fn from(t: IllegalTransition) -> Self {
        Rejection::Illegal(t)
    }
}

impl From<ReviewReason> for Rejection {
    fn from(r: ReviewReason) -> Self {
        Rejection::Review(r)
    }
}

type Step = Result<Decision, Rejection>;

/// Decide what `event` does to the records in `snapshot`.
#[must_use]
pub fn decide(snapshot: &Snapshot, event: &NormalizedEvent, now: DateTime<Utc>) -> Decision {
    let step = match &event.kind {
        EventKind::CheckoutCompleted => checkout(snapshot, event, now),
        EventKind::PaymentUpdated => update_payment(snapshot, event, now),
        EventKind::RefundIssued { amount_minor } => refund(snapshot, event, *amount_minor, now),
        EventKind::Unhandled { event_type } => Err(Rejection::Ignored(format!(
            "unhandled event type {event_type}"
        ))),
        kind => advance_subscription(snapshot, event, kind, now),
    };

    step.unwrap_or_else(|rejection| refuse(snapshot, event, rejection, now))
}

fn refuse(
    snapshot: &Snapshot,
    event: &NormalizedEvent,
    rejection: Rejection,
    now: DateTime<Utc>,
) -> Decision {
    let outcome = match rejection {
        Rejection::Illegal(transition) => Outcome::IllegalTransition { transition },
        Rejection::Review(reason) => Outcome::ManualReview { reason },
        Rejection::Ignored(reason) => {
            return Decision {
                outcome: Outcome::Ignored { reason },
                writes: Writes::default(),
                effects: Vec::new(),
            }
        }
    };

    let subscription_id = snapshot
        .subscription
        .as_ref()
        .or(snapshot.live_subscription.as_ref())
        .map(|s| s.id);
    let audit = AuditRecord::new(event, subscription_id, outcome.clone(), now);

    Decision {
        outcome,
        writes: Writes {
            audit: Some(audit),
            ..Writes::default()
        },
        effects: Vec::new(),
    }
}

/// A reference the event kind requires is absent, or present but unknown.
fn unresolved(present: bool, field: &str, unknown: ReviewReason) -> Rejection {
    if present {
        Rejection::Review(unknown)
    } else {
        Rejection::Review(ReviewReason::MissingReference {
            field: field.to_string(),
        })
    }
}

fn checkout(snapshot: &Snapshot, event: &NormalizedEvent, now: DateTime<Utc>) -> Step {
    let refs = &event.refs;
    let customer = snapshot.customer.as_ref().ok_or_else(|| {
        unresolved(
            refs.customer_id.is_some() || refs.provider_customer.is_some(),
            "customer",
            ReviewReason::UnknownCustomer,
        )
    })?;

    let Some(provider_subscription) = refs.provider_subscription.as_ref() else {
        // One-off purchase: no subscription, just the payment.
        if refs.payment.is_none() {
            return Err(unresolved(false, "subscription", ReviewReason::UnknownSubscription));
        }
        let mut decision = update_payment(snapshot, event, now)?;
        decision.writes.customer = attach_customer_ref(customer, event, now);
        return Ok(decision);
    };

    let product = snapshot.product.as_ref().ok_or_else(|| {
        unresolved(
            refs.product_id.is_some() || refs.product_code.is_some(),
            "product",
            ReviewReason::UnknownProduct,
        )
    })?;

    if let Some(existing) = snapshot
        .subscription
        .as_ref()
        .or(snapshot.live_subscription.as_ref())
    {
        return Err(IllegalTransition::SubscriptionExists {
            subscription_id: existing.id,
        }
        .into());
    }

    let status = if product.has_trial() {
        SubscriptionStatus::Trialing
    } else {
        SubscriptionStatus::Active
    };
    let subscription = Subscription {
        id: SubscriptionId::generate(),
        customer_id: customer.id,
        product_id: product.id,
        provider: event.provider,
        provider_ref: provider_subscription.clone(),
        status,
        current_period: refs.period,
        last_event_at: event.occurred_at,
        created_at: now,
        updated_at: now,
    };

    let owner = PaymentOwner {
        customer_id: customer.id,
        product_id: Some(product.id),
        subscription_id: Some(subscription.id),
    };
    let payment = match refs.payment.as_ref() {
        Some(details) => upsert_payment(snapshot.payment.as_ref(), details, &owner, event, now)?,
        None => None,
    };

    let mut effects = vec![Notification::new(
        &customer.email,
        TemplateKind::SubscriptionStarted,
        json!({
            "product": product.name,
            "status": status,
            "trial_days": product.trial_days,
        }),
    )];
    if let Some((intent, _)) = &payment {
        if intent.status == PaymentStatus::Completed {
            effects.push(receipt(customer, Some(product), intent));
        }
    }

    let (payment, payment_change) = payment.unzip();
    Ok(Decision {
        outcome: Outcome::Applied {
            subscription: Some(SubscriptionChange {
                subscription_id: subscription.id,
                from: None,
                to: status,
            }),
            payment: payment_change,
        },
        writes: Writes {
            customer: attach_customer_ref(customer, event, now),
            subscription: Some(subscription),
            payment,
            audit: None,
        },
        effects,
    })
}

fn attach_customer_ref(
    customer: &Customer,
    event: &NormalizedEvent,
    now: DateTime<Utc>,
) -> Option<Customer> {
    let billing_ref = event.provider_customer_ref()?;
    let mut updated = customer.clone();
    updated.attach_billing_ref(billing_ref, now).then_some(updated)
}

/// The command a subscription event implies for a subscription in `current`.
fn command_for(
    kind: &EventKind,
    current: SubscriptionStatus,
) -> Result<SubscriptionCommand, Rejection> {
    use SubscriptionCommand as C;

    let command = match kind {
        EventKind::InvoicePaid => C::InvoicePaid,
        EventKind::InvoicePaymentFailed => C::InvoicePaymentFailed,
        EventKind::PaymentRetriesExhausted => C::RetriesExhausted,
        EventKind::SubscriptionCancelled => C::Cancel,
        EventKind::SubscriptionExpired => C::Expire,
        EventKind::SubscriptionPaused => C::Pause,
        EventKind::SubscriptionResumed => C::Resume,
        EventKind::SubscriptionUpdated { status } => match status {
            SubscriptionStatus::NeedsReview => {
                return Err(ReviewReason::UnrecognizedStatus.into())
            }
            reported if *reported == current => C::Confirm(*reported),
            SubscriptionStatus::Active if current == SubscriptionStatus::Paused => C::Resume,
            SubscriptionStatus::Active => C::InvoicePaid,
            SubscriptionStatus::PastDue => C::InvoicePaymentFailed,
            SubscriptionStatus::Paused => C::Pause,
            SubscriptionStatus::Cancelled => C::Cancel,
            SubscriptionStatus::Expired => C::Expire,
            SubscriptionStatus::Trialing => C::Confirm(SubscriptionStatus::Trialing),
        },
        EventKind::CheckoutCompleted
        | EventKind::PaymentUpdated
        | EventKind::RefundIssued { .. }
        | EventKind::Unhandled { .. } => {
            return Err(Rejection::Ignored(format!(
                "{} does not target a subscription",
                kind.label()
            )))
        }
    };
    Ok(command)
}

fn advance_subscription(
    snapshot: &Snapshot,
    event: &NormalizedEvent,
    kind: &EventKind,
    now: DateTime<Utc>,
) -> Step {
    let current = snapshot.subscription.as_ref().ok_or_else(|| {
        unresolved(
            event.refs.provider_subscription.is_some(),
            "subscription",
            ReviewReason::UnknownSubscription,
        )
    })?;

    let command = command_for(kind, current.status)?;
    let next = current.status.apply(command).map_err(|rejected| {
        IllegalTransition::Subscription {
            subscription_id: current.id,
            rejected,
        }
    })?;

    if event.occurred_at < current.last_event_at {
        return Err(IllegalTransition::StaleEvent {
            subscription_id: current.id,
            last_event_at: current.last_event_at,
            occurred_at: event.occurred_at,
        }
        .into());
    }

    let mut subscription = current.clone();
    subscription.status = next;
    if let Some(period) = event.refs.period {
        subscription.current_period = Some(period);
    }
    subscription.last_event_at = event.occurred_at;
    subscription.updated_at = now;

    let owner = PaymentOwner {
        customer_id: current.customer_id,
        product_id: Some(current.product_id),
        subscription_id: Some(current.id),
    };
    let payment = match event.refs.payment.as_ref() {
        Some(details) => upsert_payment(snapshot.payment.as_ref(), details, &owner, event, now)?,
        None => None,
    };

    let mut effects = Vec::new();
    if let Some(customer) = snapshot.customer.as_ref() {
        let product = snapshot.product.as_ref();
        match command {
            SubscriptionCommand::InvoicePaid => {
                if let Some((intent, _)) = &payment {
                    effects.push(receipt(customer, product, intent));
                }
            }
            SubscriptionCommand::InvoicePaymentFailed => {
                effects.push(Notification::new(
                    &customer.email,
                    TemplateKind::PaymentFailed,
                    json!({ "product": product.map(|p| &p.name) }),
                ));
            }
            _ => {}
        }
        if next.is_terminal() && next != current.status {
            effects.push(Notification::new(
                &customer.email,
                TemplateKind::SubscriptionCancelled,
                json!({
                    "product": product.map(|p| &p.name),
                    "status": next,
                }),
            ));
        }
    }

    let (payment, payment_change) = payment.unzip();
    Ok(Decision {
        outcome: Outcome::Applied {
            subscription: Some(SubscriptionChange {
                subscription_id: current.id,
                from: Some(current.status),
                to: next,
            }),
            payment: payment_change,
        },
        writes: Writes {
            customer: None,
            subscription: Some(subscription),
            payment,
            audit: None,
        },
        effects,
    })
}

struct PaymentOwner {
    customer_id: CustomerId,
    product_id: Option<ProductId>,
    subscription_id: Option<SubscriptionId>,
}

/// Create or advance the payment intent described by `details`.
///
/// Returns `None` when the stored intent already has the reported status.
fn upsert_payment(
    existing: Option<&PaymentIntent>,
    details: &PaymentDetails,
    owner: &PaymentOwner,
    event: &NormalizedEvent,
    now: DateTime<Utc>,
) -> Result<Option<(PaymentIntent, PaymentChange)>, Rejection> {
    if details.status == PaymentStatus::NeedsReview {
        return Err(ReviewReason::UnrecognizedStatus.into());
    }

    let Some(existing) = existing else {
        let intent = PaymentIntent {
            id: PaymentIntentId::generate(),
            provider: event.provider,
            provider_ref: details.provider_ref.clone(),
            amount_minor: details.amount_minor,
            currency: details.currency.clone(),
            status: details.status,
            customer_id: owner.customer_id,
            product_id: owner.product_id,
            subscription_id: owner.subscription_id,
            refunded_minor: 0,
            metadata: json!({ "event_id": event.event_id }),
            created_at: now,
            updated_at: now,
        };
        let change = PaymentChange {
            payment_id: intent.id,
            from: None,
            to: intent.status,
        };
        return Ok(Some((intent, change)));
    };

    if existing.status == details.status {
        return Ok(None);
    }
    if !existing.status.can_advance_to(details.status) {
        return Err(IllegalTransition::Payment {
            payment_id: existing.id,
            from: existing.status,
            to: details.status,
        }
        .into());
    }

    let mut intent = existing.clone();
    intent.status = details.status;
    intent.amount_minor = details.amount_minor;
    intent.updated_at = now;
    if intent.subscription_id.is_none() {
        intent.subscription_id = owner.subscription_id;
    }
    if intent.product_id.is_none() {
        intent.product_id = owner.product_id;
    }
    let change = PaymentChange {
        payment_id: intent.id,
        from: Some(existing.status),
        to: intent.status,
    };
    Ok(Some((intent, change)))
}

fn update_payment(snapshot: &Snapshot, event: &NormalizedEvent, now: DateTime<Utc>) -> Step {
    let details = event.refs.payment.as_ref().ok_or_else(|| {
        unresolved(false, "payment", ReviewReason::UnknownPayment)
    })?;

    let owner = match (snapshot.payment.as_ref(), snapshot.customer.as_ref()) {
        (Some(existing), _) => PaymentOwner {
            customer_id: existing.customer_id,
            product_id: existing.product_id,
            subscription_id: existing.subscription_id,
        },
        (None, Some(customer)) => PaymentOwner {
            customer_id: customer.id,
            product_id: snapshot.product.as_ref().map(|p| p.id),
            subscription_id: snapshot.subscription.as_ref().map(|s| s.id),
        },
        (None, None) => {
            return Err(unresolved(
                event.refs.customer_id.is_some() || event.refs.provider_customer.is_some(),
                "customer",
                ReviewReason::UnknownCustomer,
            ))
        }
    };

    let Some((intent, change)) =
        upsert_payment(snapshot.payment.as_ref(), details, &owner, event, now)?
    else {
        return Err(Rejection::Ignored(format!(
            "payment already {}",
            details.status
        )));
    };

    // Recurring payments are announced by their invoice events.
    let mut effects = Vec::new();
    if let (Some(customer), None) = (snapshot.customer.as_ref(), intent.subscription_id) {
        match intent.status {
            PaymentStatus::Completed => {
                effects.push(receipt(customer, snapshot.product.as_ref(), &intent));
            }
            PaymentStatus::Failed => effects.push(Notification::new(
                &customer.email,
                TemplateKind::PaymentFailed,
                json!({
                    "product": snapshot.product.as_ref().map(|p| &p.name),
                    "amount_minor": intent.amount_minor,
                    "currency": intent.currency,
                }),
            )),
            _ => {}
        }
    }

    Ok(Decision {
        outcome: Outcome::Applied {
            subscription: None,
            payment: Some(change),
        },
        writes: Writes {
            payment: Some(intent),
            ..Writes::default()
        },
        effects,
    })
}

fn refund(
    snapshot: &Snapshot,
    event: &NormalizedEvent,
    amount_minor: i64,
    now: DateTime<Utc>,
) -> Step {
    let existing = snapshot.payment.as_ref().ok_or_else(|| {
        unresolved(
            event.refs.payment.is_some(),
            "payment",
            ReviewReason::UnknownPayment,
        )
    })?;

    if amount_minor <= 0 {
        return Err(Rejection::Ignored("refund without amount".to_string()));
    }
    if existing.status != PaymentStatus::Refunded
        && !existing.status.can_advance_to(PaymentStatus::Refunded)
    {
        return Err(IllegalTransition::Payment {
            payment_id: existing.id,
            from: existing.status,
            to: PaymentStatus::Refunded,
        }
        .into());
    }

    let mut intent = existing.clone();
    intent.status = PaymentStatus::Refunded;
    intent.refunded_minor = existing
        .refunded_minor
        .saturating_add(amount_minor)
        .min(existing.amount_minor);
    intent.updated_at = now;

    let effects = snapshot
        .customer
        .as_ref()
        .map(|customer| {
            Notification::new(
                &customer.email,
                TemplateKind::RefundIssued,
                json!({
                    "amount_minor": amount_minor,
                    "currency": intent.currency,
                    "refunded_minor": intent.refunded_minor,
                }),
            )
        })
        .into_iter()
        .collect();

    Ok(Decision {
        outcome: Outcome::Applied {
            subscription: None,
            payment: Some(PaymentChange {
                payment_id: intent.id,
                from: Some(existing.status),
                to: intent.status,
            }),
        },
        writes: Writes {
            payment: Some(intent),
            ..Writes::default()
        },
        effects,
    })
}

fn receipt(customer: &Customer, product: Option<&Product>, intent: &PaymentIntent) -> Notification {
    Notification::new(
        &customer.email,
        TemplateKind::PaymentReceipt,
        json!({
            "product": product.map(|p| &p.name),
            "amount_minor": intent.amount_minor,
            "currency": intent.currency,
        }),
    )
}
