//! Webhook reconciliation.
//!
//! [`Reconciler::handle`] takes one inbound webhook from verification to a
//! committed ledger record:
//!
//! 1. The provider's adapter verifies and normalizes the payload.
//! 2. One unit of work reserves the ledger key, loads the records the event
//!    touches, runs the state machine, writes its decision and completes the
//!    ledger record. A key that is already recorded short-circuits as a
//!    duplicate.
//! 3. After commit the decision's notifications are dispatched.
//!
//! A decision that breaks a unique index (a billing ref another customer
//! already owns, say) fails the same way on every delivery. It is rolled back
//! and a second unit of work records the event for review instead.
//!
//! The unit of work runs on the blocking pool under a deadline. A webhook
//! that misses it is answered as retryable; if the unit of work still
//! commits afterwards, the provider's redelivery is seen as a duplicate.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use z_recon_core::{
    decide, AuditRecord, EventKind, IdempotencyRecord, LedgerCheck, NormalizedEvent,
    Notification, Outcome, Provider, ReviewReason, Snapshot, Writes,
};
use z_recon_store::{transact, Store, StoreError, UnitOfWork};

use crate::adapter::{Adapters, InboundWebhook, VerificationError};
use crate::notify::Dispatcher;

/// Attempts for a unit of work that loses a lock race.
const MAX_UNIT_OF_WORK_ATTEMPTS: u32 = 3;

/// Backoff after the first lost lock race (doubles with each attempt).
const CONFLICT_BACKOFF_MS: u64 = 20;

/// What happened to a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// First delivery; the event was processed with this record.
    Processed(IdempotencyRecord),
    /// The event was already processed; this is the earlier record.
    Duplicate(IdempotencyRecord),
}

impl Disposition {
    /// The ledger record for the event.
    #[must_use]
    pub fn record(&self) -> &IdempotencyRecord {
        match self {
            Self::Processed(record) | Self::Duplicate(record) => record,
        }
    }

    /// Whether the delivery was a duplicate.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Error type for reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The webhook failed verification. Permanent.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// No adapter is configured for the provider.
    #[error("{0} webhooks are not configured")]
    ProviderNotConfigured(Provider),

    /// The unit of work failed; nothing was committed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// The unit of work did not finish within the deadline.
    #[error("processing exceeded the {0:?} deadline")]
    Timeout(Duration),

    /// The unit of work panicked or was cancelled.
    #[error("processing aborted: {0}")]
    Aborted(String),
}

impl ReconcileError {
    /// Whether the provider should redeliver.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Verification(_) | Self::ProviderNotConfigured(_) => false,
            Self::Persistence(e) => e.is_retryable(),
            Self::Timeout(_) | Self::Aborted(_) => true,
        }
    }
}

/// Applies provider webhooks to the store.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    adapters: Adapters,
    dispatcher: Dispatcher,
    deadline: Duration,
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        adapters: Adapters,
        dispatcher: Dispatcher,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            adapters,
            dispatcher,
            deadline,
        }
    }

    /// Verify, normalize and apply one webhook.
    pub async fn handle(
        &self,
        provider: Provider,
        webhook: InboundWebhook,
    ) -> Result<Disposition, ReconcileError> {
        let adapter = self
            .adapters
            .get(provider)
            .ok_or(ReconcileError::ProviderNotConfigured(provider))?;

        let event = adapter.normalize(&webhook)?;
        let event_id = event.event_id.clone();
        let kind = event.kind.label();

        tracing::debug!(
            provider = %provider,
            event_id = %event_id,
            kind = %kind,
            "Webhook verified"
        );

        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || process(store.as_ref(), &event, Utc::now()));

        let (disposition, effects) = match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(result)) => result.map_err(|e| {
                if e.is_retryable() {
                    tracing::warn!(
                        provider = %provider,
                        event_id = %event_id,
                        error = %e,
                        "Webhook unit of work failed"
                    );
                } else {
                    tracing::error!(
                        provider = %provider,
                        event_id = %event_id,
                        error = %e,
                        "Webhook unit of work failed permanently"
                    );
                }
                ReconcileError::Persistence(e)
            })?,
            Ok(Err(join_error)) => {
                tracing::error!(
                    provider = %provider,
                    event_id = %event_id,
                    error = %join_error,
                    "Webhook unit of work aborted"
                );
                return Err(ReconcileError::Aborted(join_error.to_string()));
            }
            Err(_) => {
                tracing::warn!(
                    provider = %provider,
                    event_id = %event_id,
                    deadline_ms = %self.deadline.as_millis(),
                    "Webhook processing exceeded deadline"
                );
                return Err(ReconcileError::Timeout(self.deadline));
            }
        };

        let record = disposition.record();
        match &disposition {
            Disposition::Duplicate(_) => tracing::info!(
                provider = %provider,
                event_id = %event_id,
                outcome = %record.outcome.label(),
                "Duplicate webhook ignored"
            ),
            Disposition::Processed(_) if record.outcome.needs_attention() => tracing::warn!(
                provider = %provider,
                event_id = %event_id,
                kind = %kind,
                outcome = ?record.outcome,
                "Webhook recorded for review"
            ),
            Disposition::Processed(_) => tracing::info!(
                provider = %provider,
                event_id = %event_id,
                kind = %kind,
                outcome = %record.outcome.label(),
                "Webhook processed"
            ),
        }

        self.dispatcher.dispatch(effects);
        Ok(disposition)
    }
}

type Processed = (Disposition, Vec<Notification>);

/// Apply `event` in one unit of work, retrying lost lock races.
///
/// Returns the disposition and the notifications to send once committed.
pub fn process(
    store: &dyn Store,
    event: &NormalizedEvent,
    now: DateTime<Utc>,
) -> Result<(Disposition, Vec<Notification>), StoreError> {
    match with_retries(store, event, |uow| apply(uow, event, now)) {
        Err(StoreError::UniqueViolation(detail)) => {
            tracing::warn!(
                event_id = %event.event_id,
                detail = %detail,
                "Decision violates a unique index, recording for review"
            );
            with_retries(store, event, |uow| record_conflict(uow, event, &detail, now))
        }
        result => result,
    }
}

fn with_retries<F>(
    store: &dyn Store,
    event: &NormalizedEvent,
    mut work: F,
) -> Result<Processed, StoreError>
where
    F: FnMut(&mut dyn UnitOfWork) -> Result<Processed, StoreError>,
{
    let mut attempt = 0;
    let mut backoff = Duration::from_millis(CONFLICT_BACKOFF_MS);

    loop {
        attempt += 1;
        match transact(store, &mut work) {
            Err(StoreError::Conflict(detail)) if attempt < MAX_UNIT_OF_WORK_ATTEMPTS => {
                tracing::debug!(
                    event_id = %event.event_id,
                    attempt = %attempt,
                    detail = %detail,
                    "Unit of work conflicted, retrying"
                );
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            result => return result,
        }
    }
}

fn apply(
    uow: &mut dyn UnitOfWork,
    event: &NormalizedEvent,
    now: DateTime<Utc>,
) -> Result<Processed, StoreError> {
    if let LedgerCheck::AlreadyProcessed(prior) = uow.check_and_reserve(&event.key())? {
        return Ok((Disposition::Duplicate(prior), Vec::new()));
    }

    let snapshot = load_snapshot(uow, event)?;
    let decision = decide(&snapshot, event, now);
    write(uow, &decision.writes)?;

    let record = IdempotencyRecord::new(event, decision.outcome, now);
    uow.complete(&record)?;
    Ok((Disposition::Processed(record), decision.effects))
}

/// Complete the ledger record for an event whose decision could not be written.
fn record_conflict(
    uow: &mut dyn UnitOfWork,
    event: &NormalizedEvent,
    detail: &str,
    now: DateTime<Utc>,
) -> Result<Processed, StoreError> {
    if let LedgerCheck::AlreadyProcessed(prior) = uow.check_and_reserve(&event.key())? {
        return Ok((Disposition::Duplicate(prior), Vec::new()));
    }

    let subscription_id = match event.provider_subscription_ref() {
        Some(provider_ref) => uow
            .find_subscription_by_provider_ref(&provider_ref)?
            .map(|s| s.id),
        None => None,
    };
    let outcome = Outcome::ManualReview {
        reason: ReviewReason::ConflictingReference {
            detail: detail.to_string(),
        },
    };
    uow.put_audit(&AuditRecord::new(event, subscription_id, outcome.clone(), now))?;

    let record = IdempotencyRecord::new(event, outcome, now);
    uow.complete(&record)?;
    Ok((Disposition::Processed(record), Vec::new()))
}

/// Read every record `event` may touch.
fn load_snapshot(
    uow: &mut dyn UnitOfWork,
    event: &NormalizedEvent,
) -> Result<Snapshot, StoreError> {
    let refs = &event.refs;

    let subscription = match event.provider_subscription_ref() {
        Some(provider_ref) => uow.find_subscription_by_provider_ref(&provider_ref)?,
        None => None,
    };
    let payment = match event.provider_payment_ref() {
        Some(provider_ref) => uow.find_payment_by_provider_ref(&provider_ref)?,
        None => None,
    };

    let mut customer = match &refs.customer_id {
        Some(id) => uow.get_customer(id)?,
        None => None,
    };
    if customer.is_none() {
        if let Some(billing_ref) = event.provider_customer_ref() {
            customer = uow.find_customer_by_billing_ref(&billing_ref)?;
        }
    }
    if customer.is_none() {
        let owner = subscription
            .as_ref()
            .map(|s| s.customer_id)
            .or_else(|| payment.as_ref().map(|p| p.customer_id));
        if let Some(id) = owner {
            customer = uow.get_customer(&id)?;
        }
    }

    let mut product = match &refs.product_id {
        Some(id) => uow.get_product(id)?,
        None => None,
    };
    if product.is_none() {
        if let Some(code) = &refs.product_code {
            product = uow.find_product_by_code(code)?;
        }
    }
    if product.is_none() {
        let owned = subscription
            .as_ref()
            .map(|s| s.product_id)
            .or_else(|| payment.as_ref().and_then(|p| p.product_id));
        if let Some(id) = owned {
            product = uow.get_product(&id)?;
        }
    }

    let live_subscription = match (&event.kind, &customer, &product) {
        (EventKind::CheckoutCompleted, Some(customer), Some(product)) => {
            uow.find_live_subscription(&customer.id, &product.id)?
        }
        _ => None,
    };

    Ok(Snapshot {
        customer,
        product,
        subscription,
        live_subscription,
        payment,
    })
}

fn write(uow: &mut dyn UnitOfWork, writes: &Writes) -> Result<(), StoreError> {
    if let Some(customer) = &writes.customer {
        uow.put_customer(customer)?;
    }
    if let Some(subscription) = &writes.subscription {
        uow.put_subscription(subscription)?;
    }
    if let Some(payment) = &writes.payment {
        uow.put_payment(payment)?;
    }
    if let Some(audit) = &writes.audit {
        uow.put_audit(audit)?;
    }
    Ok(())
}
