//! Stripe webhook verification and normalization.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

use z_recon_core::{
    Currency, CustomerId, EntityRefs, EventKind, NormalizedEvent, PaymentDetails, PaymentStatus,
    Period, ProductId, Provider, SubscriptionStatus,
};

use super::types::WebhookEvent;
use crate::adapter::{int, text, unix_time, InboundWebhook, ProviderAdapter, VerificationError};
use crate::crypto::{constant_time_eq, hmac_sha256_hex};

/// Verifies `Stripe-Signature` headers and maps Stripe events.
#[derive(Debug, Clone)]
pub struct StripeAdapter {
    secret: String,
    tolerance_seconds: u64,
}

impl StripeAdapter {
    /// Create an adapter for the endpoint signing secret (`whsec_...`).
    pub fn new(secret: impl Into<String>, tolerance_seconds: u64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_seconds,
        }
    }

    /// Verify the signature header against the raw body.
    ///
    /// The signed payload is `"{t}.{body}"`. Any `v1` entry may match; Stripe
    /// sends several while a secret is being rolled.
    fn verify(&self, webhook: &InboundWebhook) -> Result<(), VerificationError> {
        let header = webhook
            .signature
            .as_deref()
            .ok_or(VerificationError::MissingSignature)?;
        let signature = SignatureHeader::parse(header)?;

        let signed = format!("{}.{}", signature.timestamp, webhook.body);
        let expected = hmac_sha256_hex(self.secret.as_bytes(), signed.as_bytes())
            .map_err(|_| VerificationError::SignatureMismatch)?;
        if !signature
            .v1
            .iter()
            .any(|candidate| constant_time_eq(&expected, candidate))
        {
            return Err(VerificationError::SignatureMismatch);
        }

        let skew = webhook
            .received_at
            .timestamp()
            .abs_diff(signature.timestamp);
        if skew > self.tolerance_seconds {
            return Err(VerificationError::TimestampOutOfTolerance {
                timestamp: signature.timestamp,
                tolerance_seconds: self.tolerance_seconds,
            });
        }

        Ok(())
    }
}

impl ProviderAdapter for StripeAdapter {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    fn normalize(&self, webhook: &InboundWebhook) -> Result<NormalizedEvent, VerificationError> {
        self.verify(webhook)?;

        let raw: Value = serde_json::from_str(&webhook.body)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
        let event = WebhookEvent::deserialize(&raw)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
        if event.id.is_empty() {
            return Err(VerificationError::MalformedPayload("missing event id".into()));
        }
        let occurred_at = DateTime::from_timestamp(event.created, 0).ok_or_else(|| {
            VerificationError::MalformedPayload(format!("invalid created time {}", event.created))
        })?;

        let (kind, refs) = translate(&event.event_type, &event.data.object)?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            kind = kind.label(),
            livemode = event.livemode,
            "Normalized Stripe event"
        );

        Ok(NormalizedEvent {
            provider: Provider::Stripe,
            event_id: event.id,
            kind,
            occurred_at,
            refs,
            raw,
        })
    }
}

/// Parsed `Stripe-Signature` header: `t=<unix>,v1=<hex>[,v1=<hex>...]`.
struct SignatureHeader<'a> {
    timestamp: i64,
    v1: Vec<&'a str>,
}

impl<'a> SignatureHeader<'a> {
    fn parse(header: &'a str) -> Result<Self, VerificationError> {
        let mut timestamp = None;
        let mut v1 = Vec::new();

        for element in header.split(',') {
            let Some((key, value)) = element.trim().split_once('=') else {
                return Err(VerificationError::MalformedSignature(format!(
                    "unexpected element {element:?}"
                )));
            };
            match key {
                "t" => {
                    let t = value.parse::<i64>().map_err(|_| {
                        VerificationError::MalformedSignature("invalid timestamp".into())
                    })?;
                    timestamp = Some(t);
                }
                "v1" => v1.push(value),
                // v0 and future schemes
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| VerificationError::MalformedSignature("missing timestamp".into()))?;
        if v1.is_empty() {
            return Err(VerificationError::MalformedSignature(
                "no v1 signature".into(),
            ));
        }

        Ok(Self { timestamp, v1 })
    }
}

type Translation = Result<(EventKind, EntityRefs), VerificationError>;

fn translate(event_type: &str, object: &Value) -> Translation {
    match event_type {
        "checkout.session.completed" => checkout_session(object),
        "invoice.paid" | "invoice.payment_succeeded" => invoice_paid(event_type, object),
        "invoice.payment_failed" => invoice_payment_failed(object),
        "customer.subscription.updated" => Ok((
            EventKind::SubscriptionUpdated {
                status: reported_subscription_status(object),
            },
            subscription_refs(object),
        )),
        "customer.subscription.paused" => {
            Ok((EventKind::SubscriptionPaused, subscription_refs(object)))
        }
        "customer.subscription.resumed" => {
            Ok((EventKind::SubscriptionResumed, subscription_refs(object)))
        }
        "customer.subscription.deleted" => {
            let kind = if text(object, "/status").as_deref() == Some("incomplete_expired") {
                EventKind::SubscriptionExpired
            } else {
                EventKind::SubscriptionCancelled
            };
            Ok((kind, subscription_refs(object)))
        }
        "charge.refunded" => charge_refunded(object),
        t if t.starts_with("payment_intent.") => payment_intent(t, object),
        other => Ok((
            EventKind::Unhandled {
                event_type: other.to_string(),
            },
            EntityRefs::default(),
        )),
    }
}

// ============================================================================
// Status vocabularies
// ============================================================================

/// Canonical status for a Stripe subscription status string.
#[must_use]
pub fn subscription_status(status: &str) -> SubscriptionStatus {
    match status {
        "trialing" => SubscriptionStatus::Trialing,
        "active" => SubscriptionStatus::Active,
        "past_due" | "unpaid" | "incomplete" => SubscriptionStatus::PastDue,
        "paused" => SubscriptionStatus::Paused,
        "canceled" => SubscriptionStatus::Cancelled,
        "incomplete_expired" => SubscriptionStatus::Expired,
        _ => SubscriptionStatus::NeedsReview,
    }
}

/// Canonical status for a Stripe payment intent status string.
#[must_use]
pub fn payment_intent_status(status: &str) -> PaymentStatus {
    match status {
        "requires_payment_method" | "requires_confirmation" | "requires_action" => {
            PaymentStatus::Pending
        }
        "processing" | "requires_capture" => PaymentStatus::Processing,
        "succeeded" => PaymentStatus::Completed,
        "canceled" => PaymentStatus::Cancelled,
        _ => PaymentStatus::NeedsReview,
    }
}

fn checkout_payment_status(status: Option<&str>) -> PaymentStatus {
    match status {
        Some("paid" | "no_payment_required") => PaymentStatus::Completed,
        Some("unpaid") => PaymentStatus::Pending,
        _ => PaymentStatus::NeedsReview,
    }
}

/// A subscription whose collection is paused still reports `active`.
fn reported_subscription_status(object: &Value) -> SubscriptionStatus {
    let status = subscription_status(text(object, "/status").as_deref().unwrap_or_default());
    let collection_paused = object
        .pointer("/pause_collection")
        .is_some_and(|v| !v.is_null());
    if status == SubscriptionStatus::Active && collection_paused {
        SubscriptionStatus::Paused
    } else {
        status
    }
}

// ============================================================================
// Object mappings
// ============================================================================

fn currency(object: &Value) -> Result<Currency, VerificationError> {
    let raw = text(object, "/currency")
        .ok_or_else(|| VerificationError::MalformedPayload("missing currency".into()))?;
    raw.parse()
        .map_err(|_| VerificationError::MalformedPayload(format!("invalid currency {raw}")))
}

/// Our customer id, echoed back as `client_reference_id` or metadata.
fn customer_id(object: &Value) -> Option<CustomerId> {
    text(object, "/client_reference_id")
        .or_else(|| text(object, "/metadata/customer_id"))
        .or_else(|| text(object, "/subscription_details/metadata/customer_id"))
        .and_then(|s| s.parse().ok())
}

fn product_id(object: &Value) -> Option<ProductId> {
    text(object, "/metadata/product_id").and_then(|s| s.parse().ok())
}

fn period(object: &Value, start: &str, end: &str) -> Option<Period> {
    Some(Period {
        start: unix_time(object, start)?,
        end: unix_time(object, end)?,
    })
}

fn checkout_session(object: &Value) -> Translation {
    let payment = match text(object, "/payment_intent") {
        Some(provider_ref) => Some(PaymentDetails {
            provider_ref,
            amount_minor: int(object, "/amount_total").unwrap_or_default(),
            currency: currency(object)?,
            status: checkout_payment_status(text(object, "/payment_status").as_deref()),
        }),
        None => None,
    };

    let refs = EntityRefs {
        customer_id: customer_id(object),
        provider_customer: text(object, "/customer"),
        provider_subscription: text(object, "/subscription"),
        product_id: product_id(object),
        product_code: text(object, "/metadata/product_code"),
        payment,
        period: None,
    };
    Ok((EventKind::CheckoutCompleted, refs))
}

fn invoice_refs(
    object: &Value,
    status: PaymentStatus,
    amount: &str,
) -> Result<EntityRefs, VerificationError> {
    let provider_ref = text(object, "/payment_intent")
        .or_else(|| text(object, "/id"))
        .ok_or_else(|| VerificationError::MalformedPayload("invoice without id".into()))?;

    Ok(EntityRefs {
        customer_id: customer_id(object),
        provider_customer: text(object, "/customer"),
        provider_subscription: text(object, "/subscription")
            .or_else(|| text(object, "/parent/subscription_details/subscription")),
        product_id: None,
        product_code: None,
        payment: Some(PaymentDetails {
            provider_ref,
            amount_minor: int(object, amount).unwrap_or_default(),
            currency: currency(object)?,
            status,
        }),
        period: period(object, "/lines/data/0/period/start", "/lines/data/0/period/end")
            .or_else(|| period(object, "/period_start", "/period_end")),
    })
}

fn invoice_paid(event_type: &str, object: &Value) -> Translation {
    // The $0 invoice that opens a trial carries no payment.
    let opens_trial = int(object, "/amount_paid") == Some(0)
        && text(object, "/billing_reason").as_deref() == Some("subscription_create");
    if opens_trial {
        return Ok((
            EventKind::Unhandled {
                event_type: event_type.to_string(),
            },
            EntityRefs::default(),
        ));
    }

    let refs = invoice_refs(object, PaymentStatus::Completed, "/amount_paid")?;
    let kind = if refs.provider_subscription.is_some() {
        EventKind::InvoicePaid
    } else {
        EventKind::PaymentUpdated
    };
    Ok((kind, refs))
}

/// Stripe sends `invoice.payment_failed` for every dunning attempt. Only the
/// first one moves the subscription; the final one (no next attempt
/// scheduled) exhausts the retries.
fn invoice_payment_failed(object: &Value) -> Translation {
    let refs = invoice_refs(object, PaymentStatus::Failed, "/amount_due")?;
    let attempt_count = int(object, "/attempt_count").unwrap_or(1);
    let next_attempt = object
        .pointer("/next_payment_attempt")
        .filter(|v| !v.is_null());

    let kind = match (refs.provider_subscription.is_some(), attempt_count > 1, next_attempt) {
        (false, _, _) | (true, true, Some(_)) => EventKind::PaymentUpdated,
        (true, true, None) => EventKind::PaymentRetriesExhausted,
        (true, false, _) => EventKind::InvoicePaymentFailed,
    };
    Ok((kind, refs))
}

fn subscription_refs(object: &Value) -> EntityRefs {
    EntityRefs {
        customer_id: customer_id(object),
        provider_customer: text(object, "/customer"),
        provider_subscription: text(object, "/id"),
        product_id: product_id(object),
        product_code: text(object, "/metadata/product_code"),
        payment: None,
        period: period(object, "/current_period_start", "/current_period_end").or_else(|| {
            period(
                object,
                "/items/data/0/current_period_start",
                "/items/data/0/current_period_end",
            )
        }),
    }
}

/// A failed attempt puts the intent back to `requires_payment_method`, so
/// the event type decides a failure, not the object's status.
fn payment_intent(event_type: &str, object: &Value) -> Translation {
    let provider_ref = text(object, "/id")
        .ok_or_else(|| VerificationError::MalformedPayload("payment intent without id".into()))?;
    let status = if event_type == "payment_intent.payment_failed" {
        PaymentStatus::Failed
    } else {
        payment_intent_status(text(object, "/status").as_deref().unwrap_or_default())
    };

    let refs = EntityRefs {
        customer_id: customer_id(object),
        provider_customer: text(object, "/customer"),
        provider_subscription: None,
        product_id: product_id(object),
        product_code: text(object, "/metadata/product_code"),
        payment: Some(PaymentDetails {
            provider_ref,
            amount_minor: int(object, "/amount").unwrap_or_default(),
            currency: currency(object)?,
            status,
        }),
        period: None,
    };
    Ok((EventKind::PaymentUpdated, refs))
}

/// The refund amount is the newest refund when the list is expanded, else the
/// running total.
fn charge_refunded(object: &Value) -> Translation {
    let provider_ref = text(object, "/payment_intent")
        .or_else(|| text(object, "/id"))
        .ok_or_else(|| VerificationError::MalformedPayload("charge without id".into()))?;
    let amount_minor = int(object, "/refunds/data/0/amount")
        .or_else(|| int(object, "/amount_refunded"))
        .unwrap_or_default();

    let refs = EntityRefs {
        customer_id: customer_id(object),
        provider_customer: text(object, "/customer"),
        provider_subscription: None,
        product_id: None,
        product_code: None,
        payment: Some(PaymentDetails {
            provider_ref,
            amount_minor: int(object, "/amount").unwrap_or_default(),
            currency: currency(object)?,
            status: PaymentStatus::Refunded,
        }),
        period: None,
    };
    Ok((EventKind::RefundIssued { amount_minor }, refs))
}
