//! Lago webhook verification and normalization.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use z_recon_core::{
    Currency, EntityRefs, EventKind, NormalizedEvent, PaymentDetails, PaymentStatus, Period,
    Provider, SubscriptionStatus,
};

use super::types::WebhookEnvelope;
use crate::adapter::{int, rfc3339_time, text, InboundWebhook, ProviderAdapter, VerificationError};
use crate::crypto::{constant_time_eq, hmac_sha256_hex, sha256_hex};

/// Verifies `X-Lago-Signature` headers and maps Lago webhooks.
#[derive(Debug, Clone)]
pub struct LagoAdapter {
    secret: String,
}

impl LagoAdapter {
    /// Create an adapter for the organization's webhook secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// The signature is the hex HMAC-SHA256 of the raw body.
    fn verify(&self, webhook: &InboundWebhook) -> Result<(), VerificationError> {
        let signature = webhook
            .signature
            .as_deref()
            .map(str::trim)
            .ok_or(VerificationError::MissingSignature)?;
        if signature.is_empty() || !signature.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VerificationError::MalformedSignature(
                "expected a hex digest".into(),
            ));
        }

        let expected = hmac_sha256_hex(self.secret.as_bytes(), webhook.body.as_bytes())
            .map_err(|_| VerificationError::SignatureMismatch)?;
        if constant_time_eq(&expected, &signature.to_ascii_lowercase()) {
            Ok(())
        } else {
            Err(VerificationError::SignatureMismatch)
        }
    }
}

impl ProviderAdapter for LagoAdapter {
    fn provider(&self) -> Provider {
        Provider::Lago
    }

    fn normalize(&self, webhook: &InboundWebhook) -> Result<NormalizedEvent, VerificationError> {
        self.verify(webhook)?;

        let raw: Value = serde_json::from_str(&webhook.body)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
        let envelope = WebhookEnvelope::deserialize(&raw)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
        let object = raw.get(&envelope.object_type).unwrap_or(&Value::Null);

        // A redelivery of the same body collapses onto the same key even
        // without the unique-key header.
        let event_id = webhook
            .delivery_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(|| sha256_hex(webhook.body.as_bytes()), String::from);

        let translated = translate(&envelope.webhook_type, object)?;
        let occurred_at = translated.occurred_at.unwrap_or(webhook.received_at);

        tracing::debug!(
            event_id = %event_id,
            webhook_type = %envelope.webhook_type,
            kind = translated.kind.label(),
            "Normalized Lago webhook"
        );

        Ok(NormalizedEvent {
            provider: Provider::Lago,
            event_id,
            kind: translated.kind,
            occurred_at,
            refs: translated.refs,
            raw,
        })
    }
}

struct Translated {
    kind: EventKind,
    refs: EntityRefs,
    occurred_at: Option<DateTime<Utc>>,
}

fn translate(webhook_type: &str, object: &Value) -> Result<Translated, VerificationError> {
    match webhook_type {
        "subscription.started" => Ok(Translated {
            kind: EventKind::CheckoutCompleted,
            refs: subscription_refs(object)?,
            occurred_at: first_time(object, &["/started_at", "/created_at"]),
        }),
        "subscription.trial_ended" => Ok(Translated {
            kind: EventKind::SubscriptionUpdated {
                status: SubscriptionStatus::Active,
            },
            refs: subscription_refs(object)?,
            occurred_at: first_time(object, &["/trial_ended_at"]),
        }),
        "subscription.terminated" => subscription_terminated(object),
        "invoice.payment_status_updated" => invoice_payment_status_updated(object),
        "invoice.payment_overdue" => {
            let refs = invoice_refs(object, PaymentStatus::Failed)?;
            let kind = if refs.provider_subscription.is_some() {
                EventKind::InvoicePaymentFailed
            } else {
                EventKind::PaymentUpdated
            };
            Ok(Translated {
                kind,
                refs,
                occurred_at: first_time(object, &["/updated_at", "/created_at"]),
            })
        }
        "credit_note.created" => credit_note_created(webhook_type, object),
        other => Ok(unhandled(other)),
    }
}

fn unhandled(webhook_type: &str) -> Translated {
    Translated {
        kind: EventKind::Unhandled {
            event_type: webhook_type.to_string(),
        },
        refs: EntityRefs::default(),
        occurred_at: None,
    }
}

// ============================================================================
// Status vocabularies
// ============================================================================

/// Canonical status for a Lago subscription status string.
///
/// `pending` is a subscription scheduled to start later; it has no
/// canonical counterpart and goes to review.
#[must_use]
pub fn subscription_status(status: &str) -> SubscriptionStatus {
    match status {
        "active" => SubscriptionStatus::Active,
        "canceled" | "terminated" => SubscriptionStatus::Cancelled,
        _ => SubscriptionStatus::NeedsReview,
    }
}

/// Canonical status for a Lago invoice `payment_status`.
#[must_use]
pub fn invoice_payment_status(status: &str) -> PaymentStatus {
    match status {
        "pending" => PaymentStatus::Pending,
        "succeeded" => PaymentStatus::Completed,
        "failed" => PaymentStatus::Failed,
        _ => PaymentStatus::NeedsReview,
    }
}

// ============================================================================
// Object mappings
// ============================================================================

fn first_time(object: &Value, pointers: &[&str]) -> Option<DateTime<Utc>> {
    pointers.iter().find_map(|p| rfc3339_time(object, p))
}

fn required(object: &Value, pointer: &str, what: &str) -> Result<String, VerificationError> {
    text(object, pointer)
        .ok_or_else(|| VerificationError::MalformedPayload(format!("missing {what}")))
}

fn currency(object: &Value) -> Result<Currency, VerificationError> {
    let raw = required(object, "/currency", "currency")?;
    raw.parse()
        .map_err(|_| VerificationError::MalformedPayload(format!("invalid currency {raw}")))
}

fn billing_period(object: &Value) -> Option<Period> {
    Some(Period {
        start: rfc3339_time(object, "/current_billing_period_started_at")?,
        end: rfc3339_time(object, "/current_billing_period_ending_at")?,
    })
}

/// Lago customers are keyed by our customer id (`external_customer_id`), so
/// it doubles as the provider customer reference.
fn customer_refs(external_id: Option<String>) -> EntityRefs {
    EntityRefs {
        customer_id: external_id.as_deref().and_then(|s| s.parse().ok()),
        provider_customer: external_id,
        ..EntityRefs::default()
    }
}

fn subscription_refs(subscription: &Value) -> Result<EntityRefs, VerificationError> {
    Ok(EntityRefs {
        provider_subscription: Some(required(subscription, "/lago_id", "subscription lago_id")?),
        product_code: text(subscription, "/plan_code"),
        period: billing_period(subscription),
        ..customer_refs(text(subscription, "/external_customer_id"))
    })
}

/// A termination at or after the scheduled end is an expiry.
fn subscription_terminated(subscription: &Value) -> Result<Translated, VerificationError> {
    let refs = subscription_refs(subscription)?;
    let terminated_at = rfc3339_time(subscription, "/terminated_at");
    let ending_at = rfc3339_time(subscription, "/ending_at");

    let reported = text(subscription, "/status");
    let status = subscription_status(reported.as_deref().unwrap_or("terminated"));
    let kind = match status {
        SubscriptionStatus::Cancelled => match (ending_at, terminated_at) {
            (Some(end), Some(at)) if end <= at => EventKind::SubscriptionExpired,
            _ => EventKind::SubscriptionCancelled,
        },
        other => EventKind::SubscriptionUpdated { status: other },
    };

    Ok(Translated {
        kind,
        refs,
        occurred_at: terminated_at.or_else(|| first_time(subscription, &["/updated_at"])),
    })
}

fn invoice_refs(invoice: &Value, status: PaymentStatus) -> Result<EntityRefs, VerificationError> {
    let subscription = invoice.pointer("/subscriptions/0").unwrap_or(&Value::Null);
    Ok(EntityRefs {
        provider_subscription: text(subscription, "/lago_id"),
        payment: Some(PaymentDetails {
            provider_ref: required(invoice, "/lago_id", "invoice lago_id")?,
            amount_minor: int(invoice, "/total_amount_cents").unwrap_or_default(),
            currency: currency(invoice)?,
            status,
        }),
        period: billing_period(subscription),
        ..customer_refs(
            text(invoice, "/customer/external_id")
                .or_else(|| text(invoice, "/external_customer_id")),
        )
    })
}

fn invoice_payment_status_updated(invoice: &Value) -> Result<Translated, VerificationError> {
    let reported = text(invoice, "/payment_status");
    let status = invoice_payment_status(reported.as_deref().unwrap_or_default());
    let refs = invoice_refs(invoice, status)?;

    let kind = match (status, refs.provider_subscription.is_some()) {
        (PaymentStatus::Completed, true) => EventKind::InvoicePaid,
        (PaymentStatus::Failed, true) => EventKind::InvoicePaymentFailed,
        _ => EventKind::PaymentUpdated,
    };

    Ok(Translated {
        kind,
        refs,
        occurred_at: first_time(invoice, &["/updated_at", "/created_at"]),
    })
}

fn credit_note_created(webhook_type: &str, note: &Value) -> Result<Translated, VerificationError> {
    let amount_minor = int(note, "/refund_amount_cents").unwrap_or_default();
    if amount_minor <= 0 {
        return Ok(unhandled(webhook_type));
    }

    let refs = EntityRefs {
        payment: Some(PaymentDetails {
            provider_ref: required(note, "/lago_invoice_id", "credit note invoice")?,
            amount_minor: int(note, "/total_amount_cents").unwrap_or_default(),
            currency: currency(note)?,
            status: PaymentStatus::Refunded,
        }),
        ..customer_refs(text(note, "/customer/external_id"))
    };

    Ok(Translated {
        kind: EventKind::RefundIssued { amount_minor },
        refs,
        occurred_at: first_time(note, &["/created_at"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use z_recon_core::CustomerId;

    const SECRET: &str = "lago_secret";

    fn adapter() -> LagoAdapter {
        LagoAdapter::new(SECRET)
    }

    fn sign(body: &str) -> String {
        hmac_sha256_hex(SECRET.as_bytes(), body.as_bytes()).unwrap()
    }

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn webhook(
        body: &str,
        signature: Option<String>,
        delivery_id: Option<&str>,
    ) -> InboundWebhook {
        InboundWebhook {
            body: body.to_string(),
            signature,
            delivery_id: delivery_id.map(String::from),
            received_at: received_at(),
        }
    }

    fn body(webhook_type: &str, object_type: &str, object: &Value) -> String {
        json!({
            "webhook_type": webhook_type,
            "object_type": object_type,
            (object_type): object
        })
        .to_string()
    }

    fn normalize(webhook_type: &str, object_type: &str, object: &Value) -> NormalizedEvent {
        let body = body(webhook_type, object_type, object);
        adapter()
            .normalize(&webhook(&body, Some(sign(&body)), Some("uk_1")))
            .unwrap()
    }

    #[test]
    fn signature_is_checked() {
        let body = body("subscription.started", "subscription", &json!({}));
        assert_eq!(
            adapter().normalize(&webhook(&body, None, None)),
            Err(VerificationError::MissingSignature)
        );
        assert!(matches!(
            adapter().normalize(&webhook(&body, Some("not-hex!".into()), None)),
            Err(VerificationError::MalformedSignature(_))
        ));
        assert_eq!(
            adapter().normalize(&webhook(&body, Some(sign("other body")), None)),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn event_id_prefers_unique_key_then_body_hash() {
        let body = body("customer.created", "customer", &json!({ "lago_id": "c_1" }));
        let keyed = adapter()
            .normalize(&webhook(&body, Some(sign(&body)), Some("uk_42")))
            .unwrap();
        assert_eq!(keyed.event_id, "uk_42");

        let first = adapter()
            .normalize(&webhook(&body, Some(sign(&body)), None))
            .unwrap();
        let again = adapter()
            .normalize(&webhook(&body, Some(sign(&body).to_uppercase()), None))
            .unwrap();
        assert_eq!(first.event_id, sha256_hex(body.as_bytes()));
        assert_eq!(first.event_id, again.event_id);
        assert_eq!(first.occurred_at, received_at());
    }

    #[test]
    fn subscription_started_is_a_checkout() {
        let customer = CustomerId::generate();
        let event = normalize(
            "subscription.started",
            "subscription",
            &json!({
                "lago_id": "sub_lago_1",
                "external_customer_id": customer.to_string(),
                "plan_code": "pro-monthly",
                "status": "active",
                "started_at": "2024-03-01T11:59:00Z"
            }),
        );
        assert_eq!(event.kind, EventKind::CheckoutCompleted);
        assert_eq!(event.refs.customer_id, Some(customer));
        assert_eq!(event.refs.provider_customer, Some(customer.to_string()));
        assert_eq!(event.refs.provider_subscription.as_deref(), Some("sub_lago_1"));
        assert_eq!(event.refs.product_code.as_deref(), Some("pro-monthly"));
        assert_eq!(
            event.occurred_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 59, 0).unwrap()
        );
    }

    #[test]
    fn started_without_subscription_id_is_malformed() {
        let body = body("subscription.started", "subscription", &json!({ "plan_code": "x" }));
        assert!(matches!(
            adapter().normalize(&webhook(&body, Some(sign(&body)), None)),
            Err(VerificationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn termination_cancels_or_expires() {
        let terminated = |ending_at: Value| {
            normalize(
                "subscription.terminated",
                "subscription",
                &json!({
                    "lago_id": "sub_lago_1",
                    "status": "terminated",
                    "terminated_at": "2024-03-01T00:00:00Z",
                    "ending_at": ending_at
                }),
            )
            .kind
        };
        assert_eq!(terminated(json!("2024-03-01T00:00:00Z")), EventKind::SubscriptionExpired);
        assert_eq!(terminated(json!("2024-06-01T00:00:00Z")), EventKind::SubscriptionCancelled);
        assert_eq!(terminated(Value::Null), EventKind::SubscriptionCancelled);
    }

    #[test]
    fn invoice_payment_statuses() {
        assert_eq!(invoice_payment_status("pending"), PaymentStatus::Pending);
        assert_eq!(invoice_payment_status("succeeded"), PaymentStatus::Completed);
        assert_eq!(invoice_payment_status("failed"), PaymentStatus::Failed);
        assert_eq!(invoice_payment_status("disputed"), PaymentStatus::NeedsReview);
        assert_eq!(subscription_status("pending"), SubscriptionStatus::NeedsReview);
        assert_eq!(subscription_status("sleeping"), SubscriptionStatus::NeedsReview);
    }

    #[test]
    fn invoice_status_update_maps_by_payment_status() {
        let invoice = |payment_status: &str, subscriptions: Value| {
            normalize(
                "invoice.payment_status_updated",
                "invoice",
                &json!({
                    "lago_id": "inv_1",
                    "payment_status": payment_status,
                    "total_amount_cents": 2000,
                    "currency": "EUR",
                    "updated_at": "2024-03-01T10:00:00Z",
                    "customer": { "external_id": "ext" },
                    "subscriptions": subscriptions
                }),
            )
        };

        let subs = json!([{ "lago_id": "sub_lago_1" }]);
        let paid = invoice("succeeded", subs.clone());
        assert_eq!(paid.kind, EventKind::InvoicePaid);
        let payment = paid.refs.payment.unwrap();
        assert_eq!(payment.provider_ref, "inv_1");
        assert_eq!(payment.currency.as_str(), "EUR");
        assert_eq!(paid.refs.customer_id, None);
        assert_eq!(paid.refs.provider_customer.as_deref(), Some("ext"));

        assert_eq!(invoice("failed", subs.clone()).kind, EventKind::InvoicePaymentFailed);
        assert_eq!(invoice("pending", subs).kind, EventKind::PaymentUpdated);
        assert_eq!(invoice("succeeded", json!([])).kind, EventKind::PaymentUpdated);
    }

    #[test]
    fn credit_note_refund() {
        let event = normalize(
            "credit_note.created",
            "credit_note",
            &json!({
                "lago_id": "cn_1",
                "lago_invoice_id": "inv_1",
                "refund_amount_cents": 700,
                "total_amount_cents": 700,
                "currency": "usd",
                "created_at": "2024-03-01T09:00:00Z"
            }),
        );
        assert_eq!(event.kind, EventKind::RefundIssued { amount_minor: 700 });
        assert_eq!(event.refs.payment.unwrap().provider_ref, "inv_1");

        let credit_only = normalize(
            "credit_note.created",
            "credit_note",
            &json!({ "lago_id": "cn_2", "refund_amount_cents": 0, "currency": "usd" }),
        );
        assert!(matches!(credit_only.kind, EventKind::Unhandled { .. }));
    }
}
