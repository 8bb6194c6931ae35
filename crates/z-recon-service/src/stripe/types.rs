//! Stripe API and webhook types.

use serde::{Deserialize, Serialize};

/// Webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Event ID (`evt_...`).
    pub id: String,
    /// Event type (e.g., "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookData,
    /// Created timestamp (unix seconds).
    pub created: i64,
    /// Whether the event comes from live mode.
    #[serde(default)]
    pub livemode: bool,
}

/// Webhook event data.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    /// The object the event is about, in its shape at event time.
    pub object: serde_json::Value,
}

/// Billing portal session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPortalSession {
    /// Session ID (`bps_...`).
    pub id: String,
    /// Customer ID.
    pub customer: String,
    /// Short-lived portal URL.
    pub url: String,
}

/// Stripe API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorResponse {
    /// Error details.
    pub error: StripeErrorDetail,
}

/// Stripe error detail.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorDetail {
    /// Error type.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error message.
    pub message: String,
    /// Error code.
    #[serde(default)]
    pub code: Option<String>,
}
