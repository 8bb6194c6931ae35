//! Lago API and webhook types.

use serde::Deserialize;

/// Webhook envelope. The payload object sits under the key named by
/// `object_type`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Webhook type (e.g., "subscription.started").
    pub webhook_type: String,
    /// Key of the payload object.
    pub object_type: String,
}

/// Customer portal response.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalUrlResponse {
    /// Wrapped customer.
    pub customer: PortalUrlCustomer,
}

/// Customer portal URL.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalUrlCustomer {
    /// Portal URL.
    pub portal_url: String,
}

/// Lago API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct LagoErrorResponse {
    /// HTTP status.
    pub status: u16,
    /// Error message.
    pub error: String,
    /// Error code.
    #[serde(default)]
    pub code: Option<String>,
    /// Error details.
    #[serde(default)]
    pub error_details: Option<serde_json::Value>,
}
