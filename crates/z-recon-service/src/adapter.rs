//! Provider adapters.
//!
//! An adapter verifies an inbound webhook against its provider's signature
//! scheme and translates the verified payload into a [`NormalizedEvent`].
//! Adapters are pure: they never touch storage and never read the clock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use z_recon_core::{NormalizedEvent, Provider};

use crate::config::ServiceConfig;
use crate::lago::LagoAdapter;
use crate::stripe::StripeAdapter;

/// A webhook request as received, before verification.
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    /// Raw request body, exactly as signed.
    pub body: String,
    /// Signature header value.
    pub signature: Option<String>,
    /// Provider delivery id header, when the provider sends one.
    pub delivery_id: Option<String>,
    /// When the request arrived.
    pub received_at: DateTime<Utc>,
}

/// Why a webhook was rejected. Every variant is permanent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// No signature header.
    #[error("missing signature")]
    MissingSignature,

    /// The signature header could not be parsed.
    #[error("malformed signature header: {0}")]
    MalformedSignature(String),

    /// No signature matched the body.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// The signed timestamp is too far from the receive time.
    #[error("signature timestamp {timestamp} outside tolerance of {tolerance_seconds}s")]
    TimestampOutOfTolerance {
        /// Signed unix timestamp.
        timestamp: i64,
        /// Accepted skew.
        tolerance_seconds: u64,
    },

    /// The body was authentic but could not be interpreted.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Translates one provider's webhooks into normalized events.
pub trait ProviderAdapter: Send + Sync {
    /// The provider this adapter handles.
    fn provider(&self) -> Provider;

    /// Verify `webhook` and normalize its payload.
    ///
    /// # Errors
    ///
    /// Returns a `VerificationError` when the signature does not verify or
    /// the verified payload is unusable.
    fn normalize(&self, webhook: &InboundWebhook) -> Result<NormalizedEvent, VerificationError>;
}

/// The configured adapters, one per provider at most.
#[derive(Clone, Default)]
pub struct Adapters {
    by_provider: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl Adapters {
    /// Build the adapters whose webhook secret is configured.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        let mut adapters = Self::default();

        match &config.stripe_webhook_secret {
            Some(secret) => {
                tracing::info!("Stripe webhook enabled");
                adapters = adapters.with(Arc::new(StripeAdapter::new(
                    secret.clone(),
                    config.stripe_signature_tolerance_seconds,
                )));
            }
            None => tracing::warn!("Stripe webhook secret not configured - endpoint disabled"),
        }

        match &config.lago_webhook_secret {
            Some(secret) => {
                tracing::info!("Lago webhook enabled");
                adapters = adapters.with(Arc::new(LagoAdapter::new(secret.clone())));
            }
            None => tracing::warn!("Lago webhook secret not configured - endpoint disabled"),
        }

        adapters
    }

    /// Register `adapter`, replacing any adapter for the same provider.
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.by_provider.insert(adapter.provider(), adapter);
        self
    }

    /// The adapter for `provider`.
    #[must_use]
    pub fn get(&self, provider: Provider) -> Option<&Arc<dyn ProviderAdapter>> {
        self.by_provider.get(&provider)
    }
}

// ============================================================================
// Payload helpers shared by the adapters
// ============================================================================

/// String at a JSON pointer. Empty strings count as absent.
pub(crate) fn text(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Integer at a JSON pointer.
pub(crate) fn int(value: &Value, pointer: &str) -> Option<i64> {
    value.pointer(pointer).and_then(Value::as_i64)
}

/// Unix-seconds timestamp at a JSON pointer.
pub(crate) fn unix_time(value: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    int(value, pointer).and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// RFC 3339 timestamp at a JSON pointer.
pub(crate) fn rfc3339_time(value: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn adapters_follow_configured_secrets() {
        let mut config = ServiceConfig::default();
        assert!(Adapters::from_config(&config).get(Provider::Stripe).is_none());

        config.stripe_webhook_secret = Some("whsec_test".into());
        let adapters = Adapters::from_config(&config);
        assert_eq!(
            adapters.get(Provider::Stripe).map(|a| a.provider()),
            Some(Provider::Stripe)
        );
        assert!(adapters.get(Provider::Lago).is_none());
    }

    #[test]
    fn payload_helpers() {
        let v = json!({
            "a": { "s": "x", "empty": "", "n": 7, "t": 1_700_000_000 },
            "at": "2024-01-02T03:04:05Z"
        });
        assert_eq!(text(&v, "/a/s").as_deref(), Some("x"));
        assert_eq!(text(&v, "/a/empty"), None);
        assert_eq!(int(&v, "/a/n"), Some(7));
        assert_eq!(unix_time(&v, "/a/t").map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(
            rfc3339_time(&v, "/at").map(|t| t.timestamp()),
            Some(1_704_164_645)
        );
        assert_eq!(text(&v, "/missing"), None);
    }
}
