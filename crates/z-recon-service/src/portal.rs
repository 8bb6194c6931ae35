//! Hosted billing portals.
//!
//! The portal is opened at the provider that owns the customer's billing
//! reference: a Stripe billing-portal session or the Lago customer portal.

use std::sync::Arc;

use async_trait::async_trait;

use z_recon_core::{Provider, ProviderRef};

use crate::lago::LagoClient;
use crate::stripe::StripeClient;

/// Error type for portal requests.
#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    /// No API client is configured for the provider.
    #[error("{0} API is not configured")]
    NotConfigured(Provider),

    /// The provider refused or failed the request.
    #[error("{provider} portal request failed: {message}")]
    Provider {
        /// Provider that failed.
        provider: Provider,
        /// Error detail.
        message: String,
    },
}

/// Produces hosted billing-portal URLs.
#[async_trait]
pub trait BillingPortal: Send + Sync {
    /// Portal URL for the customer behind `billing_ref`.
    async fn portal_url(
        &self,
        billing_ref: &ProviderRef,
        return_url: &str,
    ) -> Result<String, PortalError>;
}

/// Portal backed by the configured provider API clients.
#[derive(Clone, Default)]
pub struct ProviderPortal {
    stripe: Option<Arc<StripeClient>>,
    lago: Option<Arc<LagoClient>>,
}

impl ProviderPortal {
    /// Create a portal over the given clients.
    #[must_use]
    pub fn new(stripe: Option<Arc<StripeClient>>, lago: Option<Arc<LagoClient>>) -> Self {
        Self { stripe, lago }
    }
}

#[async_trait]
impl BillingPortal for ProviderPortal {
    async fn portal_url(
        &self,
        billing_ref: &ProviderRef,
        return_url: &str,
    ) -> Result<String, PortalError> {
        let provider = billing_ref.provider;
        match provider {
            Provider::Stripe => {
                let stripe = self
                    .stripe
                    .as_ref()
                    .ok_or(PortalError::NotConfigured(provider))?;
                let session = stripe
                    .create_billing_portal_session(&billing_ref.id, return_url)
                    .await
                    .map_err(|e| PortalError::Provider {
                        provider,
                        message: e.to_string(),
                    })?;
                Ok(session.url)
            }
            // Lago portals have no return URL.
            Provider::Lago => {
                let lago = self
                    .lago
                    .as_ref()
                    .ok_or(PortalError::NotConfigured(provider))?;
                lago.customer_portal_url(&billing_ref.id)
                    .await
                    .map_err(|e| PortalError::Provider {
                        provider,
                        message: e.to_string(),
                    })
            }
        }
    }
}
