//! Application state.

use std::sync::Arc;

use z_recon_store::Store;

use crate::adapter::{Adapters, ProviderAdapter};
use crate::auth::{AdminKeyResolver, AdminResolver, IdentityResolver, JwksIdentityResolver};
use crate::config::ServiceConfig;
use crate::lago::LagoClient;
use crate::notify::{Dispatcher, Notifier};
use crate::portal::{BillingPortal, ProviderPortal};
use crate::provisioning::Provisioner;
use crate::reconcile::Reconciler;
use crate::stripe::StripeClient;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Webhook adapters for the enabled providers.
    pub adapters: Adapters,

    /// Post-commit notification delivery.
    pub dispatcher: Dispatcher,

    /// Hosted billing portals.
    pub portal: Arc<dyn BillingPortal>,

    /// Who is calling.
    pub identity: Arc<dyn IdentityResolver>,

    /// Whether the caller is an admin.
    pub admin: Arc<dyn AdminResolver>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        // Create Stripe client if configured
        let stripe = config.stripe_api_key.as_ref().and_then(|key| {
            match StripeClient::new(key) {
                Ok(client) => {
                    tracing::info!("Stripe API enabled");
                    Some(Arc::new(client.with_base_url(&config.stripe_api_url)))
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create Stripe client");
                    None
                }
            }
        });

        if stripe.is_none() {
            tracing::warn!("Stripe API not configured - Stripe billing portal unavailable");
        }

        // Create Lago client if configured
        let lago = config
            .lago_api_url
            .as_ref()
            .zip(config.lago_api_key.as_ref())
            .and_then(|(url, key)| match LagoClient::new(url, key) {
                Ok(client) => {
                    tracing::info!(lago_url = %url, "Lago API enabled");
                    Some(Arc::new(client))
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create Lago client");
                    None
                }
            });

        if lago.is_none() {
            tracing::warn!("Lago API not configured - Lago customer portal unavailable");
        }

        Self {
            adapters: Adapters::from_config(&config),
            dispatcher: Dispatcher::from_config(&config),
            portal: Arc::new(ProviderPortal::new(stripe, lago)),
            identity: Arc::new(JwksIdentityResolver::from_config(&config)),
            admin: Arc::new(AdminKeyResolver::new(config.admin_api_key.clone())),
            store,
            config,
        }
    }

    /// Replace the notification sink, keeping the configured retry policy.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Send notifications through `notifier` with the configured retry policy.
    #[must_use]
    pub fn with_notifier(self, notifier: Arc<dyn Notifier>) -> Self {
        let dispatcher = Dispatcher::new(
            notifier,
            std::time::Duration::from_secs(self.config.notify_timeout_seconds),
            self.config.notify_max_attempts,
        );
        self.with_dispatcher(dispatcher)
    }

    /// Register or replace a webhook adapter.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters = self.adapters.with(adapter);
        self
    }

    /// Replace the identity capability.
    #[must_use]
    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = resolver;
        self
    }

    /// Replace the admin capability.
    #[must_use]
    pub fn with_admin_resolver(mut self, resolver: Arc<dyn AdminResolver>) -> Self {
        self.admin = resolver;
        self
    }

    /// Replace the billing portal.
    #[must_use]
    pub fn with_portal(mut self, portal: Arc<dyn BillingPortal>) -> Self {
        self.portal = portal;
        self
    }

    /// The webhook reconciler over this state.
    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.store),
            self.adapters.clone(),
            self.dispatcher.clone(),
            self.config.webhook_deadline(),
        )
    }

    /// The customer provisioner over this state.
    #[must_use]
    pub fn provisioner(&self) -> Provisioner {
        Provisioner::new(
            Arc::clone(&self.store),
            self.dispatcher.clone(),
            self.config.welcome_window(),
        )
    }
}
