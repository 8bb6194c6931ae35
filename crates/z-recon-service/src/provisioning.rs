//! Customer provisioning.
//!
//! Every authenticated identity maps to exactly one customer. Concurrent
//! first requests race on the store's unique identity index; the loser reads
//! the winner's record. The welcome notification goes out at most once per
//! customer, and only for records created within the welcome window.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use z_recon_core::{Customer, CustomerProfile, Notification, TemplateKind};
use z_recon_store::{Store, StoreError};

use crate::notify::Dispatcher;

/// Error type for provisioning.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    /// The identity or email is unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of [`Provisioner::get_or_create`].
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// The customer for the identity.
    pub customer: Customer,
    /// Whether this call created the record.
    pub created: bool,
}

/// Creates customers on first sight of an identity.
#[derive(Clone)]
pub struct Provisioner {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    welcome_window: Duration,
}

impl Provisioner {
    /// Create a provisioner.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, dispatcher: Dispatcher, welcome_window: Duration) -> Self {
        Self {
            store,
            dispatcher,
            welcome_window,
        }
    }

    /// Return the customer for `identity`, creating it if needed.
    ///
    /// Must be called from within a Tokio runtime (the welcome notification
    /// is dispatched on a spawned task).
    pub fn get_or_create(
        &self,
        identity: &str,
        email: &str,
        profile: CustomerProfile,
    ) -> Result<Provisioned, ProvisioningError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(ProvisioningError::InvalidInput("identity must not be empty".into()));
        }
        let email = email.trim();
        if !email.contains('@') {
            return Err(ProvisioningError::InvalidInput(format!("invalid email: {email}")));
        }

        let (mut customer, created) = match self.store.find_customer_by_identity(identity)? {
            Some(existing) => (existing, false),
            None => self.insert(Customer::new(identity, email, profile))?,
        };

        let now = Utc::now();
        if customer.welcome_sent_at.is_none()
            && customer.created_within(self.welcome_window, now)
            && self.store.claim_welcome(&customer.id, now)?
        {
            customer.welcome_sent_at = Some(now);
            self.dispatcher.dispatch(vec![Notification::new(
                &customer.email,
                TemplateKind::Welcome,
                json!({ "name": customer.name }),
            )]);
        }

        Ok(Provisioned { customer, created })
    }

    fn insert(&self, customer: Customer) -> Result<(Customer, bool), ProvisioningError> {
        match self.store.insert_customer(&customer) {
            Ok(()) => {
                tracing::info!(
                    customer_id = %customer.id,
                    identity = %customer.external_identity,
                    "Customer created"
                );
                Ok((customer, true))
            }
            Err(StoreError::UniqueViolation(detail)) => {
                tracing::debug!(
                    identity = %customer.external_identity,
                    detail = %detail,
                    "Lost customer creation race, reading winner"
                );
                let winner = self
                    .store
                    .find_customer_by_identity(&customer.external_identity)?
                    .ok_or(StoreError::UniqueViolation(detail))?;
                Ok((winner, false))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use z_recon_store::MemoryStore;

    use crate::notify::{Notifier, NotifyError};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notification>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn provisioner(window: Duration) -> (Provisioner, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(recorder.clone(), StdDuration::from_secs(1), 1);
        (
            Provisioner::new(Arc::new(MemoryStore::new()), dispatcher, window),
            recorder,
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn second_call_returns_the_same_customer() {
        let (provisioner, recorder) = provisioner(Duration::seconds(60));

        let first = provisioner
            .get_or_create("zid|alice", "alice@example.com", CustomerProfile::default())
            .unwrap();
        let second = provisioner
            .get_or_create("zid|alice", "alice@example.com", CustomerProfile::default())
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.customer.id, second.customer.id);

        settle().await;
        let sent = recorder.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template, TemplateKind::Welcome);
    }

    #[tokio::test]
    async fn no_welcome_outside_the_window() {
        let (provisioner, recorder) = provisioner(Duration::seconds(-1));
        provisioner
            .get_or_create("zid|bob", "bob@example.com", CustomerProfile::default())
            .unwrap();
        settle().await;
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_unusable_input() {
        let (provisioner, _) = provisioner(Duration::seconds(60));
        assert!(matches!(
            provisioner.get_or_create(" ", "a@b.c", CustomerProfile::default()),
            Err(ProvisioningError::InvalidInput(_))
        ));
        assert!(matches!(
            provisioner.get_or_create("zid|x", "not-an-email", CustomerProfile::default()),
            Err(ProvisioningError::InvalidInput(_))
        ));
    }
}
