//! Notification dispatch.
//!
//! Notifications are sent only after the state change they announce has
//! committed. Delivery runs on spawned tasks with a per-attempt timeout and
//! bounded exponential backoff; a delivery that keeps failing is logged and
//! dropped, never surfaced to the webhook caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use tokio::task::JoinHandle;

use z_recon_core::Notification;

use crate::config::ServiceConfig;

/// Initial backoff between attempts (doubles with each attempt).
const NOTIFY_INITIAL_BACKOFF_MS: u64 = 200;

/// Maximum backoff between attempts.
const NOTIFY_MAX_BACKOFF_MS: u64 = 10_000;

/// Error type for notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink answered with a non-success status.
    #[error("notification sink returned HTTP {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// The attempt did not finish in time.
    #[error("notification attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl NotifyError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected { status } => *status == 429 || *status >= 500,
            Self::Http(_) | Self::Timeout(_) => true,
        }
    }
}

/// A transactional notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts notifications as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpNotifier {
    /// Create a notifier posting to `url`.
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(notification);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected {
                status: response.status().as_u16(),
            })
        }
    }
}

/// Logs notifications instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            to = %notification.to,
            template = %notification.template,
            "Notification (log only)"
        );
        Ok(())
    }
}

/// Delivers notifications in the background with retries.
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    attempt_timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over `notifier`.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, attempt_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            notifier,
            attempt_timeout,
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(NOTIFY_INITIAL_BACKOFF_MS),
        }
    }

    /// Create the dispatcher the configuration asks for.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        let notifier: Arc<dyn Notifier> = match &config.notify_url {
            Some(url) => match HttpNotifier::new(url, config.notify_api_key.clone()) {
                Ok(notifier) => {
                    tracing::info!(notify_url = %url, "Notification delivery enabled");
                    Arc::new(notifier)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create notification client");
                    Arc::new(LogNotifier)
                }
            },
            None => {
                tracing::warn!("NOTIFY_URL not configured - notifications will only be logged");
                Arc::new(LogNotifier)
            }
        };

        Self::new(
            notifier,
            Duration::from_secs(config.notify_timeout_seconds),
            config.notify_max_attempts,
        )
    }

    /// Deliver `notifications` on a spawned task.
    ///
    /// Must be called from within a Tokio runtime. Returns `None` when there
    /// is nothing to send.
    pub fn dispatch(&self, notifications: Vec<Notification>) -> Option<JoinHandle<()>> {
        if notifications.is_empty() {
            return None;
        }

        let dispatcher = self.clone();
        Some(tokio::spawn(async move {
            join_all(notifications.iter().map(|n| dispatcher.deliver(n))).await;
        }))
    }

    /// Deliver one notification, retrying retryable failures.
    pub async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            attempt += 1;
            let result = tokio::time::timeout(self.attempt_timeout, self.notifier.send(notification))
                .await
                .unwrap_or(Err(NotifyError::Timeout(self.attempt_timeout)));

            match result {
                Ok(()) => {
                    tracing::debug!(
                        to = %notification.to,
                        template = %notification.template,
                        attempt = %attempt,
                        "Notification delivered"
                    );
                    return Ok(());
                }
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => {
                    tracing::warn!(
                        to = %notification.to,
                        template = %notification.template,
                        attempt = %attempt,
                        error = %e,
                        "Notification dropped"
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(
                        template = %notification.template,
                        attempt = %attempt,
                        backoff_ms = %backoff.as_millis(),
                        error = %e,
                        "Notification failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(NOTIFY_MAX_BACKOFF_MS));
                }
            }
        }
    }
}
