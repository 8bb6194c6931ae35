//! Post-commit notifications.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which message template the notification sink should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// First sign-in.
    Welcome,
    /// A subscription was created.
    SubscriptionStarted,
    /// A payment was captured.
    PaymentReceipt,
    /// A payment failed.
    PaymentFailed,
    /// A subscription ended (cancelled or expired).
    SubscriptionCancelled,
    /// Money was returned.
    RefundIssued,
}

impl TemplateKind {
    /// Template name as sent to the sink.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TemplateKind::Welcome => "welcome",
            TemplateKind::SubscriptionStarted => "subscription_started",
            TemplateKind::PaymentReceipt => "payment_receipt",
            TemplateKind::PaymentFailed => "payment_failed",
            TemplateKind::SubscriptionCancelled => "subscription_cancelled",
            TemplateKind::RefundIssued => "refund_issued",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message for the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Recipient email.
    pub to: String,
    /// Template to render.
    pub template: TemplateKind,
    /// Template variables.
    pub data: serde_json::Value,
}

impl Notification {
    /// Build a notification.
    #[must_use]
    pub fn new(to: impl Into<String>, template: TemplateKind, data: serde_json::Value) -> Self {
        Self {
            to: to.into(),
            template,
            data,
        }
    }
}
