//! Core types for z-recon.
//!
//! This crate holds the canonical model every payment provider is reconciled
//! into, plus the pure state machine that applies provider events to it:
//!
//! - **Identifiers**: `CustomerId`, `ProductId`, `SubscriptionId`, `PaymentIntentId`, `AuditId`
//! - **Records**: `Customer`, `Product`, `PaymentIntent`, `Subscription`
//! - **Events**: `NormalizedEvent`, `EventKind`, `EntityRefs`
//! - **Ledger**: `IdempotencyKey`, `IdempotencyRecord`, `Outcome`, `AuditRecord`
//! - **Machine**: `decide`, `Snapshot`, `Decision`
//!
//! # Amounts
//!
//! Money is stored as `i64` minor units of the record's currency
//! (2000 with currency `USD` is $20.00).

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod customer;
pub mod error;
pub mod event;
pub mod ids;
pub mod ledger;
pub mod machine;
pub mod notification;
pub mod payment;
pub mod provider;
pub mod subscription;

pub use catalog::{BillingInterval, Product};
pub use customer::{Customer, CustomerProfile};
pub use error::{CoreError, Result};
pub use event::{EntityRefs, EventKind, NormalizedEvent, PaymentDetails};
pub use ids::{AuditId, CustomerId, IdError, PaymentIntentId, ProductId, SubscriptionId};
pub use ledger::{
    AuditRecord, IdempotencyKey, IdempotencyRecord, LedgerCheck, Outcome, PaymentChange,
    ReviewReason, SubscriptionChange,
};
pub use machine::{decide, Decision, IllegalTransition, Snapshot, Writes};
pub use notification::{Notification, TemplateKind};
pub use payment::{Currency, PaymentIntent, PaymentStatus};
pub use provider::{Provider, ProviderRef};
pub use subscription::{
    Period, RejectedCommand, Subscription, SubscriptionCommand, SubscriptionStatus,
};
