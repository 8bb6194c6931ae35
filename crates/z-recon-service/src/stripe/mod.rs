//! Stripe integration.
//!
//! Stripe delivers checkout, invoice, subscription, payment intent and charge
//! webhooks signed with `Stripe-Signature`. The client is only used to open
//! billing-portal sessions.

pub mod adapter;
pub mod client;
pub mod types;

pub use adapter::StripeAdapter;
pub use client::{StripeClient, StripeError};
