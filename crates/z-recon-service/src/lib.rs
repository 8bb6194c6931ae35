//! Z-Recon HTTP service.
//!
//! This crate turns provider webhooks into committed state changes and
//! exposes the customer-facing and admin read surfaces:
//!
//! - Stripe and Lago webhook ingestion (verification, normalization, reconciliation)
//! - Customer provisioning for authenticated identities
//! - Order history and hosted billing portals
//! - Admin subscription lookup and the review queue
//!
//! # Authentication
//!
//! Capabilities are injected into [`AppState`]:
//!
//! 1. **Identity** - ZID JWT tokens validated against the issuer's JWKS
//! 2. **Admin** - the `X-Admin-Key` header
//!
//! Webhooks authenticate with their provider's signature scheme instead.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers are async for axum even when they never await

pub mod adapter;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod lago;
pub mod maintenance;
pub mod notify;
pub mod portal;
pub mod provisioning;
pub mod reconcile;
pub mod routes;
pub mod state;
pub mod stripe;

pub use adapter::{Adapters, InboundWebhook, ProviderAdapter, VerificationError};
pub use auth::{Admin, AdminResolver, Identity, IdentityResolver};
pub use config::{ServiceConfig, StoreBackend};
pub use error::ApiError;
pub use lago::{LagoAdapter, LagoClient};
pub use notify::{Dispatcher, HttpNotifier, LogNotifier, Notifier, NotifyError};
pub use portal::{BillingPortal, PortalError, ProviderPortal};
pub use provisioning::{Provisioned, Provisioner, ProvisioningError};
pub use reconcile::{Disposition, ReconcileError, Reconciler};
pub use routes::create_router;
pub use state::AppState;
pub use stripe::{StripeAdapter, StripeClient, StripeError};
