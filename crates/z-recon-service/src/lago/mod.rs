//! Lago integration.
//!
//! Lago delivers subscription, invoice and credit-note webhooks signed with
//! `X-Lago-Signature`. The client is only used to fetch customer portal URLs.

pub mod adapter;
pub mod client;
pub mod types;

pub use adapter::LagoAdapter;
pub use client::{LagoClient, LagoError};
