//! API handlers.

pub mod admin;
pub mod customers;
pub mod health;
pub mod webhooks;
