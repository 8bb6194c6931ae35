//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use chrono::{DateTime, Utc};
use z_recon_core::{
    AuditId, CustomerId, IdempotencyKey, PaymentIntentId, ProductId, ProviderRef, SubscriptionId,
};

/// Create a customer key from a customer ID.
#[must_use]
pub fn customer_key(id: &CustomerId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create an identity index key.
#[must_use]
pub fn identity_key(identity: &str) -> Vec<u8> {
    identity.as_bytes().to_vec()
}

/// Create a provider reference key.
///
/// Format: `provider tag (1 byte) || provider id`
#[must_use]
pub fn provider_ref_key(provider_ref: &ProviderRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + provider_ref.id.len());
    key.push(provider_ref.provider.tag());
    key.extend_from_slice(provider_ref.id.as_bytes());
    key
}

/// Create a product key from a product ID.
#[must_use]
pub fn product_key(id: &ProductId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create a product code index key.
#[must_use]
pub fn product_code_key(code: &str) -> Vec<u8> {
    code.as_bytes().to_vec()
}

/// Create a subscription key from a subscription ID.
#[must_use]
pub fn subscription_key(id: &SubscriptionId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create a live-subscription index key.
///
/// Format: `customer_id (16 bytes) || product_id (16 bytes)`
#[must_use]
pub fn live_subscription_key(customer_id: &CustomerId, product_id: &ProductId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(customer_id.as_bytes());
    key.extend_from_slice(product_id.as_bytes());
    key
}

/// Create a payment key from a payment ID.
#[must_use]
pub fn payment_key(id: &PaymentIntentId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create a customer-payment index key.
///
/// Format: `customer_id (16 bytes) || created_at millis (8 bytes, big-endian) || payment_id (16 bytes)`
///
/// Payments for a customer sort by creation time.
#[must_use]
pub fn customer_payment_key(
    customer_id: &CustomerId,
    created_at: DateTime<Utc>,
    payment_id: &PaymentIntentId,
) -> Vec<u8> {
    // Offset so pre-epoch timestamps still sort before later ones.
    let millis = created_at.timestamp_millis().to_be_bytes();
    let mut ordered = millis;
    ordered[0] ^= 0x80;

    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(customer_id.as_bytes());
    key.extend_from_slice(&ordered);
    key.extend_from_slice(payment_id.as_bytes());
    key
}

/// Create a prefix for iterating all payments for a customer.
#[must_use]
pub fn customer_payments_prefix(customer_id: &CustomerId) -> Vec<u8> {
    customer_id.as_bytes().to_vec()
}

/// Extract the payment ID from a customer-payment index key.
///
/// Returns `None` if the key is not 40 bytes.
#[must_use]
pub fn extract_payment_id_from_customer_key(key: &[u8]) -> Option<PaymentIntentId> {
    let bytes: [u8; 16] = key.get(24..40)?.try_into().ok()?;
    Some(PaymentIntentId::from_bytes(bytes))
}

/// Create a ledger key.
///
/// Format: `provider tag (1 byte) || event_id`
#[must_use]
pub fn ledger_key(key: &IdempotencyKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.event_id.len());
    out.push(key.provider.tag());
    out.extend_from_slice(key.event_id.as_bytes());
    out
}

/// Create an audit key from an audit ID.
#[must_use]
pub fn audit_key(id: &AuditId) -> Vec<u8> {
    id.to_bytes().to_vec()
}
