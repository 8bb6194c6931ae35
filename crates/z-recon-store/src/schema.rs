//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Customer records, keyed by `customer_id`.
    pub const CUSTOMERS: &str = "customers";

    /// Index: external auth identity → `customer_id`.
    pub const CUSTOMERS_BY_IDENTITY: &str = "customers_by_identity";

    /// Index: billing-provider customer ref → `customer_id`.
    pub const CUSTOMERS_BY_BILLING_REF: &str = "customers_by_billing_ref";

    /// Catalog products, keyed by `product_id`.
    pub const PRODUCTS: &str = "products";

    /// Index: product code → `product_id`.
    pub const PRODUCTS_BY_CODE: &str = "products_by_code";

    /// Subscriptions, keyed by `subscription_id`.
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Index: provider subscription ref → `subscription_id`.
    pub const SUBSCRIPTIONS_BY_PROVIDER_REF: &str = "subscriptions_by_provider_ref";

    /// Unique index: `customer_id || product_id` → live `subscription_id`.
    pub const LIVE_SUBSCRIPTIONS: &str = "live_subscriptions";

    /// Payment intents, keyed by `payment_id`.
    pub const PAYMENTS: &str = "payments";

    /// Index: provider payment ref → `payment_id`.
    pub const PAYMENTS_BY_PROVIDER_REF: &str = "payments_by_provider_ref";

    /// Index: payments by customer, keyed by `customer_id || created_at || payment_id`.
    /// Value is empty (index only).
    pub const PAYMENTS_BY_CUSTOMER: &str = "payments_by_customer";

    /// Idempotency ledger, keyed by `provider tag || event_id`.
    pub const LEDGER: &str = "ledger";

    /// Audit records, keyed by `audit_id` (ULID).
    pub const AUDIT: &str = "audit";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::CUSTOMERS,
        cf::CUSTOMERS_BY_IDENTITY,
        cf::CUSTOMERS_BY_BILLING_REF,
        cf::PRODUCTS,
        cf::PRODUCTS_BY_CODE,
        cf::SUBSCRIPTIONS,
        cf::SUBSCRIPTIONS_BY_PROVIDER_REF,
        cf::LIVE_SUBSCRIPTIONS,
        cf::PAYMENTS,
        cf::PAYMENTS_BY_PROVIDER_REF,
        cf::PAYMENTS_BY_CUSTOMER,
        cf::LEDGER,
        cf::AUDIT,
    ]
}
