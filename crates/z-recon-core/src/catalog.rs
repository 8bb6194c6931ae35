//! Catalog products.
//!
//! Products are owned by catalog management and are read-only to the
//! reconciler. Only `is_active` and `sort_order` may change once a live
//! subscription references a product.

use serde::{Deserialize, Serialize};

use crate::ids::ProductId;
use crate::payment::Currency;

/// Billing interval of a recurring product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    /// Billed every month.
    Month,
    /// Billed every year.
    Year,
}

/// A purchasable plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product ID.
    pub id: ProductId,

    /// Stable plan code (Lago `plan_code`, Stripe `metadata.product_code`).
    pub code: String,

    /// Display name.
    pub name: String,

    /// Whether the product is offered.
    pub is_active: bool,

    /// Display ordering.
    pub sort_order: i32,

    /// Price per interval in minor units.
    pub price_minor: i64,

    /// Price currency.
    pub currency: Currency,

    /// Billing interval.
    pub interval: BillingInterval,

    /// Trial length; zero means subscriptions start `active`.
    #[serde(default)]
    pub trial_days: u32,
}

impl Product {
    /// Whether new subscriptions start in `trialing`.
    #[must_use]
    pub const fn has_trial(&self) -> bool {
        self.trial_days > 0
    }
}
