//! Product catalog loading.
//!
//! The catalog is a JSON file (`CATALOG_PATH`) seeded into the store at
//! start-up:
//!
//! ```json
//! { "products": [
//!     { "code": "pro-monthly", "name": "Pro", "price_minor": 2000,
//!       "currency": "usd", "interval": "month", "trial_days": 14 }
//! ] }
//! ```
//!
//! Products are matched by `code`. Once a product is stored only its
//! `is_active` flag and `sort_order` are updated from the file.

use std::path::Path;

use serde::Deserialize;

use z_recon_core::{BillingInterval, Currency, Product, ProductId};
use z_recon_store::{Store, StoreError};

/// Error type for catalog loading.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The file could not be read.
    #[error("failed to read catalog {path}: {source}")]
    Io {
        /// Catalog path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a valid catalog.
    #[error("invalid catalog: {0}")]
    Invalid(String),

    /// Writing the catalog failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    products: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    id: Option<ProductId>,
    code: String,
    name: String,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    sort_order: i32,
    price_minor: i64,
    currency: Currency,
    interval: BillingInterval,
    #[serde(default)]
    trial_days: u32,
}

fn default_active() -> bool {
    true
}

/// Parse a catalog document.
pub fn parse_catalog(json: &str) -> Result<Vec<Product>, CatalogError> {
    let file: CatalogFile =
        serde_json::from_str(json).map_err(|e| CatalogError::Invalid(e.to_string()))?;

    let mut products = Vec::with_capacity(file.products.len());
    for entry in file.products {
        if entry.code.trim().is_empty() {
            return Err(CatalogError::Invalid("product code must not be empty".into()));
        }
        if entry.price_minor < 0 {
            return Err(CatalogError::Invalid(format!(
                "product {} has a negative price",
                entry.code
            )));
        }
        if products.iter().any(|p: &Product| p.code == entry.code) {
            return Err(CatalogError::Invalid(format!(
                "duplicate product code {}",
                entry.code
            )));
        }
        products.push(Product {
            id: entry.id.unwrap_or_else(ProductId::generate),
            code: entry.code,
            name: entry.name,
            is_active: entry.is_active,
            sort_order: entry.sort_order,
            price_minor: entry.price_minor,
            currency: entry.currency,
            interval: entry.interval,
            trial_days: entry.trial_days,
        });
    }
    Ok(products)
}

/// Read and parse the catalog at `path`.
pub fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<Product>, CatalogError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_catalog(&json)
}

/// Write `products` to the store. Returns how many records were written.
pub fn seed(store: &dyn Store, products: &[Product]) -> Result<usize, CatalogError> {
    let existing = store.list_products()?;
    let mut written = 0;

    for product in products {
        let record = match existing.iter().find(|p| p.code == product.code) {
            Some(stored) => {
                if stored.is_active == product.is_active && stored.sort_order == product.sort_order
                {
                    continue;
                }
                if stored.price_minor != product.price_minor
                    || stored.currency != product.currency
                    || stored.interval != product.interval
                    || stored.trial_days != product.trial_days
                {
                    tracing::warn!(
                        code = %product.code,
                        "Catalog changes to stored product terms are ignored"
                    );
                }
                Product {
                    is_active: product.is_active,
                    sort_order: product.sort_order,
                    ..stored.clone()
                }
            }
            None => product.clone(),
        };

        store.put_product(&record)?;
        written += 1;
    }

    tracing::info!(products = %products.len(), written = %written, "Catalog seeded");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use z_recon_store::MemoryStore;

    const CATALOG: &str = r#"{
        "products": [
            { "code": "pro-monthly", "name": "Pro", "price_minor": 2000,
              "currency": "usd", "interval": "month", "trial_days": 14, "sort_order": 1 },
            { "code": "team-yearly", "name": "Team", "price_minor": 50000,
              "currency": "USD", "interval": "year", "is_active": false }
        ]
    }"#;

    #[test]
    fn parses_products() {
        let products = parse_catalog(CATALOG).unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].currency.as_str(), "USD");
        assert!(products[0].has_trial());
        assert!(products[0].is_active);
        assert!(!products[1].is_active);
        assert_eq!(products[1].interval, BillingInterval::Year);
    }

    #[test]
    fn rejects_duplicate_codes() {
        let json = r#"{ "products": [
            { "code": "a", "name": "A", "price_minor": 1, "currency": "USD", "interval": "month" },
            { "code": "a", "name": "B", "price_minor": 1, "currency": "USD", "interval": "month" }
        ] }"#;
        assert!(matches!(parse_catalog(json), Err(CatalogError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_currency() {
        let json = r#"{ "products": [
            { "code": "a", "name": "A", "price_minor": 1, "currency": "dollars", "interval": "month" }
        ] }"#;
        assert!(parse_catalog(json).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();
        assert_eq!(load_catalog(file.path()).unwrap().len(), 2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            load_catalog("/nonexistent/catalog.json"),
            Err(CatalogError::Io { .. })
        ));
    }

    #[test]
    fn reseeding_keeps_ids_and_terms() {
        let store = MemoryStore::new();
        let products = parse_catalog(CATALOG).unwrap();
        assert_eq!(seed(&store, &products).unwrap(), 2);
        let first = store.list_products().unwrap();

        let mut changed = parse_catalog(CATALOG).unwrap();
        changed[0].price_minor = 9999;
        changed[0].sort_order = 7;
        assert_eq!(seed(&store, &changed).unwrap(), 1);

        let stored = store
            .list_products()
            .unwrap()
            .into_iter()
            .find(|p| p.code == "pro-monthly")
            .unwrap();
        let original = first.iter().find(|p| p.code == "pro-monthly").unwrap();
        assert_eq!(stored.id, original.id);
        assert_eq!(stored.price_minor, 2000);
        assert_eq!(stored.sort_order, 7);

        assert_eq!(seed(&store, &changed).unwrap(), 0);
    }
}
