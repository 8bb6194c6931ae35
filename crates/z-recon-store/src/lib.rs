//! Transactional storage layer for z-recon.
//!
//! The reconciler needs a row store with unique constraints and an atomic
//! unit of work: the ledger reservation, the state writes and the ledger
//! record of one event must commit together or not at all. [`Store`] exposes
//! the reads and the few self-contained writes the HTTP surface needs, and
//! [`Store::transact`] runs a closure against a [`UnitOfWork`].
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: everything behind one lock; units of work are serialized.
//! - `RocksStore` (feature `rocksdb-backend`): a pessimistic `TransactionDB`
//!   where every read inside a unit of work takes an exclusive row lock.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use z_recon_core::{IdempotencyKey, IdempotencyRecord, LedgerCheck, Outcome, Provider};
//! use z_recon_store::{transact, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let key = IdempotencyKey::new(Provider::Stripe, "evt_1");
//! let record = IdempotencyRecord {
//!     key: key.clone(),
//!     event_kind: "unhandled".to_string(),
//!     outcome: Outcome::Ignored { reason: "example".to_string() },
//!     processed_at: Utc::now(),
//! };
//!
//! let first = transact(&store, |uow| {
//!     let check = uow.check_and_reserve(&key)?;
//!     uow.complete(&record)?;
//!     Ok(check)
//! })
//! .unwrap();
//! assert_eq!(first, LedgerCheck::Fresh);
//!
//! let second = transact(&store, |uow| uow.check_and_reserve(&key)).unwrap();
//! assert_eq!(second, LedgerCheck::AlreadyProcessed(record));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
mod ledger;
pub mod memory;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use z_recon_core::{
    AuditRecord, Customer, CustomerId, IdempotencyKey, IdempotencyRecord, LedgerCheck,
    PaymentIntent, Product, ProductId, ProviderRef, Subscription, SubscriptionId,
};

/// The storage trait for operations outside a unit of work.
pub trait Store: Send + Sync {
    // =========================================================================
    // Customers
    // =========================================================================

    /// Insert a new customer.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if a customer with the same
    /// external identity (or ID) already exists.
    fn insert_customer(&self, customer: &Customer) -> Result<()>;

    /// Get a customer by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>>;

    /// Find the customer for an external auth identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_customer_by_identity(&self, identity: &str) -> Result<Option<Customer>>;

    /// Set `welcome_sent_at` if it is still unset.
    ///
    /// Returns `true` for exactly one caller per customer.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the customer doesn't exist.
    fn claim_welcome(&self, id: &CustomerId, at: DateTime<Utc>) -> Result<bool>;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Insert or update a product.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if another product uses the same code.
    fn put_product(&self, product: &Product) -> Result<()>;

    /// Get a product by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_product(&self, id: &ProductId) -> Result<Option<Product>>;

    /// List all products by `sort_order`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_products(&self) -> Result<Vec<Product>>;

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a subscription by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>>;

    /// List a customer's payment intents, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_payments_by_customer(
        &self,
        customer_id: &CustomerId,
        limit: usize,
    ) -> Result<Vec<PaymentIntent>>;

    /// Get the ledger record for a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_ledger_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;

    /// List audit records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_audit(&self, limit: usize) -> Result<Vec<AuditRecord>>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Delete ledger records processed before `before`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn prune_ledger(&self, before: DateTime<Utc>) -> Result<usize>;

    // =========================================================================
    // Units of work
    // =========================================================================

    /// Run `work` as one atomic unit of work.
    ///
    /// Everything `work` writes is committed when it returns `Ok` and every
    /// ledger reservation it made was completed. Otherwise nothing is
    /// visible.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, `StoreError::ReservationNotCompleted`, or
    /// `StoreError::Conflict` when the backend could not serialize the unit.
    fn transact(&self, work: &mut dyn FnMut(&mut dyn UnitOfWork) -> Result<()>) -> Result<()>;
}

/// Operations available inside one atomic unit of work.
pub trait UnitOfWork {
    /// Reserve a ledger key.
    ///
    /// Returns `LedgerCheck::AlreadyProcessed` with the committed record when
    /// the key is known. A `Fresh` reservation must be followed by
    /// [`UnitOfWork::complete`] before the unit of work ends, or the unit of
    /// work fails with `StoreError::ReservationNotCompleted`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn check_and_reserve(&mut self, key: &IdempotencyKey) -> Result<LedgerCheck>;

    /// Write the ledger record for a reserved key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotReserved` if the key was not reserved as
    /// `Fresh` in this unit of work, or was already completed.
    fn complete(&mut self, record: &IdempotencyRecord) -> Result<()>;

    /// Get a customer by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_customer(&mut self, id: &CustomerId) -> Result<Option<Customer>>;

    /// Find a customer by billing-provider reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_customer_by_billing_ref(&mut self, billing_ref: &ProviderRef)
        -> Result<Option<Customer>>;

    /// Get a product by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_product(&mut self, id: &ProductId) -> Result<Option<Product>>;

    /// Find a product by code.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_product_by_code(&mut self, code: &str) -> Result<Option<Product>>;

    /// Find a subscription by provider reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_subscription_by_provider_ref(
        &mut self,
        provider_ref: &ProviderRef,
    ) -> Result<Option<Subscription>>;

    /// Find the live subscription for a `(customer, product)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_live_subscription(
        &mut self,
        customer_id: &CustomerId,
        product_id: &ProductId,
    ) -> Result<Option<Subscription>>;

    /// Find a payment intent by provider reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_payment_by_provider_ref(
        &mut self,
        provider_ref: &ProviderRef,
    ) -> Result<Option<PaymentIntent>>;

    /// Insert or update a customer, maintaining the billing-ref index.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if the billing ref belongs to
    /// another customer.
    fn put_customer(&mut self, customer: &Customer) -> Result<()>;

    /// Insert or update a subscription, maintaining its indexes.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if the provider reference
    /// belongs to another subscription, or another live subscription exists
    /// for the same `(customer, product)` pair.
    fn put_subscription(&mut self, subscription: &Subscription) -> Result<()>;

    /// Insert or update a payment intent, maintaining its indexes.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if the provider reference
    /// belongs to another payment intent.
    fn put_payment(&mut self, payment: &PaymentIntent) -> Result<()>;

    /// Insert an audit record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_audit(&mut self, record: &AuditRecord) -> Result<()>;
}

/// Run `work` in a unit of work and return its value.
///
/// # Errors
///
/// See [`Store::transact`].
pub fn transact<S, T, F>(store: &S, mut work: F) -> Result<T>
where
    S: Store + ?Sized,
    F: FnMut(&mut dyn UnitOfWork) -> Result<T>,
{
    let mut output = None;
    store.transact(&mut |uow| {
        output = Some(work(uow)?);
        Ok(())
    })?;
    output.ok_or_else(|| StoreError::Database("unit of work produced no value".to_string()))
}
