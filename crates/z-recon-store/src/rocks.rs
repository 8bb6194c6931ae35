//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait on
//! top of a pessimistic `TransactionDB`. Every read inside a unit of work uses
//! `get_for_update`, so two units of work touching the same ledger key or
//! record serialize on its row lock: the second one blocks until the first
//! commits and then sees its writes.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, MultiThreaded,
    Options, Transaction, TransactionDB, TransactionDBOptions,
};
use z_recon_core::{
    AuditRecord, Customer, CustomerId, IdempotencyKey, IdempotencyRecord, LedgerCheck,
    PaymentIntent, PaymentIntentId, Product, ProductId, ProviderRef, Subscription,
    SubscriptionId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::ledger::Reservations;
use crate::schema::{all_column_families, cf};
use crate::{Store, UnitOfWork};

/// How long a unit of work waits for a row lock before giving up.
const LOCK_TIMEOUT_MS: i64 = 2_000;

fn db_err(e: &rocksdb::Error) -> StoreError {
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
            StoreError::Conflict(e.to_string())
        }
        _ => StoreError::Database(e.to_string()),
    }
}

fn id_bytes(data: &[u8]) -> Result<[u8; 16]> {
    data.try_into()
        .map_err(|_| StoreError::Serialization(format!("index value of {} bytes", data.len())))
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<TransactionDB<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(LOCK_TIMEOUT_MS);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = TransactionDB::open_cf_descriptors(&opts, &txn_opts, path, cf_descriptors)
            .map_err(|e| db_err(&e))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Read a record outside any unit of work.
    fn get<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| db_err(&e))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Run `f` in a transaction and commit it.
    fn run<T>(&self, f: impl FnOnce(&mut RocksUnitOfWork<'_>) -> Result<T>) -> Result<T> {
        let mut uow = RocksUnitOfWork {
            store: self,
            txn: self.db.transaction(),
            reservations: Reservations::default(),
        };
        let value = f(&mut uow)?;
        uow.reservations.finish()?;
        uow.txn.commit().map_err(|e| db_err(&e))?;
        Ok(value)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Customers
    // =========================================================================

    fn insert_customer(&self, customer: &Customer) -> Result<()> {
        self.run(|uow| {
            let identity_key = keys::identity_key(&customer.external_identity);
            if uow.read_raw(cf::CUSTOMERS_BY_IDENTITY, &identity_key)?.is_some() {
                return Err(StoreError::UniqueViolation(format!(
                    "external identity {}",
                    customer.external_identity
                )));
            }
            if uow.get_customer(&customer.id)?.is_some() {
                return Err(StoreError::UniqueViolation(format!("customer {}", customer.id)));
            }
            uow.put_customer(customer)?;
            uow.write_raw(cf::CUSTOMERS_BY_IDENTITY, &identity_key, customer.id.as_bytes())
        })
    }

    fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>> {
        self.get(cf::CUSTOMERS, &keys::customer_key(id))
    }

    fn find_customer_by_identity(&self, identity: &str) -> Result<Option<Customer>> {
        let cf = self.cf(cf::CUSTOMERS_BY_IDENTITY)?;
        let Some(data) = self
            .db
            .get_cf(&cf, keys::identity_key(identity))
            .map_err(|e| db_err(&e))?
        else {
            return Ok(None);
        };
        self.get_customer(&CustomerId::from_bytes(id_bytes(&data)?))
    }

    fn claim_welcome(&self, id: &CustomerId, at: DateTime<Utc>) -> Result<bool> {
        self.run(|uow| {
            let mut customer = uow.get_customer(id)?.ok_or(StoreError::NotFound)?;
            if customer.welcome_sent_at.is_some() {
                return Ok(false);
            }
            customer.welcome_sent_at = Some(at);
            customer.updated_at = at;
            uow.write(cf::CUSTOMERS, &keys::customer_key(id), &customer)?;
            Ok(true)
        })
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    fn put_product(&self, product: &Product) -> Result<()> {
        self.run(|uow| {
            let code_key = keys::product_code_key(&product.code);
            if let Some(owner) = uow.read_raw(cf::PRODUCTS_BY_CODE, &code_key)? {
                if ProductId::from_bytes(id_bytes(&owner)?) != product.id {
                    return Err(StoreError::UniqueViolation(format!(
                        "product code {}",
                        product.code
                    )));
                }
            }
            if let Some(previous) = uow.get_product(&product.id)? {
                if previous.code != product.code {
                    uow.delete(cf::PRODUCTS_BY_CODE, &keys::product_code_key(&previous.code))?;
                }
            }
            uow.write(cf::PRODUCTS, &keys::product_key(&product.id), product)?;
            uow.write_raw(cf::PRODUCTS_BY_CODE, &code_key, product.id.as_bytes())
        })
    }

    fn get_product(&self, id: &ProductId) -> Result<Option<Product>> {
        self.get(cf::PRODUCTS, &keys::product_key(id))
    }

    fn list_products(&self) -> Result<Vec<Product>> {
        let cf = self.cf(cf::PRODUCTS)?;
        let mut products = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| db_err(&e))?;
            products.push(Self::deserialize::<Product>(&value)?);
        }
        products.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.code.cmp(&b.code)));
        Ok(products)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        self.get(cf::SUBSCRIPTIONS, &keys::subscription_key(id))
    }

    fn list_payments_by_customer(
        &self,
        customer_id: &CustomerId,
        limit: usize,
    ) -> Result<Vec<PaymentIntent>> {
        let cf_by_customer = self.cf(cf::PAYMENTS_BY_CUSTOMER)?;
        let prefix = keys::customer_payments_prefix(customer_id);

        let iter = self.db.iterator_cf(
            &cf_by_customer,
            IteratorMode::From(&prefix, Direction::Forward),
        );

        // Index keys sort by creation time; collect then walk newest first.
        let mut all_keys: Vec<Vec<u8>> = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| db_err(&e))?;
            if !key.starts_with(&prefix) {
                break;
            }
            all_keys.push(key.to_vec());
        }

        let mut payments = Vec::new();
        for key in all_keys.iter().rev() {
            if payments.len() >= limit {
                break;
            }
            let Some(payment_id) = keys::extract_payment_id_from_customer_key(key) else {
                continue;
            };
            if let Some(payment) = self.get(cf::PAYMENTS, &keys::payment_key(&payment_id))? {
                payments.push(payment);
            }
        }

        Ok(payments)
    }

    fn get_ledger_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        self.get(cf::LEDGER, &keys::ledger_key(key))
    }

    fn list_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let cf = self.cf(cf::AUDIT)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::End) {
            if records.len() >= limit {
                break;
            }
            let (_, value) = item.map_err(|e| db_err(&e))?;
            records.push(Self::deserialize(&value)?);
        }
        Ok(records)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    fn prune_ledger(&self, before: DateTime<Utc>) -> Result<usize> {
        let cf = self.cf(cf::LEDGER)?;
        let mut expired = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| db_err(&e))?;
            let record: IdempotencyRecord = Self::deserialize(&value)?;
            if record.processed_at < before {
                expired.push(key.to_vec());
            }
        }

        let count = expired.len();
        self.run(|uow| {
            for key in &expired {
                uow.delete(cf::LEDGER, key)?;
            }
            Ok(())
        })?;
        Ok(count)
    }

    // =========================================================================
    // Units of work
    // =========================================================================

    fn transact(&self, work: &mut dyn FnMut(&mut dyn UnitOfWork) -> Result<()>) -> Result<()> {
        self.run(|uow| work(uow))
    }
}

struct RocksUnitOfWork<'a> {
    store: &'a RocksStore,
    txn: Transaction<'a, TransactionDB<MultiThreaded>>,
    reservations: Reservations,
}

impl RocksUnitOfWork<'_> {
    /// Read raw bytes under an exclusive row lock.
    fn read_raw(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.store.cf(cf_name)?;
        self.txn
            .get_for_update_cf(&cf, key, true)
            .map_err(|e| db_err(&e))
    }

    /// Read a record under an exclusive row lock.
    fn read<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        self.read_raw(cf_name, key)?
            .map(|data| RocksStore::deserialize(&data))
            .transpose()
    }

    /// Follow an index entry holding a 16-byte ID.
    fn read_index(&self, cf_name: &str, key: &[u8]) -> Result<Option<[u8; 16]>> {
        self.read_raw(cf_name, key)?
            .map(|data| id_bytes(&data))
            .transpose()
    }

    fn read_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        self.read(cf::SUBSCRIPTIONS, &keys::subscription_key(id))
    }

    fn write_raw(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.store.cf(cf_name)?;
        self.txn.put_cf(&cf, key, value).map_err(|e| db_err(&e))
    }

    fn write<T: serde::Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        self.write_raw(cf_name, key, &RocksStore::serialize(value)?)
    }

    fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.store.cf(cf_name)?;
        self.txn.delete_cf(&cf, key).map_err(|e| db_err(&e))
    }
}

impl UnitOfWork for RocksUnitOfWork<'_> {
    fn check_and_reserve(&mut self, key: &IdempotencyKey) -> Result<LedgerCheck> {
        if let Some(record) = self.read(cf::LEDGER, &keys::ledger_key(key))? {
            return Ok(LedgerCheck::AlreadyProcessed(record));
        }
        self.reservations.reserve(key);
        Ok(LedgerCheck::Fresh)
    }

    fn complete(&mut self, record: &IdempotencyRecord) -> Result<()> {
        self.reservations.complete(&record.key)?;
        self.write(cf::LEDGER, &keys::ledger_key(&record.key), record)
    }

    fn get_customer(&mut self, id: &CustomerId) -> Result<Option<Customer>> {
        self.read(cf::CUSTOMERS, &keys::customer_key(id))
    }

    fn find_customer_by_billing_ref(
        &mut self,
        billing_ref: &ProviderRef,
    ) -> Result<Option<Customer>> {
        match self.read_index(cf::CUSTOMERS_BY_BILLING_REF, &keys::provider_ref_key(billing_ref))? {
            Some(id) => self.get_customer(&CustomerId::from_bytes(id)),
            None => Ok(None),
        }
    }

    fn get_product(&mut self, id: &ProductId) -> Result<Option<Product>> {
        self.read(cf::PRODUCTS, &keys::product_key(id))
    }

    fn find_product_by_code(&mut self, code: &str) -> Result<Option<Product>> {
        match self.read_index(cf::PRODUCTS_BY_CODE, &keys::product_code_key(code))? {
            Some(id) => self.get_product(&ProductId::from_bytes(id)),
            None => Ok(None),
        }
    }

    fn find_subscription_by_provider_ref(
        &mut self,
        provider_ref: &ProviderRef,
    ) -> Result<Option<Subscription>> {
        let key = keys::provider_ref_key(provider_ref);
        match self.read_index(cf::SUBSCRIPTIONS_BY_PROVIDER_REF, &key)? {
            Some(id) => self.read_subscription(&SubscriptionId::from_bytes(id)),
            None => Ok(None),
        }
    }

    fn find_live_subscription(
        &mut self,
        customer_id: &CustomerId,
        product_id: &ProductId,
    ) -> Result<Option<Subscription>> {
        let key = keys::live_subscription_key(customer_id, product_id);
        match self.read_index(cf::LIVE_SUBSCRIPTIONS, &key)? {
            Some(id) => self.read_subscription(&SubscriptionId::from_bytes(id)),
            None => Ok(None),
        }
    }

    fn find_payment_by_provider_ref(
        &mut self,
        provider_ref: &ProviderRef,
    ) -> Result<Option<PaymentIntent>> {
        let key = keys::provider_ref_key(provider_ref);
        match self.read_index(cf::PAYMENTS_BY_PROVIDER_REF, &key)? {
            Some(id) => self.read(cf::PAYMENTS, &keys::payment_key(&PaymentIntentId::from_bytes(id))),
            None => Ok(None),
        }
    }

    fn put_customer(&mut self, customer: &Customer) -> Result<()> {
        if let Some(billing_ref) = &customer.billing_ref {
            let key = keys::provider_ref_key(billing_ref);
            if let Some(owner) = self.read_index(cf::CUSTOMERS_BY_BILLING_REF, &key)? {
                if CustomerId::from_bytes(owner) != customer.id {
                    return Err(StoreError::UniqueViolation(format!("billing ref {billing_ref}")));
                }
            }
            self.write_raw(cf::CUSTOMERS_BY_BILLING_REF, &key, customer.id.as_bytes())?;
        }
        self.write(cf::CUSTOMERS, &keys::customer_key(&customer.id), customer)
    }

    fn put_subscription(&mut self, subscription: &Subscription) -> Result<()> {
        let provider_ref = subscription.provider_ref();
        let ref_key = keys::provider_ref_key(&provider_ref);
        if let Some(owner) = self.read_index(cf::SUBSCRIPTIONS_BY_PROVIDER_REF, &ref_key)? {
            if SubscriptionId::from_bytes(owner) != subscription.id {
                return Err(StoreError::UniqueViolation(format!(
                    "subscription ref {provider_ref}"
                )));
            }
        }

        let live_key =
            keys::live_subscription_key(&subscription.customer_id, &subscription.product_id);
        let live_owner = self
            .read_index(cf::LIVE_SUBSCRIPTIONS, &live_key)?
            .map(SubscriptionId::from_bytes);
        if subscription.status.is_live() {
            if let Some(owner) = live_owner {
                if owner != subscription.id {
                    return Err(StoreError::UniqueViolation(format!(
                        "live subscription for customer {} product {}",
                        subscription.customer_id, subscription.product_id
                    )));
                }
            }
            self.write_raw(cf::LIVE_SUBSCRIPTIONS, &live_key, subscription.id.as_bytes())?;
        } else if live_owner == Some(subscription.id) {
            self.delete(cf::LIVE_SUBSCRIPTIONS, &live_key)?;
        }

        self.write_raw(cf::SUBSCRIPTIONS_BY_PROVIDER_REF, &ref_key, subscription.id.as_bytes())?;
        self.write(
            cf::SUBSCRIPTIONS,
            &keys::subscription_key(&subscription.id),
            subscription,
        )
    }

    fn put_payment(&mut self, payment: &PaymentIntent) -> Result<()> {
        let provider_ref = payment.provider_ref();
        let ref_key = keys::provider_ref_key(&provider_ref);
        if let Some(owner) = self.read_index(cf::PAYMENTS_BY_PROVIDER_REF, &ref_key)? {
            if PaymentIntentId::from_bytes(owner) != payment.id {
                return Err(StoreError::UniqueViolation(format!(
                    "payment ref {provider_ref}"
                )));
            }
        }
        self.write_raw(cf::PAYMENTS_BY_PROVIDER_REF, &ref_key, payment.id.as_bytes())?;
        self.write_raw(
            cf::PAYMENTS_BY_CUSTOMER,
            &keys::customer_payment_key(&payment.customer_id, payment.created_at, &payment.id),
            &[],
        )?;
        self.write(cf::PAYMENTS, &keys::payment_key(&payment.id), payment)
    }

    fn put_audit(&mut self, record: &AuditRecord) -> Result<()> {
        self.write(cf::AUDIT, &keys::audit_key(&record.id), record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transact;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use z_recon_core::{
        BillingInterval, CustomerProfile, Outcome, PaymentStatus, Provider, SubscriptionStatus,
    };

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn alice() -> Customer {
        Customer::new("zid|alice", "alice@example.com", CustomerProfile::default())
    }

    fn product() -> Product {
        Product {
            id: ProductId::generate(),
            code: "pro-monthly".to_string(),
            name: "Pro Monthly".to_string(),
            is_active: true,
            sort_order: 1,
            price_minor: 2_000,
            currency: "USD".parse().unwrap(),
            interval: BillingInterval::Month,
            trial_days: 14,
        }
    }

    fn subscription(customer: &Customer, product: &Product, provider_ref: &str) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::generate(),
            customer_id: customer.id,
            product_id: product.id,
            provider: Provider::Stripe,
            provider_ref: provider_ref.to_string(),
            status: SubscriptionStatus::Trialing,
            current_period: None,
            last_event_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn record(key: &IdempotencyKey, processed_at: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord {
            key: key.clone(),
            event_kind: "invoice_paid".to_string(),
            outcome: Outcome::Ignored {
                reason: "test".to_string(),
            },
            processed_at,
        }
    }

    #[test]
    fn customer_crud() {
        let (store, _dir) = create_test_store();
        let customer = alice();

        store.insert_customer(&customer).unwrap();
        assert!(matches!(
            store.insert_customer(&alice()),
            Err(StoreError::UniqueViolation(_))
        ));

        let found = store.find_customer_by_identity("zid|alice").unwrap().unwrap();
        assert_eq!(found.id, customer.id);

        assert!(store.claim_welcome(&customer.id, Utc::now()).unwrap());
        assert!(!store.claim_welcome(&customer.id, Utc::now()).unwrap());
        assert!(store
            .get_customer(&customer.id)
            .unwrap()
            .unwrap()
            .welcome_sent_at
            .is_some());
    }

    #[test]
    fn ledger_round_trip_and_reservation_rules() {
        let (store, _dir) = create_test_store();
        let key = IdempotencyKey::new(Provider::Stripe, "evt_1");

        let result = transact(&store, |uow| uow.check_and_reserve(&key));
        assert!(matches!(result, Err(StoreError::ReservationNotCompleted(_))));

        let rec = record(&key, Utc::now());
        transact(&store, |uow| {
            assert_eq!(uow.check_and_reserve(&key)?, LedgerCheck::Fresh);
            uow.complete(&rec)
        })
        .unwrap();

        let check = transact(&store, |uow| uow.check_and_reserve(&key)).unwrap();
        assert_eq!(check, LedgerCheck::AlreadyProcessed(rec.clone()));
        assert_eq!(store.get_ledger_record(&key).unwrap(), Some(rec));
    }

    #[test]
    fn concurrent_reservations_admit_one() {
        let (store, _dir) = create_test_store();
        let store = Arc::new(store);
        let key = IdempotencyKey::new(Provider::Lago, "dup");
        let fresh = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                let fresh = Arc::clone(&fresh);
                std::thread::spawn(move || {
                    transact(store.as_ref(), |uow| {
                        if uow.check_and_reserve(&key)? == LedgerCheck::Fresh {
                            fresh.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(50));
                            uow.complete(&record(&key, Utc::now()))?;
                        }
                        Ok(())
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(fresh.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn live_subscription_index() {
        let (store, _dir) = create_test_store();
        let customer = alice();
        let product = product();
        let first = subscription(&customer, &product, "sub_1");
        let second = subscription(&customer, &product, "sub_2");

        transact(&store, |uow| uow.put_subscription(&first)).unwrap();
        assert!(matches!(
            transact(&store, |uow| uow.put_subscription(&second)),
            Err(StoreError::UniqueViolation(_))
        ));

        let mut expired = first.clone();
        expired.status = SubscriptionStatus::Expired;
        transact(&store, |uow| {
            uow.put_subscription(&expired)?;
            uow.put_subscription(&second)
        })
        .unwrap();

        let (live, by_ref) = transact(&store, |uow| {
            Ok((
                uow.find_live_subscription(&customer.id, &product.id)?,
                uow.find_subscription_by_provider_ref(&ProviderRef::new(Provider::Stripe, "sub_1"))?,
            ))
        })
        .unwrap();
        assert_eq!(live.map(|s| s.id), Some(second.id));
        assert_eq!(by_ref.map(|s| s.status), Some(SubscriptionStatus::Expired));
    }

    #[test]
    fn payments_and_audit_listing() {
        let (store, _dir) = create_test_store();
        let customer = alice();
        let base = Utc::now();

        transact(&store, |uow| {
            for i in 0..3 {
                uow.put_payment(&PaymentIntent {
                    id: PaymentIntentId::generate(),
                    provider: Provider::Stripe,
                    provider_ref: format!("pi_{i}"),
                    amount_minor: 500,
                    currency: "USD".parse().unwrap(),
                    status: PaymentStatus::Completed,
                    customer_id: customer.id,
                    product_id: None,
                    subscription_id: None,
                    refunded_minor: 0,
                    metadata: serde_json::Value::Null,
                    created_at: base + chrono::Duration::seconds(i),
                    updated_at: base,
                })?;
            }
            Ok(())
        })
        .unwrap();

        let payments = store.list_payments_by_customer(&customer.id, 10).unwrap();
        let refs: Vec<_> = payments.iter().map(|p| p.provider_ref.as_str()).collect();
        assert_eq!(refs, vec!["pi_2", "pi_1", "pi_0"]);

        let found = transact(&store, |uow| {
            uow.find_payment_by_provider_ref(&ProviderRef::new(Provider::Stripe, "pi_1"))
        })
        .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn product_catalog() {
        let (store, _dir) = create_test_store();
        let mut pro = product();
        store.put_product(&pro).unwrap();
        pro.is_active = false;
        store.put_product(&pro).unwrap();

        let products = store.list_products().unwrap();
        assert_eq!(products.len(), 1);
        assert!(!products[0].is_active);

        let by_code = transact(&store, |uow| uow.find_product_by_code("pro-monthly")).unwrap();
        assert_eq!(by_code.map(|p| p.id), Some(pro.id));
    }

    #[test]
    fn prune_and_reopen() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let old = IdempotencyKey::new(Provider::Stripe, "evt_old");
        let new = IdempotencyKey::new(Provider::Stripe, "evt_new");
        {
            let store = RocksStore::open(dir.path()).unwrap();
            transact(&store, |uow| {
                uow.check_and_reserve(&old)?;
                uow.complete(&record(&old, now - chrono::Duration::days(90)))?;
                uow.check_and_reserve(&new)?;
                uow.complete(&record(&new, now))
            })
            .unwrap();
            assert_eq!(store.prune_ledger(now - chrono::Duration::days(30)).unwrap(), 1);
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert!(store.get_ledger_record(&old).unwrap().is_none());
        assert!(store.get_ledger_record(&new).unwrap().is_some());
    }
}
