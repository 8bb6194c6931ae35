//! In-memory storage implementation.
//!
//! All tables live behind one mutex, held for the whole unit of work, so
//! units of work are fully serialized. Writes go straight to the tables and
//! record the entries they replace; a failed unit of work replays that log in
//! reverse and leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use z_recon_core::{
    AuditId, AuditRecord, Customer, CustomerId, IdempotencyKey, IdempotencyRecord, LedgerCheck,
    PaymentIntent, PaymentIntentId, Product, ProductId, ProviderRef, Subscription, SubscriptionId,
};

use crate::error::{Result, StoreError};
use crate::ledger::Reservations;
use crate::{Store, UnitOfWork};

#[derive(Debug, Default)]
struct Tables {
    customers: HashMap<CustomerId, Customer>,
    customers_by_identity: HashMap<String, CustomerId>,
    customers_by_billing_ref: HashMap<ProviderRef, CustomerId>,
    products: HashMap<ProductId, Product>,
    products_by_code: HashMap<String, ProductId>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    subscriptions_by_provider_ref: HashMap<ProviderRef, SubscriptionId>,
    live_subscriptions: HashMap<(CustomerId, ProductId), SubscriptionId>,
    payments: HashMap<PaymentIntentId, PaymentIntent>,
    payments_by_provider_ref: HashMap<ProviderRef, PaymentIntentId>,
    ledger: HashMap<IdempotencyKey, IdempotencyRecord>,
    audit: BTreeMap<AuditId, AuditRecord>,
}

impl Tables {
    fn put_customer(&mut self, customer: &Customer) -> Result<()> {
        if let Some(billing_ref) = &customer.billing_ref {
            match self.customers_by_billing_ref.get(billing_ref) {
                Some(owner) if *owner != customer.id => {
                    return Err(StoreError::UniqueViolation(format!(
                        "billing ref {billing_ref}"
                    )));
                }
                _ => {}
            }
            self.customers_by_billing_ref
                .insert(billing_ref.clone(), customer.id);
        }
        self.customers.insert(customer.id, customer.clone());
        Ok(())
    }

    fn put_product(&mut self, product: &Product) -> Result<()> {
        match self.products_by_code.get(&product.code) {
            Some(owner) if *owner != product.id => {
                return Err(StoreError::UniqueViolation(format!(
                    "product code {}",
                    product.code
                )));
            }
            _ => {}
        }
        if let Some(previous) = self.products.get(&product.id) {
            if previous.code != product.code {
                self.products_by_code.remove(&previous.code);
            }
        }
        self.products_by_code.insert(product.code.clone(), product.id);
        self.products.insert(product.id, product.clone());
        Ok(())
    }

    fn put_subscription(&mut self, subscription: &Subscription) -> Result<()> {
        let provider_ref = subscription.provider_ref();
        if let Some(owner) = self.subscriptions_by_provider_ref.get(&provider_ref) {
            if *owner != subscription.id {
                return Err(StoreError::UniqueViolation(format!(
                    "subscription ref {provider_ref}"
                )));
            }
        }

        let pair = (subscription.customer_id, subscription.product_id);
        if subscription.status.is_live() {
            if let Some(owner) = self.live_subscriptions.get(&pair) {
                if *owner != subscription.id {
                    return Err(StoreError::UniqueViolation(format!(
                        "live subscription for customer {} product {}",
                        pair.0, pair.1
                    )));
                }
            }
            self.live_subscriptions.insert(pair, subscription.id);
        } else if self.live_subscriptions.get(&pair) == Some(&subscription.id) {
            self.live_subscriptions.remove(&pair);
        }

        self.subscriptions_by_provider_ref
            .insert(provider_ref, subscription.id);
        self.subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    fn put_payment(&mut self, payment: &PaymentIntent) -> Result<()> {
        let provider_ref = payment.provider_ref();
        if let Some(owner) = self.payments_by_provider_ref.get(&provider_ref) {
            if *owner != payment.id {
                return Err(StoreError::UniqueViolation(format!(
                    "payment ref {provider_ref}"
                )));
            }
        }
        self.payments_by_provider_ref.insert(provider_ref, payment.id);
        self.payments.insert(payment.id, payment.clone());
        Ok(())
    }
}

/// In-memory storage for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Database("store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn insert_customer(&self, customer: &Customer) -> Result<()> {
        let mut tables = self.lock()?;
        if tables
            .customers_by_identity
            .contains_key(&customer.external_identity)
        {
            return Err(StoreError::UniqueViolation(format!(
                "external identity {}",
                customer.external_identity
            )));
        }
        if tables.customers.contains_key(&customer.id) {
            return Err(StoreError::UniqueViolation(format!("customer {}", customer.id)));
        }
        tables.put_customer(customer)?;
        tables
            .customers_by_identity
            .insert(customer.external_identity.clone(), customer.id);
        Ok(())
    }

    fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>> {
        Ok(self.lock()?.customers.get(id).cloned())
    }

    fn find_customer_by_identity(&self, identity: &str) -> Result<Option<Customer>> {
        let tables = self.lock()?;
        Ok(tables
            .customers_by_identity
            .get(identity)
            .and_then(|id| tables.customers.get(id))
            .cloned())
    }

    fn claim_welcome(&self, id: &CustomerId, at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.lock()?;
        let customer = tables.customers.get_mut(id).ok_or(StoreError::NotFound)?;
        if customer.welcome_sent_at.is_some() {
            return Ok(false);
        }
        customer.welcome_sent_at = Some(at);
        customer.updated_at = at;
        Ok(true)
    }

    fn put_product(&self, product: &Product) -> Result<()> {
        self.lock()?.put_product(product)
    }

    fn get_product(&self, id: &ProductId) -> Result<Option<Product>> {
        Ok(self.lock()?.products.get(id).cloned())
    }

    fn list_products(&self) -> Result<Vec<Product>> {
        let mut products: Vec<_> = self.lock()?.products.values().cloned().collect();
        products.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.code.cmp(&b.code)));
        Ok(products)
    }

    fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(id).cloned())
    }

    fn list_payments_by_customer(
        &self,
        customer_id: &CustomerId,
        limit: usize,
    ) -> Result<Vec<PaymentIntent>> {
        let tables = self.lock()?;
        let mut payments: Vec<_> = tables
            .payments
            .values()
            .filter(|p| p.customer_id == *customer_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        payments.truncate(limit);
        Ok(payments)
    }

    fn get_ledger_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        Ok(self.lock()?.ledger.get(key).cloned())
    }

    fn list_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        Ok(self
            .lock()?
            .audit
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn prune_ledger(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.lock()?;
        let len = tables.ledger.len();
        tables.ledger.retain(|_, record| record.processed_at >= before);
        Ok(len - tables.ledger.len())
    }

    fn transact(&self, work: &mut dyn FnMut(&mut dyn UnitOfWork) -> Result<()>) -> Result<()> {
        let mut tables = self.lock()?;
        let mut uow = MemoryUnitOfWork {
            tables: &mut *tables,
            reservations: Reservations::default(),
            undo: Vec::new(),
        };
        let result = work(&mut uow).and_then(|()| uow.reservations.finish());
        if result.is_err() {
            uow.rollback();
        }
        result
    }
}

/// An entry as it was before a unit of work replaced it.
enum Undo {
    Customer(CustomerId, Option<Customer>),
    BillingRef(ProviderRef, Option<CustomerId>),
    Subscription(SubscriptionId, Option<Subscription>),
    SubscriptionRef(ProviderRef, Option<SubscriptionId>),
    LiveSubscription((CustomerId, ProductId), Option<SubscriptionId>),
    Payment(PaymentIntentId, Option<PaymentIntent>),
    PaymentRef(ProviderRef, Option<PaymentIntentId>),
    Audit(AuditId),
    Ledger(IdempotencyKey),
}

fn restore<K: Hash + Eq, V>(map: &mut HashMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(value) => map.insert(key, value),
        None => map.remove(&key),
    };
}

struct MemoryUnitOfWork<'a> {
    tables: &'a mut Tables,
    reservations: Reservations,
    undo: Vec<Undo>,
}

impl MemoryUnitOfWork<'_> {
    fn rollback(&mut self) {
        let t = &mut *self.tables;
        for undo in self.undo.drain(..).rev() {
            match undo {
                Undo::Customer(id, prior) => restore(&mut t.customers, id, prior),
                Undo::BillingRef(r, prior) => restore(&mut t.customers_by_billing_ref, r, prior),
                Undo::Subscription(id, prior) => restore(&mut t.subscriptions, id, prior),
                Undo::SubscriptionRef(r, prior) => {
                    restore(&mut t.subscriptions_by_provider_ref, r, prior);
                }
                Undo::LiveSubscription(pair, prior) => {
                    restore(&mut t.live_subscriptions, pair, prior);
                }
                Undo::Payment(id, prior) => restore(&mut t.payments, id, prior),
                Undo::PaymentRef(r, prior) => restore(&mut t.payments_by_provider_ref, r, prior),
                Undo::Audit(id) => {
                    t.audit.remove(&id);
                }
                Undo::Ledger(key) => {
                    t.ledger.remove(&key);
                }
            }
        }
    }
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    fn check_and_reserve(&mut self, key: &IdempotencyKey) -> Result<LedgerCheck> {
        if let Some(record) = self.tables.ledger.get(key) {
            return Ok(LedgerCheck::AlreadyProcessed(record.clone()));
        }
        self.reservations.reserve(key);
        Ok(LedgerCheck::Fresh)
    }

    fn complete(&mut self, record: &IdempotencyRecord) -> Result<()> {
        self.reservations.complete(&record.key)?;
        self.tables.ledger.insert(record.key.clone(), record.clone());
        self.undo.push(Undo::Ledger(record.key.clone()));
        Ok(())
    }

    fn get_customer(&mut self, id: &CustomerId) -> Result<Option<Customer>> {
        Ok(self.tables.customers.get(id).cloned())
    }

    fn find_customer_by_billing_ref(
        &mut self,
        billing_ref: &ProviderRef,
    ) -> Result<Option<Customer>> {
        Ok(self
            .tables
            .customers_by_billing_ref
            .get(billing_ref)
            .and_then(|id| self.tables.customers.get(id))
            .cloned())
    }

    fn get_product(&mut self, id: &ProductId) -> Result<Option<Product>> {
        Ok(self.tables.products.get(id).cloned())
    }

    fn find_product_by_code(&mut self, code: &str) -> Result<Option<Product>> {
        Ok(self
            .tables
            .products_by_code
            .get(code)
            .and_then(|id| self.tables.products.get(id))
            .cloned())
    }

    fn find_subscription_by_provider_ref(
        &mut self,
        provider_ref: &ProviderRef,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .tables
            .subscriptions_by_provider_ref
            .get(provider_ref)
            .and_then(|id| self.tables.subscriptions.get(id))
            .cloned())
    }

    fn find_live_subscription(
        &mut self,
        customer_id: &CustomerId,
        product_id: &ProductId,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .tables
            .live_subscriptions
            .get(&(*customer_id, *product_id))
            .and_then(|id| self.tables.subscriptions.get(id))
            .cloned())
    }

    fn find_payment_by_provider_ref(
        &mut self,
        provider_ref: &ProviderRef,
    ) -> Result<Option<PaymentIntent>> {
        Ok(self
            .tables
            .payments_by_provider_ref
            .get(provider_ref)
            .and_then(|id| self.tables.payments.get(id))
            .cloned())
    }

    // Each `Tables::put_*` checks its constraints before mutating, so the
    // prior entries are recorded only once the put succeeded.

    fn put_customer(&mut self, customer: &Customer) -> Result<()> {
        let t = &mut *self.tables;
        let prior = t.customers.get(&customer.id).cloned();
        let prior_ref = customer
            .billing_ref
            .as_ref()
            .map(|r| (r.clone(), t.customers_by_billing_ref.get(r).copied()));
        t.put_customer(customer)?;

        self.undo.push(Undo::Customer(customer.id, prior));
        if let Some((billing_ref, owner)) = prior_ref {
            self.undo.push(Undo::BillingRef(billing_ref, owner));
        }
        Ok(())
    }

    fn put_subscription(&mut self, subscription: &Subscription) -> Result<()> {
        let t = &mut *self.tables;
        let provider_ref = subscription.provider_ref();
        let pair = (subscription.customer_id, subscription.product_id);
        let prior = t.subscriptions.get(&subscription.id).cloned();
        let prior_ref = t.subscriptions_by_provider_ref.get(&provider_ref).copied();
        let prior_live = t.live_subscriptions.get(&pair).copied();
        t.put_subscription(subscription)?;

        self.undo.push(Undo::Subscription(subscription.id, prior));
        self.undo.push(Undo::SubscriptionRef(provider_ref, prior_ref));
        self.undo.push(Undo::LiveSubscription(pair, prior_live));
        Ok(())
    }

    fn put_payment(&mut self, payment: &PaymentIntent) -> Result<()> {
        let t = &mut *self.tables;
        let provider_ref = payment.provider_ref();
        let prior = t.payments.get(&payment.id).cloned();
        let prior_ref = t.payments_by_provider_ref.get(&provider_ref).copied();
        t.put_payment(payment)?;

        self.undo.push(Undo::Payment(payment.id, prior));
        self.undo.push(Undo::PaymentRef(provider_ref, prior_ref));
        Ok(())
    }

    fn put_audit(&mut self, record: &AuditRecord) -> Result<()> {
        self.tables.audit.insert(record.id, record.clone());
        self.undo.push(Undo::Audit(record.id));
        Ok(())
    }
}
