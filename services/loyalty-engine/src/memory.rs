//! In-memory balance store
//!
//! Row-level locking is emulated with one `tokio::sync::Mutex` per entity id.
//! A unit of work holds the owned guards for every row it locked and stages
//! its writes; commit applies them under the table lock in one step, and a
//! dropped unit of work discards them and releases its locks.
//!
//! Customers inserted by an uncommitted unit of work are provisional: their
//! name is reserved, so a racing insert or lock waits on the row until the
//! creator commits or rolls back, but plain reads do not see them.

use crate::errors::{LoyaltyError, Result};
use crate::models::{
    same_calendar_month, BestSeller, Customer, NewProduct, Product, Redemption, Transaction, TransactionRecord,
    TransactionReportData,
};
use crate::store::{BalanceStore, UnitOfWork};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: DashMap<Uuid, Arc<RowLock<()>>>,
}

#[derive(Default)]
struct Tables {
    customers: HashMap<Uuid, Customer>,
    customer_names: HashMap<String, Uuid>,
    provisional: HashSet<Uuid>,
    products: HashMap<Uuid, Product>,
    transactions: Vec<Transaction>,
    redemptions: Vec<Redemption>,
}

impl Tables {
    fn committed_customer(&self, id: &Uuid) -> Option<&Customer> {
        if self.provisional.contains(id) {
            return None;
        }
        self.customers.get(id)
    }

    /// Transactions in `[start, end)` newest first, joined with their rows
    fn records_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Vec<TransactionRecord> {
        let mut in_range: Vec<&Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.transaction_at >= start && t.transaction_at < end)
            .collect();
        in_range.sort_by(|a, b| {
            b.transaction_at
                .cmp(&a.transaction_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        in_range
            .into_iter()
            .filter_map(|t| {
                let customer = self.customers.get(&t.customer_id)?;
                let product = self.products.get(&t.product_id)?;
                Some(TransactionRecord {
                    transaction: t.clone(),
                    customer: customer.clone(),
                    product: product.clone(),
                })
            })
            .skip(offset)
            .take(limit)
            .collect()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.tables.lock().transactions.len()
    }

    pub fn redemption_count(&self) -> usize {
        self.inner.tables.lock().redemptions.len()
    }

    pub fn customer_count(&self) -> usize {
        let tables = self.inner.tables.lock();
        tables.customers.len() - tables.provisional.len()
    }

    fn row_lock(&self, id: Uuid) -> Arc<RowLock<()>> {
        self.inner.row_locks.entry(id).or_default().clone()
    }
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

pub struct MemoryUnitOfWork {
    store: MemoryStore,
    guards: HashMap<Uuid, OwnedMutexGuard<()>>,
    inserted_customers: Vec<Uuid>,
    customer_updates: HashMap<Uuid, Customer>,
    product_updates: HashMap<Uuid, Product>,
    transactions: Vec<Transaction>,
    redemptions: Vec<Redemption>,
    committed: bool,
}

impl MemoryUnitOfWork {
    fn new(store: MemoryStore) -> Self {
        Self {
            store,
            guards: HashMap::new(),
            inserted_customers: Vec::new(),
            customer_updates: HashMap::new(),
            product_updates: HashMap::new(),
            transactions: Vec::new(),
            redemptions: Vec::new(),
            committed: false,
        }
    }

    async fn lock_row(&mut self, id: Uuid) {
        if self.guards.contains_key(&id) {
            return;
        }
        let lock = self.store.row_lock(id);
        let guard = lock.lock_owned().await;
        self.guards.insert(id, guard);
    }

    fn apply(&mut self) -> Result<()> {
        let mut tables = self.store.inner.tables.lock();

        // Mirror the schema CHECK constraints before touching anything
        if let Some(customer) = self.customer_updates.values().find(|c| c.points < 0) {
            return Err(LoyaltyError::Storage(format!(
                "check constraint violated: customer {} points {}",
                customer.id, customer.points
            )));
        }
        if let Some(product) = self.product_updates.values().find(|p| p.stock_qty < 0) {
            return Err(LoyaltyError::Storage(format!(
                "check constraint violated: product {} stock_qty {}",
                product.id, product.stock_qty
            )));
        }

        for id in &self.inserted_customers {
            tables.provisional.remove(id);
        }
        for (id, customer) in self.customer_updates.drain() {
            tables.customers.insert(id, customer);
        }
        for (id, product) in self.product_updates.drain() {
            tables.products.insert(id, product);
        }
        tables.transactions.append(&mut self.transactions);
        tables.redemptions.append(&mut self.redemptions);

        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if self.committed || self.inserted_customers.is_empty() {
            return;
        }
        // Row guards are released after this body, so waiters observe the removal
        let mut tables = self.store.inner.tables.lock();
        for id in &self.inserted_customers {
            tables.provisional.remove(id);
            if let Some(customer) = tables.customers.remove(id) {
                tables.customer_names.remove(&name_key(&customer.name));
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_product(&mut self, product_id: Uuid) -> Result<Option<Product>> {
        let exists = self.store.inner.tables.lock().products.contains_key(&product_id);
        if !exists {
            return Ok(None);
        }

        self.lock_row(product_id).await;

        if let Some(staged) = self.product_updates.get(&product_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.store.inner.tables.lock().products.get(&product_id).cloned())
    }

    async fn lock_customer_by_name(&mut self, name: &str) -> Result<Option<Customer>> {
        let key = name_key(name);
        let id = self.store.inner.tables.lock().customer_names.get(&key).copied();
        let Some(id) = id else {
            return Ok(None);
        };

        self.lock_row(id).await;

        if let Some(staged) = self.customer_updates.get(&id) {
            return Ok(Some(staged.clone()));
        }
        // The row may have been rolled back while we waited for its lock
        Ok(self.store.inner.tables.lock().customers.get(&id).cloned())
    }

    async fn try_insert_customer(&mut self, name: &str) -> Result<Option<Customer>> {
        let key = name_key(name);
        loop {
            let pending = {
                let mut tables = self.store.inner.tables.lock();
                match tables.customer_names.get(&key).copied() {
                    // Uncommitted insert by another unit of work
                    Some(id) if tables.provisional.contains(&id) && !self.guards.contains_key(&id) => {
                        self.store.row_lock(id)
                    }
                    Some(_) => return Ok(None),
                    None => {
                        let now = Utc::now();
                        let customer = Customer {
                            id: Uuid::new_v4(),
                            name: name.trim().to_string(),
                            points: 0,
                            created_at: now,
                            updated_at: now,
                        };

                        let lock = self.store.row_lock(customer.id);
                        let guard = lock.try_lock_owned().map_err(|_| {
                            LoyaltyError::Storage(format!("fresh row {} already locked", customer.id))
                        })?;
                        self.guards.insert(customer.id, guard);

                        tables.customer_names.insert(key, customer.id);
                        tables.provisional.insert(customer.id);
                        tables.customers.insert(customer.id, customer.clone());
                        self.inserted_customers.push(customer.id);

                        return Ok(Some(customer));
                    }
                }
            };

            // The creator holds the row until it commits or rolls back
            drop(pending.lock().await);
        }
    }

    async fn update_product(&mut self, product: &Product) -> Result<()> {
        if !self.guards.contains_key(&product.id) {
            return Err(LoyaltyError::Storage(format!(
                "product {} updated without holding its row lock",
                product.id
            )));
        }
        self.product_updates.insert(product.id, product.clone());
        Ok(())
    }

    async fn update_customer(&mut self, customer: &Customer) -> Result<()> {
        if !self.guards.contains_key(&customer.id) {
            return Err(LoyaltyError::Storage(format!(
                "customer {} updated without holding its row lock",
                customer.id
            )));
        }
        self.customer_updates.insert(customer.id, customer.clone());
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        self.transactions.push(transaction.clone());
        Ok(())
    }

    async fn insert_redemption(&mut self, redemption: &Redemption) -> Result<()> {
        self.redemptions.push(redemption.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.apply()
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork::new(self.clone())))
    }

    async fn insert_product(&self, product: NewProduct) -> Result<Product> {
        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4(),
            name: product.name,
            product_type: product.product_type,
            flavor: product.flavor.as_str().to_string(),
            size: product.size.as_str().to_string(),
            price: product.price,
            stock_qty: product.stock_qty,
            manufactured_date: product.manufactured_date,
            created_at: now,
            updated_at: now,
        };

        self.inner
            .tables
            .lock()
            .products
            .insert(product.id, product.clone());
        Ok(product)
    }

    async fn find_product(&self, product_id: Uuid) -> Result<Option<Product>> {
        Ok(self.inner.tables.lock().products.get(&product_id).cloned())
    }

    async fn find_customer_by_name(&self, name: &str) -> Result<Option<Customer>> {
        let tables = self.inner.tables.lock();
        Ok(tables
            .customer_names
            .get(&name_key(name))
            .and_then(|id| tables.committed_customer(id))
            .cloned())
    }

    async fn products_by_manufactured_date(&self, date: NaiveDate) -> Result<Vec<Product>> {
        let tables = self.inner.tables.lock();
        let mut products: Vec<Product> = tables
            .products
            .values()
            .filter(|p| p.manufactured_date == date)
            .cloned()
            .collect();
        products.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(products)
    }

    async fn list_customers(&self) -> Result<Vec<Customer>> {
        let tables = self.inner.tables.lock();
        let mut customers: Vec<Customer> = tables
            .customers
            .keys()
            .filter_map(|id| tables.committed_customer(id))
            .cloned()
            .collect();
        customers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(customers)
    }

    async fn transactions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .inner
            .tables
            .lock()
            .records_between(start, end, limit, offset))
    }

    async fn transaction_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        last_limit: usize,
    ) -> Result<TransactionReportData> {
        let tables = self.inner.tables.lock();
        let in_range: Vec<&Transaction> = tables
            .transactions
            .iter()
            .filter(|t| t.transaction_at >= start && t.transaction_at < end)
            .collect();

        let customers: HashSet<Uuid> = in_range.iter().map(|t| t.customer_id).collect();
        let has_new_customer = in_range.iter().any(|t| {
            tables
                .customers
                .get(&t.customer_id)
                .map(|c| same_calendar_month(c.created_at, t.transaction_at))
                .unwrap_or(false)
        });

        let mut sold: HashMap<Uuid, i64> = HashMap::new();
        for t in &in_range {
            *sold.entry(t.product_id).or_insert(0) += t.qty;
        }
        let best_seller = sold
            .iter()
            .filter_map(|(id, qty)| tables.products.get(id).map(|p| (p, *qty)))
            .max_by(|(a, qa), (b, qb)| qa.cmp(qb).then_with(|| b.name.cmp(&a.name)))
            .map(|(product, total_qty)| BestSeller {
                product_name: product.name.clone(),
                size: product.size.clone(),
                flavor: product.flavor.clone(),
                total_qty,
            });

        let total_income = in_range.iter().map(|t| t.total_price).sum();
        let total_products_sold = in_range.iter().map(|t| t.qty).sum();
        let last_transactions = tables.records_between(start, end, last_limit, 0);

        Ok(TransactionReportData {
            total_customer: customers.len() as i64,
            has_new_customer,
            total_income,
            total_products_sold,
            best_seller,
            last_transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Flavor, ProductSize};
    use chrono::{Datelike, TimeZone};
    use std::time::Duration;

    fn new_product(stock_qty: i64) -> NewProduct {
        NewProduct {
            name: "Qtela".to_string(),
            product_type: "Chips".to_string(),
            flavor: Flavor::Original,
            size: ProductSize::Small,
            price: 8000,
            stock_qty,
            manufactured_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_dropped_unit_of_work_discards_writes() {
        let store = MemoryStore::new();
        let product = store.insert_product(new_product(5)).await.unwrap();

        {
            let mut uow = store.begin().await.unwrap();
            let mut locked = uow.lock_product(product.id).await.unwrap().unwrap();
            locked.stock_qty = 1;
            uow.update_product(&locked).await.unwrap();
            uow.try_insert_customer("Bob").await.unwrap().unwrap();
        }

        let stored = store.find_product(product.id).await.unwrap().unwrap();
        assert_eq!(stored.stock_qty, 5);
        assert!(store.find_customer_by_name("bob").await.unwrap().is_none());
        assert_eq!(store.customer_count(), 0);
    }

    #[tokio::test]
    async fn test_racing_insert_waits_then_inserts_after_rollback() {
        let store = MemoryStore::new();

        let mut first = store.begin().await.unwrap();
        assert!(first.try_insert_customer("Carol").await.unwrap().is_some());

        // The second insert blocks on the row until the first one finishes
        let mut second = store.begin().await.unwrap();
        let waiter = tokio::spawn(async move {
            let inserted = second.try_insert_customer("CAROL").await.unwrap();
            (second, inserted)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let (second, inserted) = waiter.await.unwrap();
        let carol = inserted.expect("name is free after rollback");
        assert_eq!(carol.name, "CAROL");

        second.commit().await.unwrap();
        assert_eq!(store.customer_count(), 1);
    }

    #[tokio::test]
    async fn test_racing_insert_yields_to_committed_row() {
        let store = MemoryStore::new();

        let mut first = store.begin().await.unwrap();
        let created = first.try_insert_customer("Dewi").await.unwrap().unwrap();

        let mut second = store.begin().await.unwrap();
        let waiter = tokio::spawn(async move {
            let inserted = second.try_insert_customer("dewi").await.unwrap();
            let locked = second.lock_customer_by_name("dewi").await.unwrap();
            (inserted, locked)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.commit().await.unwrap();
        let (inserted, locked) = waiter.await.unwrap();
        assert!(inserted.is_none());
        assert_eq!(locked.map(|c| c.id), Some(created.id));
    }

    #[tokio::test]
    async fn test_transactions_between_pages_newest_first() {
        let store = MemoryStore::new();
        let product = store.insert_product(new_product(10)).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let customer = uow.try_insert_customer("Eka").await.unwrap().unwrap();
        for day in 1..=4 {
            let at = Utc.with_ymd_and_hms(2024, 6, day, 9, 0, 0).unwrap();
            uow.insert_transaction(&Transaction {
                id: Uuid::new_v4(),
                customer_id: customer.id,
                product_id: product.id,
                qty: 1,
                unit_price: 8000,
                total_price: 8000,
                points_earned: 8,
                transaction_at: at,
                created_at: at,
            })
            .await
            .unwrap();
        }
        uow.commit().await.unwrap();

        let start = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 4, 9, 0, 0).unwrap();
        let days = |records: Vec<TransactionRecord>| -> Vec<u32> {
            records.iter().map(|r| r.transaction.transaction_at.day()).collect()
        };

        assert_eq!(days(store.transactions_between(start, end, 10, 0).await.unwrap()), vec![3, 2]);
        assert_eq!(days(store.transactions_between(start, end, 1, 1).await.unwrap()), vec![2]);
        assert!(store.transactions_between(start, end, 10, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_rejects_negative_balances() {
        let store = MemoryStore::new();
        let product = store.insert_product(new_product(1)).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let mut locked = uow.lock_product(product.id).await.unwrap().unwrap();
        locked.stock_qty -= 2;
        uow.update_product(&locked).await.unwrap();

        assert!(matches!(uow.commit().await, Err(LoyaltyError::Storage(_))));
        assert_eq!(store.find_product(product.id).await.unwrap().unwrap().stock_qty, 1);
    }

    #[tokio::test]
    async fn test_update_requires_row_lock() {
        let store = MemoryStore::new();
        let product = store.insert_product(new_product(3)).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        assert!(uow.update_product(&product).await.is_err());
    }
}
