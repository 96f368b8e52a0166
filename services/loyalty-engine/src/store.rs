//! Balance store abstraction
//!
//! The ledger talks to storage through two traits:
//!
//! - [`BalanceStore`] hands out units of work and serves the read-only
//!   queries behind listings and reports.
//! - [`UnitOfWork`] is one atomic group of reads and writes. Row locks taken
//!   through it are held until the unit of work is committed or dropped.
//!
//! Dropping a unit of work without calling [`UnitOfWork::commit`] rolls it
//! back, so every early return, panic or cancelled future discards all of its
//! writes.

use crate::errors::Result;
use crate::models::{
    Customer, NewProduct, Product, Redemption, Transaction, TransactionRecord,
    TransactionReportData,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

#[async_trait]
pub trait UnitOfWork: Send {
    /// Exclusively lock a product row, `None` when absent.
    async fn lock_product(&mut self, product_id: Uuid) -> Result<Option<Product>>;

    /// Exclusively lock a customer row matched case-insensitively by name.
    async fn lock_customer_by_name(&mut self, name: &str) -> Result<Option<Customer>>;

    /// Insert a zero-point customer and hold its row lock.
    ///
    /// An uncommitted insert of the same name by another unit of work is
    /// waited out. Returns `None` when the name belongs to a committed
    /// customer; the caller is expected to re-fetch with
    /// [`UnitOfWork::lock_customer_by_name`].
    async fn try_insert_customer(&mut self, name: &str) -> Result<Option<Customer>>;

    async fn update_product(&mut self, product: &Product) -> Result<()>;

    async fn update_customer(&mut self, customer: &Customer) -> Result<()>;

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()>;

    async fn insert_redemption(&mut self, redemption: &Redemption) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    async fn insert_product(&self, product: NewProduct) -> Result<Product>;

    async fn find_product(&self, product_id: Uuid) -> Result<Option<Product>>;

    async fn find_customer_by_name(&self, name: &str) -> Result<Option<Customer>>;

    /// Products manufactured on `date`, newest first
    async fn products_by_manufactured_date(&self, date: NaiveDate) -> Result<Vec<Product>>;

    /// All customers, newest first
    async fn list_customers(&self) -> Result<Vec<Customer>>;

    /// Transactions with `start <= transaction_at < end` joined with their
    /// customer and product, newest first
    async fn transactions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionRecord>>;

    /// Report aggregates over transactions with `start <= transaction_at < end`
    async fn transaction_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        last_limit: usize,
    ) -> Result<TransactionReportData>;
}
