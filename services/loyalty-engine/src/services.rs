use crate::cache::{self, keys, ttl, Cache};
use crate::errors::{LoyaltyError, Result};
use crate::models::{
    parse_date, CreateProductRequest, Customer, NewProduct, Product, TransactionRecord,
    TransactionReportData,
};
use crate::store::BalanceStore;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Number of most recent transactions included in a report
pub const REPORT_LAST_TRANSACTIONS: usize = 10;

/// Transactions returned by a listing when no limit is given
pub const DEFAULT_TRANSACTION_LIMIT: usize = 10;

/// Upper bound on a single transaction listing
pub const MAX_TRANSACTION_LIMIT: usize = 100;

/// Lifetimes of the read-through cache entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub product_listing: Duration,
    pub report: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        CacheTtls {
            product_listing: ttl::PRODUCT_LISTING,
            report: ttl::REPORT,
        }
    }
}

pub struct CatalogService {
    store: Arc<dyn BalanceStore>,
    cache: Option<Arc<dyn Cache>>,
    listing_ttl: Duration,
}

impl CatalogService {
    pub fn new(store: Arc<dyn BalanceStore>, cache: Option<Arc<dyn Cache>>, ttls: CacheTtls) -> Self {
        CatalogService {
            store,
            cache,
            listing_ttl: ttls.product_listing,
        }
    }

    /// Add a product to the catalog
    pub async fn create_product(&self, request: &CreateProductRequest) -> Result<Product> {
        let new_product = NewProduct::try_from(request)?;
        let product = self.store.insert_product(new_product).await?;

        cache::evict(
            self.cache.as_deref(),
            &keys::product_listing(product.manufactured_date),
        )
        .await;

        info!(
            "Created product {} ({} {} {}) manufactured {}",
            product.id, product.name, product.flavor, product.size, product.manufactured_date
        );
        Ok(product)
    }

    /// Products manufactured on a `YYYY-MM-DD` date, newest first
    pub async fn list_by_date(&self, raw_date: &str) -> Result<Vec<Product>> {
        let date = parse_date(raw_date)?;
        let key = keys::product_listing(date);

        if let Some(products) = cache::fetch_cached(self.cache.as_deref(), &key).await {
            return Ok(products);
        }

        let products = self.store.products_by_manufactured_date(date).await?;
        // Can land after a concurrent commit's eviction; the ttl bounds that staleness
        cache::populate(self.cache.as_deref(), &key, &products, self.listing_ttl).await;
        debug!(%date, count = products.len(), "loaded product listing from store");

        Ok(products)
    }
}

pub struct CustomerService {
    store: Arc<dyn BalanceStore>,
}

impl CustomerService {
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        CustomerService { store }
    }

    pub async fn list(&self) -> Result<Vec<Customer>> {
        self.store.list_customers().await
    }
}

pub struct ReportService {
    store: Arc<dyn BalanceStore>,
    cache: Option<Arc<dyn Cache>>,
    report_ttl: Duration,
}

impl ReportService {
    pub fn new(store: Arc<dyn BalanceStore>, cache: Option<Arc<dyn Cache>>, ttls: CacheTtls) -> Self {
        ReportService {
            store,
            cache,
            report_ttl: ttls.report,
        }
    }

    /// Report over transactions from `start` through `end`, both inclusive days
    pub async fn transactions_report(&self, start: &str, end: &str) -> Result<TransactionReportData> {
        let (from, until) = date_window(start, end)?;

        let key = keys::report(start, end);
        if let Some(report) = cache::fetch_cached(self.cache.as_deref(), &key).await {
            return Ok(report);
        }

        let report = self
            .store
            .transaction_report(from, until, REPORT_LAST_TRANSACTIONS)
            .await?;

        // An older snapshot can outlive a concurrent eviction by at most one ttl
        cache::populate(self.cache.as_deref(), &key, &report, self.report_ttl).await;
        Ok(report)
    }
}

pub struct TransactionService {
    store: Arc<dyn BalanceStore>,
}

impl TransactionService {
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        TransactionService { store }
    }

    /// Transactions from `start` through `end` (inclusive days), newest first
    pub async fn list(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<TransactionRecord>> {
        let (from, until) = date_window(start, end)?;
        let limit = limit
            .unwrap_or(DEFAULT_TRANSACTION_LIMIT)
            .min(MAX_TRANSACTION_LIMIT);
        let offset = offset.unwrap_or(0);

        let records = self
            .store
            .transactions_between(from, until, limit, offset)
            .await?;
        debug!(%from, %until, limit, offset, count = records.len(), "listed transactions");
        Ok(records)
    }
}

/// Parse a `YYYY-MM-DD` pair into the half-open window `[start, end + 1 day)`
fn date_window(start: &str, end: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start_date = parse_date(start)?;
    let end_date = parse_date(end)?;
    if end_date < start_date {
        return Err(LoyaltyError::InvalidRequestData(format!(
            "end date {} is before start date {}",
            end_date, start_date
        )));
    }

    let end_exclusive = end_date.succ_opt().ok_or_else(|| {
        LoyaltyError::InvalidRequestData(format!("end date {} is out of range", end_date))
    })?;
    Ok((start_of_day(start_date), start_of_day(end_exclusive)))
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}
