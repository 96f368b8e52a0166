//! Ledger engine: the earn (purchase) and spend (redemption) state machines
//!
//! Every operation runs inside one unit of work and locks product before
//! customer. Balances are checked against the freshly locked rows, so two
//! operations touching the same row serialize on its lock and the second one
//! always sees the first one's committed result.

use crate::cache::{self, keys, Cache};
use crate::errors::{ErrorKind, LoyaltyError, Result};
use crate::metrics::{
    LEDGER_OPERATION_DURATION, LEDGER_REJECTIONS, POINTS_EARNED, POINTS_SPENT, PURCHASES_TOTAL,
    REDEMPTIONS_TOTAL,
};
use crate::models::{
    points_cost, points_earned, CreateRedemptionRequest, CreateTransactionRequest, Customer,
    PurchaseCommand, Redemption, RedemptionCommand, RedemptionRecord, Transaction,
    TransactionRecord,
};
use crate::store::{BalanceStore, UnitOfWork};
use chrono::{NaiveDate, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub struct LedgerEngine {
    store: Arc<dyn BalanceStore>,
    cache: Option<Arc<dyn Cache>>,
    operation_timeout: Option<Duration>,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn BalanceStore>, cache: Option<Arc<dyn Cache>>) -> Self {
        LedgerEngine {
            store,
            cache,
            operation_timeout: None,
        }
    }

    /// Bound each operation; a zero duration disables the bound.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Record a purchase from a raw request
    pub async fn purchase(&self, request: &CreateTransactionRequest) -> Result<TransactionRecord> {
        let command = PurchaseCommand::try_from(request).map_err(|e| {
            record_rejection("purchase", &e);
            e
        })?;
        self.execute_purchase(command).await
    }

    /// Record a redemption from a raw request
    pub async fn redeem(&self, request: &CreateRedemptionRequest) -> Result<RedemptionRecord> {
        let command = RedemptionCommand::try_from(request).map_err(|e| {
            record_rejection("redeem", &e);
            e
        })?;
        self.execute_redemption(command).await
    }

    #[instrument(
        skip(self, command),
        fields(customer = %command.customer_name, product_id = %command.product_id, qty = command.qty)
    )]
    pub async fn execute_purchase(&self, command: PurchaseCommand) -> Result<TransactionRecord> {
        let timer = LEDGER_OPERATION_DURATION
            .with_label_values(&["purchase"])
            .start_timer();
        let result = self.bounded(self.purchase_in_unit_of_work(&command)).await;
        timer.observe_duration();

        let record = result.map_err(|e| {
            record_rejection("purchase", &e);
            e
        })?;

        PURCHASES_TOTAL.inc();
        POINTS_EARNED.inc_by(record.transaction.points_earned as u64);
        info!(
            transaction_id = %record.transaction.id,
            customer_id = %record.customer.id,
            points_earned = record.transaction.points_earned,
            balance = record.customer.points,
            stock_left = record.product.stock_qty,
            "purchase committed"
        );

        self.invalidate_caches(record.product.manufactured_date).await;
        Ok(record)
    }

    #[instrument(
        skip(self, command),
        fields(customer = %command.customer_name, product_id = %command.product_id, qty = command.qty)
    )]
    pub async fn execute_redemption(&self, command: RedemptionCommand) -> Result<RedemptionRecord> {
        let timer = LEDGER_OPERATION_DURATION
            .with_label_values(&["redeem"])
            .start_timer();
        let result = self.bounded(self.redeem_in_unit_of_work(&command)).await;
        timer.observe_duration();

        let record = result.map_err(|e| {
            record_rejection("redeem", &e);
            e
        })?;

        REDEMPTIONS_TOTAL.inc();
        POINTS_SPENT.inc_by(record.redemption.points_spent as u64);
        info!(
            redemption_id = %record.redemption.id,
            customer_id = %record.customer.id,
            points_spent = record.redemption.points_spent,
            balance = record.customer.points,
            stock_left = record.product.stock_qty,
            "redemption committed"
        );

        self.invalidate_caches(record.product.manufactured_date).await;
        Ok(record)
    }

    async fn purchase_in_unit_of_work(&self, command: &PurchaseCommand) -> Result<TransactionRecord> {
        let mut uow = self.store.begin().await?;

        let mut product = uow
            .lock_product(command.product_id)
            .await?
            .ok_or(LoyaltyError::ProductNotFound(command.product_id))?;

        if product.stock_qty < command.qty {
            return Err(LoyaltyError::InsufficientStock {
                requested: command.qty,
                available: product.stock_qty,
            });
        }

        let mut customer = find_or_create_customer(uow.as_mut(), &command.customer_name).await?;

        let unit_price = product.price;
        let total_price = unit_price.checked_mul(command.qty).ok_or_else(|| {
            LoyaltyError::InvalidRequestData(format!(
                "total price overflows for qty {} at {}",
                command.qty, unit_price
            ))
        })?;
        let earned = points_earned(total_price);

        let now = Utc::now();
        product.stock_qty -= command.qty;
        product.updated_at = now;
        customer.points = customer.points.checked_add(earned).ok_or_else(|| {
            LoyaltyError::InvalidRequestData(format!("points balance overflows for {}", customer.name))
        })?;
        customer.updated_at = now;

        uow.update_product(&product).await?;
        uow.update_customer(&customer).await?;

        let transaction = Transaction {
            id: Uuid::new_v4(),
            customer_id: customer.id,
            product_id: product.id,
            qty: command.qty,
            unit_price,
            total_price,
            points_earned: earned,
            transaction_at: command.transaction_at,
            created_at: now,
        };
        uow.insert_transaction(&transaction).await?;

        uow.commit().await?;

        Ok(TransactionRecord {
            transaction,
            customer,
            product,
        })
    }

    async fn redeem_in_unit_of_work(&self, command: &RedemptionCommand) -> Result<RedemptionRecord> {
        let mut uow = self.store.begin().await?;

        let mut product = uow
            .lock_product(command.product_id)
            .await?
            .ok_or(LoyaltyError::ProductNotFound(command.product_id))?;

        let mut customer = uow
            .lock_customer_by_name(&command.customer_name)
            .await?
            .ok_or_else(|| LoyaltyError::CustomerNotFound(command.customer_name.clone()))?;

        let cost = points_cost(&product.size);
        if cost == 0 {
            return Err(LoyaltyError::InvalidRequestData(format!(
                "product {} has no redeemable size ('{}')",
                product.id, product.size
            )));
        }

        let total_points = cost.checked_mul(command.qty).ok_or_else(|| {
            LoyaltyError::InvalidRequestData(format!("points cost overflows for qty {}", command.qty))
        })?;

        if customer.points < total_points {
            return Err(LoyaltyError::InsufficientPoints {
                required: total_points,
                available: customer.points,
            });
        }
        if product.stock_qty < command.qty {
            return Err(LoyaltyError::InsufficientStock {
                requested: command.qty,
                available: product.stock_qty,
            });
        }

        let now = Utc::now();
        customer.points -= total_points;
        customer.updated_at = now;
        product.stock_qty -= command.qty;
        product.updated_at = now;

        uow.update_product(&product).await?;
        uow.update_customer(&customer).await?;

        let redemption = Redemption {
            id: Uuid::new_v4(),
            customer_id: customer.id,
            product_id: product.id,
            qty: command.qty,
            points_spent: total_points,
            redeem_at: command.redeem_at,
            created_at: now,
        };
        uow.insert_redemption(&redemption).await?;

        uow.commit().await?;

        Ok(RedemptionRecord {
            redemption,
            customer,
            product,
        })
    }

    /// Dropping the timed-out future drops its unit of work, which rolls back.
    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        match self.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .map_err(|_| LoyaltyError::Timeout(limit.as_millis() as u64))?,
            None => operation.await,
        }
    }

    async fn invalidate_caches(&self, manufactured_date: NaiveDate) {
        let cache = self.cache.as_deref();
        cache::evict(cache, &keys::product_listing(manufactured_date)).await;
        cache::evict_prefix(cache, keys::REPORT_PREFIX).await;
    }
}

/// Lock the customer by name, creating it when unseen.
///
/// A lost insert race is retried once by locking the winner's row.
async fn find_or_create_customer(uow: &mut dyn UnitOfWork, name: &str) -> Result<Customer> {
    if let Some(customer) = uow.lock_customer_by_name(name).await? {
        return Ok(customer);
    }

    if let Some(customer) = uow.try_insert_customer(name).await? {
        info!(customer_id = %customer.id, name, "created customer");
        return Ok(customer);
    }

    uow.lock_customer_by_name(name).await?.ok_or_else(|| {
        LoyaltyError::Storage(format!(
            "customer '{}' conflicted on insert but could not be locked",
            name
        ))
    })
}

fn record_rejection(operation: &str, err: &LoyaltyError) {
    LEDGER_REJECTIONS
        .with_label_values(&[operation, err.error_type()])
        .inc();

    match err.kind() {
        ErrorKind::Internal => error!(operation, "ledger operation failed: {}", err),
        _ => warn!(operation, "ledger operation rejected: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::memory::MemoryStore;
    use crate::models::{Flavor, NewProduct, Product, ProductSize};

    async fn setup(price: i64, stock_qty: i64, size: ProductSize) -> (MemoryStore, LedgerEngine, Product) {
        let store = MemoryStore::new();
        let product = store
            .insert_product(NewProduct {
                name: "Taro".to_string(),
                product_type: "Chips".to_string(),
                flavor: Flavor::RumputLaut,
                size,
                price,
                stock_qty,
                manufactured_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            })
            .await
            .unwrap();
        let engine = LedgerEngine::new(Arc::new(store.clone()), None);
        (store, engine, product)
    }

    fn purchase(name: &str, product_id: Uuid, qty: i64) -> CreateTransactionRequest {
        CreateTransactionRequest {
            customer_name: name.to_string(),
            product_id: product_id.to_string(),
            qty,
            transaction_at: "2024-06-02 09:00:00".to_string(),
        }
    }

    fn redemption(name: &str, product_id: Uuid, qty: i64) -> CreateRedemptionRequest {
        CreateRedemptionRequest {
            customer_name: name.to_string(),
            product_id: product_id.to_string(),
            qty,
            redeem_at: "2024-06-02T10:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_purchase_creates_customer_and_moves_balances() {
        let (store, engine, product) = setup(5000, 10, ProductSize::Medium).await;

        let record = engine.purchase(&purchase("Alice", product.id, 2)).await.unwrap();

        assert_eq!(record.transaction.total_price, 10000);
        assert_eq!(record.transaction.points_earned, 10);
        assert_eq!(record.customer.points, 10);
        assert_eq!(record.product.stock_qty, 8);

        let stored = store.find_product(product.id).await.unwrap().unwrap();
        assert_eq!(stored.stock_qty, 8);
        assert_eq!(store.customer_count(), 1);
    }

    #[tokio::test]
    async fn test_customer_lookup_is_case_insensitive() {
        let (store, engine, product) = setup(1000, 10, ProductSize::Small).await;

        engine.purchase(&purchase("Alice", product.id, 1)).await.unwrap();
        let second = engine.purchase(&purchase("ALICE", product.id, 1)).await.unwrap();

        assert_eq!(second.customer.name, "Alice");
        assert_eq!(second.customer.points, 2);
        assert_eq!(store.customer_count(), 1);
    }

    #[tokio::test]
    async fn test_purchase_rejections_leave_no_trace() {
        let (store, engine, product) = setup(5000, 1, ProductSize::Medium).await;

        let err = engine.purchase(&purchase("Bob", product.id, 2)).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::InsufficientStock { requested: 2, available: 1 }));

        let err = engine
            .purchase(&purchase("Bob", Uuid::new_v4(), 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(store.customer_count(), 0);
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(store.find_product(product.id).await.unwrap().unwrap().stock_qty, 1);
    }

    #[tokio::test]
    async fn test_redemption_spends_points_and_stock() {
        let (store, engine, product) = setup(300_000, 5, ProductSize::Medium).await;
        engine.purchase(&purchase("Dewi", product.id, 1)).await.unwrap();

        let record = engine.redeem(&redemption("dewi", product.id, 1)).await.unwrap();

        assert_eq!(record.redemption.points_spent, 300);
        assert_eq!(record.customer.points, 0);
        assert_eq!(record.product.stock_qty, 3);
        assert_eq!(store.redemption_count(), 1);
    }

    #[tokio::test]
    async fn test_redemption_never_creates_customers() {
        let (store, engine, product) = setup(5000, 5, ProductSize::Small).await;

        let err = engine.redeem(&redemption("Ghost", product.id, 1)).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::CustomerNotFound(_)));
        assert_eq!(store.customer_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_product_reported_before_missing_customer() {
        let (_store, engine, _product) = setup(5000, 5, ProductSize::Small).await;

        let err = engine
            .redeem(&redemption("Ghost", Uuid::new_v4(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::ProductNotFound(_)));
    }

    #[tokio::test]
    async fn test_redemption_checks_points_before_stock() {
        let (_store, engine, product) = setup(200_000, 1, ProductSize::Small).await;
        engine.purchase(&purchase("Eka", product.id, 1)).await.unwrap();

        // 200 points and no stock left
        let err = engine.redeem(&redemption("Eka", product.id, 1)).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::InsufficientStock { requested: 1, available: 0 }));

        let err = engine.redeem(&redemption("Eka", product.id, 2)).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::InsufficientPoints { required: 400, available: 200 }));
    }

    #[tokio::test]
    async fn test_unredeemable_size_is_invalid_request_data() {
        let (store, engine, product) = setup(1_000_000, 5, ProductSize::Large).await;
        engine.purchase(&purchase("Fajar", product.id, 1)).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let mut locked = uow.lock_product(product.id).await.unwrap().unwrap();
        locked.size = "Jumbo".to_string();
        uow.update_product(&locked).await.unwrap();
        uow.commit().await.unwrap();

        let err = engine.redeem(&redemption("Fajar", product.id, 1)).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidRequestData(_)));
    }

    #[tokio::test]
    async fn test_overflowing_total_is_rejected() {
        let (store, engine, product) = setup(i64::MAX / 2, 10, ProductSize::Small).await;

        let err = engine.purchase(&purchase("Gita", product.id, 3)).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidRequestData(_)));
        assert_eq!(store.customer_count(), 0);
    }

    #[tokio::test]
    async fn test_purchase_creates_customer_after_racing_creator_rolls_back() {
        let (store, engine, product) = setup(4000, 10, ProductSize::Small).await;
        let engine = Arc::new(engine);

        let mut creator = store.begin().await.unwrap();
        creator.try_insert_customer("Ina").await.unwrap().unwrap();

        let buyer = {
            let engine = engine.clone();
            let request = purchase("INA", product.id, 1);
            tokio::spawn(async move { engine.purchase(&request).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!buyer.is_finished());

        drop(creator);
        let record = buyer.await.unwrap().unwrap();
        assert_eq!(record.customer.name, "INA");
        assert_eq!(record.customer.points, 4);
        assert_eq!(store.customer_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_and_releases_locks() {
        let (store, engine, product) = setup(5000, 10, ProductSize::Medium).await;
        let engine = engine.with_operation_timeout(Duration::from_millis(50));

        // Hold the product row so the purchase blocks on it
        let mut holder = store.begin().await.unwrap();
        holder.lock_product(product.id).await.unwrap();

        let err = engine.purchase(&purchase("Hana", product.id, 1)).await.unwrap_err();
        assert!(matches!(err, LoyaltyError::Timeout(50)));
        assert_eq!(err.kind(), ErrorKind::Internal);

        drop(holder);
        let record = engine.purchase(&purchase("Hana", product.id, 1)).await.unwrap();
        assert_eq!(record.product.stock_qty, 9);
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_evicts_listing_and_reports() {
        let store = MemoryStore::new();
        let product = store
            .insert_product(NewProduct {
                name: "Chiki".to_string(),
                product_type: "Snack".to_string(),
                flavor: Flavor::KejuManis,
                size: ProductSize::Small,
                price: 2000,
                stock_qty: 3,
                manufactured_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            })
            .await
            .unwrap();
        let cache = Arc::new(MemoryCache::new());
        let engine = LedgerEngine::new(Arc::new(store), Some(cache.clone() as Arc<dyn Cache>));

        let listing_key = keys::product_listing(product.manufactured_date);
        let report_key = keys::report("2024-06-01", "2024-06-30");
        let other_key = keys::product_listing(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        for key in [&listing_key, &report_key, &other_key] {
            cache.set(key, "[]".into(), cache::ttl::REPORT).await.unwrap();
        }

        engine.purchase(&purchase("Ika", product.id, 1)).await.unwrap();

        assert!(!cache.contains_key(&listing_key));
        assert!(!cache.contains_key(&report_key));
        assert!(cache.contains_key(&other_key));
    }

    #[tokio::test]
    async fn test_failed_operation_keeps_cache() {
        let store = MemoryStore::new();
        let cache = Arc::new(MemoryCache::new());
        let engine = LedgerEngine::new(Arc::new(store), Some(cache.clone() as Arc<dyn Cache>));
        let report_key = keys::report("2024-06-01", "2024-06-30");
        cache.set(&report_key, "{}".into(), cache::ttl::REPORT).await.unwrap();

        assert!(engine.purchase(&purchase("Joko", Uuid::new_v4(), 1)).await.is_err());
        assert!(cache.contains_key(&report_key));
    }
}
