//! End-to-end ledger scenarios against the in-memory store and cache

use chrono::NaiveDate;
use loyalty_engine::{
    assembler::{ReportTransactionsResponse, TransactionResponse},
    cache::{Cache, MemoryCache},
    memory::MemoryStore,
    models::{
        CreateProductRequest, CreateRedemptionRequest, CreateTransactionRequest, Product,
    },
    services::{CacheTtls, CatalogService, ReportService},
    BalanceStore, ErrorKind, LedgerEngine, LoyaltyError,
};
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    store: MemoryStore,
    ledger: LedgerEngine,
    catalog: CatalogService,
    reports: ReportService,
}

impl Harness {
    fn new(cache: Option<Arc<dyn Cache>>) -> Self {
        let store = MemoryStore::new();
        let shared: Arc<dyn BalanceStore> = Arc::new(store.clone());
        Harness {
            ledger: LedgerEngine::new(shared.clone(), cache.clone()),
            catalog: CatalogService::new(shared.clone(), cache.clone(), CacheTtls::default()),
            reports: ReportService::new(shared, cache, CacheTtls::default()),
            store,
        }
    }

    async fn product(&self, price: i64, stock_qty: i64, size: &str) -> Product {
        self.catalog
            .create_product(&CreateProductRequest {
                name: "Qtela".to_string(),
                product_type: "Chips".to_string(),
                flavor: "Pedas".to_string(),
                size: size.to_string(),
                price,
                stock_qty,
                manufactured_date: "2024-06-01".to_string(),
            })
            .await
            .expect("product should be created")
    }

    async fn snapshot(&self, product_id: Uuid, customer: &str) -> (i64, Option<i64>) {
        let stock = self
            .store
            .find_product(product_id)
            .await
            .unwrap()
            .expect("product exists")
            .stock_qty;
        let points = self
            .store
            .find_customer_by_name(customer)
            .await
            .unwrap()
            .map(|c| c.points);
        (stock, points)
    }
}

fn purchase(name: &str, product_id: Uuid, qty: i64, at: &str) -> CreateTransactionRequest {
    CreateTransactionRequest {
        customer_name: name.to_string(),
        product_id: product_id.to_string(),
        qty,
        transaction_at: at.to_string(),
    }
}

fn redemption(name: &str, product_id: Uuid, qty: i64) -> CreateRedemptionRequest {
    CreateRedemptionRequest {
        customer_name: name.to_string(),
        product_id: product_id.to_string(),
        qty,
        redeem_at: "2024-06-05T12:00:00+07:00".to_string(),
    }
}

#[tokio::test]
async fn alice_earns_then_cannot_afford_redemption() {
    let h = Harness::new(None);
    let product = h.product(5000, 10, "Medium").await;

    let record = h
        .ledger
        .purchase(&purchase("Alice", product.id, 2, "2024-06-02 10:00:00"))
        .await
        .unwrap();
    let response = TransactionResponse::from(&record);
    assert_eq!(response.total_price, 10000);
    assert_eq!(response.points_earned, 10);
    assert_eq!(response.customer_name, "Alice");
    assert_eq!(h.snapshot(product.id, "Alice").await, (8, Some(10)));

    let err = h
        .ledger
        .redeem(&redemption("Alice", product.id, 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LoyaltyError::InsufficientPoints {
            required: 300,
            available: 10
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.snapshot(product.id, "Alice").await, (8, Some(10)));
    assert_eq!(h.store.redemption_count(), 0);
}

#[tokio::test]
async fn failed_operations_leave_balances_identical() {
    let h = Harness::new(None);
    let product = h.product(100_000, 3, "Small").await;
    h.ledger
        .purchase(&purchase("Budi", product.id, 1, "2024-06-02 10:00:00"))
        .await
        .unwrap();
    let before = h.snapshot(product.id, "Budi").await;
    assert_eq!(before, (2, Some(100)));

    let failures = vec![
        h.ledger
            .purchase(&purchase("Budi", product.id, 5, "2024-06-02 11:00:00"))
            .await
            .unwrap_err(),
        h.ledger
            .purchase(&purchase("Budi", product.id, 1, "yesterday"))
            .await
            .unwrap_err(),
        h.ledger
            .redeem(&redemption("Budi", product.id, 1))
            .await
            .unwrap_err(),
        h.ledger
            .redeem(&redemption("Budi", Uuid::new_v4(), 1))
            .await
            .unwrap_err(),
    ];

    let kinds: Vec<ErrorKind> = failures.iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            ErrorKind::Conflict,
            ErrorKind::InvalidInput,
            ErrorKind::Conflict,
            ErrorKind::NotFound
        ]
    );
    assert_eq!(h.snapshot(product.id, "Budi").await, before);
    assert_eq!(h.store.transaction_count(), 1);
}

#[tokio::test]
async fn listing_is_fresh_after_purchase() {
    let cache = Arc::new(MemoryCache::new());
    let h = Harness::new(Some(cache.clone() as Arc<dyn Cache>));
    let product = h.product(5000, 10, "Large").await;

    let listed = h.catalog.list_by_date("2024-06-01").await.unwrap();
    assert_eq!(listed[0].stock_qty, 10);
    assert!(cache.contains_key("products:date:2024-06-01"));

    h.ledger
        .purchase(&purchase("Citra", product.id, 3, "2024-06-02 10:00:00"))
        .await
        .unwrap();

    let listed = h.catalog.list_by_date("2024-06-01").await.unwrap();
    assert_eq!(listed[0].stock_qty, 7);
}

#[tokio::test]
async fn report_is_fresh_after_purchase_and_redemption() {
    let cache = Arc::new(MemoryCache::new());
    let h = Harness::new(Some(cache.clone() as Arc<dyn Cache>));
    let product = h.product(300_000, 10, "Medium").await;

    let empty = h
        .reports
        .transactions_report("2024-06-01", "2024-06-30")
        .await
        .unwrap();
    assert_eq!(empty.total_income, 0);
    assert!(cache.contains_key("report:transactions:2024-06-01:2024-06-30"));

    h.ledger
        .purchase(&purchase("Dian", product.id, 1, "2024-06-30 23:59:59"))
        .await
        .unwrap();

    let report = h
        .reports
        .transactions_report("2024-06-01", "2024-06-30")
        .await
        .unwrap();
    assert_eq!(report.total_income, 300_000);
    assert_eq!(report.total_customer, 1);
    assert_eq!(report.total_products_sold, 1);

    h.ledger
        .redeem(&redemption("Dian", product.id, 1))
        .await
        .unwrap();
    assert!(!cache.contains_key("report:transactions:2024-06-01:2024-06-30"));
}

#[tokio::test]
async fn report_aggregates_window_and_best_seller() {
    let h = Harness::new(None);
    let chips = h.product(10_000, 50, "Small").await;
    let crackers = h
        .catalog
        .create_product(&CreateProductRequest {
            name: "Chiki".to_string(),
            product_type: "Snack".to_string(),
            flavor: "Jagung Bakar".to_string(),
            size: "Large".to_string(),
            price: 2_000,
            stock_qty: 50,
            manufactured_date: "2024-05-20".to_string(),
        })
        .await
        .unwrap();

    for (name, product, qty, at) in [
        ("Eko", chips.id, 1, "2024-06-01 00:00:00"),
        ("Fitri", crackers.id, 4, "2024-06-10 08:00:00"),
        ("Eko", crackers.id, 2, "2024-06-15 08:00:00"),
        ("Gilang", chips.id, 9, "2024-07-01 00:00:00"),
        ("Gilang", chips.id, 9, "2024-05-31 23:59:59"),
    ] {
        h.ledger
            .purchase(&purchase(name, product, qty, at))
            .await
            .unwrap();
    }

    let report = h
        .reports
        .transactions_report("2024-06-01", "2024-06-30")
        .await
        .unwrap();
    assert_eq!(report.total_customer, 2);
    assert_eq!(report.total_products_sold, 7);
    assert_eq!(report.total_income, 10_000 + 8_000 + 4_000);

    let best = report.best_seller.as_ref().expect("sales in window");
    assert_eq!(best.product_name, "Chiki");
    assert_eq!(best.total_qty, 6);

    let response = ReportTransactionsResponse::from(&report);
    let timestamps: Vec<&str> = response
        .last_transactions
        .iter()
        .map(|item| item.transaction.transaction_at.as_str())
        .collect();
    assert_eq!(
        timestamps,
        vec!["2024-06-15 08:00:00", "2024-06-10 08:00:00", "2024-06-01 00:00:00"]
    );
}

#[tokio::test]
async fn report_keeps_only_last_ten() {
    let h = Harness::new(None);
    let product = h.product(1_000, 100, "Small").await;

    for day in 1..=12 {
        h.ledger
            .purchase(&purchase(
                "Hadi",
                product.id,
                1,
                &format!("2024-06-{:02} 12:00:00", day),
            ))
            .await
            .unwrap();
    }

    let report = h
        .reports
        .transactions_report("2024-06-01", "2024-06-30")
        .await
        .unwrap();
    assert_eq!(report.total_products_sold, 12);
    assert_eq!(report.last_transactions.len(), 10);
    assert_eq!(
        report.last_transactions[0].transaction.transaction_at.date_naive(),
        NaiveDate::from_ymd_opt(2024, 6, 12).unwrap()
    );
}

#[tokio::test]
async fn ledger_works_without_cache() {
    let h = Harness::new(None);
    let product = h.product(250_000, 4, "Small").await;

    assert_eq!(h.catalog.list_by_date("2024-06-01").await.unwrap().len(), 1);
    h.ledger
        .purchase(&purchase("Indah", product.id, 1, "2024-06-02 10:00:00"))
        .await
        .unwrap();
    let record = h
        .ledger
        .redeem(&redemption("INDAH", product.id, 1))
        .await
        .unwrap();

    assert_eq!(record.customer.points, 50);
    assert_eq!(h.catalog.list_by_date("2024-06-01").await.unwrap()[0].stock_qty, 2);
}
