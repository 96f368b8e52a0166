use crate::errors::{LoyaltyError, Result};
use crate::models::{
    BestSeller, Customer, NewProduct, Product, Redemption, Transaction, TransactionRecord,
    TransactionReportData,
};
use crate::store::{BalanceStore, UnitOfWork};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Pool, Postgres};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct Database {
    pool: Pool<Postgres>,
}

impl Database {
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    /// Wrap an already configured pool
    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

/// Postgres unit of work; dropping the inner transaction rolls it back.
pub struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_product(&mut self, product_id: Uuid) -> Result<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT id, name, type, flavor, size, price, stock_qty, manufactured_date, created_at, updated_at
            FROM products
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(product)
    }

    async fn lock_customer_by_name(&mut self, name: &str) -> Result<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, name, points, created_at, updated_at
            FROM customers
            WHERE lower(name) = lower($1)
            FOR UPDATE
            "#,
        )
        .bind(name.trim())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(customer)
    }

    async fn try_insert_customer(&mut self, name: &str) -> Result<Option<Customer>> {
        // A concurrent insert of the same name blocks here until the other
        // transaction finishes, then yields no row instead of aborting ours.
        let now = Utc::now();
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            INSERT INTO customers (id, name, points, created_at, updated_at)
            VALUES ($1, $2, 0, $3, $3)
            ON CONFLICT ((lower(name))) DO NOTHING
            RETURNING id, name, points, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name.trim())
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(customer)
    }

    async fn update_product(&mut self, product: &Product) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET stock_qty = $1,
                updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(product.stock_qty)
        .bind(product.updated_at)
        .bind(product.id)
        .execute(&mut *self.tx)
        .await?;

        expect_one_row(result.rows_affected(), "products", product.id)
    }

    async fn update_customer(&mut self, customer: &Customer) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE customers
            SET points = $1,
                updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(customer.points)
        .bind(customer.updated_at)
        .bind(customer.id)
        .execute(&mut *self.tx)
        .await?;

        expect_one_row(result.rows_affected(), "customers", customer.id)
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, customer_id, product_id, qty, unit_price, total_price,
                points_earned, transaction_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.customer_id)
        .bind(transaction.product_id)
        .bind(transaction.qty)
        .bind(transaction.unit_price)
        .bind(transaction.total_price)
        .bind(transaction.points_earned)
        .bind(transaction.transaction_at)
        .bind(transaction.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_redemption(&mut self, redemption: &Redemption) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO redemptions (
                id, customer_id, product_id, qty, points_spent, redeem_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(redemption.id)
        .bind(redemption.customer_id)
        .bind(redemption.product_id)
        .bind(redemption.qty)
        .bind(redemption.points_spent)
        .bind(redemption.redeem_at)
        .bind(redemption.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl BalanceStore for Database {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn insert_product(&self, product: NewProduct) -> Result<Product> {
        let now = Utc::now();

        let product = sqlx::query_as::<_, Product>(
            r#"
            INSERT INTO products (
                id, name, type, flavor, size, price, stock_qty, manufactured_date, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING id, name, type, flavor, size, price, stock_qty, manufactured_date, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&product.name)
        .bind(&product.product_type)
        .bind(product.flavor.as_str())
        .bind(product.size.as_str())
        .bind(product.price)
        .bind(product.stock_qty)
        .bind(product.manufactured_date)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(product)
    }

    async fn find_product(&self, product_id: Uuid) -> Result<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT id, name, type, flavor, size, price, stock_qty, manufactured_date, created_at, updated_at
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    async fn find_customer_by_name(&self, name: &str) -> Result<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, name, points, created_at, updated_at
            FROM customers
            WHERE lower(name) = lower($1)
            "#,
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(customer)
    }

    async fn products_by_manufactured_date(&self, date: NaiveDate) -> Result<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>(
            r#"
            SELECT id, name, type, flavor, size, price, stock_qty, manufactured_date, created_at, updated_at
            FROM products
            WHERE manufactured_date = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    async fn list_customers(&self) -> Result<Vec<Customer>> {
        let customers = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, name, points, created_at, updated_at
            FROM customers
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(customers)
    }

    async fn transactions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query_as::<_, TransactionDetailRow>(
            r#"
            SELECT t.id, t.customer_id, t.product_id, t.qty, t.unit_price, t.total_price,
                   t.points_earned, t.transaction_at, t.created_at,
                   c.name AS customer_name, c.points AS customer_points,
                   c.created_at AS customer_created_at, c.updated_at AS customer_updated_at,
                   p.name AS product_name, p.type AS product_type, p.flavor AS product_flavor,
                   p.size AS product_size, p.price AS product_price, p.stock_qty AS product_stock_qty,
                   p.manufactured_date AS product_manufactured_date,
                   p.created_at AS product_created_at, p.updated_at AS product_updated_at
            FROM transactions t
            JOIN customers c ON c.id = t.customer_id
            JOIN products p ON p.id = t.product_id
            WHERE t.transaction_at >= $1 AND t.transaction_at < $2
            ORDER BY t.transaction_at DESC, t.created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TransactionDetailRow::into_record).collect())
    }

    async fn transaction_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        last_limit: usize,
    ) -> Result<TransactionReportData> {
        let total_customer = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT customer_id)
            FROM transactions
            WHERE transaction_at >= $1 AND transaction_at < $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let has_new_customer = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM transactions t
                JOIN customers c ON c.id = t.customer_id
                WHERE t.transaction_at >= $1 AND t.transaction_at < $2
                  AND date_trunc('month', c.created_at AT TIME ZONE 'UTC')
                      = date_trunc('month', t.transaction_at AT TIME ZONE 'UTC')
            )
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let (total_income, total_products_sold) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT COALESCE(SUM(total_price), 0)::BIGINT,
                   COALESCE(SUM(qty), 0)::BIGINT
            FROM transactions
            WHERE transaction_at >= $1 AND transaction_at < $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let best_seller = sqlx::query_as::<_, BestSeller>(
            r#"
            SELECT p.name AS product_name, p.size, p.flavor, SUM(t.qty)::BIGINT AS total_qty
            FROM transactions t
            JOIN products p ON p.id = t.product_id
            WHERE t.transaction_at >= $1 AND t.transaction_at < $2
            GROUP BY p.id, p.name, p.size, p.flavor
            ORDER BY total_qty DESC
            LIMIT 1
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await?;

        let last_transactions = self.transactions_between(start, end, last_limit, 0).await?;

        Ok(TransactionReportData {
            total_customer,
            has_new_customer,
            total_income,
            total_products_sold,
            best_seller,
            last_transactions,
        })
    }
}

/// Transaction joined with its customer and product
#[derive(FromRow)]
struct TransactionDetailRow {
    id: Uuid,
    customer_id: Uuid,
    product_id: Uuid,
    qty: i64,
    unit_price: i64,
    total_price: i64,
    points_earned: i64,
    transaction_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    customer_name: String,
    customer_points: i64,
    customer_created_at: DateTime<Utc>,
    customer_updated_at: DateTime<Utc>,
    product_name: String,
    product_type: String,
    product_flavor: String,
    product_size: String,
    product_price: i64,
    product_stock_qty: i64,
    product_manufactured_date: NaiveDate,
    product_created_at: DateTime<Utc>,
    product_updated_at: DateTime<Utc>,
}

impl TransactionDetailRow {
    fn into_record(self) -> TransactionRecord {
        TransactionRecord {
            transaction: Transaction {
                id: self.id,
                customer_id: self.customer_id,
                product_id: self.product_id,
                qty: self.qty,
                unit_price: self.unit_price,
                total_price: self.total_price,
                points_earned: self.points_earned,
                transaction_at: self.transaction_at,
                created_at: self.created_at,
            },
            customer: Customer {
                id: self.customer_id,
                name: self.customer_name,
                points: self.customer_points,
                created_at: self.customer_created_at,
                updated_at: self.customer_updated_at,
            },
            product: Product {
                id: self.product_id,
                name: self.product_name,
                product_type: self.product_type,
                flavor: self.product_flavor,
                size: self.product_size,
                price: self.product_price,
                stock_qty: self.product_stock_qty,
                manufactured_date: self.product_manufactured_date,
                created_at: self.product_created_at,
                updated_at: self.product_updated_at,
            },
        }
    }
}

fn expect_one_row(rows_affected: u64, table: &str, id: Uuid) -> Result<()> {
    if rows_affected != 1 {
        return Err(LoyaltyError::Storage(format!(
            "expected to update one {} row for {}, updated {}",
            table, id, rows_affected
        )));
    }
    Ok(())
}
