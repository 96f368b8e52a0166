use crate::errors::{LoyaltyError, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Calendar date layout used by listings, reports and cache keys
pub const DATE_LAYOUT: &str = "%Y-%m-%d";

/// Purchase timestamp layout (`2006-01-02 15:04:05`)
pub const DATE_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// One point is earned per this many units of total price
pub const PRICE_PER_POINT: i64 = 1000;

/// Points earned for a purchase: floor(total_price / 1000)
pub fn points_earned(total_price: i64) -> i64 {
    total_price / PRICE_PER_POINT
}

/// Whether two instants fall in the same calendar year and month
pub fn same_calendar_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

/// Redemption cost for a raw size label, 0 when the label is unknown.
pub fn points_cost(size: &str) -> i64 {
    size.parse::<ProductSize>()
        .map(|size| size.points_cost())
        .unwrap_or(0)
}

/// Product size tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductSize {
    Small,
    Medium,
    Large,
}

impl ProductSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductSize::Small => "Small",
            ProductSize::Medium => "Medium",
            ProductSize::Large => "Large",
        }
    }

    pub fn points_cost(&self) -> i64 {
        match self {
            ProductSize::Small => 200,
            ProductSize::Medium => 300,
            ProductSize::Large => 500,
        }
    }
}

impl FromStr for ProductSize {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Small" => Ok(ProductSize::Small),
            "Medium" => Ok(ProductSize::Medium),
            "Large" => Ok(ProductSize::Large),
            other => Err(LoyaltyError::Validation(format!(
                "size must be one of Small, Medium, Large (got '{}')",
                other
            ))),
        }
    }
}

impl fmt::Display for ProductSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snack flavors the catalog accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flavor {
    JagungBakar,
    RumputLaut,
    Original,
    JagungManis,
    KejuAsin,
    KejuManis,
    Pedas,
}

impl Flavor {
    pub const ALL: [Flavor; 7] = [
        Flavor::JagungBakar,
        Flavor::RumputLaut,
        Flavor::Original,
        Flavor::JagungManis,
        Flavor::KejuAsin,
        Flavor::KejuManis,
        Flavor::Pedas,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::JagungBakar => "Jagung Bakar",
            Flavor::RumputLaut => "Rumput Laut",
            Flavor::Original => "Original",
            Flavor::JagungManis => "Jagung Manis",
            Flavor::KejuAsin => "Keju Asin",
            Flavor::KejuManis => "Keju Manis",
            Flavor::Pedas => "Pedas",
        }
    }
}

impl FromStr for Flavor {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Flavor::ALL
            .iter()
            .copied()
            .find(|flavor| flavor.as_str() == trimmed)
            .ok_or_else(|| LoyaltyError::Validation(format!("unsupported flavor '{}'", trimmed)))
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub points: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub product_type: String,
    pub flavor: String,
    pub size: String,
    pub price: i64,
    pub stock_qty: i64,
    pub manufactured_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Purchase ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub product_id: Uuid,
    pub qty: i64,
    pub unit_price: i64,
    pub total_price: i64,
    pub points_earned: i64,
    pub transaction_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Points-spend ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Redemption {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub product_id: Uuid,
    pub qty: i64,
    pub points_spent: i64,
    pub redeem_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A committed purchase with its customer and product as of commit time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction: Transaction,
    pub customer: Customer,
    pub product: Product,
}

/// A committed redemption with its customer and product as of commit time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub redemption: Redemption,
    pub customer: Customer,
    pub product: Product,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BestSeller {
    pub product_name: String,
    pub size: String,
    pub flavor: String,
    pub total_qty: i64,
}

/// Aggregates backing the transaction report for a `[start, end)` window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReportData {
    pub total_customer: i64,
    pub has_new_customer: bool,
    pub total_income: i64,
    pub total_products_sold: i64,
    pub best_seller: Option<BestSeller>,
    pub last_transactions: Vec<TransactionRecord>,
}

/// Product insert, already validated
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub product_type: String,
    pub flavor: Flavor,
    pub size: ProductSize,
    pub price: i64,
    pub stock_qty: i64,
    pub manufactured_date: NaiveDate,
}

/// Purchase request as received from the delivery layer
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateTransactionRequest {
    #[validate(length(min = 1))]
    pub customer_name: String,
    #[validate(length(min = 1))]
    pub product_id: String,
    #[validate(range(min = 1))]
    pub qty: i64,
    #[validate(length(min = 1))]
    pub transaction_at: String,
}

/// Redemption request as received from the delivery layer
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateRedemptionRequest {
    #[validate(length(min = 1))]
    pub customer_name: String,
    #[validate(length(min = 1))]
    pub product_id: String,
    #[validate(range(min = 1))]
    pub qty: i64,
    #[validate(length(min = 1))]
    pub redeem_at: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateProductRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub product_type: String,
    pub flavor: String,
    pub size: String,
    #[validate(range(min = 0))]
    pub price: i64,
    #[validate(range(min = 0))]
    pub stock_qty: i64,
    pub manufactured_date: String,
}

/// Parsed purchase input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseCommand {
    pub customer_name: String,
    pub product_id: Uuid,
    pub qty: i64,
    pub transaction_at: DateTime<Utc>,
}

/// Parsed redemption input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionCommand {
    pub customer_name: String,
    pub product_id: Uuid,
    pub qty: i64,
    pub redeem_at: DateTime<Utc>,
}

impl TryFrom<&CreateTransactionRequest> for PurchaseCommand {
    type Error = LoyaltyError;

    fn try_from(request: &CreateTransactionRequest) -> Result<Self> {
        request.validate()?;

        let product_id = parse_product_id(&request.product_id)?;
        let raw_at = request.transaction_at.trim();
        let transaction_at = NaiveDateTime::parse_from_str(raw_at, DATE_TIME_LAYOUT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|e| {
                LoyaltyError::InvalidFormat(format!("transaction_at '{}': {}", raw_at, e))
            })?;
        let customer_name = required_name(&request.customer_name)?;

        Ok(PurchaseCommand {
            customer_name,
            product_id,
            qty: request.qty,
            transaction_at,
        })
    }
}

impl TryFrom<&CreateRedemptionRequest> for RedemptionCommand {
    type Error = LoyaltyError;

    fn try_from(request: &CreateRedemptionRequest) -> Result<Self> {
        request.validate()?;

        let product_id = parse_product_id(&request.product_id)?;
        let raw_at = request.redeem_at.trim();
        let redeem_at = DateTime::parse_from_rfc3339(raw_at)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| LoyaltyError::InvalidFormat(format!("redeem_at '{}': {}", raw_at, e)))?;
        let customer_name = required_name(&request.customer_name)?;

        Ok(RedemptionCommand {
            customer_name,
            product_id,
            qty: request.qty,
            redeem_at,
        })
    }
}

impl TryFrom<&CreateProductRequest> for NewProduct {
    type Error = LoyaltyError;

    fn try_from(request: &CreateProductRequest) -> Result<Self> {
        request.validate()?;

        let name = request.name.trim();
        let product_type = request.product_type.trim();
        if name.is_empty() || product_type.is_empty() {
            return Err(LoyaltyError::Validation(
                "name and type are required".to_string(),
            ));
        }

        Ok(NewProduct {
            name: name.to_string(),
            product_type: product_type.to_string(),
            flavor: request.flavor.parse()?,
            size: request.size.parse()?,
            price: request.price,
            stock_qty: request.stock_qty,
            manufactured_date: parse_date(&request.manufactured_date)?,
        })
    }
}

/// Parse a `YYYY-MM-DD` calendar date
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, DATE_LAYOUT)
        .map_err(|e| LoyaltyError::InvalidFormat(format!("date '{}': {}", raw, e)))
}

fn parse_product_id(raw: &str) -> Result<Uuid> {
    let raw = raw.trim();
    Uuid::parse_str(raw).map_err(|e| LoyaltyError::InvalidId(format!("product_id '{}': {}", raw, e)))
}

fn required_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(LoyaltyError::Validation(
            "customer_name is required".to_string(),
        ));
    }
    Ok(name.to_string())
}
