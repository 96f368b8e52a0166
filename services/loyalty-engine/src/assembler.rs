//! Externally shaped response records
//!
//! Ledger and catalog results carry full entities; the API exposes flat
//! records with names resolved and timestamps formatted.

use crate::models::{
    same_calendar_month, BestSeller, Customer, Product, RedemptionRecord, TransactionRecord,
    TransactionReportData, DATE_LAYOUT, DATE_TIME_LAYOUT,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub transaction_id: Uuid,
    pub customer_name: String,
    pub product_name: String,
    pub size: String,
    pub flavor: String,
    pub qty: i64,
    pub unit_price: i64,
    pub total_price: i64,
    pub points_earned: i64,
    pub transaction_at: String,
}

impl From<&TransactionRecord> for TransactionResponse {
    fn from(record: &TransactionRecord) -> Self {
        TransactionResponse {
            transaction_id: record.transaction.id,
            customer_name: record.customer.name.clone(),
            product_name: record.product.name.clone(),
            size: record.product.size.clone(),
            flavor: record.product.flavor.clone(),
            qty: record.transaction.qty,
            unit_price: record.transaction.unit_price,
            total_price: record.transaction.total_price,
            points_earned: record.transaction.points_earned,
            transaction_at: record
                .transaction
                .transaction_at
                .format(DATE_TIME_LAYOUT)
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionResponse {
    pub redemption_id: Uuid,
    pub customer_name: String,
    pub product_name: String,
    pub size: String,
    pub qty: i64,
    pub points_spent: i64,
    pub redeem_at: String,
}

impl From<&RedemptionRecord> for RedemptionResponse {
    fn from(record: &RedemptionRecord) -> Self {
        RedemptionResponse {
            redemption_id: record.redemption.id,
            customer_name: record.customer.name.clone(),
            product_name: record.product.name.clone(),
            size: record.product.size.clone(),
            qty: record.redemption.qty,
            points_spent: record.redemption.points_spent,
            redeem_at: record
                .redemption
                .redeem_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub product_type: String,
    pub flavor: String,
    pub size: String,
    pub price: i64,
    pub stock_qty: i64,
    pub manufactured_date: String,
}

impl From<&Product> for ProductResponse {
    fn from(product: &Product) -> Self {
        ProductResponse {
            id: product.id,
            name: product.name.clone(),
            product_type: product.product_type.clone(),
            flavor: product.flavor.clone(),
            size: product.size.clone(),
            price: product.price,
            stock_qty: product.stock_qty,
            manufactured_date: product.manufactured_date.format(DATE_LAYOUT).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerResponse {
    pub name: String,
    pub points: i64,
}

impl From<&Customer> for CustomerResponse {
    fn from(customer: &Customer) -> Self {
        CustomerResponse {
            name: customer.name.clone(),
            points: customer.points,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportBestSeller {
    pub product_name: String,
    pub size: String,
    pub flavor: String,
    pub total_qty: i64,
}

impl From<&BestSeller> for ReportBestSeller {
    fn from(best: &BestSeller) -> Self {
        ReportBestSeller {
            product_name: best.product_name.clone(),
            size: best.size.clone(),
            flavor: best.flavor.clone(),
            total_qty: best.total_qty,
        }
    }
}

/// One of the most recent transactions in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTransactionItem {
    #[serde(flatten)]
    pub transaction: TransactionResponse,
    /// Customer was created in the same calendar month as this transaction
    pub is_new_customer: bool,
}

impl From<&TransactionRecord> for ReportTransactionItem {
    fn from(record: &TransactionRecord) -> Self {
        ReportTransactionItem {
            transaction: TransactionResponse::from(record),
            is_new_customer: same_calendar_month(
                record.customer.created_at,
                record.transaction.transaction_at,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTransactionsResponse {
    pub total_customer: i64,
    pub has_new_customer: bool,
    pub total_income: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub best_seller: Option<ReportBestSeller>,
    pub total_products_sold: i64,
    pub last_transactions: Vec<ReportTransactionItem>,
}

impl From<&TransactionReportData> for ReportTransactionsResponse {
    fn from(data: &TransactionReportData) -> Self {
        ReportTransactionsResponse {
            total_customer: data.total_customer,
            has_new_customer: data.has_new_customer,
            total_income: data.total_income,
            best_seller: data.best_seller.as_ref().map(ReportBestSeller::from),
            total_products_sold: data.total_products_sold,
            last_transactions: data
                .last_transactions
                .iter()
                .map(ReportTransactionItem::from)
                .collect(),
        }
    }
}
