use crate::assembler::{
    CustomerResponse, ProductResponse, RedemptionResponse, ReportTransactionsResponse,
    TransactionResponse,
};
use crate::errors::LoyaltyError;
use crate::ledger::LedgerEngine;
use crate::metrics;
use crate::models::{CreateProductRequest, CreateRedemptionRequest, CreateTransactionRequest};
use crate::services::{CatalogService, CustomerService, ReportService, TransactionService};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ProductDateQuery {
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct ReportRangeQuery {
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionListQuery {
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "loyalty-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Record a purchase and credit points
pub async fn create_transaction(
    ledger: web::Data<Arc<LedgerEngine>>,
    request: web::Json<CreateTransactionRequest>,
) -> Result<HttpResponse, LoyaltyError> {
    let record = ledger.purchase(&request).await?;
    Ok(HttpResponse::Created().json(TransactionResponse::from(&record)))
}

/// Spend points on a product
pub async fn create_redemption(
    ledger: web::Data<Arc<LedgerEngine>>,
    request: web::Json<CreateRedemptionRequest>,
) -> Result<HttpResponse, LoyaltyError> {
    let record = ledger.redeem(&request).await?;
    Ok(HttpResponse::Created().json(RedemptionResponse::from(&record)))
}

pub async fn list_transactions(
    transactions: web::Data<Arc<TransactionService>>,
    query: web::Query<TransactionListQuery>,
) -> Result<HttpResponse, LoyaltyError> {
    let records = transactions
        .list(&query.start, &query.end, query.limit, query.offset)
        .await?;
    let body: Vec<TransactionResponse> = records.iter().map(TransactionResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn create_product(
    catalog: web::Data<Arc<CatalogService>>,
    request: web::Json<CreateProductRequest>,
) -> Result<HttpResponse, LoyaltyError> {
    let product = catalog.create_product(&request).await?;
    Ok(HttpResponse::Created().json(ProductResponse::from(&product)))
}

pub async fn list_products(
    catalog: web::Data<Arc<CatalogService>>,
    query: web::Query<ProductDateQuery>,
) -> Result<HttpResponse, LoyaltyError> {
    let products = catalog.list_by_date(&query.date).await?;
    let body: Vec<ProductResponse> = products.iter().map(ProductResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn list_customers(
    customers: web::Data<Arc<CustomerService>>,
) -> Result<HttpResponse, LoyaltyError> {
    let customers = customers.list().await?;
    let body: Vec<CustomerResponse> = customers.iter().map(CustomerResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn transactions_report(
    reports: web::Data<Arc<ReportService>>,
    query: web::Query<ReportRangeQuery>,
) -> Result<HttpResponse, LoyaltyError> {
    let report = reports.transactions_report(&query.start, &query.end).await?;
    Ok(HttpResponse::Ok().json(ReportTransactionsResponse::from(&report)))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "error": "Failed to gather metrics",
            "details": e.to_string()
        })),
    }
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/transactions", web::post().to(create_transaction))
            .route("/transactions", web::get().to(list_transactions))
            .route("/redemptions", web::post().to(create_redemption))
            .route("/products", web::get().to(list_products))
            .route("/products", web::post().to(create_product))
            .route("/customers", web::get().to(list_customers))
            .route("/reports/transactions", web::get().to(transactions_report)),
    )
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}
