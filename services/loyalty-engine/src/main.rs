use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::{anyhow, Context};
use dotenv::dotenv;
use loyalty_engine::{
    cache::{Cache, RedisCache},
    config::{Config, LoggingConfig},
    database::Database,
    handlers,
    ledger::LedgerEngine,
    metrics,
    services::{CatalogService, CustomerService, ReportService, TransactionService},
    store::BalanceStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_target(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    init_tracing(&config.logging);
    info!("Starting Loyalty Engine on {}:{}", config.server.host, config.server.port);

    metrics::register_metrics(&metrics::REGISTRY).context("Failed to register metrics")?;

    let database = Database::new(
        &config.database.url,
        config.database.max_connections,
        config.database.min_connections,
        Duration::from_secs(config.database.acquire_timeout_secs),
    )
    .await
    .context("Failed to connect to database")?;

    if config.database.run_migrations {
        database
            .run_migrations()
            .await
            .context("Failed to run migrations")?;
    }

    let cache: Option<Arc<dyn Cache>> = if config.redis.enabled {
        match RedisCache::connect(&config.redis.url).await {
            Ok(redis) => {
                info!("Connected to Redis at {}", config.redis.url);
                Some(Arc::new(redis) as Arc<dyn Cache>)
            }
            Err(e) => {
                warn!("Redis unavailable, running without cache: {}", e);
                None
            }
        }
    } else {
        info!("Redis disabled, running without cache");
        None
    };

    let store: Arc<dyn BalanceStore> = Arc::new(database);
    let ttls = config.cache.ttls();

    let ledger = Arc::new(
        LedgerEngine::new(store.clone(), cache.clone())
            .with_operation_timeout(config.ledger.operation_timeout()),
    );
    let catalog = Arc::new(CatalogService::new(store.clone(), cache.clone(), ttls));
    let customers = Arc::new(CustomerService::new(store.clone()));
    let transactions = Arc::new(TransactionService::new(store.clone()));
    let reports = Arc::new(ReportService::new(store, cache, ttls));

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(ledger.clone()))
            .app_data(web::Data::new(catalog.clone()))
            .app_data(web::Data::new(customers.clone()))
            .app_data(web::Data::new(transactions.clone()))
            .app_data(web::Data::new(reports.clone()))
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers.max(1))
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
