pub mod assembler;
pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod services;
pub mod store;

pub use config::Config;
pub use errors::{ErrorKind, LoyaltyError, Result};
pub use ledger::LedgerEngine;
pub use store::{BalanceStore, UnitOfWork};
