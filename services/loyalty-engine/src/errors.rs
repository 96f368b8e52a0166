use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, LoyaltyError>;

/// Coarse classification callers use to pick a protocol-level response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed identifiers, dates or request data
    InvalidInput,
    /// Missing or out-of-range required field
    Validation,
    /// Referenced customer or product is absent
    NotFound,
    /// Business rule violation (stock, points)
    Conflict,
    /// Storage or unexpected failure
    Internal,
}

#[derive(Error, Debug)]
pub enum LoyaltyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    #[error("Invalid input format: {0}")]
    InvalidFormat(String),

    #[error("Invalid request data: {0}")]
    InvalidRequestData(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Product not found: {0}")]
    ProductNotFound(Uuid),

    #[error("Insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    #[error("Insufficient points: required {required}, available {available}")]
    InsufficientPoints { required: i64, available: i64 },

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for LoyaltyError {
    fn from(err: serde_json::Error) -> Self {
        LoyaltyError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<validator::ValidationErrors> for LoyaltyError {
    fn from(err: validator::ValidationErrors) -> Self {
        LoyaltyError::Validation(err.to_string())
    }
}

impl LoyaltyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoyaltyError::InvalidId(_)
            | LoyaltyError::InvalidFormat(_)
            | LoyaltyError::InvalidRequestData(_) => ErrorKind::InvalidInput,
            LoyaltyError::Validation(_) => ErrorKind::Validation,
            LoyaltyError::CustomerNotFound(_) | LoyaltyError::ProductNotFound(_) => {
                ErrorKind::NotFound
            }
            LoyaltyError::InsufficientStock { .. } | LoyaltyError::InsufficientPoints { .. } => {
                ErrorKind::Conflict
            }
            LoyaltyError::Database(_)
            | LoyaltyError::Migration(_)
            | LoyaltyError::Redis(_)
            | LoyaltyError::Timeout(_)
            | LoyaltyError::Storage(_)
            | LoyaltyError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short reason label, used for the response body and rejection metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            LoyaltyError::Database(_) => "database_error",
            LoyaltyError::Migration(_) => "migration_error",
            LoyaltyError::Redis(_) => "cache_error",
            LoyaltyError::InvalidId(_) => "invalid_id",
            LoyaltyError::InvalidFormat(_) => "invalid_format",
            LoyaltyError::InvalidRequestData(_) => "invalid_request_data",
            LoyaltyError::Validation(_) => "validation_error",
            LoyaltyError::CustomerNotFound(_) => "not_found",
            LoyaltyError::ProductNotFound(_) => "not_found",
            LoyaltyError::InsufficientStock { .. } => "insufficient_stock",
            LoyaltyError::InsufficientPoints { .. } => "insufficient_points",
            LoyaltyError::Timeout(_) => "timeout",
            LoyaltyError::Storage(_) => "storage_error",
            LoyaltyError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for LoyaltyError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        // Internal details stay in the logs
        let error_message = match self.kind() {
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::InvalidInput | ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
