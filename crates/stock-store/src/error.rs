use thiserror::Error;

use crate::{ProductId, WarehouseId};

/// PostgreSQL SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// PostgreSQL SQLSTATE raised when `statement_timeout` cancels a statement.
const QUERY_CANCELED: &str = "57014";
/// PostgreSQL SQLSTATE for a detected deadlock.
const DEADLOCK_DETECTED: &str = "40P01";
/// PostgreSQL SQLSTATE for a serialization failure.
const SERIALIZATION_FAILURE: &str = "40001";

/// Errors that can occur when interacting with the stock store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Waiting for a row lock (or a statement) took longer than the
    /// transaction's timeout.
    #[error("Timed out waiting for a stock row lock")]
    LockTimeout,

    /// A deduction would drive a row below zero.
    #[error(
        "Stock row {warehouse_id}/{product_id} holds {available} units, cannot deduct {requested}"
    )]
    InsufficientRowQuantity {
        warehouse_id: WarehouseId,
        product_id: ProductId,
        available: i64,
        requested: i64,
    },

    /// A quantity that must be positive (or non-negative for onboarding) was not.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    /// The stock row does not exist.
    #[error("Stock row not found: warehouse {warehouse_id}, product {product_id}")]
    RowNotFound {
        warehouse_id: WarehouseId,
        product_id: ProductId,
    },

    /// A mutation was attempted on a row the transaction has not locked.
    #[error("Stock row {warehouse_id}/{product_id} is not locked by this transaction")]
    RowNotLocked {
        warehouse_id: WarehouseId,
        product_id: ProductId,
    },

    /// A stock row already exists for this warehouse and product.
    #[error("Stock row already exists: warehouse {warehouse_id}, product {product_id}")]
    DuplicateRow {
        warehouse_id: WarehouseId,
        product_id: ProductId,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Maps a raw sqlx error, recognising lock-wait and statement timeouts.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err
            && matches!(
                db_err.code().as_deref(),
                Some(LOCK_NOT_AVAILABLE | QUERY_CANCELED)
            )
        {
            return StoreError::LockTimeout;
        }
        StoreError::Database(err)
    }

    /// Returns true for failures a caller may reasonably retry: lock-wait
    /// timeouts, lost connections, pool exhaustion, deadlock or
    /// serialization aborts.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::LockTimeout => true,
            StoreError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db_err) => matches!(
                    db_err.code().as_deref(),
                    Some(
                        LOCK_NOT_AVAILABLE
                            | QUERY_CANCELED
                            | DEADLOCK_DETECTED
                            | SERIALIZATION_FAILURE
                    )
                ),
                _ => false,
            },
            _ => false,
        }
    }
}

/// Result type for stock store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
