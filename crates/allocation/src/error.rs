//! Allocation error types.

use common::SaleId;
use stock_store::StoreError;
use thiserror::Error;

use crate::planner::Shortfall;
use crate::request::ValidationErrors;

/// Errors that can occur while allocating or replenishing stock.
///
/// No variant is ever returned after a commit: every error path leaves the
/// stock rows and movement log untouched.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The request is malformed. Rejected before any transaction is opened.
    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    /// One or more products lack stock. Lists every short product.
    #[error("Insufficient stock for {} product(s)", .0.len())]
    InsufficientStock(Vec<Shortfall>),

    /// The sale was already allocated with a different order number or
    /// different quantities.
    #[error("Sale {sale_id} was already allocated with different contents")]
    SaleConflict { sale_id: SaleId },

    /// The stock store failed.
    #[error("Stock store error: {0}")]
    Store(#[from] StoreError),
}

impl AllocationError {
    /// Discrete reply code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AllocationError::Validation(_) => "validation_error",
            AllocationError::InsufficientStock(_) => "insufficient_stock",
            AllocationError::SaleConflict { .. } => "sale_conflict",
            AllocationError::Store(err) if err.is_transient() => "transient_error",
            AllocationError::Store(_) => "internal_error",
        }
    }

    /// Returns true if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AllocationError::Store(err) if err.is_transient())
    }
}

/// Convenience type alias for allocation results.
pub type Result<T> = std::result::Result<T, AllocationError>;
