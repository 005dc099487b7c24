//! Reply messages sent back for each allocation request.

use std::time::Duration;

use allocation::{AllocationError, AllocationResult, FieldError, Shortfall};
use common::SaleId;
use serde::{Deserialize, Serialize};

/// Discrete failure code carried by every rejected reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    InsufficientStock,
    SaleConflict,
    TransientError,
    InternalError,
}

/// Reply to one allocation request.
///
/// Serialized with a `status` tag:
/// `{"status":"allocated","order_number":..,"sale_id":..,"items":[..]}` or
/// `{"status":"rejected","code":"insufficient_stock",..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Allocated(AllocationResult),
    Rejected(Rejection),
}

/// Structured failure detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
    /// Echoed from the request when it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_id: Option<SaleId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shortfalls: Vec<Shortfall>,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>, sale_id: Option<SaleId>) -> Self {
        Self {
            code,
            message: message.into(),
            sale_id,
            field_errors: Vec::new(),
            shortfalls: Vec::new(),
        }
    }
}

impl Reply {
    /// Shapes an allocation failure.
    ///
    /// Internal store failures are logged here and replied with a generic
    /// message, so database details never leave the worker.
    pub fn from_error(sale_id: SaleId, err: AllocationError) -> Self {
        let sale_id = Some(sale_id);
        let rejection = match err {
            AllocationError::Validation(errors) => Rejection {
                field_errors: errors.0,
                ..Rejection::new(
                    ErrorCode::ValidationError,
                    "invalid allocation request",
                    sale_id,
                )
            },
            AllocationError::InsufficientStock(shortfalls) => Rejection {
                shortfalls,
                ..Rejection::new(ErrorCode::InsufficientStock, "insufficient stock", sale_id)
            },
            err @ AllocationError::SaleConflict { .. } => {
                Rejection::new(ErrorCode::SaleConflict, err.to_string(), sale_id)
            }
            err if err.is_transient() => {
                Rejection::new(ErrorCode::TransientError, err.to_string(), sale_id)
            }
            err => {
                tracing::error!(error = %err, "internal allocation error");
                Rejection::new(ErrorCode::InternalError, "internal error", sale_id)
            }
        };
        Reply::Rejected(rejection)
    }

    /// Reply for a payload that could not be read as an allocation request.
    pub fn malformed(sale_id: Option<SaleId>, field_errors: Vec<FieldError>) -> Self {
        Reply::Rejected(Rejection {
            field_errors,
            ..Rejection::new(
                ErrorCode::ValidationError,
                "malformed allocation request",
                sale_id,
            )
        })
    }

    /// Reply for an allocation abandoned at its deadline.
    pub fn timed_out(sale_id: SaleId, after: Duration) -> Self {
        Reply::Rejected(Rejection::new(
            ErrorCode::TransientError,
            format!("allocation timed out after {}ms", after.as_millis()),
            Some(sale_id),
        ))
    }

    /// Reply for a request the worker pool could not run.
    pub fn unavailable() -> Self {
        Reply::Rejected(Rejection::new(
            ErrorCode::TransientError,
            "worker pool unavailable",
            None,
        ))
    }

    /// Failure code, or `None` for a successful allocation.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Reply::Allocated(_) => None,
            Reply::Rejected(rejection) => Some(rejection.code),
        }
    }
}
