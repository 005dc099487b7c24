//! Stock allocation engine.
//!
//! This crate reserves warehouse inventory for sales:
//! - `request`: typed allocation requests and their validation
//! - `planner`: pure, deterministic split of demand across warehouse rows
//! - `allocator`: the transactional executor (lock, plan, deduct, record)
//! - `events`: post-commit stock change notifications

pub mod allocator;
pub mod error;
pub mod events;
pub mod planner;
pub mod request;
pub mod result;

pub use allocator::Allocator;
pub use error::{AllocationError, Result};
pub use events::StockChanged;
pub use planner::{PlannedDeduction, Shortfall, plan};
pub use request::{AllocationItem, AllocationRequest, Demand, FieldError, ValidationErrors};
pub use result::{AllocatedItem, AllocationResult};
