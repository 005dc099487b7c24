//! Identifier types shared by the stock allocation crates.

pub mod types;

pub use types::{MovementId, ProductId, SaleId, WarehouseId};
