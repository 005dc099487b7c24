//! Persisted stock records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MovementId, ProductId, SaleId, WarehouseId};

/// Available quantity of one product in one warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRow {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub quantity: i64,
}

impl StockRow {
    pub fn new(warehouse_id: WarehouseId, product_id: ProductId, quantity: i64) -> Self {
        Self {
            warehouse_id,
            product_id,
            quantity,
        }
    }
}

/// Immutable record that `quantity` units left a warehouse for a sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: i64,
    pub sale_id: SaleId,
    pub order_number: i64,
    pub created_at: DateTime<Utc>,
}

/// A movement about to be written. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovement {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: i64,
    pub sale_id: SaleId,
    pub order_number: i64,
}

impl NewMovement {
    pub(crate) fn into_movement(self, id: MovementId, created_at: DateTime<Utc>) -> StockMovement {
        StockMovement {
            id,
            product_id: self.product_id,
            warehouse_id: self.warehouse_id,
            quantity: self.quantity,
            sale_id: self.sale_id,
            order_number: self.order_number,
            created_at,
        }
    }
}

/// Quantity of a product summed across every warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: ProductId,
    pub total_quantity: i64,
}
