use chrono::{DateTime, Utc};
use common::{ProductId, SaleId, WarehouseId};
use serde::{Deserialize, Serialize};
use stock_store::StockMovement;

/// Units of one product reserved from one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedItem {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a successful allocation, one item per movement written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub order_number: i64,
    pub sale_id: SaleId,
    pub items: Vec<AllocatedItem>,
}

impl AllocationResult {
    /// Builds the result from the movements recorded for the allocation.
    pub fn from_movements(order_number: i64, sale_id: SaleId, movements: &[StockMovement]) -> Self {
        Self {
            order_number,
            sale_id,
            items: movements
                .iter()
                .map(|movement| AllocatedItem {
                    product_id: movement.product_id,
                    warehouse_id: movement.warehouse_id,
                    quantity: movement.quantity,
                    timestamp: movement.created_at,
                })
                .collect(),
        }
    }

    /// Total units allocated for a product across warehouses.
    pub fn quantity_for(&self, product_id: ProductId) -> i64 {
        self.items
            .iter()
            .filter(|item| item.product_id == product_id)
            .fold(0i64, |total, item| total.saturating_add(item.quantity))
    }

    /// Total units allocated.
    pub fn total_units(&self) -> i64 {
        self.items
            .iter()
            .fold(0i64, |total, item| total.saturating_add(item.quantity))
    }
}
