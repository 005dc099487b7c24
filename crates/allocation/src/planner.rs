//! Allocation planning.
//!
//! The planner is a pure function of the demand and a snapshot of locked
//! stock rows. It never touches storage, so the same inputs always yield the
//! same deductions in the same order.

use std::collections::BTreeMap;

use common::{ProductId, WarehouseId};
use serde::{Deserialize, Serialize};
use stock_store::StockRow;

use crate::request::Demand;

/// Deficit between requested and available quantity for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub product_id: ProductId,
    pub available: i64,
    pub requested: i64,
}

/// Units to take from one stock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedDeduction {
    /// The row as it was in the snapshot.
    pub row: StockRow,
    pub amount: i64,
}

impl PlannedDeduction {
    pub fn product_id(&self) -> ProductId {
        self.row.product_id
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        self.row.warehouse_id
    }
}

/// Splits `demand` across `rows`.
///
/// Rows of each product are drained fullest first, with warehouse id
/// breaking ties, so that an order ships from as few warehouses as possible.
/// If any product is short, nothing is planned and every short product is
/// returned in ascending product order. Rows for products outside the demand
/// and rows without stock are ignored.
pub fn plan(demand: &Demand, rows: &[StockRow]) -> Result<Vec<PlannedDeduction>, Vec<Shortfall>> {
    let mut candidates: Vec<StockRow> = rows
        .iter()
        .filter(|row| row.quantity > 0 && demand.requested(&row.product_id) > 0)
        .copied()
        .collect();
    candidates.sort_by(|a, b| {
        a.product_id
            .cmp(&b.product_id)
            .then(b.quantity.cmp(&a.quantity))
            .then(a.warehouse_id.cmp(&b.warehouse_id))
    });

    let mut by_product: BTreeMap<ProductId, Vec<StockRow>> = BTreeMap::new();
    for row in candidates {
        by_product.entry(row.product_id).or_default().push(row);
    }

    let shortfalls: Vec<Shortfall> = demand
        .iter()
        .filter_map(|(product_id, requested)| {
            // Saturates: a total beyond i64::MAX covers any valid request anyway.
            let available = by_product
                .get(&product_id)
                .map(|rows| {
                    rows.iter()
                        .fold(0i64, |total, row| total.saturating_add(row.quantity))
                })
                .unwrap_or(0);
            (available < requested).then_some(Shortfall {
                product_id,
                available,
                requested,
            })
        })
        .collect();

    if !shortfalls.is_empty() {
        return Err(shortfalls);
    }

    let mut deductions = Vec::new();
    for (product_id, requested) in demand.iter() {
        let mut remaining = requested;
        for row in by_product.get(&product_id).into_iter().flatten() {
            if remaining == 0 {
                break;
            }
            let amount = remaining.min(row.quantity);
            deductions.push(PlannedDeduction { row: *row, amount });
            remaining -= amount;
        }
    }

    Ok(deductions)
}
