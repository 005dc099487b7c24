use crate::{ProductId, StockRow, WarehouseId};

/// Filter for listing stock rows.
///
/// Unset fields match every row. Results are ordered by product, then
/// warehouse.
#[derive(Debug, Clone, Default)]
pub struct StockQuery {
    /// Filter by warehouse.
    pub warehouse_id: Option<WarehouseId>,

    /// Filter by product.
    pub product_id: Option<ProductId>,

    /// Only return rows with quantity above zero.
    pub in_stock_only: bool,

    /// Maximum number of rows to return.
    pub limit: Option<usize>,
}

impl StockQuery {
    /// Creates a query matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for every row of one warehouse.
    pub fn for_warehouse(warehouse_id: WarehouseId) -> Self {
        Self {
            warehouse_id: Some(warehouse_id),
            ..Default::default()
        }
    }

    /// Creates a query for every row of one product.
    pub fn for_product(product_id: ProductId) -> Self {
        Self {
            product_id: Some(product_id),
            ..Default::default()
        }
    }

    /// Filters by warehouse.
    pub fn warehouse_id(mut self, id: WarehouseId) -> Self {
        self.warehouse_id = Some(id);
        self
    }

    /// Filters by product.
    pub fn product_id(mut self, id: ProductId) -> Self {
        self.product_id = Some(id);
        self
    }

    /// Skips empty rows.
    pub fn in_stock_only(mut self) -> Self {
        self.in_stock_only = true;
        self
    }

    /// Limits the number of rows returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `row` passes every filter (limit aside).
    pub fn matches(&self, row: &StockRow) -> bool {
        if let Some(id) = self.warehouse_id
            && row.warehouse_id != id
        {
            return false;
        }
        if let Some(id) = self.product_id
            && row.product_id != id
        {
            return false;
        }
        !(self.in_stock_only && row.quantity <= 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_matches_everything() {
        let row = StockRow::new(WarehouseId::new(), ProductId::new(), 0);
        assert!(StockQuery::new().matches(&row));
    }

    #[test]
    fn query_for_warehouse() {
        let warehouse = WarehouseId::new();
        let query = StockQuery::for_warehouse(warehouse);

        assert!(query.matches(&StockRow::new(warehouse, ProductId::new(), 3)));
        assert!(!query.matches(&StockRow::new(WarehouseId::new(), ProductId::new(), 3)));
    }

    #[test]
    fn query_builder_chain() {
        let warehouse = WarehouseId::new();
        let product = ProductId::new();
        let query = StockQuery::new()
            .warehouse_id(warehouse)
            .product_id(product)
            .in_stock_only()
            .limit(10);

        assert_eq!(query.warehouse_id, Some(warehouse));
        assert_eq!(query.product_id, Some(product));
        assert_eq!(query.limit, Some(10));
        assert!(query.matches(&StockRow::new(warehouse, product, 1)));
        assert!(!query.matches(&StockRow::new(warehouse, product, 0)));
    }
}
