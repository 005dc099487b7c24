use std::time::Duration;

use async_trait::async_trait;

use crate::{
    NewMovement, ProductId, ProductStock, Result, SaleId, StockMovement, StockQuery, StockRow,
    WarehouseId,
};

/// Core trait for stock ledger implementations.
///
/// Reads issued directly on the store see committed state only. Every
/// mutation of an existing row goes through a [`StockTransaction`], which
/// locks the rows it touches before changing them. All implementations must
/// be thread-safe (Send + Sync).
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Opens a new transaction.
    ///
    /// Dropping the returned transaction without committing rolls it back
    /// and releases every lock it holds.
    async fn begin(&self) -> Result<Box<dyn StockTransaction>>;

    /// Opens a new transaction whose lock waits and statements give up
    /// with `LockTimeout` after at most `timeout`, even when the store
    /// itself waits indefinitely.
    ///
    /// Callers with a deadline use this instead of abandoning a pending
    /// `begin` transaction: the store stops waiting on its own, so the
    /// transaction can be rolled back before the caller answers.
    async fn begin_with_lock_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Box<dyn StockTransaction>>;

    /// Creates the stock row for a product newly stocked in a warehouse.
    ///
    /// Fails with `DuplicateRow` if the row already exists and with
    /// `InvalidQuantity` for a negative quantity.
    async fn open_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<StockRow>;

    /// Retrieves a single stock row.
    async fn get_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<StockRow>>;

    /// Lists stock rows matching a query, ordered by product then warehouse.
    async fn list_stock(&self, query: StockQuery) -> Result<Vec<StockRow>>;

    /// Sums a product's quantity across all warehouses.
    ///
    /// Returns None if the product has no stock rows at all.
    async fn product_total(&self, product_id: ProductId) -> Result<Option<ProductStock>>;

    /// Sums every product's quantity across all warehouses, ordered by product.
    async fn catalog(&self) -> Result<Vec<ProductStock>>;

    /// Retrieves the movements recorded for a sale, oldest first.
    async fn movements_for_sale(&self, sale_id: SaleId) -> Result<Vec<StockMovement>>;

    /// Sums the quantity ever moved out for a product, optionally restricted
    /// to a single warehouse.
    async fn moved_total(
        &self,
        product_id: ProductId,
        warehouse_id: Option<WarehouseId>,
    ) -> Result<i64>;
}

/// An open unit of work against the stock ledger.
///
/// Row locks taken by a transaction are held until `commit` or `rollback`
/// (or drop). Nothing written through a transaction is visible to other
/// readers before `commit` returns.
#[async_trait]
pub trait StockTransaction: Send {
    /// Acquires write locks on every row of the given products that holds a
    /// positive quantity, blocking while another transaction holds any of
    /// them.
    ///
    /// Rows are locked in primary-key order (product, then warehouse) and
    /// returned in that order with their current quantities.
    async fn lock_rows_for_products(&mut self, product_ids: &[ProductId]) -> Result<Vec<StockRow>>;

    /// Locks a single row regardless of its quantity.
    ///
    /// Returns None if the row does not exist.
    async fn lock_row(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<StockRow>>;

    /// Decrements a locked row in place and returns its new state.
    ///
    /// The caller guarantees `amount <= row.quantity`; the store refuses any
    /// deduction that would drive the row negative.
    async fn apply_deduction(&mut self, row: &StockRow, amount: i64) -> Result<StockRow>;

    /// Increments a locked row in place and returns its new state.
    async fn apply_increase(&mut self, row: &StockRow, amount: i64) -> Result<StockRow>;

    /// Appends a movement record.
    async fn insert_movement(&mut self, movement: NewMovement) -> Result<StockMovement>;

    /// Retrieves the movements for a sale as seen by this transaction,
    /// including its own uncommitted writes.
    async fn movements_for_sale(&mut self, sale_id: SaleId) -> Result<Vec<StockMovement>>;

    /// Makes every write durable and releases the locks.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every write and releases the locks.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Returns the distinct product ids in ascending order.
///
/// This is the lock-acquisition order shared by every transaction, which
/// keeps two allocations over overlapping product sets from deadlocking.
pub fn lock_order(product_ids: &[ProductId]) -> Vec<ProductId> {
    let mut ids = product_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}
