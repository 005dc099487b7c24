use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{
    MovementId, NewMovement, ProductId, ProductStock, Result, SaleId, StockMovement, StockQuery,
    StockRow, StoreError, WarehouseId,
    store::{StockStore, StockTransaction, lock_order},
};

/// Rows are keyed product-first so that iteration follows lock order.
type RowKey = (ProductId, WarehouseId);

#[derive(Default)]
struct CommittedState {
    rows: BTreeMap<RowKey, i64>,
    movements: Vec<StockMovement>,
}

/// In-memory stock store for testing.
///
/// Provides the same locking contract as the PostgreSQL implementation:
/// each stock row has its own async mutex, transactions stage their writes
/// privately and publish them atomically on commit, and dropping a
/// transaction discards its writes and releases its locks.
#[derive(Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<RwLock<CommittedState>>,
    row_locks: Arc<Mutex<HashMap<RowKey, Arc<Mutex<()>>>>>,
    lock_timeout: Option<Duration>,
}

impl InMemoryStockStore {
    /// Creates a new empty in-memory stock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds how long a transaction may wait for a single row lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Returns the total number of movements recorded.
    pub async fn movement_count(&self) -> usize {
        self.state.read().await.movements.len()
    }

    /// Clears all rows and movements.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.rows.clear();
        state.movements.clear();
    }

    async fn acquire(
        &self,
        key: RowKey,
        timeout: Option<Duration>,
    ) -> Result<OwnedMutexGuard<()>> {
        let lock = self.row_locks.lock().await.entry(key).or_default().clone();

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| {
                    tracing::debug!(
                        product_id = %key.0,
                        warehouse_id = %key.1,
                        "row lock wait timed out"
                    );
                    StoreError::LockTimeout
                }),
            None => Ok(lock.lock_owned().await),
        }
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn begin(&self) -> Result<Box<dyn StockTransaction>> {
        Ok(Box::new(InMemoryStockTransaction::new(
            self.clone(),
            self.lock_timeout,
        )))
    }

    async fn begin_with_lock_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Box<dyn StockTransaction>> {
        let bound = self.lock_timeout.map_or(timeout, |own| own.min(timeout));
        Ok(Box::new(InMemoryStockTransaction::new(
            self.clone(),
            Some(bound),
        )))
    }

    async fn open_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<StockRow> {
        if quantity < 0 {
            return Err(StoreError::InvalidQuantity(quantity));
        }

        let mut state = self.state.write().await;
        let key = (product_id, warehouse_id);
        if state.rows.contains_key(&key) {
            return Err(StoreError::DuplicateRow {
                warehouse_id,
                product_id,
            });
        }
        state.rows.insert(key, quantity);

        Ok(StockRow::new(warehouse_id, product_id, quantity))
    }

    async fn get_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<StockRow>> {
        let state = self.state.read().await;
        Ok(state
            .rows
            .get(&(product_id, warehouse_id))
            .map(|quantity| StockRow::new(warehouse_id, product_id, *quantity)))
    }

    async fn list_stock(&self, query: StockQuery) -> Result<Vec<StockRow>> {
        let state = self.state.read().await;
        let rows = state
            .rows
            .iter()
            .map(|(&(product_id, warehouse_id), &quantity)| {
                StockRow::new(warehouse_id, product_id, quantity)
            })
            .filter(|row| query.matches(row));

        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn product_total(&self, product_id: ProductId) -> Result<Option<ProductStock>> {
        let state = self.state.read().await;
        let mut rows = state
            .rows
            .iter()
            .filter(|((p, _), _)| *p == product_id)
            .peekable();

        if rows.peek().is_none() {
            return Ok(None);
        }

        Ok(Some(ProductStock {
            product_id,
            total_quantity: rows
                .fold(0i64, |total, (_, quantity)| total.saturating_add(*quantity)),
        }))
    }

    async fn catalog(&self) -> Result<Vec<ProductStock>> {
        let state = self.state.read().await;
        let mut totals: BTreeMap<ProductId, i64> = BTreeMap::new();
        for (&(product_id, _), &quantity) in &state.rows {
            let total = totals.entry(product_id).or_default();
            *total = total.saturating_add(quantity);
        }

        Ok(totals
            .into_iter()
            .map(|(product_id, total_quantity)| ProductStock {
                product_id,
                total_quantity,
            })
            .collect())
    }

    async fn movements_for_sale(&self, sale_id: SaleId) -> Result<Vec<StockMovement>> {
        let state = self.state.read().await;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.sale_id == sale_id)
            .cloned()
            .collect())
    }

    async fn moved_total(
        &self,
        product_id: ProductId,
        warehouse_id: Option<WarehouseId>,
    ) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.product_id == product_id)
            .filter(|m| warehouse_id.is_none_or(|id| m.warehouse_id == id))
            .fold(0i64, |total, m| total.saturating_add(m.quantity)))
    }
}

/// A transaction against an [`InMemoryStockStore`].
pub struct InMemoryStockTransaction {
    store: InMemoryStockStore,
    guards: BTreeMap<RowKey, OwnedMutexGuard<()>>,
    staged_rows: BTreeMap<RowKey, i64>,
    staged_movements: Vec<StockMovement>,
    lock_timeout: Option<Duration>,
}

impl InMemoryStockTransaction {
    fn new(store: InMemoryStockStore, lock_timeout: Option<Duration>) -> Self {
        Self {
            store,
            guards: BTreeMap::new(),
            staged_rows: BTreeMap::new(),
            staged_movements: Vec::new(),
            lock_timeout,
        }
    }

    async fn lock_key(&mut self, key: RowKey) -> Result<()> {
        if !self.guards.contains_key(&key) {
            let guard = self.store.acquire(key, self.lock_timeout).await?;
            self.guards.insert(key, guard);
        }
        Ok(())
    }

    /// Quantity as this transaction sees it: its own staged write, else the
    /// committed value.
    fn current_quantity(&self, state: &CommittedState, key: &RowKey) -> Option<i64> {
        self.staged_rows
            .get(key)
            .or_else(|| state.rows.get(key))
            .copied()
    }

    async fn locked_quantity(&self, row: &StockRow) -> Result<i64> {
        let key = (row.product_id, row.warehouse_id);
        if !self.guards.contains_key(&key) {
            return Err(StoreError::RowNotLocked {
                warehouse_id: row.warehouse_id,
                product_id: row.product_id,
            });
        }

        let state = self.store.state.read().await;
        self.current_quantity(&state, &key)
            .ok_or(StoreError::RowNotFound {
                warehouse_id: row.warehouse_id,
                product_id: row.product_id,
            })
    }
}

#[async_trait]
impl StockTransaction for InMemoryStockTransaction {
    async fn lock_rows_for_products(&mut self, product_ids: &[ProductId]) -> Result<Vec<StockRow>> {
        let ids = lock_order(product_ids);

        let candidates: Vec<RowKey> = {
            let state = self.store.state.read().await;
            state
                .rows
                .iter()
                .filter(|(key, _)| ids.binary_search(&key.0).is_ok())
                .filter(|(key, _)| self.current_quantity(&state, key).unwrap_or(0) > 0)
                .map(|(key, _)| *key)
                .collect()
        };

        for key in &candidates {
            self.lock_key(*key).await?;
        }

        // Re-read once every lock is held: a competing transaction may have
        // committed a new quantity while we waited.
        let state = self.store.state.read().await;
        Ok(candidates
            .into_iter()
            .filter_map(|key| {
                let quantity = self.current_quantity(&state, &key)?;
                (quantity > 0).then(|| StockRow::new(key.1, key.0, quantity))
            })
            .collect())
    }

    async fn lock_row(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<StockRow>> {
        let key = (product_id, warehouse_id);
        if !self.store.state.read().await.rows.contains_key(&key) {
            return Ok(None);
        }

        self.lock_key(key).await?;

        let state = self.store.state.read().await;
        Ok(self
            .current_quantity(&state, &key)
            .map(|quantity| StockRow::new(warehouse_id, product_id, quantity)))
    }

    async fn apply_deduction(&mut self, row: &StockRow, amount: i64) -> Result<StockRow> {
        if amount <= 0 {
            return Err(StoreError::InvalidQuantity(amount));
        }

        let available = self.locked_quantity(row).await?;
        if amount > available {
            return Err(StoreError::InsufficientRowQuantity {
                warehouse_id: row.warehouse_id,
                product_id: row.product_id,
                available,
                requested: amount,
            });
        }

        let quantity = available - amount;
        self.staged_rows
            .insert((row.product_id, row.warehouse_id), quantity);
        Ok(StockRow::new(row.warehouse_id, row.product_id, quantity))
    }

    async fn apply_increase(&mut self, row: &StockRow, amount: i64) -> Result<StockRow> {
        if amount <= 0 {
            return Err(StoreError::InvalidQuantity(amount));
        }

        let quantity = self
            .locked_quantity(row)
            .await?
            .checked_add(amount)
            .ok_or(StoreError::InvalidQuantity(amount))?;
        self.staged_rows
            .insert((row.product_id, row.warehouse_id), quantity);
        Ok(StockRow::new(row.warehouse_id, row.product_id, quantity))
    }

    async fn insert_movement(&mut self, movement: NewMovement) -> Result<StockMovement> {
        if movement.quantity <= 0 {
            return Err(StoreError::InvalidQuantity(movement.quantity));
        }

        let key = (movement.product_id, movement.warehouse_id);
        if !self.store.state.read().await.rows.contains_key(&key) {
            return Err(StoreError::RowNotFound {
                warehouse_id: movement.warehouse_id,
                product_id: movement.product_id,
            });
        }

        let movement = movement.into_movement(MovementId::new(), Utc::now());
        self.staged_movements.push(movement.clone());
        Ok(movement)
    }

    async fn movements_for_sale(&mut self, sale_id: SaleId) -> Result<Vec<StockMovement>> {
        let state = self.store.state.read().await;
        Ok(state
            .movements
            .iter()
            .chain(self.staged_movements.iter())
            .filter(|m| m.sale_id == sale_id)
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            store,
            guards,
            staged_rows,
            staged_movements,
            ..
        } = *self;

        {
            let mut state = store.state.write().await;
            state.rows.extend(staged_rows);
            state.movements.extend(staged_movements);
        }

        // Locks are released only after the writes are visible.
        drop(guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
