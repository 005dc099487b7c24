//! Transactional allocation executor.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use common::{ProductId, WarehouseId};
use stock_store::{NewMovement, StockMovement, StockRow, StockStore, StockTransaction, StoreError};
use tokio::sync::broadcast;

use crate::error::{AllocationError, Result};
use crate::events::StockChanged;
use crate::planner::{self, Shortfall};
use crate::request::{AllocationRequest, Demand, ValidationErrors};
use crate::result::AllocationResult;

const CHANGE_FEED_CAPACITY: usize = 1024;

/// Uncommitted outcome of one allocation transaction.
enum Staged {
    Deducted(Vec<StockMovement>),
    AlreadyAllocated(Vec<StockMovement>),
    Short(Vec<Shortfall>),
}

/// Reserves stock for sales against a shared stock store.
///
/// Each allocation runs in a single store transaction:
/// 1. Validate the request (no transaction yet)
/// 2. Lock every stocked row of the requested products, ascending product order
/// 3. Plan deductions on the locked snapshot
/// 4. Roll back with the full shortfall list, or deduct, record one movement
///    per deduction and commit
///
/// The allocator holds no state besides the store handle and the change
/// feed, so one instance can be shared by any number of concurrent workers.
pub struct Allocator<S: StockStore> {
    store: S,
    changes: broadcast::Sender<StockChanged>,
}

impl<S: StockStore> Allocator<S> {
    /// Creates a new allocator over the given store.
    pub fn new(store: S) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { store, changes }
    }

    /// Returns a reference to the underlying store, for read-side queries.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Subscribes to committed stock changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StockChanged> {
        self.changes.subscribe()
    }

    /// Allocates stock for every item of a request, all or nothing.
    ///
    /// Replaying a request for a sale that is already allocated returns the
    /// recorded allocation without touching stock again.
    pub async fn allocate(&self, request: &AllocationRequest) -> Result<AllocationResult> {
        self.allocate_bounded(request, None).await
    }

    /// Like [`Allocator::allocate`], but the store gives up waiting for row
    /// locks after `deadline`.
    ///
    /// The expired wait surfaces as a transient store error once the
    /// transaction has been rolled back, so no row stays locked after the
    /// caller has its answer.
    pub async fn allocate_within(
        &self,
        request: &AllocationRequest,
        deadline: Duration,
    ) -> Result<AllocationResult> {
        self.allocate_bounded(request, Some(deadline)).await
    }

    #[tracing::instrument(
        name = "allocate",
        skip(self, request),
        fields(sale_id = %request.sale_id, order_number = request.order_number)
    )]
    async fn allocate_bounded(
        &self,
        request: &AllocationRequest,
        deadline: Option<Duration>,
    ) -> Result<AllocationResult> {
        metrics::counter!("allocations_total").increment(1);
        let started = Instant::now();

        let outcome = self.run_allocation(request, deadline).await;

        metrics::histogram!("allocation_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        match &outcome {
            Ok(result) => {
                metrics::counter!("allocations_succeeded").increment(1);
                metrics::counter!("stock_units_allocated").increment(result.total_units() as u64);
            }
            Err(err) => {
                metrics::counter!("allocations_rejected", "reason" => err.code()).increment(1);
                match err {
                    AllocationError::Store(store_err) => {
                        tracing::error!(error = %store_err, "allocation failed");
                    }
                    other => tracing::info!(reason = other.code(), "allocation rejected"),
                }
            }
        }

        outcome
    }

    async fn run_allocation(
        &self,
        request: &AllocationRequest,
        deadline: Option<Duration>,
    ) -> Result<AllocationResult> {
        let demand = request.validate()?;

        let mut tx = match deadline {
            Some(deadline) => self.store.begin_with_lock_timeout(deadline).await?,
            None => self.store.begin().await?,
        };

        // Every outcome but a deduction ends in an explicit rollback, so the
        // locks are gone before the caller sees the result.
        let movements = match Self::stage(request, &demand, tx.as_mut()).await {
            Ok(Staged::Deducted(movements)) => movements,
            Ok(Staged::AlreadyAllocated(recorded)) => {
                tx.rollback().await?;
                return Self::replay(request, &demand, &recorded);
            }
            Ok(Staged::Short(shortfalls)) => {
                tx.rollback().await?;
                return Err(AllocationError::InsufficientStock(shortfalls));
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after failed allocation failed");
                }
                return Err(err);
            }
        };

        tx.commit().await?;
        tracing::info!(
            movements = movements.len(),
            units = demand.total_units(),
            "allocation committed"
        );

        self.publish_changes(&demand.product_ids()).await;

        Ok(AllocationResult::from_movements(
            request.order_number,
            request.sale_id,
            &movements,
        ))
    }

    /// Locks, plans and, if stock suffices, writes the deductions and
    /// movements into `tx` without committing.
    async fn stage(
        request: &AllocationRequest,
        demand: &Demand,
        tx: &mut dyn StockTransaction,
    ) -> Result<Staged> {
        let rows = tx.lock_rows_for_products(&demand.product_ids()).await?;
        tracing::debug!(
            product_count = demand.len(),
            locked_rows = rows.len(),
            "stock rows locked"
        );

        let recorded = tx.movements_for_sale(request.sale_id).await?;
        if !recorded.is_empty() {
            return Ok(Staged::AlreadyAllocated(recorded));
        }

        let deductions = match planner::plan(demand, &rows) {
            Ok(deductions) => deductions,
            Err(shortfalls) => return Ok(Staged::Short(shortfalls)),
        };

        let mut movements = Vec::with_capacity(deductions.len());
        for deduction in &deductions {
            tx.apply_deduction(&deduction.row, deduction.amount).await?;
            let movement = tx
                .insert_movement(NewMovement {
                    product_id: deduction.product_id(),
                    warehouse_id: deduction.warehouse_id(),
                    quantity: deduction.amount,
                    sale_id: request.sale_id,
                    order_number: request.order_number,
                })
                .await?;
            movements.push(movement);
        }

        Ok(Staged::Deducted(movements))
    }

    /// Answers a replayed request from the movements already on record.
    fn replay(
        request: &AllocationRequest,
        demand: &Demand,
        recorded: &[StockMovement],
    ) -> Result<AllocationResult> {
        let mut recorded_totals: BTreeMap<ProductId, i64> = BTreeMap::new();
        for movement in recorded {
            let total = recorded_totals.entry(movement.product_id).or_default();
            *total = total.saturating_add(movement.quantity);
        }

        let same_order = recorded
            .iter()
            .all(|movement| movement.order_number == request.order_number);
        let same_items = recorded_totals.len() == demand.len()
            && demand
                .iter()
                .all(|(product_id, quantity)| recorded_totals.get(&product_id) == Some(&quantity));

        if !(same_order && same_items) {
            return Err(AllocationError::SaleConflict {
                sale_id: request.sale_id,
            });
        }

        tracing::info!(
            movements = recorded.len(),
            "sale already allocated, returning recorded allocation"
        );
        Ok(AllocationResult::from_movements(
            request.order_number,
            request.sale_id,
            recorded,
        ))
    }

    /// Creates the stock row for a product newly stocked in a warehouse.
    #[tracing::instrument(skip(self))]
    pub async fn open_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<StockRow> {
        if quantity < 0 {
            return Err(ValidationErrors::single("quantity", "must not be negative").into());
        }

        let row = self
            .store
            .open_stock(warehouse_id, product_id, quantity)
            .await?;
        self.publish_changes(&[product_id]).await;
        Ok(row)
    }

    /// Adds units to an existing stock row through the same lock-then-mutate
    /// path as allocations.
    #[tracing::instrument(skip(self))]
    pub async fn restock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<StockRow> {
        if quantity <= 0 {
            return Err(ValidationErrors::single("quantity", "must be greater than zero").into());
        }

        let mut tx = self.store.begin().await?;
        let row = tx
            .lock_row(warehouse_id, product_id)
            .await?
            .ok_or(StoreError::RowNotFound {
                warehouse_id,
                product_id,
            })?;
        let updated = tx.apply_increase(&row, quantity).await?;
        tx.commit().await?;

        tracing::info!(new_quantity = updated.quantity, "stock replenished");
        self.publish_changes(&[product_id]).await;
        Ok(updated)
    }

    /// Emits one [`StockChanged`] per product with its post-commit total.
    ///
    /// Runs after commit, so a failure here is logged rather than returned:
    /// the mutation itself has already succeeded.
    async fn publish_changes(&self, product_ids: &[ProductId]) {
        if self.changes.receiver_count() == 0 {
            return;
        }

        for product_id in product_ids {
            match self.store.product_total(*product_id).await {
                Ok(Some(total)) => {
                    // A send error only means every subscriber has gone away.
                    let _ = self.changes.send(StockChanged {
                        product_id: total.product_id,
                        total_quantity: total.total_quantity,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%product_id, error = %err, "failed to read stock total for change feed");
                }
            }
        }
    }
}
