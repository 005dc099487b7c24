//! Integration tests for the allocator over the in-memory stock store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use allocation::{
    AllocationError, AllocationItem, AllocationRequest, Allocator, Shortfall, StockChanged,
};
use common::{ProductId, SaleId, WarehouseId};
use futures_util::future::join_all;
use stock_store::{InMemoryStockStore, StockQuery, StockStore, StockTransaction, StoreError};
use uuid::Uuid;

struct TestHarness {
    allocator: Arc<Allocator<InMemoryStockStore>>,
    store: InMemoryStockStore,
}

impl TestHarness {
    fn new() -> Self {
        let store = InMemoryStockStore::new();
        Self {
            allocator: Arc::new(Allocator::new(store.clone())),
            store,
        }
    }

    async fn stock(&self, rows: &[(WarehouseId, ProductId, i64)]) {
        for (warehouse, product, quantity) in rows {
            self.store
                .open_stock(*warehouse, *product, *quantity)
                .await
                .unwrap();
        }
    }

    async fn quantity(&self, warehouse: WarehouseId, product: ProductId) -> i64 {
        self.store
            .get_stock(warehouse, product)
            .await
            .unwrap()
            .unwrap()
            .quantity
    }

    async fn snapshot(&self) -> HashMap<(WarehouseId, ProductId), i64> {
        self.store
            .list_stock(StockQuery::new())
            .await
            .unwrap()
            .into_iter()
            .map(|row| ((row.warehouse_id, row.product_id), row.quantity))
            .collect()
    }
}

fn warehouse(n: u128) -> WarehouseId {
    WarehouseId::from_uuid(Uuid::from_u128(n))
}

fn request(items: &[(ProductId, i64)]) -> AllocationRequest {
    AllocationRequest::new(
        100,
        SaleId::new(),
        items
            .iter()
            .map(|(product, quantity)| AllocationItem::new(*product, *quantity))
            .collect(),
    )
}

#[tokio::test]
async fn fullest_warehouse_is_drained_first() {
    let h = TestHarness::new();
    let (w1, w2) = (warehouse(1), warehouse(2));
    let p = ProductId::new();
    h.stock(&[(w1, p, 10), (w2, p, 5)]).await;

    let result = h.allocator.allocate(&request(&[(p, 12)])).await.unwrap();

    let taken: Vec<_> = result
        .items
        .iter()
        .map(|item| (item.warehouse_id, item.quantity))
        .collect();
    assert_eq!(taken, vec![(w1, 10), (w2, 2)]);
    assert_eq!(h.quantity(w1, p).await, 0);
    assert_eq!(h.quantity(w2, p).await, 3);
    assert_eq!(h.store.movement_count().await, 2);
}

#[tokio::test]
async fn shortfall_leaves_stock_untouched() {
    let h = TestHarness::new();
    let (w1, w2) = (warehouse(1), warehouse(2));
    let p = ProductId::new();
    h.stock(&[(w1, p, 3), (w2, p, 2)]).await;

    let err = h.allocator.allocate(&request(&[(p, 6)])).await.unwrap_err();

    match err {
        AllocationError::InsufficientStock(shortfalls) => assert_eq!(
            shortfalls,
            vec![Shortfall {
                product_id: p,
                available: 5,
                requested: 6
            }]
        ),
        other => panic!("expected insufficient stock, got {other:?}"),
    }
    assert_eq!(h.quantity(w1, p).await, 3);
    assert_eq!(h.quantity(w2, p).await, 2);
    assert_eq!(h.store.movement_count().await, 0);
}

#[tokio::test]
async fn one_short_product_blocks_the_whole_request() {
    let h = TestHarness::new();
    let w = warehouse(1);
    let plenty = ProductId::new();
    let scarce = ProductId::new();
    let missing = ProductId::new();
    h.stock(&[(w, plenty, 50), (w, scarce, 1)]).await;
    let before = h.snapshot().await;

    let err = h
        .allocator
        .allocate(&request(&[(plenty, 10), (scarce, 2), (missing, 3)]))
        .await
        .unwrap_err();

    let AllocationError::InsufficientStock(shortfalls) = err else {
        panic!("expected insufficient stock");
    };
    let short: HashMap<_, _> = shortfalls
        .iter()
        .map(|s| (s.product_id, (s.available, s.requested)))
        .collect();
    assert_eq!(short.len(), 2);
    assert_eq!(short[&scarce], (1, 2));
    assert_eq!(short[&missing], (0, 3));

    assert_eq!(h.snapshot().await, before);
    assert_eq!(h.store.movement_count().await, 0);
}

#[tokio::test]
async fn invalid_request_never_opens_a_transaction() {
    let h = TestHarness::new();
    let w = warehouse(1);
    let p = ProductId::new();
    h.stock(&[(w, p, 5)]).await;

    // Hold the only row lock: a request that got as far as locking would block.
    let mut holder = h.store.begin().await.unwrap();
    holder.lock_rows_for_products(&[p]).await.unwrap();

    let err = tokio::time::timeout(
        Duration::from_secs(1),
        h.allocator.allocate(&request(&[(p, 0)])),
    )
    .await
    .expect("validation must not wait for locks")
    .unwrap_err();

    assert_eq!(err.code(), "validation_error");
    drop(holder);
    assert_eq!(h.quantity(w, p).await, 5);
}

#[tokio::test]
async fn movement_totals_match_requested_quantities() {
    let h = TestHarness::new();
    let (w1, w2, w3) = (warehouse(1), warehouse(2), warehouse(3));
    let a = ProductId::new();
    let b = ProductId::new();
    h.stock(&[(w1, a, 4), (w2, a, 4), (w3, a, 4), (w1, b, 7), (w2, b, 2)])
        .await;
    let before = h.snapshot().await;

    let req = request(&[(a, 9), (b, 8)]);
    let result = h.allocator.allocate(&req).await.unwrap();

    assert_eq!(result.quantity_for(a), 9);
    assert_eq!(result.quantity_for(b), 8);
    assert_eq!(result.sale_id, req.sale_id);
    assert_eq!(result.order_number, req.order_number);

    let after = h.snapshot().await;
    let deducted: i64 = before.iter().map(|(key, q)| q - after[key]).sum();
    assert_eq!(deducted, 17);
    assert!(after.values().all(|q| *q >= 0));

    let movements = h.store.movements_for_sale(req.sale_id).await.unwrap();
    assert_eq!(movements.len(), result.items.len());
    assert_eq!(h.store.moved_total(a, None).await.unwrap(), 9);
    assert_eq!(h.store.moved_total(b, Some(w1)).await.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contended_row_is_never_oversold() {
    for _ in 0..20 {
        let h = TestHarness::new();
        let w = warehouse(1);
        let p = ProductId::new();
        h.stock(&[(w, p, 10)]).await;

        let tasks = (0..2).map(|_| {
            let allocator = h.allocator.clone();
            tokio::spawn(async move { allocator.allocate(&request(&[(p, 6)])).await })
        });
        let outcomes: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let successes = outcomes.iter().filter(|o| o.is_ok()).count();
        let shortages = outcomes
            .iter()
            .filter(|o| matches!(o, Err(AllocationError::InsufficientStock(_))))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(shortages, 1);
        assert_eq!(h.quantity(w, p).await, 4);
        assert_eq!(h.store.movement_count().await, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_requests_run_independently() {
    let h = TestHarness::new();
    let (w1, w2) = (warehouse(1), warehouse(2));
    let a = ProductId::new();
    let b = ProductId::new();
    h.stock(&[(w1, a, 8), (w2, a, 8), (w1, b, 5)]).await;

    let req_a = request(&[(a, 12)]);
    let req_b = request(&[(b, 5)]);
    let (ra, rb) = tokio::join!(h.allocator.allocate(&req_a), h.allocator.allocate(&req_b));

    let ra = ra.unwrap();
    let rb = rb.unwrap();
    assert_eq!(ra.items.len(), 2);
    assert_eq!(ra.quantity_for(a), 12);
    assert_eq!(rb.items.len(), 1);
    assert_eq!(rb.quantity_for(b), 5);
    assert_eq!(h.store.movements_for_sale(req_a.sale_id).await.unwrap().len(), 2);
    assert_eq!(h.store.movements_for_sale(req_b.sale_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_product_sets_do_not_deadlock() {
    let h = TestHarness::new();
    let w = warehouse(1);
    let a = ProductId::new();
    let b = ProductId::new();
    let c = ProductId::new();
    h.stock(&[(w, a, 1_000), (w, b, 1_000), (w, c, 1_000)]).await;

    let tasks = (0..60).map(|i| {
        let allocator = h.allocator.clone();
        // Same products listed in different orders.
        let items = match i % 3 {
            0 => vec![(a, 1), (b, 1), (c, 1)],
            1 => vec![(c, 1), (b, 1), (a, 1)],
            _ => vec![(b, 1), (c, 1), (a, 1)],
        };
        tokio::spawn(async move { allocator.allocate(&request(&items)).await })
    });

    let outcomes = tokio::time::timeout(Duration::from_secs(10), join_all(tasks))
        .await
        .expect("allocations deadlocked");

    assert!(outcomes.into_iter().all(|o| o.unwrap().is_ok()));
    for product in [a, b, c] {
        assert_eq!(h.quantity(w, product).await, 940);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_demand_conserves_stock() {
    let h = TestHarness::new();
    let (w1, w2, w3) = (warehouse(1), warehouse(2), warehouse(3));
    let a = ProductId::new();
    let b = ProductId::new();
    h.stock(&[(w1, a, 13), (w2, a, 9), (w3, a, 5), (w1, b, 6), (w3, b, 11)])
        .await;

    let tasks = (0..25).map(|i| {
        let allocator = h.allocator.clone();
        let items = vec![(a, 1 + i % 3), (b, 1 + i % 2)];
        tokio::spawn(async move { allocator.allocate(&request(&items)).await })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let mut allocated_a = 0;
    let mut allocated_b = 0;
    for outcome in &results {
        match outcome {
            Ok(result) => {
                allocated_a += result.quantity_for(a);
                allocated_b += result.quantity_for(b);
            }
            Err(AllocationError::InsufficientStock(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    let total_a = h.store.product_total(a).await.unwrap().unwrap().total_quantity;
    let total_b = h.store.product_total(b).await.unwrap().unwrap().total_quantity;
    assert_eq!(total_a + allocated_a, 27);
    assert_eq!(total_b + allocated_b, 17);
    assert!(total_a >= 0 && total_b >= 0);
    assert_eq!(h.store.moved_total(a, None).await.unwrap(), allocated_a);
    assert_eq!(h.store.moved_total(b, None).await.unwrap(), allocated_b);
}

#[tokio::test]
async fn replayed_request_returns_recorded_allocation() {
    let h = TestHarness::new();
    let w = warehouse(1);
    let p = ProductId::new();
    h.stock(&[(w, p, 10)]).await;

    let req = request(&[(p, 4)]);
    let first = h.allocator.allocate(&req).await.unwrap();
    let second = h.allocator.allocate(&req).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.quantity(w, p).await, 6);
    assert_eq!(h.store.movement_count().await, 1);
}

#[tokio::test]
async fn reused_sale_with_different_items_conflicts() {
    let h = TestHarness::new();
    let w = warehouse(1);
    let p = ProductId::new();
    h.stock(&[(w, p, 10)]).await;

    let req = request(&[(p, 4)]);
    h.allocator.allocate(&req).await.unwrap();

    let mut changed = req.clone();
    changed.items[0].quantity = 5;
    let err = h.allocator.allocate(&changed).await.unwrap_err();

    assert!(matches!(err, AllocationError::SaleConflict { sale_id } if sale_id == req.sale_id));
    assert_eq!(h.quantity(w, p).await, 6);
}

#[tokio::test]
async fn lock_timeout_surfaces_as_transient_error() {
    let store = InMemoryStockStore::new().with_lock_timeout(Duration::from_millis(20));
    let allocator = Allocator::new(store.clone());
    let w = warehouse(1);
    let p = ProductId::new();
    store.open_stock(w, p, 5).await.unwrap();

    let mut holder = store.begin().await.unwrap();
    holder.lock_rows_for_products(&[p]).await.unwrap();

    let err = allocator.allocate(&request(&[(p, 1)])).await.unwrap_err();

    assert!(matches!(err, AllocationError::Store(StoreError::LockTimeout)));
    assert!(err.is_transient());
    assert_eq!(err.code(), "transient_error");
}

#[tokio::test]
async fn bounded_allocation_gives_up_and_rolls_back() {
    let h = TestHarness::new();
    let w = warehouse(1);
    let first = ProductId::from_uuid(Uuid::from_u128(1));
    let second = ProductId::from_uuid(Uuid::from_u128(2));
    h.stock(&[(w, first, 5), (w, second, 5)]).await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_row(w, second).await.unwrap();

    let err = h
        .allocator
        .allocate_within(&request(&[(first, 1), (second, 1)]), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::Store(StoreError::LockTimeout)));
    assert!(err.is_transient());

    // The row locked before the wait gave up is free again.
    let mut other = h
        .store
        .begin_with_lock_timeout(Duration::from_millis(10))
        .await
        .unwrap();
    assert!(other.lock_row(w, first).await.unwrap().is_some());
    other.rollback().await.unwrap();
    holder.rollback().await.unwrap();

    assert_eq!(h.quantity(w, first).await, 5);
    assert_eq!(h.quantity(w, second).await, 5);
}

#[tokio::test]
async fn abandoned_allocation_releases_its_locks() {
    let h = TestHarness::new();
    let w = warehouse(1);
    let p = ProductId::new();
    h.stock(&[(w, p, 5)]).await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_rows_for_products(&[p]).await.unwrap();

    // The caller gives up while the allocation waits for the lock.
    let timed_out = tokio::time::timeout(
        Duration::from_millis(50),
        h.allocator.allocate(&request(&[(p, 2)])),
    )
    .await;
    assert!(timed_out.is_err());
    drop(holder);

    let result = h.allocator.allocate(&request(&[(p, 5)])).await.unwrap();
    assert_eq!(result.quantity_for(p), 5);
    assert_eq!(h.quantity(w, p).await, 0);
}

#[tokio::test]
async fn restock_and_allocation_publish_committed_totals() {
    let h = TestHarness::new();
    let (w1, w2) = (warehouse(1), warehouse(2));
    let p = ProductId::new();
    let mut changes = h.allocator.subscribe();

    h.allocator.open_stock(w1, p, 3).await.unwrap();
    h.allocator.open_stock(w2, p, 4).await.unwrap();
    h.allocator.restock(w1, p, 5).await.unwrap();
    h.allocator.allocate(&request(&[(p, 10)])).await.unwrap();

    let mut totals = Vec::new();
    while let Ok(StockChanged {
        product_id,
        total_quantity,
    }) = changes.try_recv()
    {
        assert_eq!(product_id, p);
        totals.push(total_quantity);
    }
    assert_eq!(totals, vec![3, 7, 12, 2]);
}

#[tokio::test]
async fn restock_rejects_bad_input() {
    let h = TestHarness::new();
    let w = warehouse(1);
    let p = ProductId::new();
    h.stock(&[(w, p, 1)]).await;

    let zero = h.allocator.restock(w, p, 0).await.unwrap_err();
    assert_eq!(zero.code(), "validation_error");

    let unknown = h.allocator.restock(w, ProductId::new(), 3).await.unwrap_err();
    assert!(matches!(
        unknown,
        AllocationError::Store(StoreError::RowNotFound { .. })
    ));
    assert_eq!(h.quantity(w, p).await, 1);
}

#[tokio::test]
async fn stock_near_i64_max_plans_and_refuses_overflowing_restock() {
    let h = TestHarness::new();
    let w1 = warehouse(1);
    let w2 = warehouse(2);
    let p = ProductId::new();
    h.stock(&[(w1, p, i64::MAX), (w2, p, 1)]).await;

    let result = h.allocator.allocate(&request(&[(p, 5)])).await.unwrap();
    assert_eq!(result.quantity_for(p), 5);
    assert_eq!(h.quantity(w1, p).await, i64::MAX - 5);

    let err = h.allocator.restock(w2, p, i64::MAX).await.unwrap_err();
    assert!(matches!(
        err,
        AllocationError::Store(StoreError::InvalidQuantity(i64::MAX))
    ));
    assert_eq!(h.quantity(w2, p).await, 1);
}
