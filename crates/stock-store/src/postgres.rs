use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    MovementId, NewMovement, ProductId, ProductStock, Result, SaleId, StockMovement, StockQuery,
    StockRow, StoreError, WarehouseId,
    store::{StockStore, StockTransaction, lock_order},
};

const MOVEMENT_COLUMNS: &str =
    "id, product_id, warehouse_id, quantity, sale_id, order_number, created_at";

/// PostgreSQL-backed stock store.
///
/// Row locks are PostgreSQL row locks taken with `SELECT ... FOR UPDATE`
/// under the default READ COMMITTED isolation level; a locked row is
/// re-read at its latest committed version once the lock is granted.
#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PostgresStockStore {
    /// Creates a new PostgreSQL stock store that waits indefinitely for locks.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Bounds how long a transaction may wait for a single row lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn open_transaction(
        &self,
        lock_timeout: Option<Duration>,
        statement_timeout: Option<Duration>,
    ) -> Result<Box<dyn StockTransaction>> {
        let mut tx = self.pool.begin().await?;

        // SET does not take bind parameters; the values are integers we format ourselves.
        for (setting, timeout) in [
            ("lock_timeout", lock_timeout),
            ("statement_timeout", statement_timeout),
        ] {
            if let Some(timeout) = timeout {
                sqlx::query(&format!(
                    "SET LOCAL {setting} = '{}ms'",
                    timeout.as_millis().max(1)
                ))
                .execute(&mut *tx)
                .await?;
            }
        }

        Ok(Box::new(PostgresStockTransaction { tx }))
    }

    fn row_to_stock(row: PgRow) -> Result<StockRow> {
        Ok(StockRow {
            warehouse_id: WarehouseId::from_uuid(row.try_get::<Uuid, _>("warehouse_id")?),
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            quantity: row.try_get("quantity")?,
        })
    }

    fn row_to_movement(row: PgRow) -> Result<StockMovement> {
        Ok(StockMovement {
            id: MovementId::from_uuid(row.try_get::<Uuid, _>("id")?),
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            warehouse_id: WarehouseId::from_uuid(row.try_get::<Uuid, _>("warehouse_id")?),
            quantity: row.try_get("quantity")?,
            sale_id: SaleId::from_uuid(row.try_get::<Uuid, _>("sale_id")?),
            order_number: row.try_get("order_number")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_total(row: PgRow) -> Result<ProductStock> {
        Ok(ProductStock {
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            total_quantity: row.try_get("total_quantity")?,
        })
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    async fn begin(&self) -> Result<Box<dyn StockTransaction>> {
        self.open_transaction(self.lock_timeout, None).await
    }

    async fn begin_with_lock_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Box<dyn StockTransaction>> {
        let lock_timeout = self.lock_timeout.map_or(timeout, |own| own.min(timeout));
        // statement_timeout also bounds a multi-row FOR UPDATE that waits on
        // several rows in turn.
        self.open_transaction(Some(lock_timeout), Some(timeout))
            .await
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

        let row = sqlx::query(
            r#"
            INSERT INTO stocks (warehouse_id, product_id, quantity)
            VALUES ($1, $2, $3)
            RETURNING warehouse_id, product_id, quantity
            "#,
        )
        .bind(warehouse_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(quantity)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::DuplicateRow {
                    warehouse_id,
                    product_id,
                };
            }
            StoreError::Database(e)
        })?;

        Self::row_to_stock(row)
    }

    async fn get_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<StockRow>> {
        let row = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, quantity
            FROM stocks
            WHERE warehouse_id = $1 AND product_id = $2
            "#,
        )
        .bind(warehouse_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_stock).transpose()
    }

    async fn list_stock(&self, query: StockQuery) -> Result<Vec<StockRow>> {
        let mut sql =
            String::from("SELECT warehouse_id, product_id, quantity FROM stocks WHERE 1=1");
        let mut param_count = 0;

        if query.warehouse_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND warehouse_id = ${param_count}"));
        }
        if query.product_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND product_id = ${param_count}"));
        }
        if query.in_stock_only {
            sql.push_str(" AND quantity > 0");
        }

        sql.push_str(" ORDER BY product_id ASC, warehouse_id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.warehouse_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(id) = query.product_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_stock).collect()
    }

    async fn product_total(&self, product_id: ProductId) -> Result<Option<ProductStock>> {
        let row = sqlx::query(
            r#"
            SELECT product_id, LEAST(SUM(quantity), 9223372036854775807)::BIGINT AS total_quantity
            FROM stocks
            WHERE product_id = $1
            GROUP BY product_id
            "#,
        )
        .bind(product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_total).transpose()
    }

    async fn catalog(&self) -> Result<Vec<ProductStock>> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, LEAST(SUM(quantity), 9223372036854775807)::BIGINT AS total_quantity
            FROM stocks
            GROUP BY product_id
            ORDER BY product_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_total).collect()
    }

    async fn movements_for_sale(&self, sale_id: SaleId) -> Result<Vec<StockMovement>> {
        let rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE sale_id = $1 ORDER BY seq ASC"
        ))
        .bind(sale_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_movement).collect()
    }

    async fn moved_total(
        &self,
        product_id: ProductId,
        warehouse_id: Option<WarehouseId>,
    ) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT LEAST(COALESCE(SUM(quantity), 0), 9223372036854775807)::BIGINT
            FROM stock_movements
            WHERE product_id = $1 AND ($2::UUID IS NULL OR warehouse_id = $2)
            "#,
        )
        .bind(product_id.as_uuid())
        .bind(warehouse_id.map(|id| id.as_uuid()))
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }
}

/// A PostgreSQL transaction on the stock tables.
///
/// sqlx rolls the underlying transaction back when it is dropped
/// uncommitted, so abandoning one (for example on a caller timeout)
/// releases its row locks.
pub struct PostgresStockTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StockTransaction for PostgresStockTransaction {
    async fn lock_rows_for_products(&mut self, product_ids: &[ProductId]) -> Result<Vec<StockRow>> {
        let ids: Vec<Uuid> = lock_order(product_ids)
            .into_iter()
            .map(|id| id.as_uuid())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // Primary-key order, never quantity: the lock order must not depend on
        // values a concurrent transaction can change.
        let rows = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, quantity
            FROM stocks
            WHERE product_id = ANY($1) AND quantity > 0
            ORDER BY product_id ASC, warehouse_id ASC
            FOR UPDATE
            "#,
        )
        .bind(ids.as_slice())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::from_sqlx)?;
        tracing::trace!(products = ids.len(), rows = rows.len(), "row locks granted");

        rows.into_iter().map(PostgresStockStore::row_to_stock).collect()
    }

    async fn lock_row(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<StockRow>> {
        let row = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, quantity
            FROM stocks
            WHERE warehouse_id = $1 AND product_id = $2
            FOR UPDATE
            "#,
        )
        .bind(warehouse_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        row.map(PostgresStockStore::row_to_stock).transpose()
    }

    async fn apply_deduction(&mut self, row: &StockRow, amount: i64) -> Result<StockRow> {
        if amount <= 0 {
            return Err(StoreError::InvalidQuantity(amount));
        }

        let updated = sqlx::query(
            r#"
            UPDATE stocks
            SET quantity = quantity - $3, updated_at = NOW()
            WHERE warehouse_id = $1 AND product_id = $2 AND quantity >= $3
            RETURNING warehouse_id, product_id, quantity
            "#,
        )
        .bind(row.warehouse_id.as_uuid())
        .bind(row.product_id.as_uuid())
        .bind(amount)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        match updated {
            Some(updated) => PostgresStockStore::row_to_stock(updated),
            None => Err(StoreError::InsufficientRowQuantity {
                warehouse_id: row.warehouse_id,
                product_id: row.product_id,
                available: row.quantity,
                requested: amount,
            }),
        }
    }

    async fn apply_increase(&mut self, row: &StockRow, amount: i64) -> Result<StockRow> {
        // `row` comes from a lock held by this transaction, so its quantity is current.
        if amount <= 0 || row.quantity.checked_add(amount).is_none() {
            return Err(StoreError::InvalidQuantity(amount));
        }

        let updated = sqlx::query(
            r#"
            UPDATE stocks
            SET quantity = quantity + $3, updated_at = NOW()
            WHERE warehouse_id = $1 AND product_id = $2
            RETURNING warehouse_id, product_id, quantity
            "#,
        )
        .bind(row.warehouse_id.as_uuid())
        .bind(row.product_id.as_uuid())
        .bind(amount)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        match updated {
            Some(updated) => PostgresStockStore::row_to_stock(updated),
            None => Err(StoreError::RowNotFound {
                warehouse_id: row.warehouse_id,
                product_id: row.product_id,
            }),
        }
    }

    async fn insert_movement(&mut self, movement: NewMovement) -> Result<StockMovement> {
        if movement.quantity <= 0 {
            return Err(StoreError::InvalidQuantity(movement.quantity));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO stock_movements (id, product_id, warehouse_id, quantity, sale_id, order_number)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {MOVEMENT_COLUMNS}
            "#
        ))
        .bind(MovementId::new().as_uuid())
        .bind(movement.product_id.as_uuid())
        .bind(movement.warehouse_id.as_uuid())
        .bind(movement.quantity)
        .bind(movement.sale_id.as_uuid())
        .bind(movement.order_number)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        PostgresStockStore::row_to_movement(row)
    }

    async fn movements_for_sale(&mut self, sale_id: SaleId) -> Result<Vec<StockMovement>> {
        let rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE sale_id = $1 ORDER BY seq ASC"
        ))
        .bind(sale_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        rows.into_iter().map(PostgresStockStore::row_to_movement).collect()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(StoreError::from_sqlx)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(StoreError::from_sqlx)
    }
}
