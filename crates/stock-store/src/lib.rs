pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod row;
pub mod store;

pub use common::{MovementId, ProductId, SaleId, WarehouseId};
pub use error::{Result, StoreError};
pub use memory::InMemoryStockStore;
pub use postgres::PostgresStockStore;
pub use query::StockQuery;
pub use row::{NewMovement, ProductStock, StockMovement, StockRow};
pub use store::{StockStore, StockTransaction};
