//! Stock change notifications.

use common::ProductId;
use serde::{Deserialize, Serialize};

/// A product's aggregate quantity after a committed stock mutation.
///
/// Only ever emitted after the mutation is durable, so a subscriber can
/// forward it without re-checking the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChanged {
    pub product_id: ProductId,
    pub total_quantity: i64,
}
