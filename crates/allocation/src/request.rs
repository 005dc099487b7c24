//! Allocation requests and their validation.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use common::{ProductId, SaleId};
use serde::{Deserialize, Serialize};

/// One product line of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationItem {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl AllocationItem {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// A request to reserve stock for a sale.
///
/// This is the shape received from the request gateway. It is not trusted:
/// call [`AllocationRequest::validate`] before using it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub order_number: i64,
    pub sale_id: SaleId,
    pub items: Vec<AllocationItem>,
}

impl AllocationRequest {
    pub fn new(order_number: i64, sale_id: SaleId, items: Vec<AllocationItem>) -> Self {
        Self {
            order_number,
            sale_id,
            items,
        }
    }

    /// Checks the request shape and returns the demand per product.
    ///
    /// Every problem is reported, not just the first one found.
    pub fn validate(&self) -> Result<Demand, ValidationErrors> {
        let mut errors = Vec::new();

        if self.order_number < 0 {
            errors.push(FieldError::new("order_number", "must not be negative"));
        }

        if self.items.is_empty() {
            errors.push(FieldError::new("items", "must contain at least one item"));
        }

        let mut demand = BTreeMap::new();
        for (index, item) in self.items.iter().enumerate() {
            if item.quantity <= 0 {
                errors.push(FieldError::new(
                    format!("items[{index}].quantity"),
                    "must be greater than zero",
                ));
            }

            match demand.entry(item.product_id) {
                Entry::Vacant(slot) => {
                    slot.insert(item.quantity);
                }
                Entry::Occupied(_) => errors.push(FieldError::new(
                    format!("items[{index}].product_id"),
                    format!("duplicate product {}", item.product_id),
                )),
            }
        }

        if errors.is_empty() {
            Ok(Demand(demand))
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

/// Validated demand: requested quantity per distinct product, each positive.
///
/// Iteration is in ascending product order, which is also the order in
/// which rows are locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Demand(BTreeMap<ProductId, i64>);

impl Demand {
    /// Returns the requested products in ascending order.
    pub fn product_ids(&self) -> Vec<ProductId> {
        self.0.keys().copied().collect()
    }

    /// Returns the quantity requested for a product (0 if not requested).
    pub fn requested(&self, product_id: &ProductId) -> i64 {
        self.0.get(product_id).copied().unwrap_or(0)
    }

    /// Iterates (product, requested quantity) in ascending product order.
    pub fn iter(&self) -> impl Iterator<Item = (ProductId, i64)> + '_ {
        self.0.iter().map(|(product_id, quantity)| (*product_id, *quantity))
    }

    /// Sum of every requested quantity.
    pub fn total_units(&self) -> i64 {
        self.0
            .values()
            .fold(0i64, |total, quantity| total.saturating_add(*quantity))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single problem with a request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Path of the offending field, e.g. `items[2].quantity`.
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Every field error found in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    /// Wraps a single field error.
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self(vec![FieldError::new(field, message)])
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid allocation request")?;
        for (i, error) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{} {}", error.field, error.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}
