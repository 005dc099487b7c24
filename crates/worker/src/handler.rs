//! Turns one inbound payload into one reply.

use std::time::Duration;

use allocation::{AllocationError, AllocationRequest, Allocator, FieldError};
use common::SaleId;
use serde_json::Value;
use stock_store::{StockStore, StoreError};

use crate::reply::Reply;

/// Extra time an allocation gets past its deadline to roll back before the
/// worker stops waiting for it.
const ROLLBACK_GRACE: Duration = Duration::from_millis(250);

/// Parses a JSON allocation request, runs it under `deadline` and shapes
/// the outcome.
///
/// Never fails: every outcome, including unreadable payloads and expired
/// deadlines, is a [`Reply`]. The deadline bounds the store's lock waits,
/// so an expired allocation has rolled back its transaction before the
/// transient reply goes out.
pub async fn handle_payload<S: StockStore>(
    allocator: &Allocator<S>,
    payload: &str,
    deadline: Duration,
) -> Reply {
    let request = match parse_request(payload) {
        Ok(request) => request,
        Err(reply) => {
            metrics::counter!("allocation_requests_malformed").increment(1);
            return reply;
        }
    };

    let bounded = allocator.allocate_within(&request, deadline);
    match tokio::time::timeout(deadline + ROLLBACK_GRACE, bounded).await {
        Ok(Ok(result)) => Reply::Allocated(result),
        Ok(Err(err)) => {
            if matches!(err, AllocationError::Store(StoreError::LockTimeout)) {
                metrics::counter!("allocation_timeouts_total").increment(1);
            }
            Reply::from_error(request.sale_id, err)
        }
        Err(_) => {
            metrics::counter!("allocation_timeouts_total").increment(1);
            tracing::warn!(
                sale_id = %request.sale_id,
                deadline_ms = deadline.as_millis() as u64,
                "allocation timed out"
            );
            Reply::timed_out(request.sale_id, deadline)
        }
    }
}

fn parse_request(payload: &str) -> Result<AllocationRequest, Reply> {
    let value: Value = serde_json::from_str(payload).map_err(|err| {
        Reply::malformed(None, vec![FieldError::new("payload", err.to_string())])
    })?;

    // Echo the sale id back even when the rest of the message is unusable.
    let sale_id = value
        .get("sale_id")
        .and_then(|id| serde_json::from_value::<SaleId>(id.clone()).ok());

    serde_json::from_value(value).map_err(|err| {
        Reply::malformed(sale_id, vec![FieldError::new("payload", err.to_string())])
    })
}
