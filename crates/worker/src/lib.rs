//! Allocation worker host.
//!
//! Receives allocation requests as JSON, runs them on a fixed pool of
//! workers sharing one [`allocation::Allocator`] and replies with a
//! structured result per request, with tracing logs and Prometheus metrics.

pub mod config;
pub mod handler;
pub mod intake;
pub mod pool;
pub mod reply;

pub use config::{Config, LogFormat};
pub use handler::handle_payload;
pub use intake::serve_lines;
pub use pool::{PoolConfig, WorkerPool};
pub use reply::{ErrorCode, Rejection, Reply};
