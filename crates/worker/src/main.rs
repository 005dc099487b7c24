//! Allocation worker entry point.

use std::sync::Arc;

use allocation::Allocator;
use sqlx::postgres::PgPoolOptions;
use stock_store::PostgresStockStore;
use tokio::io::BufReader;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::{Config, LogFormat, WorkerPool};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // Replies go to stdout, so logs must go to stderr.
    match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus recorder with its own scrape listener
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()?;
    tracing::info!(addr = %config.metrics_addr, "metrics listener started");

    // 3. Connect and migrate
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    let mut store = PostgresStockStore::new(pool);
    store.run_migrations().await?;
    if let Some(timeout) = config.lock_timeout {
        store = store.with_lock_timeout(timeout);
    }

    // 4. Start workers
    let allocator = Arc::new(Allocator::new(store));
    let workers = WorkerPool::spawn(allocator, config.pool_config());

    // 5. Serve stdin until EOF or a shutdown signal
    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();
    tokio::select! {
        served = worker::serve_lines(input, output, &workers) => {
            served?;
            tracing::info!("input exhausted");
        }
        () = shutdown_signal() => {}
    }

    workers.shutdown().await;
    tracing::info!("worker shut down gracefully");
    Ok(())
}
