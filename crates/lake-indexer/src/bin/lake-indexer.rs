//! # lake-indexer
//!
//! Mirrors Solana cluster state (and optional GeoIP enrichment) into the
//! lake datasets.
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - 200 once every view has refreshed successfully
//! - `GET /metrics` - Prometheus text format
//!
//! ## Usage
//!
//! ```bash
//! # Create tables only
//! lake-indexer --store clickhouse --clickhouse-url http://ch:8123 migrate
//!
//! # Run the refresh loops
//! lake-indexer serve --solana-rpc-url https://api.mainnet-beta.solana.com --port 8080
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;

use lake_core::store::{ClickHouseConfig, ClickHouseStore, MemoryStore};
use lake_core::{ColumnarStore, LogFormat, init_logging};
use lake_indexer::sources::{FileGeoIpResolver, SolanaJsonRpc, SolanaRpcConfig};
use lake_indexer::{CacheConfig, Indexer, RefreshConfig, metrics, migrate, server};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    /// In-process store; data is lost on exit.
    Memory,
    /// ClickHouse over HTTP.
    Clickhouse,
}

/// Lake indexer.
#[derive(Debug, Parser)]
#[command(name = "lake-indexer")]
#[command(about = "Mirrors external state into dimension and fact datasets")]
#[command(version)]
struct Args {
    /// Store backend.
    #[arg(long, env = "LAKE_STORE", value_enum, default_value = "memory", global = true)]
    store: StoreBackend,

    /// ClickHouse HTTP endpoint.
    #[arg(long, env = "LAKE_CLICKHOUSE_URL", default_value = "http://localhost:8123", global = true)]
    clickhouse_url: String,

    /// ClickHouse database.
    #[arg(long, env = "LAKE_CLICKHOUSE_DATABASE", default_value = "default", global = true)]
    clickhouse_database: String,

    /// ClickHouse user.
    #[arg(long, env = "LAKE_CLICKHOUSE_USER", global = true)]
    clickhouse_user: Option<String>,

    /// ClickHouse password.
    #[arg(long, env = "LAKE_CLICKHOUSE_PASSWORD", global = true, hide_env_values = true)]
    clickhouse_password: Option<String>,

    /// Maximum concurrent ClickHouse requests.
    #[arg(long, env = "LAKE_CLICKHOUSE_MAX_CONNECTIONS", default_value = "16", global = true)]
    clickhouse_max_connections: usize,

    /// Log format (`json` or `pretty`).
    #[arg(long, env = "LAKE_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate, then run the refresh loops with HTTP endpoints.
    Serve {
        /// HTTP port for health, readiness and metrics.
        #[arg(long, env = "LAKE_PORT", default_value = "8080")]
        port: u16,

        /// Solana JSON-RPC endpoint.
        #[arg(long, env = "LAKE_SOLANA_RPC_URL")]
        solana_rpc_url: String,

        /// JSON GeoIP database; enables the geoip view.
        #[arg(long, env = "LAKE_GEOIP_DB")]
        geoip_db: Option<PathBuf>,

        /// Seconds between refresh starts.
        #[arg(long, env = "LAKE_REFRESH_INTERVAL_SECS", default_value = "60")]
        refresh_interval_secs: u64,

        /// Deadline for a single refresh, in seconds.
        #[arg(long, env = "LAKE_REFRESH_TIMEOUT_SECS", default_value = "300")]
        refresh_timeout_secs: u64,

        /// Lifetime of cached GeoIP lookups, in seconds.
        #[arg(long, env = "LAKE_GEOIP_CACHE_TTL_SECS", default_value = "21600")]
        geoip_cache_ttl_secs: u64,
    },

    /// Create every table and exit.
    Migrate,
}

fn build_store(args: &Args) -> Result<Arc<dyn ColumnarStore>> {
    match args.store {
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; data is not persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Clickhouse => {
            let config = ClickHouseConfig {
                url: args.clickhouse_url.clone(),
                database: args.clickhouse_database.clone(),
                user: args.clickhouse_user.clone(),
                password: args.clickhouse_password.clone(),
                max_connections: args.clickhouse_max_connections,
                ..ClickHouseConfig::default()
            };
            let store = ClickHouseStore::new(config).context("failed to configure clickhouse")?;
            Ok(Arc::new(store))
        }
    }
}

/// Resolves when ctrl-c is received.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c; shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let store = build_store(&args)?;

    match &args.command {
        Commands::Migrate => {
            let report = migrate::migrate_all(store).await.context("migration failed")?;
            tracing::info!(tables = ?report.tables, "migration finished");
        }
        Commands::Serve {
            port,
            solana_rpc_url,
            geoip_db,
            refresh_interval_secs,
            refresh_timeout_secs,
            geoip_cache_ttl_secs,
        } => {
            metrics::init_metrics();
            migrate::migrate_all(Arc::clone(&store))
                .await
                .context("migration failed")?;

            let rpc = SolanaJsonRpc::new(SolanaRpcConfig::new(solana_rpc_url.as_str()))?;
            let mut builder = Indexer::builder()
                .store(store)
                .solana_rpc(Arc::new(rpc))
                .refresh_config(RefreshConfig {
                    interval: Duration::from_secs(*refresh_interval_secs),
                    timeout: Duration::from_secs(*refresh_timeout_secs),
                })
                .cache_config(CacheConfig {
                    ttl: Duration::from_secs(*geoip_cache_ttl_secs),
                });
            if let Some(path) = geoip_db {
                builder = builder.geoip_resolver(Arc::new(FileGeoIpResolver::from_path(path)?));
            }
            let indexer = Arc::new(builder.build()?);

            tracing::info!(
                port = *port,
                views = indexer.runners().len(),
                refresh_interval_secs = *refresh_interval_secs,
                "starting indexer"
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = indexer.start(shutdown_rx.clone());
            let addr = SocketAddr::from(([0, 0, 0, 0], *port));
            let mut http = tokio::spawn(server::serve(addr, Arc::clone(&indexer), shutdown_rx));

            let served = tokio::select! {
                () = shutdown_signal() => {
                    tracing::info!("shutdown requested");
                    None
                }
                result = &mut http => Some(result),
            };
            let _ = shutdown_tx.send(true);
            handle.join().await;

            let served = match served {
                Some(result) => result,
                None => http.await,
            };
            served.context("http server task failed")??;
            tracing::info!("indexer stopped");
        }
    }
    Ok(())
}
