//! # lake-indexer
//!
//! Refresh orchestration that mirrors external state into lake datasets.
//!
//! - **Views** ([`view`]): each domain pulls from its sources on a fixed
//!   interval behind a fault barrier and flips a readiness latch after its
//!   first successful refresh.
//! - **Deltas** ([`delta`]): incremental counters continue identically
//!   across batches and restarts.
//! - **Backfill** ([`backfill`]): bounded-concurrency epoch fills that stop
//!   at the first failed epoch.
//! - **Domains** ([`domains`]): solana, revenue, latency and geoip stores
//!   and views.
//! - **Process surface** ([`server`], [`migrate`], the `lake-indexer`
//!   binary).
//!
//! ## Example
//!
//! ```rust,ignore
//! let indexer = Indexer::builder()
//!     .store(store)
//!     .solana_rpc(Arc::new(SolanaJsonRpc::new(SolanaRpcConfig::new(url))?))
//!     .build()?;
//! let (tx, rx) = tokio::sync::watch::channel(false);
//! let handle = indexer.start(rx);
//! // ...
//! tx.send(true)?;
//! handle.join().await;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backfill;
pub mod cache;
pub mod config;
pub mod delta;
pub mod domains;
pub mod error;
pub mod indexer;
pub mod metrics;
pub mod migrate;
pub mod readiness;
pub mod server;
pub mod sources;
pub mod view;

pub use backfill::{BackfillPlan, BackfillReport, BackfillRequest, EpochBackfill, EpochRange, run_backfill};
pub use config::{BackfillConfig, CacheConfig, RefreshConfig};
pub use error::{Error, Result};
pub use indexer::{Indexer, IndexerBuilder, IndexerHandle, ViewStatus};
pub use readiness::ReadinessLatch;
pub use view::{RefreshOutcome, View, ViewRunner};
