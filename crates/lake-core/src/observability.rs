//! Observability infrastructure for lake.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by the dataset
//! engines and the indexer.

use std::str::FromStr;
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `lake_dataset=debug`)
///
/// # Example
///
/// ```rust
/// use lake_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for dataset operations with standard fields.
///
/// # Example
///
/// ```rust
/// use lake_core::observability::dataset_span;
///
/// let span = dataset_span("write_batch", "dim_gossip_nodes_history");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn dataset_span(operation: &str, table: &str) -> Span {
    tracing::info_span!("dataset", op = operation, table = table)
}

/// Creates a span for a single view refresh.
#[must_use]
pub fn refresh_span(view: &str) -> Span {
    tracing::info_span!("refresh", view = view)
}
