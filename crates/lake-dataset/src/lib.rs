//! # lake-dataset
//!
//! Dimension and fact datasets over a [`lake_core::ColumnarStore`].
//!
//! - [`DimensionType2Dataset`]: slowly-changing (type 2) dimensions. Every
//!   change appends a history row; current state is derived by windowing
//!   over `(snapshot_ts, ingested_at, op_id)`. Full-snapshot writes infer
//!   deletions for entities that disappeared upstream.
//! - [`FactDataset`]: append-only facts deduplicated by unique key, with the
//!   highest version winning. Re-writes are idempotent; higher versions are
//!   corrections.
//!
//! Datasets are constructed with their schema descriptor and store, hold no
//! row state between calls, and never retry: a failed call surfaces a
//! [`DatasetError`] with the operation and table attached and the caller
//! decides what to do.
//!
//! ## Example
//!
//! ```rust,ignore
//! let nodes = DimensionType2Dataset::new(Arc::new(GossipNodes), store.clone())?;
//! nodes
//!     .write_batch(snapshot.len(), |i| Ok(snapshot[i].to_record()), WriteConfig::full_snapshot())
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dimension;
pub mod error;
pub mod fact;
pub mod metrics;
pub mod sql;

pub use dimension::{DimensionType2Dataset, WriteConfig, WriteSummary};
pub use error::{DatasetError, Result};
pub use fact::{FactDataset, FactWriteSummary};
pub use sql::{CompareOp, Filter};

use lake_core::Value;
use lake_core::time::truncate_micros;

/// Brings a value to the precision every backend stores.
pub(crate) fn normalize(value: Value) -> Value {
    match value {
        Value::Timestamp(ts) => Value::Timestamp(truncate_micros(ts)),
        other => other,
    }
}
