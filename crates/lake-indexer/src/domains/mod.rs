//! Per-domain stores and views.
//!
//! Each domain declares its dataset schemas, a store that converts domain
//! types to rows, and a [`crate::view::View`] that pulls from its sources.

use std::sync::Arc;

use lake_core::schema::{DimensionSchema, FactSchema};
use lake_core::Value;

pub mod geoip;
pub mod latency;
pub mod revenue;
pub mod solana;

/// Every dimension schema the indexer writes.
#[must_use]
pub fn dimension_schemas() -> Vec<Arc<dyn DimensionSchema>> {
    vec![
        Arc::new(solana::GossipNodes),
        Arc::new(solana::VoteAccounts),
        Arc::new(revenue::ProgramConfigs),
        Arc::new(latency::LinkCircuits),
        Arc::new(geoip::GeoIpRecords),
    ]
}

/// Every fact schema the indexer writes.
#[must_use]
pub fn fact_schemas() -> Vec<Arc<dyn FactSchema>> {
    vec![
        Arc::new(solana::VoteAccountActivity),
        Arc::new(revenue::Distributions),
        Arc::new(revenue::ValidatorDebts),
        Arc::new(latency::LatencySamples),
    ]
}

/// Stores an unsigned counter in a BIGINT column.
pub(crate) fn int(v: u64) -> Value {
    Value::Int64(i64::try_from(v).unwrap_or(i64::MAX))
}

/// Reads a BIGINT column back as an unsigned counter.
pub(crate) fn uint(v: &Value) -> Option<u64> {
    v.as_i64().and_then(|v| u64::try_from(v).ok())
}

pub(crate) fn opt<T: Into<Value>>(v: Option<T>) -> Value {
    v.map_or(Value::Null, Into::into)
}
