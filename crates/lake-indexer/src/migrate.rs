//! Table migration.
//!
//! Creating a table is idempotent, so migration simply ensures every
//! registered dataset table exists. It runs before the indexer starts and
//! from the `migrate` subcommand.

use std::sync::Arc;

use lake_core::schema::{DimensionSchema, FactSchema};
use lake_core::ColumnarStore;
use lake_dataset::{DimensionType2Dataset, FactDataset};

use crate::domains;
use crate::error::{Error, Result};

/// Tables ensured by one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Table names, in migration order.
    pub tables: Vec<String>,
}

/// Ensures the tables of the given schemas exist.
///
/// # Errors
///
/// Returns a dataset error for an invalid schema or a failed create.
pub async fn migrate(
    store: Arc<dyn ColumnarStore>,
    dimensions: &[Arc<dyn DimensionSchema>],
    facts: &[Arc<dyn FactSchema>],
) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    for schema in dimensions {
        let dataset = DimensionType2Dataset::new(Arc::clone(schema), Arc::clone(&store))
            .map_err(Error::dataset("migrate"))?;
        dataset.ensure_table().await.map_err(Error::dataset("migrate"))?;
        report.tables.push(dataset.table().to_string());
    }
    for schema in facts {
        let dataset = FactDataset::new(Arc::clone(schema), Arc::clone(&store))
            .map_err(Error::dataset("migrate"))?;
        dataset.ensure_table().await.map_err(Error::dataset("migrate"))?;
        report.tables.push(dataset.table().to_string());
    }
    tracing::info!(tables = report.tables.len(), backend = store.backend(), "migration complete");
    Ok(report)
}

/// Ensures every table the indexer writes exists.
///
/// # Errors
///
/// Returns a dataset error for a failed create.
pub async fn migrate_all(store: Arc<dyn ColumnarStore>) -> Result<MigrationReport> {
    migrate(store, &domains::dimension_schemas(), &domains::fact_schemas()).await
}
