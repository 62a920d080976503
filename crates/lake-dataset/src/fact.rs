//! Append-only fact dataset with merge-engine deduplication.
//!
//! Writes are pure appends. Rows sharing the unique key collapse to the one
//! with the highest version column, either eventually (background merges)
//! or on [`FactDataset::compact`]. Reads apply the same "latest version wins"
//! rule with a window so they are exact before any merge has run.
//!
//! Re-writing an identical logical row is therefore idempotent, and writing
//! a row with a higher version is a correction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::Instrument;

use lake_core::observability::dataset_span;
use lake_core::schema::{DedupMode, FactSchema, TableSpec};
use lake_core::store::{self, ColumnarStore, Statement};
use lake_core::time::now_micros;
use lake_core::{Record, Value};

use crate::error::{DatasetError, Result};
use crate::metrics;
use crate::sql::{self, Filter};

/// Lower bound (inclusive) for partitioned time columns: 2000-01-01T00:00:00Z.
const PARTITION_MIN_SECS: i64 = 946_684_800;
/// Upper bound (exclusive) for partitioned time columns: 2100-01-01T00:00:00Z.
const PARTITION_MAX_SECS: i64 = 4_102_444_800;

/// What a fact write appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactWriteSummary {
    /// Rows appended.
    pub written: usize,
    /// Version stamped on rows that did not carry one; `None` for an empty batch.
    pub ingested_at: Option<DateTime<Utc>>,
}

/// An append-only fact table.
pub struct FactDataset {
    schema: Arc<dyn FactSchema>,
    spec: TableSpec,
    store: Arc<dyn ColumnarStore>,
    table_ready: OnceCell<()>,
}

impl std::fmt::Debug for FactDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactDataset")
            .field("table", &self.spec.name)
            .field("store", &self.store.backend())
            .finish_non_exhaustive()
    }
}

impl FactDataset {
    /// Creates a dataset after validating the schema descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::Schema`] if the descriptor is inconsistent.
    pub fn new(schema: Arc<dyn FactSchema>, store: Arc<dyn ColumnarStore>) -> Result<Self> {
        schema.validate().map_err(|source| DatasetError::Schema {
            name: schema.name().to_string(),
            source,
        })?;
        let spec = schema.table_spec();
        Ok(Self {
            schema,
            spec,
            store,
            table_ready: OnceCell::new(),
        })
    }

    /// Fact table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.spec.name
    }

    /// Physical table description.
    #[must_use]
    pub fn table_spec(&self) -> &TableSpec {
        &self.spec
    }

    /// Creates the fact table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a store error if the DDL fails.
    pub async fn ensure_table(&self) -> Result<()> {
        self.table_ready
            .get_or_try_init(|| async {
                store::execute(self.store.as_ref(), Statement::CreateTable(&self.spec))
                    .await
                    .map_err(|e| DatasetError::store("create_table", &self.spec.name, e))
            })
            .await
            .map(|_| ())
    }

    fn physical_row(&self, index: usize, mut record: Record, ingested_at: DateTime<Utc>) -> Result<Vec<Value>> {
        if let Some(unknown) = record.keys().find(|name| self.spec.column(name).is_none()) {
            return Err(DatasetError::invalid_row(
                &self.spec.name,
                index,
                format!("unknown column {unknown}"),
            ));
        }

        let version_column = self.schema.version_column();
        let mut row = Vec::with_capacity(self.spec.columns.len());
        for column in &self.spec.columns {
            let value = match record.remove(&column.name) {
                Some(value) if !value.is_null() => crate::normalize(value),
                _ if column.name == version_column => Value::Timestamp(ingested_at),
                _ if column.nullable => Value::Null,
                _ => {
                    return Err(DatasetError::invalid_row(
                        &self.spec.name,
                        index,
                        format!("missing value for non-nullable column {}", column.name),
                    ));
                }
            };
            if !column.ty.accepts(&value) {
                return Err(DatasetError::invalid_row(
                    &self.spec.name,
                    index,
                    format!("column {} expects {}, got {value:?}", column.name, column.ty),
                ));
            }
            row.push(value);
        }

        if let Some(partition) = &self.spec.partition {
            let idx = self
                .spec
                .columns
                .iter()
                .position(|c| c.name == partition.column)
                .unwrap_or_default();
            match row[idx].as_timestamp() {
                Some(ts) if (PARTITION_MIN_SECS..PARTITION_MAX_SECS).contains(&ts.timestamp()) => {}
                Some(ts) => {
                    return Err(DatasetError::invalid_row(
                        &self.spec.name,
                        index,
                        format!("{} {ts} outside the partitionable range", partition.column),
                    ));
                }
                None => {
                    return Err(DatasetError::invalid_row(
                        &self.spec.name,
                        index,
                        format!("partition column {} is null", partition.column),
                    ));
                }
            }
        }
        Ok(row)
    }

    /// Keeps the last row of each unique key, at the key's first position.
    fn collapse_duplicates(&self, rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
        if self.schema.dedup() != DedupMode::Replacing {
            return rows;
        }
        let key_positions: Vec<usize> = self
            .schema
            .unique_key_columns()
            .iter()
            .filter_map(|name| self.spec.columns.iter().position(|c| c.name == *name))
            .collect();
        let mut positions: HashMap<Vec<String>, usize> = HashMap::with_capacity(rows.len());
        let mut kept: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
        for row in rows {
            let key: Vec<String> = key_positions.iter().map(|&i| row[i].sql_literal()).collect();
            match positions.get(&key) {
                Some(&pos) => kept[pos] = row,
                None => {
                    positions.insert(key, kept.len());
                    kept.push(row);
                }
            }
        }
        kept
    }

    /// Appends a batch of fact rows.
    ///
    /// `producer(i)` is called once for each `i` in `0..n`. Rows without an
    /// explicit version are stamped with one timestamp for the whole call.
    /// Rows sharing a unique key within the batch collapse to the last one.
    ///
    /// # Errors
    ///
    /// Returns the producer's error, [`DatasetError::InvalidRow`] for rows
    /// that do not fit the schema or fall outside the partitionable time
    /// range, or a wrapped store error. Nothing is written when any row is
    /// rejected.
    pub async fn write_batch<F>(&self, n: usize, producer: F) -> Result<FactWriteSummary>
    where
        F: FnMut(usize) -> Result<Record>,
    {
        if n == 0 {
            return Ok(FactWriteSummary::default());
        }
        let started = Instant::now();
        let result = self
            .write_batch_inner(n, producer)
            .instrument(dataset_span("write_batch", &self.spec.name))
            .await;
        metrics::record_write(
            &self.spec.name,
            "fact",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        if let Ok(summary) = &result {
            metrics::record_rows(&self.spec.name, "fact", summary.written, 0);
        }
        result
    }

    async fn write_batch_inner<F>(&self, n: usize, mut producer: F) -> Result<FactWriteSummary>
    where
        F: FnMut(usize) -> Result<Record>,
    {
        let ingested_at = now_micros();
        let rows = (0..n)
            .map(|index| {
                let record = producer(index)?;
                self.physical_row(index, record, ingested_at)
            })
            .collect::<Result<Vec<_>>>()?;
        let rows = self.collapse_duplicates(rows);

        self.ensure_table().await?;
        store::execute(
            self.store.as_ref(),
            Statement::Insert {
                table: &self.spec,
                rows: &rows,
            },
        )
        .await
        .map_err(|e| DatasetError::store("write_batch", &self.spec.name, e))?;

        tracing::debug!(written = rows.len(), "fact batch written");
        Ok(FactWriteSummary {
            written: rows.len(),
            ingested_at: Some(ingested_at),
        })
    }

    fn check_column(&self, column: &str) -> Result<()> {
        if self.spec.column(column).is_none() {
            return Err(DatasetError::invalid_argument(
                &self.spec.name,
                format!("unknown column {column}"),
            ));
        }
        Ok(())
    }

    fn latest_sql(&self, filters: &[Filter]) -> Result<String> {
        let sql = match self.schema.dedup() {
            DedupMode::Replacing => sql::latest_facts(
                &self.spec,
                self.schema.unique_key_columns(),
                self.schema.version_column(),
                filters,
            ),
            DedupMode::None => sql::all_rows(&self.spec, filters),
        };
        sql.map_err(|e| DatasetError::invalid_argument(&self.spec.name, e.to_string()))
    }

    async fn run(&self, operation: &'static str, sql: &str) -> Result<lake_core::Rows> {
        self.ensure_table().await?;
        store::query(self.store.as_ref(), sql)
            .instrument(dataset_span(operation, &self.spec.name))
            .await
            .map_err(|e| DatasetError::store(operation, &self.spec.name, e))
    }

    /// Latest version of every logical row matching `filters`.
    ///
    /// Filters apply after deduplication.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::InvalidArgument`] for filters on unknown
    /// columns, or a wrapped store error.
    pub async fn latest_rows(&self, filters: &[Filter]) -> Result<Vec<Record>> {
        let sql = self.latest_sql(filters)?;
        Ok(self.run("latest_rows", &sql).await?.into_records())
    }

    /// For each group, the latest logical row with the highest `order_column`.
    ///
    /// Used to seed incremental computations from the last stored state.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::InvalidArgument`] for unknown columns, or a
    /// wrapped store error.
    pub async fn latest_per_group(
        &self,
        group_by: &[&str],
        order_column: &str,
        filters: &[Filter],
    ) -> Result<Vec<Record>> {
        for column in group_by {
            self.check_column(column)?;
        }
        self.check_column(order_column)?;
        let source = self.latest_sql(filters)?;
        let sql = sql::top_per_group(&self.spec, &source, group_by, order_column)
            .map_err(|e| DatasetError::invalid_argument(&self.spec.name, e.to_string()))?;
        Ok(self.run("latest_per_group", &sql).await?.into_records())
    }

    /// Maximum of `column` over the latest logical rows matching `filters`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::InvalidArgument`] for unknown columns, or a
    /// wrapped store error.
    pub async fn max_value(&self, column: &str, filters: &[Filter]) -> Result<Option<Value>> {
        self.check_column(column)?;
        let source = self.latest_sql(filters)?;
        let sql = sql::max_of(&source, column)
            .map_err(|e| DatasetError::invalid_argument(&self.spec.name, e.to_string()))?;
        let rows = self.run("max_value", &sql).await?;
        Ok(rows.scalar("v").filter(|v| !v.is_null()).cloned())
    }

    /// Minimum and maximum of `column` over the latest logical rows matching
    /// `filters`; `None` when no row matches.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::InvalidArgument`] for unknown columns, or a
    /// wrapped store error.
    pub async fn value_bounds(&self, column: &str, filters: &[Filter]) -> Result<Option<(Value, Value)>> {
        self.check_column(column)?;
        let source = self.latest_sql(filters)?;
        let sql = sql::bounds_of(&source, column)
            .map_err(|e| DatasetError::invalid_argument(&self.spec.name, e.to_string()))?;
        let rows = self.run("value_bounds", &sql).await?;
        match (rows.scalar("lo"), rows.scalar("hi")) {
            (Some(lo), Some(hi)) if !lo.is_null() && !hi.is_null() => Ok(Some((lo.clone(), hi.clone()))),
            _ => Ok(None),
        }
    }

    /// Physical rows currently stored, duplicates included.
    ///
    /// # Errors
    ///
    /// Returns a wrapped store error.
    pub async fn physical_row_count(&self) -> Result<u64> {
        let sql = sql::count(&self.spec)
            .map_err(|e| DatasetError::invalid_argument(&self.spec.name, e.to_string()))?;
        let rows = self.run("physical_row_count", &sql).await?;
        let count = rows.scalar("n").and_then(Value::as_i64).unwrap_or_default();
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Forces the store to merge duplicates now.
    ///
    /// # Errors
    ///
    /// Returns a wrapped store error.
    pub async fn compact(&self) -> Result<()> {
        self.ensure_table().await?;
        store::execute(self.store.as_ref(), Statement::Optimize { table: &self.spec })
            .instrument(dataset_span("compact", &self.spec.name))
            .await
            .map_err(|e| DatasetError::store("compact", &self.spec.name, e))
    }
}
