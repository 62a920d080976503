//! Slowly-changing (type 2) dimension dataset.
//!
//! Every write appends immutable history rows; nothing is updated in place.
//! The current state of an entity is its history row with the highest
//! `(snapshot_ts, ingested_at, op_id)` tuple, provided that row is not a
//! tombstone.
//!
//! ## Write algorithm
//!
//! 1. Materialize the batch by calling the producer for `0..n`.
//! 2. Derive each row's surrogate key from its natural key columns; a later
//!    row for the same entity replaces an earlier one in the same batch.
//! 3. With `missing_means_deleted`, every currently live entity absent from
//!    the batch gets a tombstone carrying its last payload forward.
//! 4. Append incoming rows, then tombstones, under one `snapshot_ts` with
//!    strictly increasing `op_id`s.
//!
//! An empty batch is a no-op: it neither creates the table nor tombstones
//! anything, so an empty upstream snapshot can never wipe a dimension.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::Instrument;

use lake_core::observability::dataset_span;
use lake_core::schema::{DimensionSchema, TableSpec, history_columns as h};
use lake_core::store::{self, ColumnarStore, Statement};
use lake_core::time::{now_micros, truncate_micros};
use lake_core::{NaturalKey, Record, SurrogateKey, Value};

use crate::error::{DatasetError, Result};
use crate::metrics;
use crate::sql;

/// Options for one dimension write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteConfig {
    /// Treat the batch as the complete current set and tombstone absentees.
    pub missing_means_deleted: bool,
    /// Logical version time; defaults to the wall clock at write time.
    pub snapshot_ts: Option<DateTime<Utc>>,
}

impl WriteConfig {
    /// Full-snapshot write: entities missing from the batch are deleted.
    #[must_use]
    pub const fn full_snapshot() -> Self {
        Self {
            missing_means_deleted: true,
            snapshot_ts: None,
        }
    }

    /// Sets the logical version time.
    #[must_use]
    pub const fn at(mut self, snapshot_ts: DateTime<Utc>) -> Self {
        self.snapshot_ts = Some(snapshot_ts);
        self
    }
}

/// What a dimension write appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Rows written for entities present in the batch.
    pub upserted: usize,
    /// Tombstones written for entities missing from the batch.
    pub tombstoned: usize,
    /// Logical version time of the write, `None` for an empty batch.
    pub snapshot_ts: Option<DateTime<Utc>>,
}

struct PendingRow {
    entity_id: SurrogateKey,
    key_parts: Vec<String>,
    payload: Vec<Value>,
}

/// A type-2 dimension backed by an append-only history table.
pub struct DimensionType2Dataset {
    schema: Arc<dyn DimensionSchema>,
    spec: TableSpec,
    store: Arc<dyn ColumnarStore>,
    op_ids: AtomicI64,
    table_ready: OnceCell<()>,
}

impl std::fmt::Debug for DimensionType2Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DimensionType2Dataset")
            .field("table", &self.spec.name)
            .field("store", &self.store.backend())
            .finish_non_exhaustive()
    }
}

impl DimensionType2Dataset {
    /// Creates a dataset after validating the schema descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::Schema`] if the descriptor is inconsistent.
    pub fn new(schema: Arc<dyn DimensionSchema>, store: Arc<dyn ColumnarStore>) -> Result<Self> {
        schema.validate().map_err(|source| DatasetError::Schema {
            name: schema.name().to_string(),
            source,
        })?;
        let spec = schema.table_spec();
        // Seeded from the clock so ids keep increasing across restarts.
        let seed = now_micros().timestamp_micros().saturating_mul(1000);
        Ok(Self {
            schema,
            spec,
            store,
            op_ids: AtomicI64::new(seed),
            table_ready: OnceCell::new(),
        })
    }

    /// History table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.spec.name
    }

    /// Physical table description.
    #[must_use]
    pub fn table_spec(&self) -> &TableSpec {
        &self.spec
    }

    /// Creates the history table if it does not exist.
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

    /// Derives the surrogate key for a record from its natural key columns.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::InvalidRow`] (index 0) if a key column is
    /// missing, not a string, or the key is empty.
    pub fn key_of(&self, record: &Record) -> Result<SurrogateKey> {
        self.natural_key(0, record)
            .map(|key| SurrogateKey::from_natural(&key))
    }

    fn natural_key(&self, index: usize, record: &Record) -> Result<NaturalKey> {
        let mut parts = Vec::with_capacity(self.schema.key_columns().len());
        for column in self.schema.key_columns() {
            match record.get(*column) {
                Some(Value::String(s)) => parts.push(s.as_str()),
                Some(Value::Null) | None => {
                    return Err(DatasetError::invalid_row(
                        &self.spec.name,
                        index,
                        format!("missing key column {column}"),
                    ));
                }
                Some(other) => {
                    return Err(DatasetError::invalid_row(
                        &self.spec.name,
                        index,
                        format!("key column {column} must be a string, got {other:?}"),
                    ));
                }
            }
        }
        NaturalKey::new(parts)
            .map_err(|e| DatasetError::invalid_row(&self.spec.name, index, e.to_string()))
    }

    fn pending_row(&self, index: usize, record: Record) -> Result<PendingRow> {
        let key = self.natural_key(index, &record)?;
        let key_columns = self.schema.key_columns();
        let payload_columns = self.schema.payload_columns();

        if let Some(unknown) = record.keys().find(|name| {
            !key_columns.contains(&name.as_str()) && !payload_columns.iter().any(|c| &c.name == *name)
        }) {
            return Err(DatasetError::invalid_row(
                &self.spec.name,
                index,
                format!("unknown column {unknown}"),
            ));
        }

        let mut record = record;
        let mut payload = Vec::with_capacity(payload_columns.len());
        for column in &payload_columns {
            let value = record.remove(&column.name).unwrap_or(Value::Null);
            if value.is_null() && !column.nullable {
                return Err(DatasetError::invalid_row(
                    &self.spec.name,
                    index,
                    format!("missing value for non-nullable column {}", column.name),
                ));
            }
            if !column.ty.accepts(&value) {
                return Err(DatasetError::invalid_row(
                    &self.spec.name,
                    index,
                    format!("column {} expects {}, got {value:?}", column.name, column.ty),
                ));
            }
            payload.push(crate::normalize(value));
        }

        Ok(PendingRow {
            entity_id: SurrogateKey::from_natural(&key),
            key_parts: key.parts().to_vec(),
            payload,
        })
    }

    /// Turns a current-row record back into a pending row for tombstoning.
    fn carried_forward(&self, record: &Record) -> Result<PendingRow> {
        let entity_id = record
            .get(h::ENTITY_ID)
            .and_then(Value::as_str)
            .map(SurrogateKey::from_stored)
            .ok_or_else(|| {
                DatasetError::store(
                    "write_batch",
                    &self.spec.name,
                    lake_core::Error::serialization("current row without entity_id"),
                )
            })?;
        let key_parts = self
            .schema
            .key_columns()
            .iter()
            .map(|c| {
                record
                    .get(*c)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        let payload = self
            .schema
            .payload_columns()
            .iter()
            .map(|c| record.get(&c.name).cloned().unwrap_or(Value::Null))
            .collect();
        Ok(PendingRow {
            entity_id,
            key_parts,
            payload,
        })
    }

    fn physical_row(
        row: PendingRow,
        snapshot_ts: DateTime<Utc>,
        ingested_at: DateTime<Utc>,
        op_id: i64,
        deleted: bool,
    ) -> Vec<Value> {
        let mut values = Vec::with_capacity(5 + row.key_parts.len() + row.payload.len());
        values.push(Value::String(row.entity_id.as_str().to_string()));
        values.push(Value::Timestamp(snapshot_ts));
        values.push(Value::Timestamp(ingested_at));
        values.push(Value::Int64(op_id));
        values.push(Value::Bool(deleted));
        values.extend(row.key_parts.into_iter().map(Value::String));
        values.extend(row.payload);
        values
    }

    /// Appends a batch of entity snapshots.
    ///
    /// `producer(i)` is called once for each `i` in `0..n`.
    ///
    /// # Errors
    ///
    /// Returns the producer's error, [`DatasetError::InvalidRow`] for rows
    /// that do not fit the schema, or a wrapped store error. Nothing is
    /// written when the batch is rejected before the insert.
    pub async fn write_batch<F>(&self, n: usize, producer: F, config: WriteConfig) -> Result<WriteSummary>
    where
        F: FnMut(usize) -> Result<Record>,
    {
        if n == 0 {
            return Ok(WriteSummary::default());
        }
        let started = Instant::now();
        let result = self
            .write_batch_inner(n, producer, config)
            .instrument(dataset_span("write_batch", &self.spec.name))
            .await;
        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_write(&self.spec.name, "dimension", result.is_ok(), elapsed);
        if let Ok(summary) = &result {
            metrics::record_rows(
                &self.spec.name,
                "dimension",
                summary.upserted + summary.tombstoned,
                summary.tombstoned,
            );
        }
        result
    }

    async fn write_batch_inner<F>(&self, n: usize, mut producer: F, config: WriteConfig) -> Result<WriteSummary>
    where
        F: FnMut(usize) -> Result<Record>,
    {
        let mut incoming: Vec<PendingRow> = Vec::with_capacity(n);
        let mut positions: HashMap<SurrogateKey, usize> = HashMap::with_capacity(n);
        for index in 0..n {
            let row = self.pending_row(index, producer(index)?)?;
            match positions.get(&row.entity_id) {
                Some(&pos) => incoming[pos] = row,
                None => {
                    positions.insert(row.entity_id.clone(), incoming.len());
                    incoming.push(row);
                }
            }
        }

        self.ensure_table().await?;

        let mut tombstones = Vec::new();
        if config.missing_means_deleted {
            let present: HashSet<&SurrogateKey> = positions.keys().collect();
            for record in self.current_rows().await? {
                let row = self.carried_forward(&record)?;
                if !present.contains(&row.entity_id) {
                    tombstones.push(row);
                }
            }
        }

        let snapshot_ts = config.snapshot_ts.map_or_else(now_micros, truncate_micros);
        let ingested_at = now_micros();
        let upserted = incoming.len();
        let tombstoned = tombstones.len();
        let total = i64::try_from(upserted + tombstoned).unwrap_or(i64::MAX);
        let first_op = self.op_ids.fetch_add(total, Ordering::SeqCst) + 1;

        let rows: Vec<Vec<Value>> = incoming
            .into_iter()
            .map(|row| (row, false))
            .chain(tombstones.into_iter().map(|row| (row, true)))
            .zip(first_op..)
            .map(|((row, deleted), op_id)| Self::physical_row(row, snapshot_ts, ingested_at, op_id, deleted))
            .collect();

        store::execute(
            self.store.as_ref(),
            Statement::Insert {
                table: &self.spec,
                rows: &rows,
            },
        )
        .await
        .map_err(|e| DatasetError::store("write_batch", &self.spec.name, e))?;

        tracing::debug!(upserted, tombstoned, %snapshot_ts, "dimension batch written");
        Ok(WriteSummary {
            upserted,
            tombstoned,
            snapshot_ts: Some(snapshot_ts),
        })
    }

    async fn query(&self, operation: &'static str, sql: lake_core::Result<String>) -> Result<Vec<Record>> {
        let sql = sql.map_err(|e| DatasetError::invalid_argument(&self.spec.name, e.to_string()))?;
        self.ensure_table().await?;
        store::query(self.store.as_ref(), &sql)
            .instrument(dataset_span(operation, &self.spec.name))
            .await
            .map(lake_core::Rows::into_records)
            .map_err(|e| DatasetError::store(operation, &self.spec.name, e))
    }

    /// Current row of one entity, or `None` if it never existed or is deleted.
    ///
    /// # Errors
    ///
    /// Returns a wrapped store error.
    pub async fn get_current_row(&self, id: &SurrogateKey) -> Result<Option<Record>> {
        let rows = self
            .query(
                "get_current_row",
                sql::current_rows(&self.spec, Some(std::slice::from_ref(id))),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Current rows of several entities, keyed by surrogate key.
    ///
    /// Deleted and unknown ids are absent from the result. Large id sets are
    /// queried in chunks.
    ///
    /// # Errors
    ///
    /// Returns a wrapped store error.
    pub async fn get_current_rows(&self, ids: &[SurrogateKey]) -> Result<HashMap<SurrogateKey, Record>> {
        let mut out = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(sql::MAX_IN_LIST) {
            let rows = self
                .query("get_current_rows", sql::current_rows(&self.spec, Some(chunk)))
                .await?;
            for record in rows {
                if let Some(id) = record.get(h::ENTITY_ID).and_then(Value::as_str) {
                    out.insert(SurrogateKey::from_stored(id), record);
                }
            }
        }
        Ok(out)
    }

    /// Every live entity's current row.
    ///
    /// # Errors
    ///
    /// Returns a wrapped store error.
    pub async fn current_rows(&self) -> Result<Vec<Record>> {
        self.query("current_rows", sql::current_rows(&self.spec, None))
            .await
    }

    /// All history rows of an entity, oldest first, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns a wrapped store error.
    pub async fn history(&self, id: &SurrogateKey) -> Result<Vec<Record>> {
        self.query("history", sql::history(&self.spec, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lake_core::schema::ColumnDef;
    use lake_core::store::MemoryStore;
    use lake_core::ColumnType;

    struct Nodes;

    impl DimensionSchema for Nodes {
        fn name(&self) -> &'static str {
            "nodes"
        }
        fn key_columns(&self) -> &'static [&'static str] {
            &["pubkey"]
        }
        fn payload_columns(&self) -> Vec<ColumnDef> {
            vec![
                ColumnDef::nullable("version", ColumnType::Varchar),
                ColumnDef::new("stake", ColumnType::BigInt),
            ]
        }
    }

    fn node(pubkey: &str, stake: i64) -> Record {
        Record::from([
            ("pubkey".to_string(), Value::from(pubkey)),
            ("stake".to_string(), Value::Int64(stake)),
        ])
    }

    fn dataset(store: &MemoryStore) -> DimensionType2Dataset {
        DimensionType2Dataset::new(Arc::new(Nodes), Arc::new(store.clone())).unwrap()
    }

    #[tokio::test]
    async fn duplicate_entity_in_batch_keeps_last() {
        let store = MemoryStore::new();
        let ds = dataset(&store);
        let rows = [node("a", 1), node("a", 2)];
        let summary = ds
            .write_batch(2, |i| Ok(rows[i].clone()), WriteConfig::default())
            .await
            .unwrap();
        assert_eq!(summary.upserted, 1);

        let id = SurrogateKey::derive(["a"]).unwrap();
        let current = ds.get_current_row(&id).await.unwrap().unwrap();
        assert_eq!(current["stake"], Value::Int64(2));
        assert_eq!(ds.history(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_key_column_is_an_invalid_row() {
        let store = MemoryStore::new();
        let ds = dataset(&store);
        let mut bad = node("a", 1);
        bad.remove("pubkey");
        let err = ds
            .write_batch(1, |_| Ok(bad.clone()), WriteConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidRow { index: 0, .. }));
    }

    #[tokio::test]
    async fn unknown_column_is_rejected() {
        let store = MemoryStore::new();
        let ds = dataset(&store);
        let mut bad = node("a", 1);
        bad.insert("extra".into(), Value::Int64(1));
        assert!(ds
            .write_batch(1, |_| Ok(bad.clone()), WriteConfig::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn key_parts_are_trimmed_before_hashing() {
        let store = MemoryStore::new();
        let ds = dataset(&store);
        ds.write_batch(1, |_| Ok(node("  a ", 1)), WriteConfig::default())
            .await
            .unwrap();
        let id = SurrogateKey::derive(["a"]).unwrap();
        let current = ds.get_current_row(&id).await.unwrap().unwrap();
        assert_eq!(current["pubkey"], Value::from("a"));
    }

    #[tokio::test]
    async fn store_failure_is_wrapped_with_context() {
        let store = MemoryStore::new();
        let ds = dataset(&store);
        store.set_fail_writes(true);
        let err = ds
            .write_batch(1, |_| Ok(node("a", 1)), WriteConfig::default())
            .await
            .unwrap_err();
        match err {
            DatasetError::Store { operation, table, .. } => {
                assert_eq!(operation, "create_table");
                assert_eq!(table, "dim_nodes_history");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
