//! Embedded columnar store on Arrow + DataFusion.
//!
//! Tables are held as Arrow record batches and every read query is planned
//! and executed by DataFusion, so the exact window-function SQL used against
//! ClickHouse runs unchanged here.
//!
//! Replacing tables behave like a merge engine before background merges:
//! duplicate keys stay physically visible until [`Statement::Optimize`]
//! collapses them to the highest version. Not suitable for production
//! volumes; used by tests and local runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::schema::{TableEngine, TableSpec};
use crate::store::arrow_util::{batches_to_rows, rows_to_batch, table_schema};
use crate::store::{ColumnarStore, Rows, Statement, StoreConnection, quote_ident};
use crate::value::Value;

#[derive(Debug, Clone)]
struct MemoryTable {
    spec: TableSpec,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<HashMap<String, MemoryTable>>,
    /// Serializes inserts against optimize so a merge never drops a concurrent insert.
    write_gate: Mutex<()>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    open_connections: AtomicUsize,
    inserts: AtomicUsize,
}

/// In-process columnar store.
///
/// Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent statement fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent query fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Connections currently checked out.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    /// Insert statements executed so far.
    #[must_use]
    pub fn insert_count(&self) -> usize {
        self.inner.inserts.load(Ordering::SeqCst)
    }

    /// Names of existing tables, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the table map lock is poisoned.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let tables = self.inner.tables.read().map_err(|_| poisoned())?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Physical row count of a table, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the table map lock is poisoned.
    pub fn physical_rows(&self, table: &str) -> Result<Option<usize>> {
        let tables = self.inner.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .get(table)
            .map(|t| t.batches.iter().map(RecordBatch::num_rows).sum()))
    }

    /// Distinct partition keys currently present in a partitioned table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist or is not partitioned.
    pub fn partitions(&self, table: &str) -> Result<BTreeSet<String>> {
        let snapshot = {
            let tables = self.inner.tables.read().map_err(|_| poisoned())?;
            tables
                .get(table)
                .cloned()
                .ok_or_else(|| Error::InvalidInput(format!("unknown table {table}")))?
        };
        let partition = snapshot
            .spec
            .partition
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("{table} is not partitioned")))?;
        let rows = batches_to_rows(snapshot.schema.as_ref(), &snapshot.batches)?;
        let idx = rows
            .column_index(&partition.column)
            .ok_or_else(|| Error::schema(format!("{table} lacks {}", partition.column)))?;
        Ok(rows
            .rows
            .iter()
            .filter_map(|row| row[idx].as_timestamp())
            .map(|ts| partition.granularity.key_for(ts))
            .collect())
    }

    fn snapshot(&self) -> Result<Vec<MemoryTable>> {
        let tables = self.inner.tables.read().map_err(|_| poisoned())?;
        Ok(tables.values().cloned().collect())
    }

    async fn run_sql(&self, sql: &str) -> Result<Rows> {
        let ctx = SessionContext::new();
        for table in self.snapshot()? {
            let provider = MemTable::try_new(table.schema.clone(), vec![table.batches])
                .map_err(|e| Error::store_with_source(format!("register {}", table.spec.name), e))?;
            ctx.register_table(table.spec.name.as_str(), Arc::new(provider))
                .map_err(|e| Error::store_with_source(format!("register {}", table.spec.name), e))?;
        }

        let df = ctx
            .sql(sql)
            .await
            .map_err(|e| Error::store_with_source("query planning failed", e))?;
        let schema = Schema::from(df.schema());
        let batches = df
            .collect()
            .await
            .map_err(|e| Error::store_with_source("query execution failed", e))?;
        batches_to_rows(&schema, &batches)
    }

    fn create_table(&self, spec: &TableSpec) -> Result<()> {
        spec.validate()?;
        let mut tables = self.inner.tables.write().map_err(|_| poisoned())?;
        if let Some(existing) = tables.get(&spec.name) {
            if existing.spec.columns != spec.columns {
                return Err(Error::schema(format!(
                    "table {} exists with a different column layout",
                    spec.name
                )));
            }
            return Ok(());
        }
        tables.insert(
            spec.name.clone(),
            MemoryTable {
                spec: spec.clone(),
                schema: table_schema(spec),
                batches: Vec::new(),
            },
        );
        Ok(())
    }

    async fn insert(&self, spec: &TableSpec, rows: &[Vec<Value>]) -> Result<()> {
        let batch = rows_to_batch(spec, rows)?;
        let _gate = self.inner.write_gate.lock().await;
        let mut tables = self.inner.tables.write().map_err(|_| poisoned())?;
        let table = tables
            .get_mut(&spec.name)
            .ok_or_else(|| Error::store(format!("table {} does not exist", spec.name)))?;
        table.batches.push(batch);
        self.inner.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn optimize(&self, spec: &TableSpec) -> Result<()> {
        let TableEngine::Replacing { version_column } = &spec.engine else {
            return Ok(());
        };

        let _gate = self.inner.write_gate.lock().await;
        let columns = spec
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let keys = spec
            .order_by
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM (SELECT {columns}, ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY {version} DESC) AS merge_rn FROM {table}) AS merged WHERE merge_rn = 1",
            version = quote_ident(version_column)?,
            table = quote_ident(&spec.name)?,
        );
        let merged = self.run_sql(&sql).await?;
        let batch = rows_to_batch(spec, &merged.rows)?;

        let mut tables = self.inner.tables.write().map_err(|_| poisoned())?;
        let table = tables
            .get_mut(&spec.name)
            .ok_or_else(|| Error::store(format!("table {} does not exist", spec.name)))?;
        table.batches = vec![batch];
        Ok(())
    }
}

#[async_trait]
impl ColumnarStore for MemoryStore {
    async fn conn(&self) -> Result<Box<dyn StoreConnection>> {
        self.inner.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Connection handle onto a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.store
            .inner
            .open_connections
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn exec(&mut self, statement: Statement<'_>) -> Result<()> {
        if self.store.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::store(format!(
                "injected failure: {} {}",
                statement.kind(),
                statement.table_name()
            )));
        }
        match statement {
            Statement::CreateTable(spec) => self.store.create_table(spec),
            Statement::Insert { table, rows } => self.store.insert(table, rows).await,
            Statement::Optimize { table } => self.store.optimize(table).await,
        }
    }

    async fn query(&mut self, sql: &str) -> Result<Rows> {
        if self.store.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::store("injected failure: query"));
        }
        self.store.run_sql(sql).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;
    use crate::store::{execute, query};
    use crate::time::now_micros;
    use crate::value::ColumnType;

    fn replacing_spec() -> TableSpec {
        TableSpec {
            name: "fact_events".into(),
            columns: vec![
                ColumnDef::new("id", ColumnType::Varchar),
                ColumnDef::new("amount", ColumnType::BigInt),
                ColumnDef::new("ingested_at", ColumnType::Timestamp),
            ],
            engine: TableEngine::Replacing {
                version_column: "ingested_at".into(),
            },
            order_by: vec!["id".into()],
            partition: None,
        }
    }

    #[tokio::test]
    async fn optimize_keeps_highest_version() {
        let store = MemoryStore::new();
        let spec = replacing_spec();
        execute(&store, Statement::CreateTable(&spec)).await.unwrap();

        let t0 = now_micros();
        let t1 = t0 + chrono::Duration::seconds(1);
        let first = vec![vec![Value::from("a"), Value::Int64(1), Value::Timestamp(t0)]];
        let second = vec![vec![Value::from("a"), Value::Int64(2), Value::Timestamp(t1)]];
        execute(&store, Statement::Insert { table: &spec, rows: &first }).await.unwrap();
        execute(&store, Statement::Insert { table: &spec, rows: &second }).await.unwrap();
        assert_eq!(store.physical_rows("fact_events").unwrap(), Some(2));

        execute(&store, Statement::Optimize { table: &spec }).await.unwrap();
        let rows = query(&store, "SELECT \"amount\" FROM \"fact_events\"").await.unwrap();
        assert_eq!(rows.rows, vec![vec![Value::Int64(2)]]);
    }

    #[tokio::test]
    async fn connections_are_released() {
        let store = MemoryStore::new();
        let spec = replacing_spec();
        execute(&store, Statement::CreateTable(&spec)).await.unwrap();
        query(&store, "SELECT count(*) AS n FROM \"fact_events\"").await.unwrap();
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_store_errors() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = execute(&store, Statement::CreateTable(&replacing_spec()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test]
    async fn create_is_idempotent_but_rejects_layout_drift() {
        let store = MemoryStore::new();
        let spec = replacing_spec();
        execute(&store, Statement::CreateTable(&spec)).await.unwrap();
        execute(&store, Statement::CreateTable(&spec)).await.unwrap();

        let mut drifted = spec.clone();
        drifted.columns.push(ColumnDef::new("extra", ColumnType::Double));
        assert!(execute(&store, Statement::CreateTable(&drifted)).await.is_err());
    }
}
