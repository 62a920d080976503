//! Columnar store collaborator contract.
//!
//! The dataset engines need exactly three things from the store:
//!
//! - [`StoreConnection::exec`]: typed DDL/DML ([`Statement`]) rendered per backend
//! - [`StoreConnection::query`]: portable SQL reads (window functions required)
//! - [`ColumnarStore::conn`]: a pooled connection with an explicit
//!   [`StoreConnection::close`]
//!
//! Connections are acquired per logical operation (one write batch, one read)
//! and released promptly, so a connection-level failure only affects the
//! operation that hit it. [`execute`] and [`query`] wrap that pattern.
//!
//! ## Backends
//!
//! - [`memory::MemoryStore`]: embedded backend on Arrow + DataFusion; used by
//!   tests and local runs. Replacing tables collapse on [`Statement::Optimize`].
//! - [`clickhouse::ClickHouseStore`]: ClickHouse over its HTTP interface with
//!   `MergeTree` history tables and `ReplacingMergeTree` fact tables.

pub mod arrow_util;
pub mod clickhouse;
pub mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::schema::TableSpec;
use crate::value::{Record, Value};

pub use clickhouse::{ClickHouseConfig, ClickHouseStore};
pub use memory::MemoryStore;

/// A typed statement executed against the store.
#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    /// Create the table if it does not exist.
    CreateTable(&'a TableSpec),
    /// Append rows; each row holds one value per column of the table spec, in order.
    Insert {
        /// Target table.
        table: &'a TableSpec,
        /// Rows in physical column order.
        rows: &'a [Vec<Value>],
    },
    /// Force a merge so replacing tables hold one row per key.
    Optimize {
        /// Target table.
        table: &'a TableSpec,
    },
}

impl Statement<'_> {
    /// Short operation name for logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CreateTable(_) => "create_table",
            Self::Insert { .. } => "insert",
            Self::Optimize { .. } => "optimize",
        }
    }

    /// Table the statement targets.
    #[must_use]
    pub fn table_name(&self) -> &str {
        match self {
            Self::CreateTable(table) | Self::Insert { table, .. } | Self::Optimize { table } => {
                &table.name
            }
        }
    }
}

/// Tabular query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    /// Column names in result order.
    pub columns: Vec<String>,
    /// Row values aligned with `columns`.
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Returns the first row's value in `column`.
    #[must_use]
    pub fn scalar(&self, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.first().and_then(|row| row.get(idx))
    }

    /// Converts rows into name-keyed records.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }
}

/// A store connection scoped to one logical operation.
#[async_trait]
pub trait StoreConnection: Send {
    /// Executes a typed statement.
    async fn exec(&mut self, statement: Statement<'_>) -> Result<()>;

    /// Runs a read query.
    async fn query(&mut self, sql: &str) -> Result<Rows>;

    /// Releases the connection back to the pool.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Columnar store with a connection pool.
#[async_trait]
pub trait ColumnarStore: Send + Sync + fmt::Debug + 'static {
    /// Acquires a connection for a single logical operation.
    async fn conn(&self) -> Result<Box<dyn StoreConnection>>;

    /// Backend name for logs and metrics.
    fn backend(&self) -> &'static str;
}

/// Executes one statement on a freshly acquired connection.
///
/// # Errors
///
/// Returns the statement's error, or the close error if the statement
/// succeeded but the connection could not be released.
pub async fn execute(store: &dyn ColumnarStore, statement: Statement<'_>) -> Result<()> {
    let mut conn = store.conn().await?;
    let result = conn.exec(statement).await;
    let closed = conn.close().await;
    result.and(closed)
}

/// Runs one read query on a freshly acquired connection.
///
/// # Errors
///
/// Returns the query error, or the close error if the query succeeded but
/// the connection could not be released.
pub async fn query(store: &dyn ColumnarStore, sql: &str) -> Result<Rows> {
    let mut conn = store.conn().await?;
    let result = conn.query(sql).await;
    let closed = conn.close().await;
    let rows = result?;
    closed?;
    Ok(rows)
}

/// Quotes an identifier for SQL text shared by every backend.
///
/// # Errors
///
/// Returns an error if the identifier contains a double quote.
pub fn quote_ident(name: &str) -> Result<String> {
    if name.contains('"') {
        return Err(Error::InvalidInput(format!("invalid identifier '{name}'")));
    }
    Ok(format!("\"{name}\""))
}
