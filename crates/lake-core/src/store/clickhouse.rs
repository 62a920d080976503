//! ClickHouse backend over the HTTP interface.
//!
//! History tables use `MergeTree` ordered by the version tuple; fact tables
//! use `ReplacingMergeTree(<version column>)` ordered by their unique key.
//! Inserts are sent as `JSONEachRow`, reads come back as `JSONCompact` and
//! are decoded against the column types in the response metadata.
//!
//! The "pool" is a semaphore bounding in-flight requests per store; each
//! connection holds one permit until it is closed or dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::schema::{PartitionGranularity, TableEngine, TableSpec};
use crate::store::{ColumnarStore, Rows, Statement, StoreConnection, quote_ident};
use crate::value::{ColumnType, Value};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Connection settings for [`ClickHouseStore`].
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// HTTP endpoint, e.g. `http://localhost:8123`.
    pub url: String,
    /// Database holding every lake table.
    pub database: String,
    /// User name, if authentication is enabled.
    pub user: Option<String>,
    /// Password for `user`.
    pub password: Option<String>,
    /// Maximum concurrent requests.
    pub max_connections: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".into(),
            database: "default".into(),
            user: None,
            password: None,
            max_connections: 16,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClickHouseConfig {
    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty URL or database or a zero
    /// connection limit.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::configuration("clickhouse url must not be empty"));
        }
        if self.database.trim().is_empty() {
            return Err(Error::configuration("clickhouse database must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(Error::configuration(
                "clickhouse max_connections must be at least 1",
            ));
        }
        Ok(())
    }
}

/// ClickHouse-backed columnar store.
#[derive(Debug, Clone)]
pub struct ClickHouseStore {
    client: reqwest::Client,
    config: Arc<ClickHouseConfig>,
    permits: Arc<Semaphore>,
}

impl ClickHouseStore {
    /// Builds a store from validated settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings or if the HTTP
    /// client cannot be built.
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::configuration(format!("clickhouse http client: {e}")))?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
        })
    }

    /// Requests currently permitted to start.
    #[must_use]
    pub fn available_connections(&self) -> usize {
        self.permits.available_permits()
    }

    async fn post(&self, body: String) -> Result<String> {
        let mut request = self
            .client
            .post(&self.config.url)
            .query(&[
                ("database", self.config.database.as_str()),
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .body(body);
        if let Some(user) = &self.config.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.config.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::store_with_source("clickhouse request failed", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::store_with_source("clickhouse response body unreadable", e))?;
        if !status.is_success() {
            return Err(Error::store(format!(
                "clickhouse returned {status}: {}",
                text.trim()
            )));
        }
        Ok(text)
    }
}

#[async_trait]
impl ColumnarStore for ClickHouseStore {
    async fn conn(&self) -> Result<Box<dyn StoreConnection>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| Error::store_with_source("clickhouse pool closed", e))?;
        Ok(Box::new(ClickHouseConnection {
            store: self.clone(),
            _permit: permit,
        }))
    }

    fn backend(&self) -> &'static str {
        "clickhouse"
    }
}

/// A pooled ClickHouse connection.
#[derive(Debug)]
pub struct ClickHouseConnection {
    store: ClickHouseStore,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl StoreConnection for ClickHouseConnection {
    async fn exec(&mut self, statement: Statement<'_>) -> Result<()> {
        let body = match statement {
            Statement::CreateTable(spec) => render_create_table(spec)?,
            Statement::Insert { table, rows } => {
                if rows.is_empty() {
                    return Ok(());
                }
                render_insert(table, rows)?
            }
            Statement::Optimize { table } => {
                format!("OPTIMIZE TABLE {} FINAL", quote_ident(&table.name)?)
            }
        };
        tracing::debug!(
            kind = statement.kind(),
            table = statement.table_name(),
            "clickhouse exec"
        );
        self.store.post(body).await.map(|_| ())
    }

    async fn query(&mut self, sql: &str) -> Result<Rows> {
        let body = format!("{} FORMAT JSONCompact", sql.trim().trim_end_matches(';'));
        let text = self.store.post(body).await?;
        parse_json_compact(&text)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn physical_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Varchar => "String",
        ColumnType::BigInt => "Int64",
        ColumnType::Integer => "Int32",
        ColumnType::Double => "Float64",
        ColumnType::Boolean => "UInt8",
        ColumnType::Timestamp => "DateTime64(6, 'UTC')",
    }
}

/// Renders `CREATE TABLE IF NOT EXISTS` DDL for a table spec.
///
/// # Errors
///
/// Returns a schema error if the table spec is inconsistent.
pub fn render_create_table(spec: &TableSpec) -> Result<String> {
    spec.validate()?;
    let mut ddl = format!("CREATE TABLE IF NOT EXISTS {} (", quote_ident(&spec.name)?);
    for (i, column) in spec.columns.iter().enumerate() {
        if i > 0 {
            ddl.push_str(", ");
        }
        let ty = physical_type(column.ty);
        let ident = quote_ident(&column.name)?;
        if column.nullable {
            ddl.push_str(&format!("{ident} Nullable({ty})"));
        } else {
            ddl.push_str(&format!("{ident} {ty}"));
        }
    }
    ddl.push(')');

    match &spec.engine {
        TableEngine::AppendOnly => ddl.push_str(" ENGINE = MergeTree"),
        TableEngine::Replacing { version_column } => {
            ddl.push_str(&format!(
                " ENGINE = ReplacingMergeTree({})",
                quote_ident(version_column)?
            ));
        }
    }
    if let Some(partition) = &spec.partition {
        let func = match partition.granularity {
            PartitionGranularity::Day => "toYYYYMMDD",
            PartitionGranularity::Month => "toYYYYMM",
        };
        ddl.push_str(&format!(" PARTITION BY {func}({})", quote_ident(&partition.column)?));
    }
    let order_by = spec
        .order_by
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    ddl.push_str(&format!(" ORDER BY ({order_by})"));
    Ok(ddl)
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Int64(v) => (*v).into(),
        Value::Int32(v) => (*v).into(),
        Value::Float64(v) => serde_json::Number::from_f64(*v)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Bool(v) => u8::from(*v).into(),
        Value::Timestamp(ts) => serde_json::Value::String(ts.format(TIMESTAMP_FORMAT).to_string()),
    }
}

/// Renders an `INSERT ... FORMAT JSONEachRow` body.
///
/// # Errors
///
/// Returns an error if a row has the wrong width or a value does not fit its
/// column.
pub fn render_insert(spec: &TableSpec, rows: &[Vec<Value>]) -> Result<String> {
    let columns = spec
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let mut body = format!(
        "INSERT INTO {} ({columns}) FORMAT JSONEachRow\n",
        quote_ident(&spec.name)?
    );
    for row in rows {
        if row.len() != spec.columns.len() {
            return Err(Error::InvalidInput(format!(
                "{}: row has {} values, expected {}",
                spec.name,
                row.len(),
                spec.columns.len()
            )));
        }
        let mut object = serde_json::Map::with_capacity(row.len());
        for (column, value) in spec.columns.iter().zip(row) {
            if !column.ty.accepts(value) || (value.is_null() && !column.nullable) {
                return Err(Error::InvalidInput(format!(
                    "{}.{}: value {value:?} does not fit column type {}",
                    spec.name, column.name, column.ty
                )));
            }
            object.insert(column.name.clone(), json_value(value));
        }
        let line = serde_json::to_string(&object)
            .map_err(|e| Error::serialization(format!("encode row for {}: {e}", spec.name)))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct CompactMeta {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Debug, Deserialize)]
struct CompactResponse {
    meta: Vec<CompactMeta>,
    data: Vec<Vec<serde_json::Value>>,
}

fn strip_wrapper<'a>(ty: &'a str, wrapper: &str) -> &'a str {
    ty.strip_prefix(wrapper)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(ty)
}

fn base_type(ty: &str) -> &str {
    let ty = strip_wrapper(ty, "Nullable");
    let ty = strip_wrapper(ty, "LowCardinality");
    strip_wrapper(ty, "Nullable")
}

fn parse_timestamp(raw: &str) -> Option<Value> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| Value::Timestamp(Utc.from_utc_datetime(&naive)))
}

fn decode_cell(ty: &str, cell: &serde_json::Value) -> Result<Value> {
    if cell.is_null() {
        return Ok(Value::Null);
    }
    let base = base_type(ty);
    let mismatch = || Error::serialization(format!("cannot decode {cell} as {ty}"));
    let value = match base {
        "String" | "FixedString" => Value::String(cell.as_str().ok_or_else(mismatch)?.to_string()),
        "UInt8" | "Bool" => match cell {
            serde_json::Value::Bool(b) => Value::Bool(*b),
            other => Value::Bool(other.as_u64().ok_or_else(mismatch)? != 0),
        },
        "Int8" | "Int16" | "Int32" | "UInt16" => Value::Int32(
            cell.as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(mismatch)?,
        ),
        "Int64" | "UInt32" | "UInt64" => Value::Int64(
            cell.as_i64()
                .or_else(|| cell.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(mismatch)?,
        ),
        "Float32" | "Float64" => Value::Float64(cell.as_f64().ok_or_else(mismatch)?),
        "Nothing" => Value::Null,
        other if other.starts_with("DateTime") => {
            parse_timestamp(cell.as_str().ok_or_else(mismatch)?).ok_or_else(mismatch)?
        }
        other => {
            return Err(Error::serialization(format!(
                "unsupported result column type {other}"
            )));
        }
    };
    Ok(value)
}

/// Decodes a `JSONCompact` response body.
///
/// # Errors
///
/// Returns a serialization error for malformed bodies or unsupported types.
pub fn parse_json_compact(body: &str) -> Result<Rows> {
    let response: CompactResponse = serde_json::from_str(body)
        .map_err(|e| Error::serialization(format!("clickhouse JSONCompact body: {e}")))?;
    let rows = response
        .data
        .iter()
        .map(|row| {
            if row.len() != response.meta.len() {
                return Err(Error::serialization("clickhouse row width mismatch"));
            }
            response
                .meta
                .iter()
                .zip(row)
                .map(|(meta, cell)| decode_cell(&meta.ty, cell))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Rows {
        columns: response.meta.into_iter().map(|m| m.name).collect(),
        rows,
    })
}
