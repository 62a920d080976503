//! Schema descriptors for dimension and fact datasets.
//!
//! Descriptors are static, code-defined contracts: each domain implements
//! [`DimensionSchema`] or [`FactSchema`] on a stateless unit struct and hands
//! an instance to the dataset constructor. There is no global registry.
//!
//! A descriptor resolves to a physical [`TableSpec`], which each store
//! backend renders into its own DDL.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::ColumnType;

/// Reserved columns present on every history table.
pub mod history_columns {
    /// Surrogate key of the entity.
    pub const ENTITY_ID: &str = "entity_id";
    /// Logical version time.
    pub const SNAPSHOT_TS: &str = "snapshot_ts";
    /// Physical write time.
    pub const INGESTED_AT: &str = "ingested_at";
    /// Monotonic tiebreaker for same-timestamp writes.
    pub const OP_ID: &str = "op_id";
    /// Tombstone flag.
    pub const IS_DELETED: &str = "is_deleted";

    /// All reserved names, in physical column order.
    pub const ALL: [&str; 5] = [ENTITY_ID, SNAPSHOT_TS, INGESTED_AT, OP_ID, IS_DELETED];
}

/// Default dedup version column for fact tables.
pub const DEFAULT_VERSION_COLUMN: &str = "ingested_at";

/// A typed column declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub ty: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl ColumnDef {
    /// Declares a non-nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }

    /// Declares a nullable column.
    #[must_use]
    pub fn nullable(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }
}

/// How a fact table collapses rows sharing a unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupMode {
    /// Merge engine keeps only the highest-version row per unique key.
    #[default]
    Replacing,
    /// Plain append; every physical row is retained.
    None,
}

/// Range partition granularity for a time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionGranularity {
    /// One partition per calendar day.
    Day,
    /// One partition per calendar month.
    Month,
}

impl PartitionGranularity {
    /// Partition key for a timestamp.
    #[must_use]
    pub fn key_for(self, ts: chrono::DateTime<chrono::Utc>) -> String {
        match self {
            Self::Day => ts.format("%Y%m%d").to_string(),
            Self::Month => ts.format("%Y%m").to_string(),
        }
    }
}

/// Physical range partitioning of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Timestamp column partitioned on.
    pub column: String,
    /// Partition granularity.
    pub granularity: PartitionGranularity,
}

/// Physical table engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableEngine {
    /// Append-only; rows are never collapsed.
    AppendOnly,
    /// Merge engine collapsing rows with equal sort keys to the highest version.
    Replacing {
        /// Version column deciding which row wins.
        version_column: String,
    },
}

/// Physical table description rendered by store backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name.
    pub name: String,
    /// Columns in physical order.
    pub columns: Vec<ColumnDef>,
    /// Table engine.
    pub engine: TableEngine,
    /// Sort key; for replacing tables this is the dedup key.
    pub order_by: Vec<String>,
    /// Optional range partition.
    pub partition: Option<PartitionSpec>,
}

impl TableSpec {
    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in physical order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Checks the table spec for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a schema error for duplicate or unknown columns, an empty
    /// sort key, or a partition on a non-timestamp column.
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(Error::schema(format!("invalid table name '{}'", self.name)));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_identifier(&column.name) {
                return Err(Error::schema(format!(
                    "invalid column name '{}' in {}",
                    column.name, self.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(Error::schema(format!(
                    "duplicate column '{}' in {}",
                    column.name, self.name
                )));
            }
        }
        if self.order_by.is_empty() {
            return Err(Error::schema(format!("{} has an empty sort key", self.name)));
        }
        for key in &self.order_by {
            if self.column(key).is_none() {
                return Err(Error::schema(format!(
                    "sort key column '{key}' not declared in {}",
                    self.name
                )));
            }
        }
        if let TableEngine::Replacing { version_column } = &self.engine {
            if self.column(version_column).is_none() {
                return Err(Error::schema(format!(
                    "version column '{version_column}' not declared in {}",
                    self.name
                )));
            }
        }
        if let Some(partition) = &self.partition {
            match self.column(&partition.column) {
                Some(c) if c.ty == ColumnType::Timestamp => {}
                _ => {
                    return Err(Error::schema(format!(
                        "partition column '{}' must be a declared TIMESTAMP in {}",
                        partition.column, self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Contract for a slowly-changing (type 2) dimension.
pub trait DimensionSchema: Send + Sync + 'static {
    /// Logical dimension name.
    fn name(&self) -> &'static str;

    /// Natural key columns (stored as VARCHAR), in key order.
    fn key_columns(&self) -> &'static [&'static str];

    /// Payload columns.
    fn payload_columns(&self) -> Vec<ColumnDef>;

    /// History table name.
    fn history_table(&self) -> String {
        format!("dim_{}_history", self.name())
    }

    /// Physical table description for the history table.
    fn table_spec(&self) -> TableSpec {
        use crate::value::ColumnType as T;
        use history_columns as h;

        let mut columns = vec![
            ColumnDef::new(h::ENTITY_ID, T::Varchar),
            ColumnDef::new(h::SNAPSHOT_TS, T::Timestamp),
            ColumnDef::new(h::INGESTED_AT, T::Timestamp),
            ColumnDef::new(h::OP_ID, T::BigInt),
            ColumnDef::new(h::IS_DELETED, T::Boolean),
        ];
        columns.extend(
            self.key_columns()
                .iter()
                .map(|name| ColumnDef::new(*name, T::Varchar)),
        );
        columns.extend(self.payload_columns());

        TableSpec {
            name: self.history_table(),
            columns,
            engine: TableEngine::AppendOnly,
            order_by: vec![
                h::ENTITY_ID.to_string(),
                h::SNAPSHOT_TS.to_string(),
                h::INGESTED_AT.to_string(),
                h::OP_ID.to_string(),
            ],
            partition: None,
        }
    }

    /// Validates the descriptor.
    ///
    /// # Errors
    ///
    /// Returns a schema error if there are no key columns, a payload column
    /// shadows a reserved or key column, or the table spec is inconsistent.
    fn validate(&self) -> Result<()> {
        if self.key_columns().is_empty() {
            return Err(Error::schema(format!(
                "dimension '{}' declares no key columns",
                self.name()
            )));
        }
        for column in self.payload_columns() {
            if history_columns::ALL.contains(&column.name.as_str()) {
                return Err(Error::schema(format!(
                    "dimension '{}' payload column '{}' is reserved",
                    self.name(),
                    column.name
                )));
            }
        }
        self.table_spec().validate()
    }
}

/// Contract for an append-only, deduplicated fact table.
pub trait FactSchema: Send + Sync + 'static {
    /// Logical fact name.
    fn name(&self) -> &'static str;

    /// Columns identifying a logical event.
    fn unique_key_columns(&self) -> &'static [&'static str];

    /// All declared columns (unique key and measurements), excluding the
    /// version column.
    fn columns(&self) -> Vec<ColumnDef>;

    /// Dedup version column.
    fn version_column(&self) -> &'static str {
        DEFAULT_VERSION_COLUMN
    }

    /// Dedup mode.
    fn dedup(&self) -> DedupMode {
        DedupMode::Replacing
    }

    /// Event time column, if any.
    fn time_column(&self) -> Option<&'static str> {
        None
    }

    /// Range partition granularity on the time column, if requested.
    fn partition(&self) -> Option<PartitionGranularity> {
        None
    }

    /// Fact table name.
    fn table(&self) -> String {
        format!("fact_{}", self.name())
    }

    /// Physical table description.
    fn table_spec(&self) -> TableSpec {
        let mut columns = self.columns();
        columns.push(ColumnDef::new(self.version_column(), ColumnType::Timestamp));

        let engine = match self.dedup() {
            DedupMode::Replacing => TableEngine::Replacing {
                version_column: self.version_column().to_string(),
            },
            DedupMode::None => TableEngine::AppendOnly,
        };

        let partition = match (self.time_column(), self.partition()) {
            (Some(column), Some(granularity)) => Some(PartitionSpec {
                column: column.to_string(),
                granularity,
            }),
            _ => None,
        };

        TableSpec {
            name: self.table(),
            columns,
            engine,
            order_by: self
                .unique_key_columns()
                .iter()
                .map(ToString::to_string)
                .collect(),
            partition,
        }
    }

    /// Validates the descriptor.
    ///
    /// # Errors
    ///
    /// Returns a schema error if no unique key is declared, a partition is
    /// requested without a time column, or the table spec is inconsistent.
    fn validate(&self) -> Result<()> {
        if self.unique_key_columns().is_empty() {
            return Err(Error::schema(format!(
                "fact '{}' declares no unique key columns",
                self.name()
            )));
        }
        if self.partition().is_some() && self.time_column().is_none() {
            return Err(Error::schema(format!(
                "fact '{}' requests partitioning without a time column",
                self.name()
            )));
        }
        self.table_spec().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    struct BadDimension;

    impl DimensionSchema for BadDimension {
        fn name(&self) -> &'static str {
            "bad"
        }
        fn key_columns(&self) -> &'static [&'static str] {
            &["id"]
        }
        fn payload_columns(&self) -> Vec<ColumnDef> {
            vec![ColumnDef::new("op_id", ColumnType::BigInt)]
        }
    }

    struct Samples;

    impl FactSchema for Samples {
        fn name(&self) -> &'static str {
            "samples"
        }
        fn unique_key_columns(&self) -> &'static [&'static str] {
            &["circuit", "sample_index"]
        }
        fn columns(&self) -> Vec<ColumnDef> {
            vec![
                ColumnDef::new("circuit", ColumnType::Varchar),
                ColumnDef::new("sample_index", ColumnType::BigInt),
                ColumnDef::new("sample_time", ColumnType::Timestamp),
                ColumnDef::new("rtt_us", ColumnType::BigInt),
            ]
        }
        fn time_column(&self) -> Option<&'static str> {
            Some("sample_time")
        }
        fn partition(&self) -> Option<PartitionGranularity> {
            Some(PartitionGranularity::Month)
        }
    }

    #[test]
    fn dimension_table_spec_has_history_columns_first() {
        let spec = Nodes.table_spec();
        assert_eq!(spec.name, "dim_nodes_history");
        assert_eq!(
            &spec.column_names()[..6],
            &["entity_id", "snapshot_ts", "ingested_at", "op_id", "is_deleted", "pubkey"]
        );
        assert_eq!(spec.engine, TableEngine::AppendOnly);
        assert!(Nodes.validate().is_ok());
    }

    #[test]
    fn reserved_payload_column_is_rejected() {
        assert!(BadDimension.validate().is_err());
    }

    #[test]
    fn fact_table_spec_is_replacing_and_partitioned() {
        let spec = Samples.table_spec();
        assert_eq!(spec.name, "fact_samples");
        assert_eq!(
            spec.engine,
            TableEngine::Replacing {
                version_column: "ingested_at".into()
            }
        );
        assert_eq!(spec.order_by, vec!["circuit", "sample_index"]);
        assert_eq!(spec.partition.as_ref().map(|p| p.column.as_str()), Some("sample_time"));
        assert!(Samples.validate().is_ok());
    }

    #[test]
    fn partition_keys_follow_granularity() {
        use chrono::TimeZone;
        let ts = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 1, 2, 3).unwrap();
        assert_eq!(PartitionGranularity::Month.key_for(ts), "202403");
        assert_eq!(PartitionGranularity::Day.key_for(ts), "20240309");
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        let spec = TableSpec {
            name: "bad-name".into(),
            columns: vec![ColumnDef::new("a", ColumnType::BigInt)],
            engine: TableEngine::AppendOnly,
            order_by: vec!["a".into()],
            partition: None,
        };
        assert!(spec.validate().is_err());
    }
}
