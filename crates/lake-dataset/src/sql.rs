//! SQL text for dataset reads.
//!
//! Every statement here runs unchanged on all store backends: identifiers
//! are double-quoted, literals come from [`Value::sql_literal`], and
//! "latest row" semantics use `ROW_NUMBER()` windows instead of
//! backend-specific `FINAL` or `argMax` constructs.

use lake_core::schema::{TableSpec, history_columns as h};
use lake_core::store::quote_ident;
use lake_core::{Error, Result, SurrogateKey, Value};

/// Largest IN list issued in one query.
pub const MAX_IN_LIST: usize = 1000;

/// Comparison operator for [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A predicate on one column of a dataset read.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column <op> value`
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        value: Value,
    },
    /// `column IN (values)`; an empty list matches nothing.
    In {
        /// Column name.
        column: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// `column IS NULL`
    IsNull(String),
    /// `column IS NOT NULL`
    NotNull(String),
}

impl Filter {
    fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    /// `column <> value`
    pub fn not_eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::NotEq, value)
    }

    /// `column < value`
    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    /// `column <= value`
    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Le, value)
    }

    /// `column > value`
    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    /// `column >= value`
    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Ge, value)
    }

    /// `column IN (values)`
    pub fn in_list<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Column the filter reads.
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Compare { column, .. } | Self::In { column, .. } => column,
            Self::IsNull(column) | Self::NotNull(column) => column,
        }
    }

    fn render(&self) -> Result<String> {
        let column = quote_ident(self.column())?;
        Ok(match self {
            Self::Compare { op, value, .. } => {
                format!("{column} {} {}", op.as_sql(), value.sql_literal())
            }
            Self::In { values, .. } if values.is_empty() => "1 = 0".to_string(),
            Self::In { values, .. } => format!(
                "{column} IN ({})",
                values
                    .iter()
                    .map(Value::sql_literal)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::IsNull(_) => format!("{column} IS NULL"),
            Self::NotNull(_) => format!("{column} IS NOT NULL"),
        })
    }
}

fn select_list<'a>(columns: impl IntoIterator<Item = &'a str>) -> Result<String> {
    Ok(columns
        .into_iter()
        .map(quote_ident)
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

/// Renders filters joined by `AND`, checking every column exists.
///
/// # Errors
///
/// Returns an error for a filter on an undeclared column.
pub fn render_filters(spec: &TableSpec, filters: &[Filter]) -> Result<Option<String>> {
    if filters.is_empty() {
        return Ok(None);
    }
    let mut parts = Vec::with_capacity(filters.len());
    for filter in filters {
        if spec.column(filter.column()).is_none() {
            return Err(Error::InvalidInput(format!(
                "unknown column '{}' in {}",
                filter.column(),
                spec.name
            )));
        }
        parts.push(filter.render()?);
    }
    Ok(Some(parts.join(" AND ")))
}

/// Current (latest, non-deleted) rows of a history table.
///
/// The outer projection omits `is_deleted`; when `ids` is given only those
/// entities are considered.
///
/// # Errors
///
/// Returns an error for invalid identifiers.
pub fn current_rows(spec: &TableSpec, ids: Option<&[SurrogateKey]>) -> Result<String> {
    let all = spec.column_names();
    let outer = select_list(all.iter().copied().filter(|c| *c != h::IS_DELETED))?;
    let inner = select_list(all.iter().copied())?;
    let filter = match ids {
        Some(ids) => format!(
            " WHERE {} IN ({})",
            quote_ident(h::ENTITY_ID)?,
            ids.iter()
                .map(|id| Value::from(id.as_str()).sql_literal())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        None => String::new(),
    };
    Ok(format!(
        "SELECT {outer} FROM (SELECT {inner}, ROW_NUMBER() OVER (PARTITION BY {entity} ORDER BY {snap} DESC, {ingested} DESC, {op} DESC) AS rn FROM {table}{filter}) AS latest WHERE rn = 1 AND {deleted} = 0",
        entity = quote_ident(h::ENTITY_ID)?,
        snap = quote_ident(h::SNAPSHOT_TS)?,
        ingested = quote_ident(h::INGESTED_AT)?,
        op = quote_ident(h::OP_ID)?,
        table = quote_ident(&spec.name)?,
        deleted = quote_ident(h::IS_DELETED)?,
    ))
}

/// Full history of one entity, oldest first, tombstones included.
///
/// # Errors
///
/// Returns an error for invalid identifiers.
pub fn history(spec: &TableSpec, id: &SurrogateKey) -> Result<String> {
    Ok(format!(
        "SELECT {cols} FROM {table} WHERE {entity} = {id} ORDER BY {snap}, {ingested}, {op}",
        cols = select_list(spec.column_names())?,
        table = quote_ident(&spec.name)?,
        entity = quote_ident(h::ENTITY_ID)?,
        id = Value::from(id.as_str()).sql_literal(),
        snap = quote_ident(h::SNAPSHOT_TS)?,
        ingested = quote_ident(h::INGESTED_AT)?,
        op = quote_ident(h::OP_ID)?,
    ))
}

/// Latest row per unique key of a fact table, filtered after dedup.
///
/// # Errors
///
/// Returns an error for invalid identifiers or unknown filter columns.
pub fn latest_facts(
    spec: &TableSpec,
    key_columns: &[&str],
    version_column: &str,
    filters: &[Filter],
) -> Result<String> {
    let cols = select_list(spec.column_names())?;
    let keys = select_list(key_columns.iter().copied())?;
    let mut sql = format!(
        "SELECT {cols} FROM (SELECT {cols}, ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY {version} DESC) AS rn FROM {table}) AS latest WHERE rn = 1",
        version = quote_ident(version_column)?,
        table = quote_ident(&spec.name)?,
    );
    if let Some(predicate) = render_filters(spec, filters)? {
        sql.push_str(" AND ");
        sql.push_str(&predicate);
    }
    Ok(sql)
}

/// All physical rows of a table matching the filters.
///
/// # Errors
///
/// Returns an error for invalid identifiers or unknown filter columns.
pub fn all_rows(spec: &TableSpec, filters: &[Filter]) -> Result<String> {
    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list(spec.column_names())?,
        quote_ident(&spec.name)?
    );
    if let Some(predicate) = render_filters(spec, filters)? {
        sql.push_str(" WHERE ");
        sql.push_str(&predicate);
    }
    Ok(sql)
}

/// The row with the highest `order_column` per group, drawn from `source`.
///
/// `source` is a complete SELECT over the table's columns (for example the
/// output of [`latest_facts`]).
///
/// # Errors
///
/// Returns an error for invalid identifiers.
pub fn top_per_group(
    spec: &TableSpec,
    source: &str,
    group_by: &[&str],
    order_column: &str,
) -> Result<String> {
    let cols = select_list(spec.column_names())?;
    Ok(format!(
        "SELECT {cols} FROM (SELECT {cols}, ROW_NUMBER() OVER (PARTITION BY {groups} ORDER BY {order} DESC) AS grp_rn FROM ({source}) AS src) AS ranked WHERE grp_rn = 1",
        groups = select_list(group_by.iter().copied())?,
        order = quote_ident(order_column)?,
    ))
}

/// Maximum of a column over `source`, aliased `v`.
///
/// # Errors
///
/// Returns an error for invalid identifiers.
pub fn max_of(source: &str, column: &str) -> Result<String> {
    Ok(format!(
        "SELECT max({}) AS v FROM ({source}) AS src",
        quote_ident(column)?
    ))
}

/// Minimum and maximum of a column over `source`, aliased `lo` and `hi`.
///
/// # Errors
///
/// Returns an error for invalid identifiers.
pub fn bounds_of(source: &str, column: &str) -> Result<String> {
    let column = quote_ident(column)?;
    Ok(format!(
        "SELECT min({column}) AS lo, max({column}) AS hi FROM ({source}) AS src"
    ))
}

/// Physical row count, aliased `n`.
///
/// # Errors
///
/// Returns an error for invalid identifiers.
pub fn count(spec: &TableSpec) -> Result<String> {
    Ok(format!("SELECT count(*) AS n FROM {}", quote_ident(&spec.name)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lake_core::schema::{ColumnDef, TableEngine};
    use lake_core::ColumnType;

    fn history_spec() -> TableSpec {
        TableSpec {
            name: "dim_nodes_history".into(),
            columns: vec![
                ColumnDef::new("entity_id", ColumnType::Varchar),
                ColumnDef::new("snapshot_ts", ColumnType::Timestamp),
                ColumnDef::new("ingested_at", ColumnType::Timestamp),
                ColumnDef::new("op_id", ColumnType::BigInt),
                ColumnDef::new("is_deleted", ColumnType::Boolean),
                ColumnDef::new("pubkey", ColumnType::Varchar),
            ],
            engine: TableEngine::AppendOnly,
            order_by: vec!["entity_id".into()],
            partition: None,
        }
    }

    #[test]
    fn current_rows_uses_version_tuple_window() {
        let sql = current_rows(&history_spec(), None).unwrap();
        assert_eq!(
            sql,
            "SELECT \"entity_id\", \"snapshot_ts\", \"ingested_at\", \"op_id\", \"pubkey\" FROM \
             (SELECT \"entity_id\", \"snapshot_ts\", \"ingested_at\", \"op_id\", \"is_deleted\", \"pubkey\", \
             ROW_NUMBER() OVER (PARTITION BY \"entity_id\" ORDER BY \"snapshot_ts\" DESC, \
             \"ingested_at\" DESC, \"op_id\" DESC) AS rn FROM \"dim_nodes_history\") AS latest \
             WHERE rn = 1 AND \"is_deleted\" = 0"
        );
    }

    #[test]
    fn current_rows_restricts_to_ids() {
        let ids = [SurrogateKey::from_stored("abc"), SurrogateKey::from_stored("d'e")];
        let sql = current_rows(&history_spec(), Some(&ids)).unwrap();
        assert!(sql.contains("WHERE \"entity_id\" IN ('abc', 'd''e')"));
    }

    #[test]
    fn filters_reject_unknown_columns() {
        let spec = history_spec();
        assert!(render_filters(&spec, &[Filter::eq("nope", 1_i64)]).is_err());
        let rendered = render_filters(&spec, &[Filter::eq("pubkey", "x"), Filter::in_list("op_id", Vec::<i64>::new())])
            .unwrap()
            .unwrap();
        assert_eq!(rendered, "\"pubkey\" = 'x' AND 1 = 0");
    }
}
