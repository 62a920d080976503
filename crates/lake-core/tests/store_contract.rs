//! Store contract tests shared by every backend.
//!
//! Exercised against the embedded store: the SQL shapes here are the ones the
//! dataset engines issue, so they must plan and run unchanged.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Duration;

use lake_core::schema::{ColumnDef, PartitionGranularity, PartitionSpec, TableEngine, TableSpec};
use lake_core::store::{MemoryStore, Statement, execute, query};
use lake_core::time::now_micros;
use lake_core::{ColumnType, Value};

fn history_spec() -> TableSpec {
    TableSpec {
        name: "dim_nodes_history".into(),
        columns: vec![
            ColumnDef::new("entity_id", ColumnType::Varchar),
            ColumnDef::new("snapshot_ts", ColumnType::Timestamp),
            ColumnDef::new("ingested_at", ColumnType::Timestamp),
            ColumnDef::new("op_id", ColumnType::BigInt),
            ColumnDef::new("is_deleted", ColumnType::Boolean),
            ColumnDef::nullable("stake", ColumnType::BigInt),
        ],
        engine: TableEngine::AppendOnly,
        order_by: vec![
            "entity_id".into(),
            "snapshot_ts".into(),
            "ingested_at".into(),
            "op_id".into(),
        ],
        partition: None,
    }
}

#[tokio::test]
async fn latest_row_window_query_runs_on_embedded_store() {
    let store = MemoryStore::new();
    let spec = history_spec();
    execute(&store, Statement::CreateTable(&spec)).await.unwrap();

    let t0 = now_micros();
    let t1 = t0 + Duration::seconds(1);
    let rows = vec![
        vec![Value::from("a"), Value::Timestamp(t0), Value::Timestamp(t0), Value::Int64(1), Value::Bool(false), Value::Int64(10)],
        vec![Value::from("a"), Value::Timestamp(t1), Value::Timestamp(t1), Value::Int64(2), Value::Bool(false), Value::Int64(20)],
        vec![Value::from("b"), Value::Timestamp(t0), Value::Timestamp(t0), Value::Int64(3), Value::Bool(false), Value::Int64(5)],
        vec![Value::from("b"), Value::Timestamp(t1), Value::Timestamp(t1), Value::Int64(4), Value::Bool(true), Value::Int64(5)],
    ];
    execute(&store, Statement::Insert { table: &spec, rows: &rows }).await.unwrap();

    let sql = "SELECT \"entity_id\", \"stake\" FROM (SELECT \"entity_id\", \"stake\", \"is_deleted\", \
               ROW_NUMBER() OVER (PARTITION BY \"entity_id\" ORDER BY \"snapshot_ts\" DESC, \
               \"ingested_at\" DESC, \"op_id\" DESC) AS rn FROM \"dim_nodes_history\") AS latest \
               WHERE rn = 1 AND \"is_deleted\" = 0";
    let result = query(&store, sql).await.unwrap();
    assert_eq!(result.rows, vec![vec![Value::from("a"), Value::Int64(20)]]);
}

#[tokio::test]
async fn timestamp_literals_compare_against_columns() {
    let store = MemoryStore::new();
    let spec = history_spec();
    execute(&store, Statement::CreateTable(&spec)).await.unwrap();

    let t0 = now_micros();
    let rows = vec![vec![
        Value::from("a"),
        Value::Timestamp(t0),
        Value::Timestamp(t0),
        Value::Int64(1),
        Value::Bool(false),
        Value::Null,
    ]];
    execute(&store, Statement::Insert { table: &spec, rows: &rows }).await.unwrap();

    let sql = format!(
        "SELECT count(*) AS n FROM \"dim_nodes_history\" WHERE \"snapshot_ts\" <= {}",
        Value::Timestamp(t0).sql_literal()
    );
    let result = query(&store, &sql).await.unwrap();
    assert_eq!(result.scalar("n").and_then(Value::as_i64), Some(1));
}

#[tokio::test]
async fn partitioned_table_reports_partition_keys() {
    let store = MemoryStore::new();
    let spec = TableSpec {
        name: "fact_samples".into(),
        columns: vec![
            ColumnDef::new("id", ColumnType::Varchar),
            ColumnDef::new("sample_time", ColumnType::Timestamp),
            ColumnDef::new("ingested_at", ColumnType::Timestamp),
        ],
        engine: TableEngine::Replacing {
            version_column: "ingested_at".into(),
        },
        order_by: vec!["id".into()],
        partition: Some(PartitionSpec {
            column: "sample_time".into(),
            granularity: PartitionGranularity::Month,
        }),
    };
    execute(&store, Statement::CreateTable(&spec)).await.unwrap();

    let now = now_micros();
    let jan = chrono::DateTime::parse_from_rfc3339("2024-01-15T00:00:00Z").unwrap().to_utc();
    let feb = chrono::DateTime::parse_from_rfc3339("2024-02-15T00:00:00Z").unwrap().to_utc();
    let rows = vec![
        vec![Value::from("a"), Value::Timestamp(jan), Value::Timestamp(now)],
        vec![Value::from("b"), Value::Timestamp(feb), Value::Timestamp(now)],
    ];
    execute(&store, Statement::Insert { table: &spec, rows: &rows }).await.unwrap();

    let partitions = store.partitions("fact_samples").unwrap();
    assert_eq!(
        partitions.into_iter().collect::<Vec<_>>(),
        vec!["202401".to_string(), "202402".to_string()]
    );
}
