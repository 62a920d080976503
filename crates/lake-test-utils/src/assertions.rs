//! Custom assertion helpers for integration tests.

use lake_core::{Record, Value};

/// Sorted string values of `column` across `rows`.
///
/// # Panics
///
/// Panics if a row lacks the column or holds a non-string value.
pub fn sorted_strings(rows: &[Record], column: &str) -> Vec<String> {
    let mut values: Vec<String> = rows
        .iter()
        .map(|row| match row.get(column) {
            Some(Value::String(s)) => s.clone(),
            other => panic!("Expected string column {column}, got {other:?}"),
        })
        .collect();
    values.sort();
    values
}

/// Asserts that the current rows hold exactly `expected` keys in `column`.
///
/// # Panics
///
/// Panics if the key sets differ.
pub fn assert_current_keys(rows: &[Record], column: &str, expected: &[&str]) {
    let mut expected: Vec<String> = expected.iter().map(ToString::to_string).collect();
    expected.sort();
    assert_eq!(
        sorted_strings(rows, column),
        expected,
        "Unexpected current keys in column {column}"
    );
}

/// Asserts an entity history ends in a tombstone and returns it.
///
/// # Panics
///
/// Panics if the history is empty or its last row is not deleted.
pub fn assert_tombstoned(history: &[Record]) -> &Record {
    let last = history.last().expect("history should not be empty");
    assert_eq!(
        last.get("is_deleted"),
        Some(&Value::Bool(true)),
        "Expected the last history row to be a tombstone: {last:?}"
    );
    last
}

/// Integer values of `column` in row order; nulls become `None`.
///
/// # Panics
///
/// Panics if a row lacks the column.
pub fn int_column(rows: &[Record], column: &str) -> Vec<Option<i64>> {
    rows.iter()
        .map(|row| {
            row.get(column)
                .unwrap_or_else(|| panic!("Missing column {column} in {row:?}"))
                .as_i64()
        })
        .collect()
}
