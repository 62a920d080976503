//! Arrow encoding/decoding helpers for the embedded store.
//!
//! Rows travel as [`Value`] vectors; the embedded backend keeps them as
//! Arrow record batches so DataFusion can query them directly. The physical
//! types here are the contract documented in [`crate::value`].

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Int32Array, Int64Array, LargeStringArray, StringArray,
    StringViewArray, TimestampMicrosecondArray, UInt8Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::error::{Error, Result};
use crate::schema::TableSpec;
use crate::store::Rows;
use crate::time::from_micros;
use crate::value::{ColumnType, Value};

/// Timezone attached to every timestamp column.
pub const UTC: &str = "UTC";

/// Arrow data type for a column type.
#[must_use]
pub fn data_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::Varchar => DataType::Utf8,
        ColumnType::BigInt => DataType::Int64,
        ColumnType::Integer => DataType::Int32,
        ColumnType::Double => DataType::Float64,
        ColumnType::Boolean => DataType::UInt8,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
    }
}

/// Arrow schema for a table spec.
#[must_use]
pub fn table_schema(spec: &TableSpec) -> SchemaRef {
    Arc::new(Schema::new(
        spec.columns
            .iter()
            .map(|c| Field::new(c.name.as_str(), data_type(c.ty), c.nullable))
            .collect::<Vec<_>>(),
    ))
}

fn type_mismatch(table: &str, column: &str, ty: ColumnType, value: &Value) -> Error {
    Error::InvalidInput(format!(
        "{table}.{column}: value {value:?} does not fit column type {ty}"
    ))
}

/// Builds a record batch from rows in physical column order.
///
/// # Errors
///
/// Returns an error if a row has the wrong width, a value does not match its
/// column type, or a non-nullable column receives NULL.
pub fn rows_to_batch(spec: &TableSpec, rows: &[Vec<Value>]) -> Result<RecordBatch> {
    let schema = table_schema(spec);
    let width = spec.columns.len();
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(Error::InvalidInput(format!(
            "{}: row has {} values, expected {width}",
            spec.name,
            bad.len()
        )));
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(width);
    for (idx, column) in spec.columns.iter().enumerate() {
        let values = rows.iter().map(|r| &r[idx]);
        if !column.nullable && rows.iter().any(|r| r[idx].is_null()) {
            return Err(Error::InvalidInput(format!(
                "{}.{}: NULL in non-nullable column",
                spec.name, column.name
            )));
        }
        let mismatch = |v: &Value| type_mismatch(&spec.name, &column.name, column.ty, v);

        let array: ArrayRef = match column.ty {
            ColumnType::Varchar => Arc::new(StringArray::from(
                values
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::String(s) => Ok(Some(s.as_str())),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            ColumnType::BigInt => Arc::new(Int64Array::from(
                values
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        other => other.as_i64().map(Some).ok_or_else(|| mismatch(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            ColumnType::Integer => Arc::new(Int32Array::from(
                values
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Int32(i) => Ok(Some(*i)),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            ColumnType::Double => Arc::new(Float64Array::from(
                values
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        other => other.as_f64().map(Some).ok_or_else(|| mismatch(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            ColumnType::Boolean => Arc::new(UInt8Array::from(
                values
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Bool(b) => Ok(Some(u8::from(*b))),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            ColumnType::Timestamp => Arc::new(
                TimestampMicrosecondArray::from(
                    values
                        .map(|v| match v {
                            Value::Null => Ok(None),
                            Value::Timestamp(ts) => Ok(Some(ts.timestamp_micros())),
                            other => Err(mismatch(other)),
                        })
                        .collect::<Result<Vec<_>>>()?,
                )
                .with_timezone(UTC),
            ),
        };
        arrays.push(array);
    }

    RecordBatch::try_new(schema, arrays).map_err(|e| {
        Error::store_with_source(format!("record batch build failed for {}", spec.name), e)
    })
}

/// Decodes record batches into rows.
///
/// # Errors
///
/// Returns an error if a column has an Arrow type outside the vocabulary.
pub fn batches_to_rows(schema: &Schema, batches: &[RecordBatch]) -> Result<Rows> {
    let columns: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
    let mut rows = Vec::new();
    for batch in batches {
        let decoded: Vec<Vec<Value>> = batch
            .columns()
            .iter()
            .map(|array| decode_array(array.as_ref()))
            .collect::<Result<_>>()?;
        for row_idx in 0..batch.num_rows() {
            rows.push(decoded.iter().map(|col| col[row_idx].clone()).collect());
        }
    }
    Ok(Rows { columns, rows })
}

fn downcast<'a, T: 'static>(array: &'a dyn Array) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| Error::Internal {
        message: format!("unexpected array layout for {}", array.data_type()),
    })
}

fn collect<T, F>(array: &dyn Array, len: usize, f: F) -> Vec<Value>
where
    F: Fn(usize) -> T,
    T: Into<Value>,
{
    (0..len)
        .map(|i| if array.is_null(i) { Value::Null } else { f(i).into() })
        .collect()
}

#[allow(clippy::cast_possible_wrap)]
fn decode_array(array: &dyn Array) -> Result<Vec<Value>> {
    let len = array.len();
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; len],
        DataType::Utf8 => {
            let a = downcast::<StringArray>(array)?;
            collect(array, len, |i| a.value(i).to_string())
        }
        DataType::LargeUtf8 => {
            let a = downcast::<LargeStringArray>(array)?;
            collect(array, len, |i| a.value(i).to_string())
        }
        DataType::Utf8View => {
            let a = downcast::<StringViewArray>(array)?;
            collect(array, len, |i| a.value(i).to_string())
        }
        DataType::Int64 => {
            let a = downcast::<Int64Array>(array)?;
            collect(array, len, |i| a.value(i))
        }
        DataType::Int32 => {
            let a = downcast::<Int32Array>(array)?;
            collect(array, len, |i| a.value(i))
        }
        DataType::UInt64 => {
            let a = downcast::<UInt64Array>(array)?;
            collect(array, len, |i| a.value(i) as i64)
        }
        DataType::UInt32 => {
            let a = downcast::<UInt32Array>(array)?;
            collect(array, len, |i| i64::from(a.value(i)))
        }
        DataType::Float64 => {
            let a = downcast::<Float64Array>(array)?;
            collect(array, len, |i| a.value(i))
        }
        DataType::UInt8 => {
            let a = downcast::<UInt8Array>(array)?;
            collect(array, len, |i| a.value(i) != 0)
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let a = downcast::<TimestampMicrosecondArray>(array)?;
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Ok(Value::Null)
                    } else {
                        from_micros(a.value(i)).map(Value::Timestamp).ok_or_else(|| {
                            Error::serialization(format!("timestamp out of range: {}", a.value(i)))
                        })
                    }
                })
                .collect::<Result<_>>()?
        }
        other => {
            return Err(Error::serialization(format!(
                "unsupported result column type {other}"
            )));
        }
    };
    Ok(values)
}
