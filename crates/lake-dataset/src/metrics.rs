//! Dataset metrics.
//!
//! Write-path counters and latency for dimension and fact datasets. These
//! complement the structured logging in the dataset spans.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Write batches by outcome.
pub const WRITES_TOTAL: &str = "lake_dataset_writes_total";

/// Rows appended (including tombstones).
pub const ROWS_WRITTEN: &str = "lake_dataset_rows_written_total";

/// Tombstones inferred by missing-means-deleted.
pub const TOMBSTONES: &str = "lake_dataset_tombstones_total";

/// Write batch duration histogram.
pub const WRITE_DURATION: &str = "lake_dataset_write_duration_seconds";

/// Registers all dataset metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(WRITES_TOTAL, "Total dataset write batches by status");
    describe_counter!(ROWS_WRITTEN, "Total rows appended to dataset tables");
    describe_counter!(TOMBSTONES, "Total tombstone rows written for vanished entities");
    describe_histogram!(WRITE_DURATION, "Duration of dataset write batches in seconds");
}

/// Records a completed or failed write batch.
pub fn record_write(table: &str, kind: &'static str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };
    counter!(
        WRITES_TOTAL,
        "table" => table.to_string(),
        "kind" => kind,
        "status" => status
    )
    .increment(1);
    histogram!(WRITE_DURATION, "table" => table.to_string(), "kind" => kind).record(duration_secs);
}

/// Records rows appended by a successful write.
pub fn record_rows(table: &str, kind: &'static str, rows: usize, tombstones: usize) {
    counter!(ROWS_WRITTEN, "table" => table.to_string(), "kind" => kind).increment(rows as u64);
    if tombstones > 0 {
        counter!(TOMBSTONES, "table" => table.to_string()).increment(tombstones as u64);
    }
}
