//! Link latency telemetry: circuits and round-trip samples with IPDV.
//!
//! IPDV (inter-packet delay variation) is the absolute RTT change between
//! consecutive non-lost samples of a circuit within one epoch. Lost probes
//! (`rtt_us = 0`) are stored with a null IPDV and do not move the reference.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lake_core::schema::{ColumnDef, DimensionSchema, FactSchema, PartitionGranularity};
use lake_core::time::now_micros;
use lake_core::{ColumnType, ColumnarStore, Record, Value};
use lake_dataset::{DimensionType2Dataset, FactDataset, Filter, WriteConfig, WriteSummary};

use super::{int, opt, uint};
use crate::delta::{DeltaPolicy, DeltaTracker, Observation};
use crate::error::{Error, Result};
use crate::sources::{Circuit, LatencySample, LatencySource};
use crate::view::{RefreshOutcome, View};

const DOMAIN: &str = "latency";

/// RTT moves both ways and is not comparable across epochs.
pub const IPDV_POLICY: DeltaPolicy = DeltaPolicy {
    monotonic: false,
    resets_per_period: true,
};

/// Monitored circuits keyed by code.
#[derive(Debug, Clone, Copy)]
pub struct LinkCircuits;

impl DimensionSchema for LinkCircuits {
    fn name(&self) -> &'static str {
        "link_circuits"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["code"]
    }

    fn payload_columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("origin", ColumnType::Varchar),
            ColumnDef::new("target", ColumnType::Varchar),
            ColumnDef::new("link_type", ColumnType::Varchar),
        ]
    }
}

/// Round-trip samples per circuit and epoch.
#[derive(Debug, Clone, Copy)]
pub struct LatencySamples;

impl FactSchema for LatencySamples {
    fn name(&self) -> &'static str {
        "link_latency_samples"
    }

    fn unique_key_columns(&self) -> &'static [&'static str] {
        &["circuit", "epoch", "sample_index"]
    }

    fn columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("circuit", ColumnType::Varchar),
            ColumnDef::new("epoch", ColumnType::BigInt),
            ColumnDef::new("sample_index", ColumnType::BigInt),
            ColumnDef::new("sample_time", ColumnType::Timestamp),
            ColumnDef::new("rtt_us", ColumnType::BigInt),
            ColumnDef::nullable("ipdv_us", ColumnType::BigInt),
            ColumnDef::new("loss", ColumnType::Boolean),
        ]
    }

    fn time_column(&self) -> Option<&'static str> {
        Some("sample_time")
    }

    fn partition(&self) -> Option<PartitionGranularity> {
        Some(PartitionGranularity::Month)
    }
}

/// A sample ready to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRow {
    /// Telemetry epoch.
    pub epoch: u64,
    /// The raw sample.
    pub sample: LatencySample,
    /// RTT change since the previous non-lost sample.
    pub ipdv_us: Option<i64>,
}

/// Continuation point for one circuit in one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoredCursor {
    /// Next sample index to fetch.
    pub next_index: u64,
    /// RTT of the last stored non-lost sample.
    pub last_rtt_us: Option<i64>,
}

/// Computes IPDV for `samples` of one circuit, continuing from `tracker`.
pub fn compute_ipdv(
    tracker: &mut DeltaTracker<(String, u64)>,
    circuit: &str,
    epoch: u64,
    samples: &[LatencySample],
) -> Vec<SampleRow> {
    samples
        .iter()
        .map(|sample| {
            let ipdv_us = if sample.is_loss() {
                None
            } else {
                let observation = Observation::new(epoch, i64::from(sample.rtt_us));
                tracker.observe((circuit.to_string(), epoch), observation)
            };
            SampleRow {
                epoch,
                sample: *sample,
                ipdv_us,
            }
        })
        .collect()
}

/// Datasets of the latency domain.
#[derive(Debug)]
pub struct LatencyStore {
    circuits: DimensionType2Dataset,
    samples: FactDataset,
}

impl LatencyStore {
    /// Creates the store.
    ///
    /// # Errors
    ///
    /// Returns a dataset error if a schema descriptor is invalid.
    pub fn new(store: Arc<dyn ColumnarStore>) -> Result<Self> {
        let wrap = Error::dataset(DOMAIN);
        Ok(Self {
            circuits: DimensionType2Dataset::new(Arc::new(LinkCircuits), Arc::clone(&store))
                .map_err(&wrap)?,
            samples: FactDataset::new(Arc::new(LatencySamples), store).map_err(&wrap)?,
        })
    }

    /// Replaces the circuit set.
    pub async fn replace_circuits(&self, circuits: &[Circuit], snapshot_ts: DateTime<Utc>) -> Result<WriteSummary> {
        self.circuits
            .write_batch(
                circuits.len(),
                |i| {
                    let c = &circuits[i];
                    Ok(Record::from([
                        ("code".to_string(), Value::from(c.code.as_str())),
                        ("origin".to_string(), Value::from(c.origin.as_str())),
                        ("target".to_string(), Value::from(c.target.as_str())),
                        ("link_type".to_string(), Value::from(c.link_type.as_str())),
                    ]))
                },
                WriteConfig::full_snapshot().at(snapshot_ts),
            )
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Current circuits.
    pub async fn current_circuits(&self) -> Result<Vec<Record>> {
        self.circuits
            .current_rows()
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Appends samples of one circuit.
    pub async fn append_samples(&self, circuit: &str, rows: &[SampleRow]) -> Result<usize> {
        let summary = self
            .samples
            .write_batch(rows.len(), |i| {
                let row = &rows[i];
                Ok(Record::from([
                    ("circuit".to_string(), Value::from(circuit)),
                    ("epoch".to_string(), int(row.epoch)),
                    ("sample_index".to_string(), int(row.sample.index)),
                    ("sample_time".to_string(), Value::Timestamp(row.sample.time)),
                    ("rtt_us".to_string(), Value::Int64(i64::from(row.sample.rtt_us))),
                    ("ipdv_us".to_string(), opt(row.ipdv_us)),
                    ("loss".to_string(), Value::Bool(row.sample.is_loss())),
                ]))
            })
            .await
            .map_err(Error::dataset(DOMAIN))?;
        Ok(summary.written)
    }

    /// Continuation point derived from stored samples; `None` if the circuit
    /// has nothing stored for `epoch`.
    pub async fn stored_cursor(&self, circuit: &str, epoch: u64) -> Result<Option<StoredCursor>> {
        let scope = [Filter::eq("circuit", circuit), Filter::eq("epoch", int(epoch))];
        let max_index = self
            .samples
            .max_value("sample_index", &scope)
            .await
            .map_err(Error::dataset(DOMAIN))?;
        let Some(max_index) = max_index.as_ref().and_then(uint) else {
            return Ok(None);
        };

        let mut reference_scope = scope.to_vec();
        reference_scope.push(Filter::gt("rtt_us", 0_i64));
        let last = self
            .samples
            .latest_per_group(&["circuit"], "sample_index", &reference_scope)
            .await
            .map_err(Error::dataset(DOMAIN))?;
        let last_rtt_us = last
            .first()
            .and_then(|row| row.get("rtt_us"))
            .and_then(Value::as_i64);

        Ok(Some(StoredCursor {
            next_index: max_index + 1,
            last_rtt_us,
        }))
    }

    /// Highest epoch with stored samples for a circuit.
    pub async fn latest_epoch(&self, circuit: &str) -> Result<Option<u64>> {
        let latest = self
            .samples
            .max_value("epoch", &[Filter::eq("circuit", circuit)])
            .await
            .map_err(Error::dataset(DOMAIN))?;
        Ok(latest.as_ref().and_then(uint))
    }

    /// Stored samples of one circuit in one epoch, by index.
    pub async fn samples(&self, circuit: &str, epoch: u64) -> Result<Vec<Record>> {
        let mut rows = self
            .samples
            .latest_rows(&[Filter::eq("circuit", circuit), Filter::eq("epoch", int(epoch))])
            .await
            .map_err(Error::dataset(DOMAIN))?;
        rows.sort_by_key(|r| r.get("sample_index").and_then(Value::as_i64));
        Ok(rows)
    }

    /// Creates the domain's tables.
    pub async fn ensure_tables(&self) -> Result<()> {
        let wrap = Error::dataset(DOMAIN);
        self.circuits.ensure_table().await.map_err(&wrap)?;
        self.samples.ensure_table().await.map_err(&wrap)
    }
}

/// Pulls new samples for every circuit.
///
/// When the epoch rolls over, each circuit's previous epoch stays pending
/// until one more fetch of it succeeds, so samples published after the last
/// poll of that epoch are still stored. After a restart the previous epoch is
/// the highest one stored for the circuit.
pub struct LatencyView {
    source: Arc<dyn LatencySource>,
    store: Arc<LatencyStore>,
    cursors: HashMap<(String, u64), u64>,
    ipdv: DeltaTracker<(String, u64)>,
    last_epoch: HashMap<String, u64>,
    pending: HashMap<String, BTreeSet<u64>>,
}

impl LatencyView {
    /// Creates the view.
    #[must_use]
    pub fn new(source: Arc<dyn LatencySource>, store: Arc<LatencyStore>) -> Self {
        Self {
            source,
            store,
            cursors: HashMap::new(),
            ipdv: DeltaTracker::new(IPDV_POLICY),
            last_epoch: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Next sample index to fetch for a circuit, if tracked.
    #[must_use]
    pub fn cursor(&self, circuit: &str, epoch: u64) -> Option<u64> {
        self.cursors.get(&(circuit.to_string(), epoch)).copied()
    }

    /// Earlier epochs of a circuit still waiting for their final fetch.
    #[must_use]
    pub fn pending_epochs(&self, circuit: &str) -> Vec<u64> {
        self.pending
            .get(circuit)
            .map(|epochs| epochs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Records that `circuit` is now polled at `epoch`, queueing the epoch
    /// it was polled at before.
    async fn advance_epoch(&mut self, circuit: &str, epoch: u64) -> Result<()> {
        let previous = match self.last_epoch.get(circuit) {
            Some(previous) => Some(*previous),
            None => self.store.latest_epoch(circuit).await?,
        };
        if let Some(previous) = previous.filter(|p| *p < epoch) {
            tracing::debug!(circuit, previous, epoch, "epoch rolled over");
            self.pending.entry(circuit.to_string()).or_default().insert(previous);
        }
        self.last_epoch.insert(circuit.to_string(), epoch);
        Ok(())
    }

    fn finish_epoch(&mut self, circuit: &str, epoch: u64) {
        let key = (circuit.to_string(), epoch);
        self.cursors.remove(&key);
        self.ipdv.forget(&key);
        if let Some(epochs) = self.pending.get_mut(circuit) {
            epochs.remove(&epoch);
            if epochs.is_empty() {
                self.pending.remove(circuit);
            }
        }
    }

    async fn next_index(&mut self, circuit: &str, epoch: u64) -> Result<u64> {
        let key = (circuit.to_string(), epoch);
        if let Some(next) = self.cursors.get(&key) {
            return Ok(*next);
        }
        let stored = self.store.stored_cursor(circuit, epoch).await?.unwrap_or_default();
        if let Some(rtt) = stored.last_rtt_us {
            self.ipdv.seed(key.clone(), Observation::new(epoch, rtt));
        }
        tracing::debug!(circuit, epoch, next_index = stored.next_index, "cursor derived from store");
        self.cursors.insert(key, stored.next_index);
        Ok(stored.next_index)
    }

    /// Fetches and stores new samples for one circuit. Source failures are
    /// returned as `Ok(Err(..))` so the caller can skip the circuit.
    async fn sync_circuit(&mut self, circuit: &str, epoch: u64) -> Result<std::result::Result<usize, Error>> {
        let from_index = self.next_index(circuit, epoch).await?;
        let mut samples = match self.source.fetch_samples(circuit, epoch, from_index).await {
            Ok(samples) => samples,
            Err(e) => return Ok(Err(e)),
        };
        samples.retain(|s| s.index >= from_index);
        samples.sort_by_key(|s| s.index);
        samples.dedup_by_key(|s| s.index);
        let Some(last) = samples.last() else {
            return Ok(Ok(0));
        };
        let next_index = last.index + 1;

        // Only this circuit's reference is committed, and only after the write.
        let key = (circuit.to_string(), epoch);
        let mut scratch = DeltaTracker::new(IPDV_POLICY);
        if let Some(reference) = self.ipdv.last(&key) {
            scratch.seed(key.clone(), reference);
        }
        let rows = compute_ipdv(&mut scratch, circuit, epoch, &samples);
        let written = self.store.append_samples(circuit, &rows).await?;
        if let Some(reference) = scratch.last(&key) {
            self.ipdv.seed(key.clone(), reference);
        }
        self.cursors.insert(key, next_index);
        Ok(Ok(written))
    }
}

#[async_trait]
impl View for LatencyView {
    fn name(&self) -> &'static str {
        DOMAIN
    }

    async fn refresh(&mut self) -> Result<RefreshOutcome> {
        let mut outcome = RefreshOutcome::default();
        let epoch = self.source.current_epoch().await?;
        let circuits = self.source.list_circuits().await?;

        let replaced = self.store.replace_circuits(&circuits, now_micros()).await?;
        outcome.add_rows(replaced.upserted + replaced.tombstoned);

        for circuit in &circuits {
            self.advance_epoch(&circuit.code, epoch).await?;
        }

        // Drain earlier epochs first, including those of circuits no longer listed.
        let mut draining: Vec<(String, u64)> = self
            .pending
            .iter()
            .flat_map(|(code, epochs)| epochs.iter().map(move |e| (code.clone(), *e)))
            .collect();
        draining.sort();
        for (code, e) in draining {
            match self.sync_circuit(&code, e).await? {
                Ok(rows) => {
                    outcome.add_rows(rows);
                    self.finish_epoch(&code, e);
                }
                Err(err) => {
                    tracing::warn!(circuit = %code, epoch = e, error = %err, "epoch tail not drained");
                    outcome.stopped_early(format!("circuit {code} epoch {e}: {err}"));
                }
            }
        }

        for circuit in &circuits {
            match self.sync_circuit(&circuit.code, epoch).await? {
                Ok(rows) => outcome.add_rows(rows),
                Err(err) => {
                    tracing::warn!(circuit = %circuit.code, epoch, error = %err, "circuit skipped");
                    outcome.stopped_early(format!("circuit {} epoch {epoch}: {err}", circuit.code));
                }
            }
        }

        tracing::info!(epoch, circuits = circuits.len(), rows = outcome.rows_written, "latency refreshed");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(index: u64, rtt_us: u32) -> LatencySample {
        LatencySample {
            index,
            time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(i64::try_from(index).unwrap()),
            rtt_us,
        }
    }

    #[test]
    fn loss_samples_do_not_move_the_reference() {
        let mut tracker = DeltaTracker::new(IPDV_POLICY);
        let rows = compute_ipdv(
            &mut tracker,
            "c1",
            7,
            &[sample(0, 100), sample(1, 0), sample(2, 130), sample(3, 120)],
        );
        let ipdv: Vec<_> = rows.iter().map(|r| r.ipdv_us).collect();
        assert_eq!(ipdv, vec![None, None, Some(30), Some(10)]);
    }

    #[test]
    fn epochs_are_tracked_independently() {
        let mut tracker = DeltaTracker::new(IPDV_POLICY);
        compute_ipdv(&mut tracker, "c1", 7, &[sample(0, 100)]);
        let next = compute_ipdv(&mut tracker, "c1", 8, &[sample(0, 150)]);
        assert_eq!(next[0].ipdv_us, None);
        let tail = compute_ipdv(&mut tracker, "c1", 7, &[sample(1, 90)]);
        assert_eq!(tail[0].ipdv_us, Some(10));
    }
}
