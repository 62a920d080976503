//! Revenue distribution: program configuration, per-epoch distributions and
//! per-validator debts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lake_core::schema::{ColumnDef, DimensionSchema, FactSchema};
use lake_core::time::now_micros;
use lake_core::{ColumnType, ColumnarStore, Record, Value};
use lake_dataset::{DimensionType2Dataset, FactDataset, Filter, WriteConfig, WriteSummary};

use super::{int, opt, uint};
use crate::backfill::EpochBackfill;
use crate::error::{Error, Result};
use crate::metrics;
use crate::sources::{EpochDistribution, PriceOracle, ProgramConfig, RevenueSource, SolanaRpc};
use crate::view::{RefreshOutcome, View};

const DOMAIN: &str = "revenue";

/// Program configuration; one current row.
#[derive(Debug, Clone, Copy)]
pub struct ProgramConfigs;

impl DimensionSchema for ProgramConfigs {
    fn name(&self) -> &'static str {
        "revenue_program_config"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["program_id"]
    }

    fn payload_columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("admin", ColumnType::Varchar),
            ColumnDef::new("validator_fee_bps", ColumnType::BigInt),
            ColumnDef::new("effective_epoch", ColumnType::BigInt),
        ]
    }
}

/// One row per distributed epoch.
#[derive(Debug, Clone, Copy)]
pub struct Distributions;

impl FactSchema for Distributions {
    fn name(&self) -> &'static str {
        "revenue_distributions"
    }

    fn unique_key_columns(&self) -> &'static [&'static str] {
        &["epoch"]
    }

    fn columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("epoch", ColumnType::BigInt),
            ColumnDef::new("total_revenue_lamports", ColumnType::BigInt),
            ColumnDef::new("total_debt_lamports", ColumnType::BigInt),
            ColumnDef::new("validator_count", ColumnType::BigInt),
            ColumnDef::nullable("sol_usd_price", ColumnType::Double),
        ]
    }
}

/// One row per validator per distributed epoch.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorDebts;

impl FactSchema for ValidatorDebts {
    fn name(&self) -> &'static str {
        "revenue_validator_debts"
    }

    fn unique_key_columns(&self) -> &'static [&'static str] {
        &["epoch", "node_pubkey"]
    }

    fn columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("epoch", ColumnType::BigInt),
            ColumnDef::new("node_pubkey", ColumnType::Varchar),
            ColumnDef::new("debt_lamports", ColumnType::BigInt),
            ColumnDef::new("paid_lamports", ColumnType::BigInt),
        ]
    }
}

fn config_record(config: &ProgramConfig) -> Record {
    Record::from([
        ("program_id".to_string(), Value::from(config.program_id.as_str())),
        ("admin".to_string(), Value::from(config.admin.as_str())),
        ("validator_fee_bps".to_string(), Value::Int64(i64::from(config.validator_fee_bps))),
        ("effective_epoch".to_string(), int(config.effective_epoch)),
    ])
}

/// Datasets of the revenue domain.
#[derive(Debug)]
pub struct RevenueStore {
    program_config: DimensionType2Dataset,
    distributions: FactDataset,
    debts: FactDataset,
}

impl RevenueStore {
    /// Creates the store.
    ///
    /// # Errors
    ///
    /// Returns a dataset error if a schema descriptor is invalid.
    pub fn new(store: Arc<dyn ColumnarStore>) -> Result<Self> {
        let wrap = Error::dataset(DOMAIN);
        Ok(Self {
            program_config: DimensionType2Dataset::new(Arc::new(ProgramConfigs), Arc::clone(&store))
                .map_err(&wrap)?,
            distributions: FactDataset::new(Arc::new(Distributions), Arc::clone(&store))
                .map_err(&wrap)?,
            debts: FactDataset::new(Arc::new(ValidatorDebts), store).map_err(&wrap)?,
        })
    }

    /// Records the current program configuration, replacing any other.
    pub async fn write_program_config(
        &self,
        config: &ProgramConfig,
        snapshot_ts: DateTime<Utc>,
    ) -> Result<WriteSummary> {
        self.program_config
            .write_batch(
                1,
                |_| Ok(config_record(config)),
                WriteConfig::full_snapshot().at(snapshot_ts),
            )
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Current program configuration rows.
    pub async fn current_program_config(&self) -> Result<Vec<Record>> {
        self.program_config
            .current_rows()
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Writes one epoch: validator debts first, then the distribution row.
    ///
    /// The distribution row marks the epoch as stored, so a failure between
    /// the two writes leaves the epoch to be fetched again.
    pub async fn write_epoch(&self, distribution: &EpochDistribution, sol_usd_price: Option<f64>) -> Result<usize> {
        let epoch = int(distribution.epoch);
        let validators = &distribution.validators;
        let debts = self
            .debts
            .write_batch(validators.len(), |i| {
                let v = &validators[i];
                Ok(Record::from([
                    ("epoch".to_string(), epoch.clone()),
                    ("node_pubkey".to_string(), Value::from(v.node_pubkey.as_str())),
                    ("debt_lamports".to_string(), int(v.debt_lamports)),
                    ("paid_lamports".to_string(), int(v.paid_lamports)),
                ]))
            })
            .await
            .map_err(Error::dataset(DOMAIN))?;

        let row = Record::from([
            ("epoch".to_string(), epoch.clone()),
            ("total_revenue_lamports".to_string(), int(distribution.total_revenue_lamports)),
            ("total_debt_lamports".to_string(), int(distribution.total_debt_lamports)),
            ("validator_count".to_string(), int(u64::try_from(validators.len()).unwrap_or(u64::MAX))),
            ("sol_usd_price".to_string(), opt(sol_usd_price)),
        ]);
        let summary = self
            .distributions
            .write_batch(1, |_| Ok(row.clone()))
            .await
            .map_err(Error::dataset(DOMAIN))?;
        Ok(debts.written + summary.written)
    }

    /// Highest stored epoch.
    pub async fn last_stored_epoch(&self) -> Result<Option<u64>> {
        let max = self
            .distributions
            .max_value("epoch", &[])
            .await
            .map_err(Error::dataset(DOMAIN))?;
        Ok(max.as_ref().and_then(uint))
    }

    /// Oldest and newest stored epochs.
    pub async fn epoch_bounds(&self) -> Result<Option<(u64, u64)>> {
        let bounds = self
            .distributions
            .value_bounds("epoch", &[])
            .await
            .map_err(Error::dataset(DOMAIN))?;
        Ok(bounds.and_then(|(lo, hi)| Some((uint(&lo)?, uint(&hi)?))))
    }

    /// Stored distribution for `epoch`.
    pub async fn distribution(&self, epoch: u64) -> Result<Option<Record>> {
        let rows = self
            .distributions
            .latest_rows(&[Filter::eq("epoch", int(epoch))])
            .await
            .map_err(Error::dataset(DOMAIN))?;
        Ok(rows.into_iter().next())
    }

    /// Stored validator debts for `epoch`.
    pub async fn debts(&self, epoch: u64) -> Result<Vec<Record>> {
        self.debts
            .latest_rows(&[Filter::eq("epoch", int(epoch))])
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Creates the domain's tables.
    pub async fn ensure_tables(&self) -> Result<()> {
        let wrap = Error::dataset(DOMAIN);
        self.program_config.ensure_table().await.map_err(&wrap)?;
        self.distributions.ensure_table().await.map_err(&wrap)?;
        self.debts.ensure_table().await.map_err(&wrap)
    }
}

async fn latest_completed_epoch(rpc: &dyn SolanaRpc) -> Result<Option<u64>> {
    Ok(rpc.epoch_info().await?.epoch.checked_sub(1))
}

/// Walks newly completed epochs and records their distributions.
pub struct RevenueView {
    source: Arc<dyn RevenueSource>,
    rpc: Arc<dyn SolanaRpc>,
    oracle: Option<Arc<dyn PriceOracle>>,
    store: Arc<RevenueStore>,
    last_fetched_epoch: Option<u64>,
}

impl RevenueView {
    /// Creates the view.
    #[must_use]
    pub fn new(
        source: Arc<dyn RevenueSource>,
        rpc: Arc<dyn SolanaRpc>,
        oracle: Option<Arc<dyn PriceOracle>>,
        store: Arc<RevenueStore>,
    ) -> Self {
        Self {
            source,
            rpc,
            oracle,
            store,
            last_fetched_epoch: None,
        }
    }

    /// Last epoch this view wrote, if known.
    #[must_use]
    pub fn last_fetched_epoch(&self) -> Option<u64> {
        self.last_fetched_epoch
    }

    async fn price(&self, outcome: &mut RefreshOutcome) -> Option<f64> {
        let oracle = self.oracle.as_ref()?;
        match oracle.sol_usd_price().await {
            Ok(price) => Some(price),
            Err(e) => {
                tracing::warn!(error = %e, "sol price lookup failed; writing without price");
                metrics::record_enrichment_failure(DOMAIN, "sol_usd_price");
                outcome.degrade("sol_usd_price");
                None
            }
        }
    }
}

#[async_trait]
impl View for RevenueView {
    fn name(&self) -> &'static str {
        DOMAIN
    }

    async fn refresh(&mut self) -> Result<RefreshOutcome> {
        let mut outcome = RefreshOutcome::default();

        let config = self.source.fetch_program_config().await?;
        let written = self.store.write_program_config(&config, now_micros()).await?;
        outcome.add_rows(written.upserted + written.tombstoned);

        let Some(latest) = latest_completed_epoch(self.rpc.as_ref()).await? else {
            return Ok(outcome);
        };
        if self.last_fetched_epoch.is_none() {
            self.last_fetched_epoch = self.store.last_stored_epoch().await?;
        }
        let start = self.last_fetched_epoch.map_or(latest, |e| e + 1);

        let mut price = None;
        for epoch in start..=latest {
            let distribution = match self.source.fetch_distribution(epoch).await {
                Ok(Some(d)) => d,
                Ok(None) => {
                    tracing::info!(epoch, "distribution not published yet");
                    outcome.stopped_early(format!("epoch {epoch}: distribution not published"));
                    break;
                }
                Err(e) => {
                    tracing::warn!(epoch, error = %e, "distribution fetch failed; retrying next refresh");
                    outcome.stopped_early(format!("epoch {epoch}: {e}"));
                    break;
                }
            };
            if price.is_none() {
                price = Some(self.price(&mut outcome).await);
            }
            let rows = self.store.write_epoch(&distribution, price.flatten()).await?;
            outcome.add_rows(rows);
            self.last_fetched_epoch = Some(epoch);
            tracing::debug!(epoch, rows, "distribution recorded");
        }

        Ok(outcome)
    }
}

/// Backfills distributions for epochs the view never wrote.
///
/// Historical rows carry no SOL price.
pub struct RevenueBackfill {
    source: Arc<dyn RevenueSource>,
    rpc: Arc<dyn SolanaRpc>,
    store: Arc<RevenueStore>,
}

impl RevenueBackfill {
    /// Creates the backfill.
    #[must_use]
    pub fn new(source: Arc<dyn RevenueSource>, rpc: Arc<dyn SolanaRpc>, store: Arc<RevenueStore>) -> Self {
        Self { source, rpc, store }
    }
}

#[async_trait]
impl EpochBackfill for RevenueBackfill {
    type Unit = EpochDistribution;

    fn domain(&self) -> &'static str {
        DOMAIN
    }

    async fn latest_completed_epoch(&self) -> Result<u64> {
        latest_completed_epoch(self.rpc.as_ref())
            .await?
            .ok_or_else(|| Error::upstream("solana-rpc", "no completed epoch yet"))
    }

    async fn stored_epoch_bounds(&self) -> Result<Option<(u64, u64)>> {
        self.store.epoch_bounds().await
    }

    async fn fetch_epoch(&self, epoch: u64) -> Result<EpochDistribution> {
        self.source
            .fetch_distribution(epoch)
            .await?
            .ok_or_else(|| Error::upstream("revenue", format!("no distribution for epoch {epoch}")))
    }

    async fn write_epoch(&self, _epoch: u64, unit: EpochDistribution) -> Result<usize> {
        self.store.write_epoch(&unit, None).await
    }
}
