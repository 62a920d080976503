//! GeoIP enrichment of gossip peer addresses.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lake_core::schema::{ColumnDef, DimensionSchema};
use lake_core::time::now_micros;
use lake_core::{ColumnType, ColumnarStore, Record, SurrogateKey, Value};
use lake_dataset::{DimensionType2Dataset, WriteConfig, WriteSummary};

use super::opt;
use super::solana::SolanaStore;
use crate::cache::TtlCache;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::sources::{GeoIpRecord, GeoIpResolver};
use crate::view::{RefreshOutcome, View};

const DOMAIN: &str = "geoip";

/// Resolved locations keyed by IP.
#[derive(Debug, Clone, Copy)]
pub struct GeoIpRecords;

impl DimensionSchema for GeoIpRecords {
    fn name(&self) -> &'static str {
        "geoip_records"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["ip"]
    }

    fn payload_columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::nullable("country_code", ColumnType::Varchar),
            ColumnDef::nullable("country", ColumnType::Varchar),
            ColumnDef::nullable("region", ColumnType::Varchar),
            ColumnDef::nullable("city", ColumnType::Varchar),
            ColumnDef::nullable("latitude", ColumnType::Double),
            ColumnDef::nullable("longitude", ColumnType::Double),
            ColumnDef::nullable("asn", ColumnType::BigInt),
            ColumnDef::nullable("org", ColumnType::Varchar),
        ]
    }
}

fn geoip_record(record: &GeoIpRecord) -> Record {
    Record::from([
        ("ip".to_string(), Value::String(record.ip.to_string())),
        ("country_code".to_string(), opt(record.country_code.clone())),
        ("country".to_string(), opt(record.country.clone())),
        ("region".to_string(), opt(record.region.clone())),
        ("city".to_string(), opt(record.city.clone())),
        ("latitude".to_string(), opt(record.latitude)),
        ("longitude".to_string(), opt(record.longitude)),
        ("asn".to_string(), opt(record.asn.map(i64::from))),
        ("org".to_string(), opt(record.org.clone())),
    ])
}

/// Datasets of the geoip domain.
#[derive(Debug)]
pub struct GeoIpStore {
    records: DimensionType2Dataset,
}

impl GeoIpStore {
    /// Creates the store.
    ///
    /// # Errors
    ///
    /// Returns a dataset error if the schema descriptor is invalid.
    pub fn new(store: Arc<dyn ColumnarStore>) -> Result<Self> {
        Ok(Self {
            records: DimensionType2Dataset::new(Arc::new(GeoIpRecords), store)
                .map_err(Error::dataset(DOMAIN))?,
        })
    }

    /// Writes records whose payload differs from the current row. Addresses
    /// not in `records` keep their current row.
    pub async fn upsert_changed(&self, records: &[GeoIpRecord], snapshot_ts: DateTime<Utc>) -> Result<WriteSummary> {
        let wrap = Error::dataset(DOMAIN);
        let rows: Vec<Record> = records.iter().map(geoip_record).collect();
        let ids = rows
            .iter()
            .map(|r| self.records.key_of(r))
            .collect::<lake_dataset::Result<Vec<SurrogateKey>>>()
            .map_err(&wrap)?;
        let current = self.records.get_current_rows(&ids).await.map_err(&wrap)?;

        let changed: Vec<&Record> = rows
            .iter()
            .zip(&ids)
            .filter(|(row, id)| {
                current.get(*id).is_none_or(|cur| {
                    row.iter()
                        .any(|(column, value)| cur.get(column).unwrap_or(&Value::Null) != value)
                })
            })
            .map(|(row, _)| row)
            .collect();

        self.records
            .write_batch(
                changed.len(),
                |i| Ok(changed[i].clone()),
                WriteConfig {
                    missing_means_deleted: false,
                    snapshot_ts: Some(snapshot_ts),
                },
            )
            .await
            .map_err(&wrap)
    }

    /// Current records.
    pub async fn current_records(&self) -> Result<Vec<Record>> {
        self.records
            .current_rows()
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// History of one address, oldest first.
    pub async fn history(&self, ip: IpAddr) -> Result<Vec<Record>> {
        let id = SurrogateKey::derive([ip.to_string()]).map_err(Error::Core)?;
        self.records.history(&id).await.map_err(Error::dataset(DOMAIN))
    }

    /// Creates the domain's table.
    pub async fn ensure_tables(&self) -> Result<()> {
        self.records.ensure_table().await.map_err(Error::dataset(DOMAIN))
    }
}

/// Resolves current gossip IPs and records their locations.
pub struct GeoIpView {
    resolver: Arc<dyn GeoIpResolver>,
    cache: TtlCache<IpAddr, Option<GeoIpRecord>>,
    solana: Arc<SolanaStore>,
    store: Arc<GeoIpStore>,
}

impl GeoIpView {
    /// Creates the view.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn GeoIpResolver>,
        solana: Arc<SolanaStore>,
        store: Arc<GeoIpStore>,
        cache: CacheConfig,
    ) -> Self {
        Self {
            resolver,
            cache: TtlCache::new(cache.ttl),
            solana,
            store,
        }
    }
}

#[async_trait]
impl View for GeoIpView {
    fn name(&self) -> &'static str {
        DOMAIN
    }

    async fn refresh(&mut self) -> Result<RefreshOutcome> {
        let mut outcome = RefreshOutcome::default();
        let ips = self.solana.current_gossip_ips().await?;

        let mut resolved = Vec::with_capacity(ips.len());
        for ip in ips {
            let resolver = Arc::clone(&self.resolver);
            match self
                .cache
                .get_or_try_insert_with(ip, || async move { resolver.resolve(ip).await })
                .await
            {
                Ok(Some(record)) => resolved.push(record),
                Ok(None) => tracing::debug!(%ip, "no geoip record"),
                Err(e) => {
                    tracing::warn!(%ip, error = %e, "geoip lookup failed");
                    metrics::record_enrichment_failure(DOMAIN, "resolve");
                    outcome.degrade(format!("geoip {ip}"));
                }
            }
        }
        self.cache.purge_expired().await;

        let summary = self.store.upsert_changed(&resolved, now_micros()).await?;
        outcome.add_rows(summary.upserted);
        tracing::info!(resolved = resolved.len(), written = summary.upserted, "geoip refreshed");
        Ok(outcome)
    }
}
