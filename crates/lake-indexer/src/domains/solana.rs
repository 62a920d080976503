//! Solana cluster state: gossip peers, vote accounts, and vote activity.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lake_core::schema::{ColumnDef, DimensionSchema, FactSchema, PartitionGranularity};
use lake_core::time::now_micros;
use lake_core::{ColumnType, ColumnarStore, Record, SurrogateKey, Value};
use lake_dataset::{DimensionType2Dataset, FactDataset, Filter, WriteConfig, WriteSummary};

use super::{int, opt};
use crate::delta::{DeltaPolicy, DeltaTracker, Observation};
use crate::error::{Error, Result};
use crate::sources::{ClusterNode, SolanaRpc, VoteAccount};
use crate::view::{RefreshOutcome, View};

const DOMAIN: &str = "solana";

/// Vote credits grow within an epoch and restart at each boundary.
pub const CREDITS_POLICY: DeltaPolicy = DeltaPolicy {
    monotonic: true,
    resets_per_period: true,
};

/// Gossip peers keyed by identity.
#[derive(Debug, Clone, Copy)]
pub struct GossipNodes;

impl DimensionSchema for GossipNodes {
    fn name(&self) -> &'static str {
        "gossip_nodes"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["pubkey"]
    }

    fn payload_columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::nullable("gossip_ip", ColumnType::Varchar),
            ColumnDef::nullable("gossip_port", ColumnType::Integer),
            ColumnDef::nullable("tpu", ColumnType::Varchar),
            ColumnDef::nullable("rpc", ColumnType::Varchar),
            ColumnDef::nullable("version", ColumnType::Varchar),
            ColumnDef::nullable("shred_version", ColumnType::Integer),
        ]
    }
}

/// Vote accounts keyed by address.
#[derive(Debug, Clone, Copy)]
pub struct VoteAccounts;

impl DimensionSchema for VoteAccounts {
    fn name(&self) -> &'static str {
        "vote_accounts"
    }

    fn key_columns(&self) -> &'static [&'static str] {
        &["vote_pubkey"]
    }

    fn payload_columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("node_pubkey", ColumnType::Varchar),
            ColumnDef::new("activated_stake", ColumnType::BigInt),
            ColumnDef::new("commission", ColumnType::Integer),
            ColumnDef::new("delinquent", ColumnType::Boolean),
        ]
    }
}

/// Per-refresh vote progress of every account.
#[derive(Debug, Clone, Copy)]
pub struct VoteAccountActivity;

impl FactSchema for VoteAccountActivity {
    fn name(&self) -> &'static str {
        "vote_account_activity"
    }

    fn unique_key_columns(&self) -> &'static [&'static str] {
        &["epoch", "vote_pubkey", "observed_at"]
    }

    fn columns(&self) -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("epoch", ColumnType::BigInt),
            ColumnDef::new("vote_pubkey", ColumnType::Varchar),
            ColumnDef::new("observed_at", ColumnType::Timestamp),
            ColumnDef::new("node_pubkey", ColumnType::Varchar),
            ColumnDef::new("last_vote", ColumnType::BigInt),
            ColumnDef::new("root_slot", ColumnType::BigInt),
            ColumnDef::new("epoch_credits", ColumnType::BigInt),
            ColumnDef::nullable("credits_delta", ColumnType::BigInt),
            ColumnDef::new("activated_stake", ColumnType::BigInt),
            ColumnDef::new("delinquent", ColumnType::Boolean),
        ]
    }

    fn time_column(&self) -> Option<&'static str> {
        Some("observed_at")
    }

    fn partition(&self) -> Option<PartitionGranularity> {
        Some(PartitionGranularity::Month)
    }
}

/// One vote account observation with its computed credit delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRow {
    /// Epoch observed.
    pub epoch: u64,
    /// Observation time.
    pub observed_at: DateTime<Utc>,
    /// Credits earned so far in the epoch.
    pub epoch_credits: u64,
    /// Credits earned since the previous observation in the same epoch.
    pub credits_delta: Option<i64>,
    /// The account as reported.
    pub account: VoteAccount,
}

impl ActivityRow {
    fn into_record(self) -> Record {
        Record::from([
            ("epoch".to_string(), int(self.epoch)),
            ("vote_pubkey".to_string(), Value::String(self.account.vote_pubkey)),
            ("observed_at".to_string(), Value::Timestamp(self.observed_at)),
            ("node_pubkey".to_string(), Value::String(self.account.node_pubkey)),
            ("last_vote".to_string(), int(self.account.last_vote)),
            ("root_slot".to_string(), int(self.account.root_slot)),
            ("epoch_credits".to_string(), int(self.epoch_credits)),
            ("credits_delta".to_string(), opt(self.credits_delta)),
            ("activated_stake".to_string(), int(self.account.activated_stake)),
            ("delinquent".to_string(), Value::Bool(self.account.delinquent)),
        ])
    }
}

fn node_record(node: &ClusterNode) -> Record {
    let gossip: Option<SocketAddr> = node.gossip.as_deref().and_then(|g| g.parse().ok());
    Record::from([
        ("pubkey".to_string(), Value::from(node.pubkey.as_str())),
        (
            "gossip_ip".to_string(),
            opt(node.gossip_ip().map(|ip| ip.to_string())),
        ),
        (
            "gossip_port".to_string(),
            opt(gossip.map(|a| i32::from(a.port()))),
        ),
        ("tpu".to_string(), opt(node.tpu.clone())),
        ("rpc".to_string(), opt(node.rpc.clone())),
        ("version".to_string(), opt(node.version.clone())),
        (
            "shred_version".to_string(),
            opt(node.shred_version.map(i32::from)),
        ),
    ])
}

fn vote_record(account: &VoteAccount) -> Record {
    Record::from([
        ("vote_pubkey".to_string(), Value::from(account.vote_pubkey.as_str())),
        ("node_pubkey".to_string(), Value::from(account.node_pubkey.as_str())),
        ("activated_stake".to_string(), int(account.activated_stake)),
        ("commission".to_string(), Value::Int32(i32::from(account.commission))),
        ("delinquent".to_string(), Value::Bool(account.delinquent)),
    ])
}

/// Datasets of the solana domain.
#[derive(Debug)]
pub struct SolanaStore {
    gossip_nodes: DimensionType2Dataset,
    vote_accounts: DimensionType2Dataset,
    activity: FactDataset,
}

impl SolanaStore {
    /// Creates the store.
    ///
    /// # Errors
    ///
    /// Returns a dataset error if a schema descriptor is invalid.
    pub fn new(store: Arc<dyn ColumnarStore>) -> Result<Self> {
        let wrap = Error::dataset(DOMAIN);
        Ok(Self {
            gossip_nodes: DimensionType2Dataset::new(Arc::new(GossipNodes), Arc::clone(&store))
                .map_err(&wrap)?,
            vote_accounts: DimensionType2Dataset::new(Arc::new(VoteAccounts), Arc::clone(&store))
                .map_err(&wrap)?,
            activity: FactDataset::new(Arc::new(VoteAccountActivity), store).map_err(&wrap)?,
        })
    }

    /// Replaces the gossip peer set; peers missing from `nodes` are deleted.
    pub async fn replace_gossip_nodes(
        &self,
        nodes: &[ClusterNode],
        snapshot_ts: DateTime<Utc>,
    ) -> Result<WriteSummary> {
        self.gossip_nodes
            .write_batch(
                nodes.len(),
                |i| Ok(node_record(&nodes[i])),
                WriteConfig::full_snapshot().at(snapshot_ts),
            )
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Replaces the vote account set; accounts missing from `accounts` are
    /// deleted.
    pub async fn replace_vote_accounts(
        &self,
        accounts: &[VoteAccount],
        snapshot_ts: DateTime<Utc>,
    ) -> Result<WriteSummary> {
        self.vote_accounts
            .write_batch(
                accounts.len(),
                |i| Ok(vote_record(&accounts[i])),
                WriteConfig::full_snapshot().at(snapshot_ts),
            )
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Appends vote activity rows.
    pub async fn append_activity(&self, rows: Vec<ActivityRow>) -> Result<usize> {
        let records: Vec<Record> = rows.into_iter().map(ActivityRow::into_record).collect();
        let summary = self
            .activity
            .write_batch(records.len(), |i| Ok(records[i].clone()))
            .await
            .map_err(Error::dataset(DOMAIN))?;
        Ok(summary.written)
    }

    /// Latest stored credit observation per vote account in `epoch`.
    pub async fn last_credits(&self, epoch: u64) -> Result<Vec<(String, Observation)>> {
        let rows = self
            .activity
            .latest_per_group(&["vote_pubkey"], "observed_at", &[Filter::eq("epoch", int(epoch))])
            .await
            .map_err(Error::dataset(DOMAIN))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let key = row.get("vote_pubkey")?.as_str()?.to_string();
                let credits = row.get("epoch_credits")?.as_i64()?;
                Some((key, Observation::new(epoch, credits)))
            })
            .collect())
    }

    /// Activity rows for one account, oldest first.
    pub async fn activity_for(&self, vote_pubkey: &str) -> Result<Vec<Record>> {
        let mut rows = self
            .activity
            .latest_rows(&[Filter::eq("vote_pubkey", vote_pubkey)])
            .await
            .map_err(Error::dataset(DOMAIN))?;
        rows.sort_by_key(|r| r.get("observed_at").and_then(Value::as_timestamp));
        Ok(rows)
    }

    /// Current gossip peers.
    pub async fn current_gossip_nodes(&self) -> Result<Vec<Record>> {
        self.gossip_nodes
            .current_rows()
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Current vote accounts.
    pub async fn current_vote_accounts(&self) -> Result<Vec<Record>> {
        self.vote_accounts
            .current_rows()
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Full history of one gossip peer, oldest first.
    pub async fn gossip_node_history(&self, pubkey: &str) -> Result<Vec<Record>> {
        let id = SurrogateKey::derive([pubkey])?;
        self.gossip_nodes
            .history(&id)
            .await
            .map_err(Error::dataset(DOMAIN))
    }

    /// Distinct gossip IPs of the current peer set, sorted.
    pub async fn current_gossip_ips(&self) -> Result<Vec<IpAddr>> {
        let ips: BTreeSet<IpAddr> = self
            .current_gossip_nodes()
            .await?
            .iter()
            .filter_map(|row| row.get("gossip_ip")?.as_str()?.parse().ok())
            .collect();
        Ok(ips.into_iter().collect())
    }

    /// Creates the domain's tables.
    pub async fn ensure_tables(&self) -> Result<()> {
        let wrap = Error::dataset(DOMAIN);
        self.gossip_nodes.ensure_table().await.map_err(&wrap)?;
        self.vote_accounts.ensure_table().await.map_err(&wrap)?;
        self.activity.ensure_table().await.map_err(&wrap)
    }
}

/// Refreshes gossip peers, vote accounts and vote activity.
pub struct SolanaView {
    rpc: Arc<dyn SolanaRpc>,
    store: Arc<SolanaStore>,
    credits: DeltaTracker<String>,
    seeded_epoch: Option<u64>,
}

impl SolanaView {
    /// Creates the view.
    #[must_use]
    pub fn new(rpc: Arc<dyn SolanaRpc>, store: Arc<SolanaStore>) -> Self {
        Self {
            rpc,
            store,
            credits: DeltaTracker::new(CREDITS_POLICY),
            seeded_epoch: None,
        }
    }

    async fn seed_credits(&mut self, epoch: u64) -> Result<()> {
        if self.seeded_epoch == Some(epoch) {
            return Ok(());
        }
        self.credits.retain_from(epoch);
        let stored = self.store.last_credits(epoch).await?;
        tracing::debug!(epoch, accounts = stored.len(), "seeded vote credit references");
        for (key, observation) in stored {
            if !self.credits.contains(&key) {
                self.credits.seed(key, observation);
            }
        }
        self.seeded_epoch = Some(epoch);
        Ok(())
    }
}

#[async_trait]
impl View for SolanaView {
    fn name(&self) -> &'static str {
        DOMAIN
    }

    async fn refresh(&mut self) -> Result<RefreshOutcome> {
        let mut outcome = RefreshOutcome::default();
        let info = self.rpc.epoch_info().await?;
        let nodes = self.rpc.cluster_nodes().await?;
        let accounts = self.rpc.vote_accounts().await?;
        let now = now_micros();

        let gossip = self.store.replace_gossip_nodes(&nodes, now).await?;
        outcome.add_rows(gossip.upserted + gossip.tombstoned);
        let votes = self.store.replace_vote_accounts(&accounts, now).await?;
        outcome.add_rows(votes.upserted + votes.tombstoned);

        self.seed_credits(info.epoch).await?;
        let mut credits = self.credits.clone();
        let rows: Vec<ActivityRow> = accounts
            .into_iter()
            .filter_map(|account| {
                let epoch_credits = account.credits_in(info.epoch)?;
                let observation =
                    Observation::new(info.epoch, i64::try_from(epoch_credits).unwrap_or(i64::MAX));
                let credits_delta = credits.observe(account.vote_pubkey.clone(), observation);
                Some(ActivityRow {
                    epoch: info.epoch,
                    observed_at: now,
                    epoch_credits,
                    credits_delta,
                    account,
                })
            })
            .collect();
        outcome.add_rows(self.store.append_activity(rows).await?);
        self.credits = credits;

        tracing::info!(
            epoch = info.epoch,
            nodes = nodes.len(),
            rows = outcome.rows_written,
            "solana state refreshed"
        );
        Ok(outcome)
    }
}
