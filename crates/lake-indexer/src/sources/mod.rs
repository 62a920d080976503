//! External source collaborators.
//!
//! Views only see these traits; transports are injected. Two concrete
//! transports live here: [`SolanaJsonRpc`] and [`FileGeoIpResolver`].
//! Every method returns [`crate::Error::Source`] on failure.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod geoip;
pub mod solana;

pub use geoip::FileGeoIpResolver;
pub use solana::{SolanaJsonRpc, SolanaRpcConfig};

// ============================================================================
// Solana cluster state
// ============================================================================

/// Position of the cluster within the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochInfo {
    /// Current epoch.
    pub epoch: u64,
    /// Slot offset within the epoch.
    pub slot_index: u64,
    /// Slots per epoch.
    pub slots_in_epoch: u64,
    /// Current slot.
    pub absolute_slot: u64,
}

/// One gossip peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    /// Node identity.
    pub pubkey: String,
    /// Gossip address (`ip:port`).
    pub gossip: Option<String>,
    /// TPU address.
    pub tpu: Option<String>,
    /// RPC address, if the node serves RPC.
    pub rpc: Option<String>,
    /// Software version.
    pub version: Option<String>,
    /// Shred version.
    pub shred_version: Option<u16>,
}

impl ClusterNode {
    /// IP of the gossip address, if it parses.
    #[must_use]
    pub fn gossip_ip(&self) -> Option<IpAddr> {
        let addr = self.gossip.as_deref()?;
        addr.parse::<std::net::SocketAddr>()
            .map(|a| a.ip())
            .or_else(|_| addr.parse::<IpAddr>())
            .ok()
    }
}

/// One vote account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteAccount {
    /// Vote account address.
    pub vote_pubkey: String,
    /// Identity of the validating node.
    pub node_pubkey: String,
    /// Stake delegated to the account, in lamports.
    pub activated_stake: u64,
    /// Commission percentage.
    pub commission: u8,
    /// Most recent voted slot.
    pub last_vote: u64,
    /// Current root slot.
    pub root_slot: u64,
    /// `(epoch, credits, previous_credits)` for recent epochs.
    #[serde(default)]
    pub epoch_credits: Vec<(u64, u64, u64)>,
    /// Whether the account is listed as delinquent.
    #[serde(skip)]
    pub delinquent: bool,
}

impl VoteAccount {
    /// Cumulative credits earned in `epoch`, if reported.
    #[must_use]
    pub fn credits_in(&self, epoch: u64) -> Option<u64> {
        self.epoch_credits
            .iter()
            .find(|(e, _, _)| *e == epoch)
            .map(|(_, credits, previous)| credits.saturating_sub(*previous))
    }
}

/// Solana RPC methods used by the indexer.
#[async_trait]
pub trait SolanaRpc: Send + Sync {
    /// Current epoch position.
    async fn epoch_info(&self) -> Result<EpochInfo>;

    /// Gossip peers.
    async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>>;

    /// Current and delinquent vote accounts.
    async fn vote_accounts(&self) -> Result<Vec<VoteAccount>>;
}

// ============================================================================
// Revenue distribution
// ============================================================================

/// On-chain configuration of the revenue distribution program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Program address.
    pub program_id: String,
    /// Administrator authority.
    pub admin: String,
    /// Share of revenue routed to validators, in basis points.
    pub validator_fee_bps: u32,
    /// Epoch the current configuration took effect.
    pub effective_epoch: u64,
}

/// Debt owed and paid by one validator in an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorDebt {
    /// Node identity.
    pub node_pubkey: String,
    /// Lamports owed.
    pub debt_lamports: u64,
    /// Lamports paid so far.
    pub paid_lamports: u64,
}

/// One epoch's distribution account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochDistribution {
    /// Epoch the distribution covers.
    pub epoch: u64,
    /// Revenue collected, in lamports.
    pub total_revenue_lamports: u64,
    /// Debt assessed, in lamports.
    pub total_debt_lamports: u64,
    /// Per-validator breakdown.
    pub validators: Vec<ValidatorDebt>,
}

/// Reader for revenue distribution accounts.
#[async_trait]
pub trait RevenueSource: Send + Sync {
    /// Current program configuration.
    async fn fetch_program_config(&self) -> Result<ProgramConfig>;

    /// The distribution for `epoch`, or `None` if it does not exist yet.
    async fn fetch_distribution(&self, epoch: u64) -> Result<Option<EpochDistribution>>;
}

/// Best-effort SOL price lookup.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current SOL/USD price.
    async fn sol_usd_price(&self) -> Result<f64>;
}

// ============================================================================
// GeoIP
// ============================================================================

/// Location data for one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoIpRecord {
    /// Address the record describes.
    pub ip: IpAddr,
    /// ISO 3166 country code.
    pub country_code: Option<String>,
    /// Country name.
    pub country: Option<String>,
    /// Region or state.
    pub region: Option<String>,
    /// City.
    pub city: Option<String>,
    /// Latitude in degrees.
    pub latitude: Option<f64>,
    /// Longitude in degrees.
    pub longitude: Option<f64>,
    /// Autonomous system number.
    pub asn: Option<u32>,
    /// Autonomous system organization.
    pub org: Option<String>,
}

/// IP geolocation lookup.
#[async_trait]
pub trait GeoIpResolver: Send + Sync {
    /// Resolves `ip`; `None` if the address is unknown.
    async fn resolve(&self, ip: IpAddr) -> Result<Option<GeoIpRecord>>;
}

// ============================================================================
// Link latency telemetry
// ============================================================================

/// A monitored link between two sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    /// Circuit code, unique per link.
    pub code: String,
    /// Originating site.
    pub origin: String,
    /// Target site.
    pub target: String,
    /// Link type (e.g. `wan`, `dz`).
    pub link_type: String,
}

/// One round-trip probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySample {
    /// Sample position within the circuit's epoch.
    pub index: u64,
    /// Probe time.
    pub time: DateTime<Utc>,
    /// Round-trip time in microseconds; zero marks a lost probe.
    pub rtt_us: u32,
}

impl LatencySample {
    /// Returns true for a lost probe.
    #[must_use]
    pub const fn is_loss(&self) -> bool {
        self.rtt_us == 0
    }
}

/// Reader for link latency telemetry.
#[async_trait]
pub trait LatencySource: Send + Sync {
    /// Current telemetry epoch.
    async fn current_epoch(&self) -> Result<u64>;

    /// Monitored circuits.
    async fn list_circuits(&self) -> Result<Vec<Circuit>>;

    /// Samples for `circuit` in `epoch` with index at least `from_index`,
    /// ascending by index.
    async fn fetch_samples(&self, circuit: &str, epoch: u64, from_index: u64) -> Result<Vec<LatencySample>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gossip_ip_parses_socket_addresses() {
        let node = ClusterNode {
            pubkey: "A".into(),
            gossip: Some("10.0.0.1:8001".into()),
            tpu: None,
            rpc: None,
            version: None,
            shred_version: None,
        };
        assert_eq!(node.gossip_ip(), Some("10.0.0.1".parse().unwrap()));

        let bare = ClusterNode {
            gossip: Some("not an address".into()),
            ..node
        };
        assert_eq!(bare.gossip_ip(), None);
    }

    #[test]
    fn credits_in_epoch_are_relative_to_previous() {
        let account = VoteAccount {
            vote_pubkey: "V".into(),
            node_pubkey: "N".into(),
            activated_stake: 0,
            commission: 0,
            last_vote: 0,
            root_slot: 0,
            epoch_credits: vec![(9, 900, 100), (10, 1500, 900)],
            delinquent: false,
        };
        assert_eq!(account.credits_in(10), Some(600));
        assert_eq!(account.credits_in(11), None);
    }
}
