//! Scripted source fakes.
//!
//! Every fake is cheap to clone and shares its state, so a test keeps one
//! handle to script data and inject failures while the indexer holds
//! another.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use lake_indexer::sources::{
    Circuit, ClusterNode, EpochDistribution, EpochInfo, GeoIpRecord, GeoIpResolver, LatencySample,
    LatencySource, PriceOracle, ProgramConfig, RevenueSource, SolanaRpc, VoteAccount,
};
use lake_indexer::{Error, Result};

// ============================================================================
// Solana RPC
// ============================================================================

#[derive(Debug, Default)]
struct SolanaState {
    epoch: u64,
    nodes: Vec<ClusterNode>,
    votes: Vec<VoteAccount>,
    fail: bool,
}

/// Scripted [`SolanaRpc`].
#[derive(Debug, Clone, Default)]
pub struct FakeSolanaRpc {
    state: Arc<Mutex<SolanaState>>,
    calls: Arc<AtomicUsize>,
}

impl FakeSolanaRpc {
    /// Creates a cluster at `epoch` with no peers.
    pub fn new(epoch: u64) -> Self {
        let rpc = Self::default();
        rpc.set_epoch(epoch);
        rpc
    }

    /// Sets the current epoch.
    pub fn set_epoch(&self, epoch: u64) {
        self.state.lock().unwrap().epoch = epoch;
    }

    /// Replaces the gossip peers.
    pub fn set_nodes(&self, nodes: Vec<ClusterNode>) {
        self.state.lock().unwrap().nodes = nodes;
    }

    /// Replaces the vote accounts.
    pub fn set_votes(&self, votes: Vec<VoteAccount>) {
        self.state.lock().unwrap().votes = votes;
    }

    /// Makes every call fail.
    pub fn set_fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    /// Calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().unwrap().fail {
            return Err(Error::upstream("solana-rpc", "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SolanaRpc for FakeSolanaRpc {
    async fn epoch_info(&self) -> Result<EpochInfo> {
        self.check()?;
        let epoch = self.state.lock().unwrap().epoch;
        Ok(EpochInfo {
            epoch,
            slot_index: 0,
            slots_in_epoch: 432_000,
            absolute_slot: epoch * 432_000,
        })
    }

    async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        self.check()?;
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn vote_accounts(&self) -> Result<Vec<VoteAccount>> {
        self.check()?;
        Ok(self.state.lock().unwrap().votes.clone())
    }
}

// ============================================================================
// Revenue
// ============================================================================

#[derive(Debug, Default)]
struct RevenueState {
    config: Option<ProgramConfig>,
    distributions: HashMap<u64, EpochDistribution>,
    failing: HashSet<u64>,
    fetches: Vec<u64>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Scripted [`RevenueSource`] that records fetch order and concurrency.
#[derive(Debug, Clone, Default)]
pub struct FakeRevenueSource {
    state: Arc<Mutex<RevenueState>>,
    fetch_delay: Option<Duration>,
}

impl FakeRevenueSource {
    /// Creates a source with a default program configuration.
    pub fn new() -> Self {
        let source = Self::default();
        source.state.lock().unwrap().config = Some(ProgramConfig {
            program_id: "dzrev1111111111111111111111111111111111111".to_string(),
            admin: "admin".to_string(),
            validator_fee_bps: 500,
            effective_epoch: 0,
        });
        source
    }

    /// Delays every distribution fetch.
    #[must_use]
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Publishes a distribution.
    pub fn publish(&self, distribution: EpochDistribution) {
        self.state
            .lock()
            .unwrap()
            .distributions
            .insert(distribution.epoch, distribution);
    }

    /// Makes fetches of `epoch` fail.
    pub fn fail_epoch(&self, epoch: u64) {
        self.state.lock().unwrap().failing.insert(epoch);
    }

    /// Clears every injected failure.
    pub fn heal(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    /// Epochs fetched so far, in call order.
    pub fn fetches(&self) -> Vec<u64> {
        self.state.lock().unwrap().fetches.clone()
    }

    /// Highest number of concurrent fetches observed.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

#[async_trait]
impl RevenueSource for FakeRevenueSource {
    async fn fetch_program_config(&self) -> Result<ProgramConfig> {
        self.state
            .lock()
            .unwrap()
            .config
            .clone()
            .ok_or_else(|| Error::upstream("revenue", "program not deployed"))
    }

    async fn fetch_distribution(&self, epoch: u64) -> Result<Option<EpochDistribution>> {
        {
            let mut state = self.state.lock().unwrap();
            state.fetches.push(epoch);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        if state.failing.contains(&epoch) {
            return Err(Error::upstream("revenue", format!("injected failure at epoch {epoch}")));
        }
        Ok(state.distributions.get(&epoch).cloned())
    }
}

/// Scripted [`PriceOracle`].
#[derive(Debug, Clone)]
pub struct FakePriceOracle {
    price: Arc<Mutex<Option<f64>>>,
}

impl FakePriceOracle {
    /// An oracle quoting `price`.
    pub fn new(price: f64) -> Self {
        Self {
            price: Arc::new(Mutex::new(Some(price))),
        }
    }

    /// An oracle that always fails.
    pub fn failing() -> Self {
        Self {
            price: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl PriceOracle for FakePriceOracle {
    async fn sol_usd_price(&self) -> Result<f64> {
        self.price
            .lock()
            .unwrap()
            .ok_or_else(|| Error::upstream("price-oracle", "injected failure"))
    }
}

// ============================================================================
// GeoIP
// ============================================================================

#[derive(Debug, Default)]
struct GeoIpState {
    records: HashMap<IpAddr, GeoIpRecord>,
    failing: HashSet<IpAddr>,
}

/// Scripted [`GeoIpResolver`] counting lookups.
#[derive(Debug, Clone, Default)]
pub struct FakeGeoIpResolver {
    state: Arc<Mutex<GeoIpState>>,
    lookups: Arc<AtomicUsize>,
}

impl FakeGeoIpResolver {
    /// Creates a resolver knowing `records`.
    pub fn new(records: impl IntoIterator<Item = GeoIpRecord>) -> Self {
        let resolver = Self::default();
        for record in records {
            resolver.insert(record);
        }
        resolver
    }

    /// Adds or replaces a record.
    pub fn insert(&self, record: GeoIpRecord) {
        self.state.lock().unwrap().records.insert(record.ip, record);
    }

    /// Makes lookups of `ip` fail.
    pub fn fail_ip(&self, ip: IpAddr) {
        self.state.lock().unwrap().failing.insert(ip);
    }

    /// Lookups performed so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoIpResolver for FakeGeoIpResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<Option<GeoIpRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.failing.contains(&ip) {
            return Err(Error::upstream("geoip", format!("injected failure for {ip}")));
        }
        Ok(state.records.get(&ip).cloned())
    }
}

// ============================================================================
// Latency
// ============================================================================

#[derive(Debug, Default)]
struct LatencyState {
    epoch: u64,
    circuits: Vec<Circuit>,
    samples: HashMap<(String, u64), Vec<LatencySample>>,
    failing: HashSet<String>,
    requests: Vec<(String, u64, u64)>,
}

/// Scripted [`LatencySource`] recording sample requests.
#[derive(Debug, Clone, Default)]
pub struct FakeLatencySource {
    state: Arc<Mutex<LatencyState>>,
}

impl FakeLatencySource {
    /// Creates a source at `epoch` monitoring `circuits`.
    pub fn new(epoch: u64, circuits: Vec<Circuit>) -> Self {
        let source = Self::default();
        {
            let mut state = source.state.lock().unwrap();
            state.epoch = epoch;
            state.circuits = circuits;
        }
        source
    }

    /// Sets the current epoch.
    pub fn set_epoch(&self, epoch: u64) {
        self.state.lock().unwrap().epoch = epoch;
    }

    /// Appends samples to a circuit's epoch.
    pub fn push_samples(&self, circuit: &str, epoch: u64, samples: impl IntoIterator<Item = LatencySample>) {
        self.state
            .lock()
            .unwrap()
            .samples
            .entry((circuit.to_string(), epoch))
            .or_default()
            .extend(samples);
    }

    /// Makes sample fetches for `circuit` fail.
    pub fn fail_circuit(&self, circuit: &str) {
        self.state.lock().unwrap().failing.insert(circuit.to_string());
    }

    /// Clears every injected failure.
    pub fn heal(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    /// `(circuit, epoch, from_index)` of every sample request, in order.
    pub fn requests(&self) -> Vec<(String, u64, u64)> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl LatencySource for FakeLatencySource {
    async fn current_epoch(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().epoch)
    }

    async fn list_circuits(&self) -> Result<Vec<Circuit>> {
        Ok(self.state.lock().unwrap().circuits.clone())
    }

    async fn fetch_samples(&self, circuit: &str, epoch: u64, from_index: u64) -> Result<Vec<LatencySample>> {
        let mut state = self.state.lock().unwrap();
        state.requests.push((circuit.to_string(), epoch, from_index));
        if state.failing.contains(circuit) {
            return Err(Error::upstream("latency", format!("injected failure for {circuit}")));
        }
        Ok(state
            .samples
            .get(&(circuit.to_string(), epoch))
            .map(|samples| samples.iter().filter(|s| s.index >= from_index).copied().collect())
            .unwrap_or_default())
    }
}
