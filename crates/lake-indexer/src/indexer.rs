//! Indexer assembly and lifecycle.
//!
//! [`IndexerBuilder`] takes every collaborator by injection and fails fast
//! on a missing dependency. [`Indexer::start`] spawns one refresh loop per
//! view; the views share nothing but the store.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use lake_core::ColumnarStore;

use crate::config::{CacheConfig, RefreshConfig};
use crate::domains::geoip::{GeoIpStore, GeoIpView};
use crate::domains::latency::{LatencyStore, LatencyView};
use crate::domains::revenue::{RevenueBackfill, RevenueStore, RevenueView};
use crate::domains::solana::{SolanaStore, SolanaView};
use crate::error::{Error, Result};
use crate::metrics::RefreshStatus;
use crate::readiness::ReadinessLatch;
use crate::sources::{GeoIpResolver, LatencySource, PriceOracle, RevenueSource, SolanaRpc};
use crate::view::{View, ViewRunner};

/// Readiness of one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ViewStatus {
    /// View name.
    pub view: String,
    /// Whether the view has refreshed successfully.
    pub ready: bool,
}

/// Builder for [`Indexer`].
#[derive(Default)]
pub struct IndexerBuilder {
    store: Option<Arc<dyn ColumnarStore>>,
    solana: Option<Arc<dyn SolanaRpc>>,
    revenue: Option<Arc<dyn RevenueSource>>,
    oracle: Option<Arc<dyn PriceOracle>>,
    geoip: Option<Arc<dyn GeoIpResolver>>,
    latency: Option<Arc<dyn LatencySource>>,
    views: Vec<Box<dyn View>>,
    refresh: RefreshConfig,
    cache: CacheConfig,
}

impl std::fmt::Debug for IndexerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerBuilder")
            .field("store", &self.store.as_ref().map(|s| s.backend()))
            .field("solana", &self.solana.is_some())
            .field("revenue", &self.revenue.is_some())
            .field("oracle", &self.oracle.is_some())
            .field("geoip", &self.geoip.is_some())
            .field("latency", &self.latency.is_some())
            .field("custom_views", &self.views.len())
            .field("refresh", &self.refresh)
            .field("cache", &self.cache)
            .finish()
    }
}

impl IndexerBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the columnar store. Required.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ColumnarStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the Solana RPC client. Required.
    #[must_use]
    pub fn solana_rpc(mut self, rpc: Arc<dyn SolanaRpc>) -> Self {
        self.solana = Some(rpc);
        self
    }

    /// Enables the revenue view.
    #[must_use]
    pub fn revenue_source(mut self, source: Arc<dyn RevenueSource>) -> Self {
        self.revenue = Some(source);
        self
    }

    /// Adds SOL price enrichment to the revenue view.
    #[must_use]
    pub fn price_oracle(mut self, oracle: Arc<dyn PriceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Enables the GeoIP view.
    #[must_use]
    pub fn geoip_resolver(mut self, resolver: Arc<dyn GeoIpResolver>) -> Self {
        self.geoip = Some(resolver);
        self
    }

    /// Enables the latency view.
    #[must_use]
    pub fn latency_source(mut self, source: Arc<dyn LatencySource>) -> Self {
        self.latency = Some(source);
        self
    }

    /// Registers an additional view.
    #[must_use]
    pub fn view(mut self, view: Box<dyn View>) -> Self {
        self.views.push(view);
        self
    }

    /// Sets the refresh loop settings.
    #[must_use]
    pub fn refresh_config(mut self, config: RefreshConfig) -> Self {
        self.refresh = config;
        self
    }

    /// Sets the resolver cache settings.
    #[must_use]
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Builds the indexer.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a missing store or Solana client,
    /// a price oracle without a revenue source, invalid settings, or two
    /// views with the same name.
    pub fn build(self) -> Result<Indexer> {
        self.refresh.validate()?;
        if self.cache.ttl.is_zero() {
            return Err(Error::configuration("cache ttl must be positive"));
        }
        let store = self
            .store
            .ok_or_else(|| Error::configuration("a columnar store is required"))?;
        let rpc = self
            .solana
            .ok_or_else(|| Error::configuration("a solana rpc client is required"))?;
        if self.oracle.is_some() && self.revenue.is_none() {
            return Err(Error::configuration(
                "a price oracle was given without a revenue source",
            ));
        }

        let solana = Arc::new(SolanaStore::new(Arc::clone(&store))?);
        let mut views: Vec<Box<dyn View>> = vec![Box::new(SolanaView::new(
            Arc::clone(&rpc),
            Arc::clone(&solana),
        ))];

        let mut revenue = None;
        if let Some(source) = self.revenue {
            let revenue_store = Arc::new(RevenueStore::new(Arc::clone(&store))?);
            views.push(Box::new(RevenueView::new(
                Arc::clone(&source),
                Arc::clone(&rpc),
                self.oracle,
                Arc::clone(&revenue_store),
            )));
            revenue = Some(RevenueParts {
                source,
                store: revenue_store,
            });
        }

        let mut latency = None;
        if let Some(source) = self.latency {
            let latency_store = Arc::new(LatencyStore::new(Arc::clone(&store))?);
            views.push(Box::new(LatencyView::new(source, Arc::clone(&latency_store))));
            latency = Some(latency_store);
        }

        let mut geoip = None;
        if let Some(resolver) = self.geoip {
            let geoip_store = Arc::new(GeoIpStore::new(Arc::clone(&store))?);
            views.push(Box::new(GeoIpView::new(
                resolver,
                Arc::clone(&solana),
                Arc::clone(&geoip_store),
                self.cache,
            )));
            geoip = Some(geoip_store);
        }

        views.extend(self.views);

        let mut names = HashSet::new();
        for view in &views {
            if !names.insert(view.name()) {
                return Err(Error::configuration(format!(
                    "view '{}' registered twice",
                    view.name()
                )));
            }
        }

        let runners = views
            .into_iter()
            .map(|view| Arc::new(ViewRunner::new(view, self.refresh)))
            .collect();

        tracing::info!(
            views = ?names,
            backend = store.backend(),
            "indexer built"
        );
        Ok(Indexer {
            runners,
            rpc,
            solana,
            revenue,
            latency,
            geoip,
        })
    }
}

struct RevenueParts {
    source: Arc<dyn RevenueSource>,
    store: Arc<RevenueStore>,
}

/// The assembled set of views.
pub struct Indexer {
    runners: Vec<Arc<ViewRunner>>,
    rpc: Arc<dyn SolanaRpc>,
    solana: Arc<SolanaStore>,
    revenue: Option<RevenueParts>,
    latency: Option<Arc<LatencyStore>>,
    geoip: Option<Arc<GeoIpStore>>,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("runners", &self.runners)
            .finish_non_exhaustive()
    }
}

impl Indexer {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> IndexerBuilder {
        IndexerBuilder::new()
    }

    /// Spawns one refresh loop per view.
    #[must_use]
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> IndexerHandle {
        let tasks = self
            .runners
            .iter()
            .map(|runner| (runner.name(), runner.start(shutdown.clone())))
            .collect();
        IndexerHandle { tasks }
    }

    /// Runs one guarded refresh of every view, in registration order.
    pub async fn refresh_all(&self) -> Vec<(&'static str, RefreshStatus)> {
        let mut statuses = Vec::with_capacity(self.runners.len());
        for runner in &self.runners {
            statuses.push((runner.name(), runner.refresh_now().await));
        }
        statuses
    }

    /// Returns true once every view has refreshed successfully.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.runners.iter().all(|r| r.is_ready())
    }

    /// Readiness of every view.
    #[must_use]
    pub fn readiness(&self) -> Vec<ViewStatus> {
        self.runners
            .iter()
            .map(|r| ViewStatus {
                view: r.name().to_string(),
                ready: r.is_ready(),
            })
            .collect()
    }

    /// Readiness latch of one view.
    #[must_use]
    pub fn view_readiness(&self, view: &str) -> Option<Arc<ReadinessLatch>> {
        self.runners
            .iter()
            .find(|r| r.name() == view)
            .map(|r| r.readiness())
    }

    /// The view runners.
    #[must_use]
    pub fn runners(&self) -> &[Arc<ViewRunner>] {
        &self.runners
    }

    /// Solana datasets.
    #[must_use]
    pub fn solana_store(&self) -> Arc<SolanaStore> {
        Arc::clone(&self.solana)
    }

    /// Revenue datasets, if the revenue view is enabled.
    #[must_use]
    pub fn revenue_store(&self) -> Option<Arc<RevenueStore>> {
        self.revenue.as_ref().map(|r| Arc::clone(&r.store))
    }

    /// Latency datasets, if the latency view is enabled.
    #[must_use]
    pub fn latency_store(&self) -> Option<Arc<LatencyStore>> {
        self.latency.clone()
    }

    /// GeoIP datasets, if the GeoIP view is enabled.
    #[must_use]
    pub fn geoip_store(&self) -> Option<Arc<GeoIpStore>> {
        self.geoip.clone()
    }

    /// Revenue backfill over the same source and store as the view.
    #[must_use]
    pub fn revenue_backfill(&self) -> Option<RevenueBackfill> {
        self.revenue.as_ref().map(|r| {
            RevenueBackfill::new(Arc::clone(&r.source), Arc::clone(&self.rpc), Arc::clone(&r.store))
        })
    }
}

/// Join handle for the refresh loops.
#[derive(Debug)]
pub struct IndexerHandle {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl IndexerHandle {
    /// Waits for every loop to exit after shutdown has been signalled.
    pub async fn join(self) {
        for (view, task) in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(view, error = %e, "refresh loop task failed");
            }
        }
        tracing::info!("all refresh loops stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lake_core::store::MemoryStore;

    use crate::sources::{ClusterNode, EpochInfo, VoteAccount};
    use crate::view::RefreshOutcome;

    struct NoRpc;

    #[async_trait]
    impl SolanaRpc for NoRpc {
        async fn epoch_info(&self) -> Result<EpochInfo> {
            Err(Error::upstream("solana-rpc", "offline"))
        }
        async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
            Ok(Vec::new())
        }
        async fn vote_accounts(&self) -> Result<Vec<VoteAccount>> {
            Ok(Vec::new())
        }
    }

    struct Named(&'static str);

    #[async_trait]
    impl View for Named {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn refresh(&mut self) -> Result<RefreshOutcome> {
            Ok(RefreshOutcome::default())
        }
    }

    fn base() -> IndexerBuilder {
        Indexer::builder()
            .store(Arc::new(MemoryStore::new()))
            .solana_rpc(Arc::new(NoRpc))
    }

    #[test]
    fn missing_dependencies_fail_fast() {
        let no_store = Indexer::builder().solana_rpc(Arc::new(NoRpc)).build();
        assert!(matches!(no_store, Err(Error::Configuration { .. })));

        let no_rpc = Indexer::builder().store(Arc::new(MemoryStore::new())).build();
        assert!(matches!(no_rpc, Err(Error::Configuration { .. })));

        let zero_interval = base()
            .refresh_config(RefreshConfig {
                interval: std::time::Duration::ZERO,
                ..RefreshConfig::default()
            })
            .build();
        assert!(zero_interval.is_err());
    }

    #[test]
    fn duplicate_view_names_are_rejected() {
        let result = base().view(Box::new(Named("solana"))).build();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[tokio::test]
    async fn ready_only_when_every_view_is_ready() {
        let indexer = base().view(Box::new(Named("extra"))).build().unwrap();
        assert_eq!(indexer.runners().len(), 2);

        let statuses = indexer.refresh_all().await;
        assert_eq!(
            statuses,
            vec![("solana", RefreshStatus::Error), ("extra", RefreshStatus::Success)]
        );
        assert!(!indexer.is_ready());
        assert_eq!(
            indexer.readiness(),
            vec![
                ViewStatus { view: "solana".into(), ready: false },
                ViewStatus { view: "extra".into(), ready: true },
            ]
        );
        assert!(indexer.view_readiness("extra").unwrap().is_ready());
        assert!(indexer.view_readiness("missing").is_none());
        assert!(indexer.revenue_backfill().is_none());
    }
}
