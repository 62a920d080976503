//! Revenue view: epoch cursor, early stops and price enrichment.

use std::sync::Arc;

use lake_core::Value;
use lake_core::store::MemoryStore;
use lake_indexer::View;
use lake_indexer::domains::revenue::{RevenueStore, RevenueView};
use lake_indexer::sources::PriceOracle;
use lake_test_utils::{FakePriceOracle, FakeRevenueSource, FakeSolanaRpc, distribution, init_test_logging};

struct Harness {
    store: Arc<RevenueStore>,
    source: FakeRevenueSource,
    rpc: FakeSolanaRpc,
}

impl Harness {
    fn new(epoch: u64) -> Self {
        let memory = MemoryStore::new();
        Self {
            store: Arc::new(RevenueStore::new(Arc::new(memory)).unwrap()),
            source: FakeRevenueSource::new(),
            rpc: FakeSolanaRpc::new(epoch),
        }
    }

    fn view(&self, oracle: Option<Arc<dyn PriceOracle>>) -> RevenueView {
        RevenueView::new(
            Arc::new(self.source.clone()),
            Arc::new(self.rpc.clone()),
            oracle,
            Arc::clone(&self.store),
        )
    }
}

#[tokio::test]
async fn first_run_starts_at_the_latest_completed_epoch() {
    init_test_logging();
    let h = Harness::new(12);
    for epoch in 9..=11 {
        h.source.publish(distribution(epoch, &[("A", 10)]));
    }

    let mut view = h.view(None);
    let outcome = view.refresh().await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(h.source.fetches(), vec![11]);
    assert_eq!(view.last_fetched_epoch(), Some(11));
    assert_eq!(h.store.epoch_bounds().await.unwrap(), Some((11, 11)));
}

#[tokio::test]
async fn cursor_is_rederived_from_the_store_after_restart() {
    let h = Harness::new(12);
    h.source.publish(distribution(11, &[("A", 10)]));
    h.source.publish(distribution(12, &[("A", 20)]));

    h.view(None).refresh().await.unwrap();
    assert_eq!(h.source.fetches(), vec![11]);

    // Epoch 12 completes while the process is down.
    h.rpc.set_epoch(13);
    let mut restarted = h.view(None);
    assert_eq!(restarted.last_fetched_epoch(), None);
    restarted.refresh().await.unwrap();

    assert_eq!(h.source.fetches(), vec![11, 12]);
    assert_eq!(restarted.last_fetched_epoch(), Some(12));
    assert_eq!(h.store.last_stored_epoch().await.unwrap(), Some(12));
}

#[tokio::test]
async fn unpublished_or_failing_epochs_stop_the_walk_without_failing() {
    let h = Harness::new(12);
    h.source.publish(distribution(11, &[]));
    let mut view = h.view(None);
    view.refresh().await.unwrap();

    h.rpc.set_epoch(15);
    h.source.publish(distribution(12, &[]));
    let outcome = view.refresh().await.unwrap();
    assert_eq!(outcome.partial.len(), 1);
    assert_eq!(view.last_fetched_epoch(), Some(12));
    assert_eq!(h.source.fetches(), vec![11, 12, 13]);

    h.source.publish(distribution(13, &[]));
    h.source.publish(distribution(14, &[]));
    h.source.fail_epoch(14);
    let outcome = view.refresh().await.unwrap();
    assert!(!outcome.is_complete());
    assert_eq!(view.last_fetched_epoch(), Some(13));

    h.source.heal();
    let outcome = view.refresh().await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(view.last_fetched_epoch(), Some(14));
    assert_eq!(h.store.epoch_bounds().await.unwrap(), Some((11, 14)));
}

#[tokio::test]
async fn nothing_to_do_before_the_first_epoch_completes() {
    let h = Harness::new(0);
    let mut view = h.view(None);
    let outcome = view.refresh().await.unwrap();
    assert!(outcome.is_complete());
    assert!(h.source.fetches().is_empty());
    // The program configuration is still recorded.
    assert_eq!(h.store.current_program_config().await.unwrap().len(), 1);
}

#[tokio::test]
async fn price_enrichment_degrades_to_null() {
    let h = Harness::new(12);
    h.source.publish(distribution(11, &[("A", 10)]));
    let mut view = h.view(Some(Arc::new(FakePriceOracle::failing())));
    let outcome = view.refresh().await.unwrap();
    assert_eq!(outcome.degraded, vec!["sol_usd_price".to_string()]);
    assert!(outcome.partial.is_empty());
    let row = h.store.distribution(11).await.unwrap().unwrap();
    assert_eq!(row["sol_usd_price"], Value::Null);

    h.rpc.set_epoch(13);
    h.source.publish(distribution(12, &[("A", 10)]));
    let mut view = h.view(Some(Arc::new(FakePriceOracle::new(142.5))));
    let outcome = view.refresh().await.unwrap();
    assert!(outcome.is_complete());
    let row = h.store.distribution(12).await.unwrap().unwrap();
    assert_eq!(row["sol_usd_price"], Value::Float64(142.5));
}

#[tokio::test]
async fn validator_debts_are_stored_per_epoch() {
    let h = Harness::new(12);
    h.source.publish(distribution(11, &[("A", 10), ("B", 25)]));
    h.view(None).refresh().await.unwrap();

    let mut debts = h.store.debts(11).await.unwrap();
    debts.sort_by(|a, b| a["node_pubkey"].as_str().cmp(&b["node_pubkey"].as_str()));
    let owed: Vec<(&str, i64)> = debts
        .iter()
        .map(|r| (r["node_pubkey"].as_str().unwrap(), r["debt_lamports"].as_i64().unwrap()))
        .collect();
    assert_eq!(owed, vec![("A", 10), ("B", 25)]);

    let row = h.store.distribution(11).await.unwrap().unwrap();
    assert_eq!(row["total_debt_lamports"], Value::Int64(35));
    assert_eq!(row["validator_count"], Value::Int64(2));
}
