//! Bounded-concurrency revenue backfill against a scripted source.

use std::sync::Arc;
use std::time::Duration;

use lake_core::store::MemoryStore;
use lake_indexer::backfill::PlanReason;
use lake_indexer::domains::revenue::{RevenueBackfill, RevenueStore};
use lake_indexer::{BackfillConfig, BackfillRequest, EpochRange, Error, run_backfill};
use lake_test_utils::{FakeRevenueSource, FakeSolanaRpc, distribution};

fn setup(epoch: u64, source: &FakeRevenueSource) -> (Arc<RevenueStore>, RevenueBackfill) {
    let store = Arc::new(RevenueStore::new(Arc::new(MemoryStore::new())).unwrap());
    let backfill = RevenueBackfill::new(
        Arc::new(source.clone()),
        Arc::new(FakeSolanaRpc::new(epoch)),
        Arc::clone(&store),
    );
    (store, backfill)
}

fn explicit(start: u64, end: u64) -> BackfillRequest {
    BackfillRequest {
        start_epoch: Some(start),
        end_epoch: Some(end),
    }
}

#[tokio::test(start_paused = true)]
async fn fetches_are_bounded_and_writes_are_ordered() {
    let source = FakeRevenueSource::new().with_fetch_delay(Duration::from_millis(50));
    for epoch in 1..=20 {
        source.publish(distribution(epoch, &[("A", epoch)]));
    }
    let (store, backfill) = setup(21, &source);
    let config = BackfillConfig {
        max_concurrency: 4,
        ..BackfillConfig::default()
    };

    let report = run_backfill(&backfill, explicit(1, 20), &config).await.unwrap();

    assert_eq!(report.epochs_written, (1..=20).collect::<Vec<_>>());
    assert_eq!(source.max_in_flight(), 4);
    assert_eq!(store.epoch_bounds().await.unwrap(), Some((1, 20)));
}

#[tokio::test]
async fn first_failure_reports_the_epoch_and_last_success() {
    let source = FakeRevenueSource::new();
    for epoch in 1..=8 {
        source.publish(distribution(epoch, &[]));
    }
    source.fail_epoch(5);
    let (store, backfill) = setup(9, &source);

    let err = run_backfill(&backfill, explicit(1, 8), &BackfillConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Backfill {
            epoch: 5,
            last_success: Some(4),
            ..
        }
    ));
    assert_eq!(store.epoch_bounds().await.unwrap(), Some((1, 4)));
}

#[tokio::test]
async fn missing_distribution_is_a_failure() {
    let source = FakeRevenueSource::new();
    source.publish(distribution(3, &[]));
    let (_, backfill) = setup(5, &source);

    let err = run_backfill(&backfill, explicit(3, 4), &BackfillConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Backfill {
            epoch: 4,
            last_success: Some(3),
            ..
        }
    ));
}

#[tokio::test]
async fn dry_run_plans_without_fetching() {
    let source = FakeRevenueSource::new();
    let (store, backfill) = setup(101, &source);
    let config = BackfillConfig {
        max_epochs_per_run: 10,
        dry_run: true,
        ..BackfillConfig::default()
    };

    let report = run_backfill(&backfill, BackfillRequest::default(), &config).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.plan.reason, PlanReason::Initial);
    assert_eq!(report.plan.range, EpochRange::new(91, 100));
    assert!(report.epochs_written.is_empty());
    assert!(source.fetches().is_empty());
    assert_eq!(store.epoch_bounds().await.unwrap(), None);
}

#[tokio::test]
async fn caught_up_store_backfills_the_older_gap() {
    let source = FakeRevenueSource::new();
    for epoch in 7..=12 {
        source.publish(distribution(epoch, &[]));
    }
    let (store, backfill) = setup(13, &source);
    for epoch in 10..=12 {
        store.write_epoch(&distribution(epoch, &[]), None).await.unwrap();
    }
    let config = BackfillConfig {
        max_epochs_per_run: 3,
        ..BackfillConfig::default()
    };

    let report = run_backfill(&backfill, BackfillRequest::default(), &config).await.unwrap();
    assert_eq!(report.plan.reason, PlanReason::OlderGap);
    assert_eq!(report.epochs_written, vec![7, 8, 9]);
    assert_eq!(store.epoch_bounds().await.unwrap(), Some((7, 12)));

    // Nothing is left once the earliest epoch is reached.
    let config = BackfillConfig {
        earliest_epoch: 7,
        ..config
    };
    let report = run_backfill(&backfill, BackfillRequest::default(), &config).await.unwrap();
    assert_eq!(report.plan.reason, PlanReason::Complete);
    assert!(report.epochs_written.is_empty());
}

#[tokio::test]
async fn inverted_explicit_range_is_rejected() {
    let source = FakeRevenueSource::new();
    let (_, backfill) = setup(10, &source);
    let err = run_backfill(&backfill, explicit(8, 3), &BackfillConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert!(source.fetches().is_empty());
}
