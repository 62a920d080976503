//! Latency view: IPDV continuation, loss handling, cursors and rollover.

use std::sync::Arc;

use lake_core::store::MemoryStore;
use lake_core::{Record, Value};
use lake_indexer::View;
use lake_indexer::domains::latency::{LatencyStore, LatencyView};
use lake_test_utils::{FakeLatencySource, assert_current_keys, circuit, init_test_logging, int_column, sample};

fn ipdv(rows: &[Record]) -> Vec<Option<i64>> {
    int_column(rows, "ipdv_us")
}

fn view(store: &MemoryStore, source: &FakeLatencySource) -> (LatencyView, Arc<LatencyStore>) {
    let latency = Arc::new(LatencyStore::new(Arc::new(store.clone())).unwrap());
    (
        LatencyView::new(Arc::new(source.clone()), Arc::clone(&latency)),
        latency,
    )
}

#[tokio::test]
async fn ipdv_continues_identically_across_batches_and_restarts() {
    init_test_logging();

    // One batch.
    let single_store = MemoryStore::new();
    let single_source = FakeLatencySource::new(7, vec![circuit("c1")]);
    single_source.push_samples("c1", 7, [sample(0, 5000), sample(1, 6000), sample(2, 5500)]);
    let (mut single, single_latency) = view(&single_store, &single_source);
    single.refresh().await.unwrap();

    // Two batches with a restart in between; the second view only has the store.
    let split_store = MemoryStore::new();
    let split_source = FakeLatencySource::new(7, vec![circuit("c1")]);
    split_source.push_samples("c1", 7, [sample(0, 5000)]);
    let (mut first, _) = view(&split_store, &split_source);
    first.refresh().await.unwrap();
    drop(first);

    split_source.push_samples("c1", 7, [sample(1, 6000), sample(2, 5500)]);
    let (mut restarted, split_latency) = view(&split_store, &split_source);
    restarted.refresh().await.unwrap();

    let expected = vec![None, Some(1000), Some(500)];
    assert_eq!(ipdv(&single_latency.samples("c1", 7).await.unwrap()), expected);
    assert_eq!(ipdv(&split_latency.samples("c1", 7).await.unwrap()), expected);

    // The restarted view resumed after the stored samples.
    assert_eq!(split_source.requests().last(), Some(&("c1".to_string(), 7, 1)));
    assert_eq!(restarted.cursor("c1", 7), Some(3));
}

#[tokio::test]
async fn loss_samples_are_stored_without_ipdv() {
    let store = MemoryStore::new();
    let source = FakeLatencySource::new(7, vec![circuit("c1")]);
    source.push_samples("c1", 7, [sample(0, 100), sample(1, 0)]);
    let (mut first, _) = view(&store, &source);
    first.refresh().await.unwrap();

    // After a restart the reference is the last non-lost sample (100), not
    // the loss.
    source.push_samples("c1", 7, [sample(2, 130)]);
    let (mut restarted, latency) = view(&store, &source);
    restarted.refresh().await.unwrap();

    let rows = latency.samples("c1", 7).await.unwrap();
    assert_eq!(ipdv(&rows), vec![None, None, Some(30)]);
    assert_eq!(rows[1]["loss"], Value::Bool(true));
    assert_eq!(rows[2]["loss"], Value::Bool(false));
}

#[tokio::test]
async fn refreshes_without_new_samples_write_nothing() {
    let store = MemoryStore::new();
    let source = FakeLatencySource::new(7, vec![circuit("c1")]);
    source.push_samples("c1", 7, [sample(0, 100), sample(1, 110)]);
    let (mut view, latency) = view(&store, &source);

    view.refresh().await.unwrap();
    let outcome = view.refresh().await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(latency.samples("c1", 7).await.unwrap().len(), 2);
    assert_eq!(source.requests().last(), Some(&("c1".to_string(), 7, 2)));
}

#[tokio::test]
async fn failing_circuit_is_skipped_without_failing_the_refresh() {
    let store = MemoryStore::new();
    let source = FakeLatencySource::new(7, vec![circuit("c1"), circuit("c2")]);
    source.push_samples("c1", 7, [sample(0, 100)]);
    source.push_samples("c2", 7, [sample(0, 200)]);
    source.fail_circuit("c2");
    let (mut view, latency) = view(&store, &source);

    let outcome = view.refresh().await.unwrap();
    assert_eq!(outcome.partial.len(), 1);
    assert!(outcome.partial[0].contains("c2"));
    assert_eq!(latency.samples("c1", 7).await.unwrap().len(), 1);
    assert!(latency.samples("c2", 7).await.unwrap().is_empty());

    source.heal();
    let outcome = view.refresh().await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(latency.samples("c2", 7).await.unwrap().len(), 1);
}

#[tokio::test]
async fn epoch_rollover_drains_the_previous_tail_once() {
    let store = MemoryStore::new();
    let source = FakeLatencySource::new(7, vec![circuit("c1")]);
    source.push_samples("c1", 7, [sample(0, 100), sample(1, 120)]);
    let (mut view, latency) = view(&store, &source);
    view.refresh().await.unwrap();

    source.push_samples("c1", 7, [sample(2, 90)]);
    source.set_epoch(8);
    source.push_samples("c1", 8, [sample(0, 300), sample(1, 310)]);
    view.refresh().await.unwrap();

    let tail = latency.samples("c1", 7).await.unwrap();
    assert_eq!(ipdv(&tail), vec![None, Some(20), Some(30)]);
    // IPDV restarts with the new epoch.
    let next = latency.samples("c1", 8).await.unwrap();
    assert_eq!(ipdv(&next), vec![None, Some(10)]);

    let before = source.requests().len();
    view.refresh().await.unwrap();
    let after = source.requests();
    assert_eq!(after.len(), before + 1);
    assert_eq!(after.last(), Some(&("c1".to_string(), 8, 2)));
    assert_eq!(view.cursor("c1", 7), None);
}

#[tokio::test]
async fn circuits_are_a_full_snapshot() {
    let store = MemoryStore::new();
    let source = FakeLatencySource::new(7, vec![circuit("c1"), circuit("c2")]);
    let (mut view, latency) = view(&store, &source);
    view.refresh().await.unwrap();
    assert_eq!(latency.current_circuits().await.unwrap().len(), 2);

    let source2 = FakeLatencySource::new(7, vec![circuit("c2")]);
    let (mut next, latency) = self::view(&store, &source2);
    next.refresh().await.unwrap();
    assert_current_keys(&latency.current_circuits().await.unwrap(), "code", &["c2"]);
}

#[tokio::test]
async fn ipdv_continues_from_the_store_one_sample_at_a_time() {
    let store = MemoryStore::new();
    let source = FakeLatencySource::new(7, vec![circuit("c1")]);

    for s in [sample(0, 5000), sample(1, 6000), sample(2, 5500)] {
        source.push_samples("c1", 7, [s]);
        let (mut fresh, _) = view(&store, &source);
        fresh.refresh().await.unwrap();
    }

    let (_, latency) = view(&store, &source);
    let rows = latency.samples("c1", 7).await.unwrap();
    assert_eq!(ipdv(&rows), vec![None, Some(1000), Some(500)]);
    let starts: Vec<u64> = source.requests().iter().map(|(_, _, from)| *from).collect();
    assert_eq!(starts, vec![0, 1, 2]);
}

#[tokio::test]
async fn failed_tail_drain_is_retried_until_it_succeeds() {
    let store = MemoryStore::new();
    let source = FakeLatencySource::new(7, vec![circuit("c1")]);
    source.push_samples("c1", 7, [sample(0, 100), sample(1, 120)]);
    let (mut view, latency) = view(&store, &source);
    view.refresh().await.unwrap();

    source.push_samples("c1", 7, [sample(2, 90)]);
    source.set_epoch(8);
    source.fail_circuit("c1");
    let outcome = view.refresh().await.unwrap();
    assert!(!outcome.is_complete());
    assert_eq!(view.pending_epochs("c1"), vec![7]);
    assert_eq!(latency.samples("c1", 7).await.unwrap().len(), 2);

    source.heal();
    let outcome = view.refresh().await.unwrap();
    assert!(outcome.is_complete());
    assert!(view.pending_epochs("c1").is_empty());
    assert_eq!(view.cursor("c1", 7), None);
    let tail = latency.samples("c1", 7).await.unwrap();
    assert_eq!(ipdv(&tail), vec![None, Some(20), Some(30)]);

    let tail_requests = |requests: Vec<(String, u64, u64)>| requests.iter().filter(|(_, e, _)| *e == 7).count();
    let drained = tail_requests(source.requests());
    view.refresh().await.unwrap();
    assert_eq!(tail_requests(source.requests()), drained);
}

#[tokio::test]
async fn restart_after_rollover_drains_the_stored_epoch() {
    let store = MemoryStore::new();
    let source = FakeLatencySource::new(7, vec![circuit("c1")]);
    source.push_samples("c1", 7, [sample(0, 100), sample(1, 120)]);
    let (mut first, _) = view(&store, &source);
    first.refresh().await.unwrap();
    drop(first);

    source.push_samples("c1", 7, [sample(2, 90)]);
    source.set_epoch(8);
    source.push_samples("c1", 8, [sample(0, 300)]);
    let (mut restarted, latency) = view(&store, &source);
    restarted.refresh().await.unwrap();

    assert!(source.requests().contains(&("c1".to_string(), 7, 2)));
    let tail = latency.samples("c1", 7).await.unwrap();
    assert_eq!(ipdv(&tail), vec![None, Some(20), Some(30)]);
    assert_eq!(latency.samples("c1", 8).await.unwrap().len(), 1);
    assert!(restarted.pending_epochs("c1").is_empty());
}
