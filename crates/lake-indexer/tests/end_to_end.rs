//! The full indexer running its refresh loops against scripted sources.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use lake_core::store::MemoryStore;
use lake_indexer::{Indexer, RefreshConfig, server};
use lake_test_utils::{
    FakeGeoIpResolver, FakeLatencySource, FakePriceOracle, FakeRevenueSource, FakeSolanaRpc, circuit,
    distribution, geoip, init_test_logging, node, sample, vote_account,
};
use tokio::sync::watch;
use tower::ServiceExt;

fn refresh() -> RefreshConfig {
    RefreshConfig {
        interval: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
    }
}

async fn ready_status(indexer: &Arc<Indexer>) -> Result<(StatusCode, serde_json::Value)> {
    let response = server::router(Arc::clone(indexer))
        .oneshot(Request::builder().uri("/ready").body(Body::empty())?)
        .await?;
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&body)?))
}

#[tokio::test]
async fn every_view_becomes_ready_and_loops_stop_on_shutdown() -> Result<()> {
    init_test_logging();
    let rpc = FakeSolanaRpc::new(601);
    rpc.set_nodes(vec![node("A", "10.0.0.1")]);
    rpc.set_votes(vec![vote_account("V1", "A", 601, 100)]);
    let revenue = FakeRevenueSource::new();
    revenue.publish(distribution(600, &[("A", 5)]));
    let latency = FakeLatencySource::new(601, vec![circuit("c1")]);
    latency.push_samples("c1", 601, [sample(0, 4000), sample(1, 4100)]);

    let indexer = Arc::new(
        Indexer::builder()
            .store(Arc::new(MemoryStore::new()))
            .solana_rpc(Arc::new(rpc.clone()))
            .revenue_source(Arc::new(revenue))
            .price_oracle(Arc::new(FakePriceOracle::new(150.0)))
            .latency_source(Arc::new(latency))
            .geoip_resolver(Arc::new(FakeGeoIpResolver::new([geoip("10.0.0.1", "Frankfurt")])))
            .refresh_config(refresh())
            .build()?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = indexer.start(shutdown_rx);

    for view in ["solana", "revenue", "latency", "geoip"] {
        let latch = indexer.view_readiness(view).context("view registered")?;
        tokio::time::timeout(Duration::from_secs(10), latch.wait_ready())
            .await
            .with_context(|| format!("{view} never became ready"))?;
    }
    assert!(indexer.is_ready());

    let (status, body) = ready_status(&indexer).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    assert_eq!(body["views"].as_array().map(Vec::len), Some(4));

    let revenue_store = indexer.revenue_store().context("revenue enabled")?;
    assert_eq!(revenue_store.last_stored_epoch().await?, Some(600));
    let latency_store = indexer.latency_store().context("latency enabled")?;
    assert_eq!(latency_store.samples("c1", 601).await?.len(), 2);

    shutdown_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .context("refresh loops did not stop")?;
    Ok(())
}

#[tokio::test]
async fn a_failing_view_keeps_the_indexer_not_ready() -> Result<()> {
    let rpc = FakeSolanaRpc::new(601);
    let latency = FakeLatencySource::new(601, vec![circuit("c1")]);
    let indexer = Arc::new(
        Indexer::builder()
            .store(Arc::new(MemoryStore::new()))
            .solana_rpc(Arc::new(rpc.clone()))
            .latency_source(Arc::new(latency))
            .refresh_config(refresh())
            .build()?,
    );
    rpc.set_fail(true);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = indexer.start(shutdown_rx);

    let latency_ready = indexer.view_readiness("latency").context("latency registered")?;
    tokio::time::timeout(Duration::from_secs(10), latency_ready.wait_ready()).await?;
    // Give the failing view a few more ticks.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!indexer.is_ready());

    let (status, body) = ready_status(&indexer).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);

    // Recovery flips the remaining latch.
    rpc.set_fail(false);
    let solana_ready = indexer.view_readiness("solana").context("solana registered")?;
    tokio::time::timeout(Duration::from_secs(10), solana_ready.wait_ready()).await?;
    assert!(indexer.is_ready());

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(10), handle.join()).await?;
    Ok(())
}

#[tokio::test]
async fn readiness_survives_later_refresh_failures() -> Result<()> {
    let rpc = FakeSolanaRpc::new(601);
    rpc.set_nodes(vec![node("A", "10.0.0.1")]);
    let latency = FakeLatencySource::new(601, vec![circuit("c1")]);
    let indexer = Arc::new(
        Indexer::builder()
            .store(Arc::new(MemoryStore::new()))
            .solana_rpc(Arc::new(rpc.clone()))
            .latency_source(Arc::new(latency))
            .refresh_config(refresh())
            .build()?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = indexer.start(shutdown_rx);
    for view in ["solana", "latency"] {
        let latch = indexer.view_readiness(view).context("view registered")?;
        tokio::time::timeout(Duration::from_secs(10), latch.wait_ready()).await?;
    }
    assert!(indexer.is_ready());

    // Every solana refresh from here on fails.
    rpc.set_fail(true);
    let failing_from = rpc.calls();
    tokio::time::timeout(Duration::from_secs(10), async {
        while rpc.calls() < failing_from + 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("solana view stopped refreshing")?;

    assert!(indexer.is_ready());
    let (status, body) = ready_status(&indexer).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);

    shutdown_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(10), handle.join()).await?;
    Ok(())
}
