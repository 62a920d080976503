//! View refresh orchestration.
//!
//! A [`View`] pulls from its sources and writes through its store; it owns
//! its cursors as private state. A [`ViewRunner`] drives one view:
//!
//! - refreshes immediately on start, then on a fixed interval; a slow
//!   refresh delays the next tick instead of causing a burst
//! - runs at most one refresh at a time (per-view mutex)
//! - contains faults: errors, panics and deadline overruns are logged and
//!   counted, and the loop carries on with the next tick
//! - flips the view's readiness latch after the first successful refresh;
//!   a refresh that returns `Ok` is successful even when its outcome records
//!   partial progress or degraded enrichment, and later failures never clear
//!   the latch
//! - stops on the shutdown signal once any in-flight refresh has finished

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use lake_core::observability::refresh_span;

use crate::config::RefreshConfig;
use crate::error::Result;
use crate::metrics::{self, RefreshStatus};
use crate::readiness::ReadinessLatch;

/// What a successful refresh did.
///
/// A refresh can succeed with partial progress (an epoch walk stopped early)
/// or degraded enrichment (a best-effort lookup failed); both are recorded
/// here rather than failing the refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Rows appended across all datasets.
    pub rows_written: usize,
    /// Reasons the refresh stopped short of its full scope.
    pub partial: Vec<String>,
    /// Best-effort enrichments that were skipped.
    pub degraded: Vec<String>,
}

impl RefreshOutcome {
    /// Adds appended rows.
    pub fn add_rows(&mut self, rows: usize) {
        self.rows_written += rows;
    }

    /// Notes that the refresh stopped short.
    pub fn stopped_early(&mut self, reason: impl Into<String>) {
        self.partial.push(reason.into());
    }

    /// Notes a skipped enrichment.
    pub fn degrade(&mut self, enrichment: impl Into<String>) {
        self.degraded.push(enrichment.into());
    }

    /// Returns true if the refresh covered its full scope with all enrichments.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.partial.is_empty() && self.degraded.is_empty()
    }
}

/// A refreshable projection of external state into datasets.
#[async_trait]
pub trait View: Send + 'static {
    /// Stable view name for logs, metrics and readiness.
    fn name(&self) -> &'static str;

    /// Pulls from sources and writes the results.
    async fn refresh(&mut self) -> Result<RefreshOutcome>;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drives one view on a fixed interval behind a fault barrier.
pub struct ViewRunner {
    name: &'static str,
    view: Mutex<Box<dyn View>>,
    readiness: Arc<ReadinessLatch>,
    config: RefreshConfig,
}

impl std::fmt::Debug for ViewRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewRunner")
            .field("name", &self.name)
            .field("ready", &self.readiness.is_ready())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ViewRunner {
    /// Wraps a view.
    #[must_use]
    pub fn new(view: Box<dyn View>, config: RefreshConfig) -> Self {
        metrics::set_view_ready(view.name(), false);
        Self {
            name: view.name(),
            view: Mutex::new(view),
            readiness: Arc::new(ReadinessLatch::new()),
            config,
        }
    }

    /// View name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The view's readiness latch.
    #[must_use]
    pub fn readiness(&self) -> Arc<ReadinessLatch> {
        Arc::clone(&self.readiness)
    }

    /// Returns true once the view has refreshed successfully.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Runs one refresh behind the fault barrier.
    ///
    /// Waits for any refresh already in progress. Never panics and never
    /// returns the view's error; the outcome is logged, counted and returned
    /// as a status.
    pub async fn refresh_now(&self) -> RefreshStatus {
        let mut view = self.view.lock().await;
        let started = Instant::now();
        let guarded = AssertUnwindSafe(view.refresh()).catch_unwind();

        let status = match tokio::time::timeout(self.config.timeout, guarded).await {
            Ok(Ok(Ok(outcome))) => {
                if self.readiness.mark_ready() {
                    metrics::set_view_ready(self.name, true);
                    tracing::info!(view = self.name, "view ready");
                }
                tracing::info!(
                    view = self.name,
                    rows_written = outcome.rows_written,
                    partial = ?outcome.partial,
                    degraded = ?outcome.degraded,
                    "refresh completed"
                );
                RefreshStatus::Success
            }
            Ok(Ok(Err(e))) => {
                tracing::error!(view = self.name, error = %e, "refresh failed");
                RefreshStatus::Error
            }
            Ok(Err(payload)) => {
                tracing::error!(
                    view = self.name,
                    panic = %panic_message(payload.as_ref()),
                    "refresh panicked"
                );
                RefreshStatus::Panic
            }
            Err(_) => {
                tracing::error!(
                    view = self.name,
                    timeout_secs = self.config.timeout.as_secs_f64(),
                    "refresh exceeded deadline"
                );
                RefreshStatus::Timeout
            }
        };
        metrics::record_refresh(self.name, status, started.elapsed().as_secs_f64());
        status
    }

    /// Spawns the refresh loop.
    ///
    /// The first refresh starts immediately. The loop exits when `shutdown`
    /// becomes true or its sender is dropped.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runner.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                view = runner.name,
                interval_secs = runner.config.interval.as_secs_f64(),
                "starting refresh loop"
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        runner
                            .refresh_now()
                            .instrument(refresh_span(runner.name))
                            .await;
                    }
                }
            }
            tracing::info!(view = runner.name, "refresh loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::error::Error;

    #[derive(Default)]
    struct Scripted {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        fail_from: Option<usize>,
        panic_on: Option<usize>,
        delay: Duration,
        outcome: RefreshOutcome,
    }

    #[async_trait]
    impl View for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn refresh(&mut self) -> Result<RefreshOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panic_on == Some(call) {
                panic!("boom on call {call}");
            }
            if call < self.fail_first || self.fail_from.is_some_and(|from| call >= from) {
                return Err(Error::upstream("rpc", "unavailable"));
            }
            Ok(self.outcome.clone())
        }
    }

    fn scripted_runner(view: Scripted) -> (Arc<ViewRunner>, Arc<AtomicUsize>) {
        let calls = Arc::clone(&view.calls);
        let config = RefreshConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        };
        (Arc::new(ViewRunner::new(Box::new(view), config)), calls)
    }

    fn runner(fail_first: usize, panic_on: Option<usize>, delay: Duration) -> (Arc<ViewRunner>, Arc<AtomicUsize>) {
        scripted_runner(Scripted {
            fail_first,
            panic_on,
            delay,
            ..Scripted::default()
        })
    }

    #[tokio::test]
    async fn failure_keeps_view_not_ready() {
        let (runner, _) = runner(1, None, Duration::ZERO);
        assert_eq!(runner.refresh_now().await, RefreshStatus::Error);
        assert!(!runner.is_ready());
        assert_eq!(runner.refresh_now().await, RefreshStatus::Success);
        assert!(runner.is_ready());
    }

    #[tokio::test]
    async fn ready_survives_later_failure() {
        let (runner, _) = scripted_runner(Scripted {
            fail_from: Some(1),
            panic_on: Some(2),
            ..Scripted::default()
        });
        assert_eq!(runner.refresh_now().await, RefreshStatus::Success);
        assert!(runner.is_ready());
        assert_eq!(runner.refresh_now().await, RefreshStatus::Error);
        assert!(runner.is_ready());
        assert_eq!(runner.refresh_now().await, RefreshStatus::Panic);
        assert!(runner.is_ready());
        assert!(runner.readiness().is_ready());
    }

    #[tokio::test]
    async fn partial_refresh_counts_as_success() {
        let mut outcome = RefreshOutcome::default();
        outcome.stopped_early("epoch 12: distribution not published");
        outcome.degrade("sol_usd_price");
        let (runner, _) = scripted_runner(Scripted {
            outcome,
            ..Scripted::default()
        });
        assert_eq!(runner.refresh_now().await, RefreshStatus::Success);
        assert!(runner.is_ready());
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let (runner, calls) = runner(0, Some(0), Duration::ZERO);
        assert_eq!(runner.refresh_now().await, RefreshStatus::Panic);
        assert!(!runner.is_ready());
        assert_eq!(runner.refresh_now().await, RefreshStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_times_out() {
        let (runner, _) = runner(0, None, Duration::from_secs(60));
        assert_eq!(runner.refresh_now().await, RefreshStatus::Timeout);
        assert!(!runner.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_refreshes_immediately_then_on_interval_and_stops() {
        let (runner, calls) = runner(0, None, Duration::ZERO);
        let (tx, rx) = watch::channel(false);
        let handle = runner.start(rx);

        runner.readiness().wait_ready().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }
}
